//! Recursive-descent bencode decoder operating directly over an
//! in-memory byte slice (a UDP datagram is always fully buffered
//! before it reaches this codec, so there is no streaming `Read` side
//! to thread through here).
use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;
use std::collections::HashMap;
use tracing::instrument;

/// Decodes a bencode byte string `<len>:<bytes>` at the start of `data`.
///
/// Returns the decoded bytes and the number of input bytes consumed.
/// The payload is returned as opaque bytes, not validated as UTF-8 —
/// infohashes, node ids and tokens are binary and frequently are not
/// valid UTF-8.
#[instrument(skip(data), level = "trace")]
pub fn decode_string(data: &[u8]) -> BencodeResult<(Vec<u8>, usize)> {
    let colon = data
        .iter()
        .position(|&b| b == b':')
        .ok_or(BencodeError::InvalidString)?;
    let len_str = std::str::from_utf8(&data[..colon]).map_err(|_| BencodeError::InvalidString)?;
    let len: usize = len_str.parse().map_err(|_| BencodeError::InvalidString)?;

    let start = colon + 1;
    let end = start
        .checked_add(len)
        .ok_or(BencodeError::InvalidString)?;
    if end > data.len() {
        return Err(BencodeError::InvalidString);
    }
    Ok((data[start..end].to_vec(), end))
}

/// Decodes a bencode integer `i<decimal>e` at the start of `data`.
///
/// Rejects leading zeros (except the literal `i0e`), `-0`, and an
/// empty digit sequence, matching the reference decoder's validation.
#[instrument(skip(data), level = "trace")]
pub fn decode_integer(data: &[u8]) -> BencodeResult<(i64, usize)> {
    if data.first() != Some(&b'i') {
        return Err(BencodeError::InvalidInt);
    }
    let e_pos = data
        .iter()
        .position(|&b| b == b'e')
        .ok_or(BencodeError::InvalidInt)?;
    let num_str =
        std::str::from_utf8(&data[1..e_pos]).map_err(|_| BencodeError::InvalidInt)?;

    if num_str.is_empty() {
        return Err(BencodeError::InvalidInt);
    }
    if num_str == "-0" {
        return Err(BencodeError::InvalidInt);
    }
    let digits = num_str.strip_prefix('-').unwrap_or(num_str);
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(BencodeError::InvalidInt);
    }

    let value: i64 = num_str.parse().map_err(|_| BencodeError::InvalidInt)?;
    Ok((value, e_pos + 1))
}

/// Decodes a bencode list `l<terms>e` at the start of `data`.
#[instrument(skip(data), level = "trace")]
fn decode_list(data: &[u8]) -> BencodeResult<(Vec<BencodeValue>, usize)> {
    if data.first() != Some(&b'l') {
        return Err(BencodeError::InvalidList);
    }
    let mut items = Vec::new();
    let mut idx = 1;
    loop {
        match data.get(idx) {
            None => return Err(BencodeError::InvalidList),
            Some(b'e') => {
                idx += 1;
                break;
            }
            _ => {
                let (item, consumed) =
                    decode_next(&data[idx..]).map_err(|_| BencodeError::InvalidList)?;
                items.push(item);
                idx += consumed;
            }
        }
    }
    Ok((items, idx))
}

/// Decodes a bencode dictionary `d(<string><term>)*e` at the start of
/// `data`.
///
/// Key order is not enforced on decode (only required on encode);
/// duplicate keys take last-wins, matching `HashMap::insert`.
#[instrument(skip(data), level = "trace")]
fn decode_dict(data: &[u8]) -> BencodeResult<(HashMap<Vec<u8>, BencodeValue>, usize)> {
    if data.first() != Some(&b'd') {
        return Err(BencodeError::InvalidDict);
    }
    let mut dict = HashMap::new();
    let mut idx = 1;
    loop {
        match data.get(idx) {
            None => return Err(BencodeError::InvalidDict),
            Some(b'e') => {
                idx += 1;
                break;
            }
            _ => {
                let (key, key_len) =
                    decode_string(&data[idx..]).map_err(|_| BencodeError::InvalidDict)?;
                idx += key_len;
                let (value, value_len) =
                    decode_next(&data[idx..]).map_err(|_| BencodeError::InvalidDict)?;
                idx += value_len;
                dict.insert(key, value);
            }
        }
    }
    Ok((dict, idx))
}

/// Decodes one term — of whichever of the four kinds `data` starts
/// with — and returns it along with the number of bytes consumed.
#[instrument(skip(data), level = "trace")]
pub fn decode_next(data: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    match data.first() {
        Some(b'0'..=b'9') => {
            let (s, len) = decode_string(data)?;
            Ok((BencodeValue::Bytes(s), len))
        }
        Some(b'i') => {
            let (i, len) = decode_integer(data)?;
            Ok((BencodeValue::Int(i), len))
        }
        Some(b'l') => {
            let (l, len) = decode_list(data)?;
            Ok((BencodeValue::List(l), len))
        }
        Some(b'd') => {
            let (d, len) = decode_dict(data)?;
            Ok((BencodeValue::Dict(d), len))
        }
        _ => Err(BencodeError::InvalidData),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_negative_integer() {
        assert_eq!(decode_integer(b"i-12345e").unwrap(), (-12345, 8));
    }

    #[test]
    fn rejects_leading_zero() {
        assert_eq!(decode_integer(b"i04e"), Err(BencodeError::InvalidInt));
    }

    #[test]
    fn rejects_negative_zero() {
        assert_eq!(decode_integer(b"i-0e"), Err(BencodeError::InvalidInt));
    }

    #[test]
    fn decodes_string_with_binary_payload() {
        let mut data = vec![b'2', b'0', b':'];
        data.extend_from_slice(&[0xffu8; 20]);
        let (s, len) = decode_string(&data).unwrap();
        assert_eq!(s, vec![0xffu8; 20]);
        assert_eq!(len, data.len());
    }

    #[test]
    fn decodes_nested_list_and_dict() {
        let (value, len) = decode_next(b"d3:fool4:spami42eee").unwrap();
        assert_eq!(len, 19);
        let dict = value.into_dict().unwrap();
        assert_eq!(
            dict.get(&b"foo"[..].to_vec()),
            Some(&BencodeValue::List(vec![
                BencodeValue::bytes(&b"spam"[..]),
                BencodeValue::Int(42),
            ]))
        );
    }

    #[test]
    fn rejects_truncated_list() {
        assert!(decode_next(b"li1e").is_err());
    }
}
