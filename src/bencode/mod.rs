//! Bencode codec: the binary dictionary format carried by every KRPC
//! datagram.
//!
//! Bencode has exactly four term kinds — integer, byte string, list,
//! dictionary — represented here as a small recursive enum rather than
//! one derived through `serde`, the same shape the reference client
//! builds its own bencode module around. Unlike BEP 3 text that
//! assumes printable payloads, byte strings are treated as opaque
//! bytes: infohashes, node ids and tokens are binary and often not
//! valid UTF-8, so this decoder never rejects a string term on that
//! basis.
use std::collections::HashMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// A decoded (or to-be-encoded) bencode term.
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<BencodeValue>),
    Dict(HashMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn bytes<B: Into<Vec<u8>>>(b: B) -> Self {
        BencodeValue::Bytes(b.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&HashMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<HashMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Errors surfaced by the bencode codec.
///
/// All of these are local parse failures: per the error taxonomy they
/// never cross a network boundary, they are dropped or logged by the
/// caller.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BencodeError {
    #[error("invalid int")]
    InvalidInt,

    #[error("invalid string")]
    InvalidString,

    #[error("invalid list")]
    InvalidList,

    #[error("invalid dict")]
    InvalidDict,

    #[error("invalid data")]
    InvalidData,

    #[error("trailing bytes after top-level term")]
    TrailingBytes,

    #[error("cannot encode type: {0}")]
    CannotEncodeType(&'static str),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;

/// Decodes a single top-level bencode term.
///
/// Fails unless the term consumes the entire input: a valid term
/// followed by garbage is rejected as `TrailingBytes`.
#[tracing::instrument(skip(data), level = "trace")]
pub fn decode(data: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, consumed) = decoder::decode_next(data)?;
    if consumed != data.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

/// Encodes a term into its bencode byte representation.
#[tracing::instrument(skip(value), level = "trace")]
pub fn encode(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encoder::encode_value(&mut buf, value)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_four_kinds() {
        let mut dict = HashMap::new();
        dict.insert(b"a".to_vec(), BencodeValue::Int(1));
        dict.insert(
            b"b".to_vec(),
            BencodeValue::List(vec![BencodeValue::bytes(&b"spam"[..])]),
        );
        let value = BencodeValue::Dict(dict);
        let encoded = encode(&value).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn rejects_trailing_bytes_at_top_level() {
        assert_eq!(decode(b"i1ee"), Err(BencodeError::TrailingBytes));
    }
}
