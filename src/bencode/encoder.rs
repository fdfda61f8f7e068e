//! Bencode encoder. Dictionary keys are always emitted in ascending
//! lexicographic byte order, regardless of insertion order into the
//! backing `HashMap` — this is the one encoding invariant the wire
//! format actually requires.
use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;
use std::collections::HashMap;
use std::io::Write;
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len()).map_err(|_| BencodeError::CannotEncodeType("string"))?;
    writer
        .write_all(s)
        .map_err(|_| BencodeError::CannotEncodeType("string"))
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i).map_err(|_| BencodeError::CannotEncodeType("int"))
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer
        .write_all(b"l")
        .map_err(|_| BencodeError::CannotEncodeType("list"))?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer
        .write_all(b"e")
        .map_err(|_| BencodeError::CannotEncodeType("list"))
}

#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(writer: &mut W, dict: &HashMap<Vec<u8>, BencodeValue>) -> BencodeResult<()> {
    writer
        .write_all(b"d")
        .map_err(|_| BencodeError::CannotEncodeType("dict"))?;
    let mut keys: Vec<&Vec<u8>> = dict.keys().collect();
    keys.sort_unstable();
    for key in keys {
        encode_string(writer, key)?;
        // `key` came from `dict.keys()` so the lookup below always hits.
        encode_value(writer, &dict[key])?;
    }
    writer
        .write_all(b"e")
        .map_err(|_| BencodeError::CannotEncodeType("dict"))
}

#[instrument(skip(writer, value), level = "trace")]
pub fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::Bytes(s) => encode_string(writer, s),
        BencodeValue::Int(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn emits_dict_keys_in_lexicographic_order() {
        let mut dict = HashMap::new();
        dict.insert(b"zebra".to_vec(), BencodeValue::Int(1));
        dict.insert(b"apple".to_vec(), BencodeValue::Int(2));
        dict.insert(b"mango".to_vec(), BencodeValue::Int(3));
        let encoded = super::super::encode(&BencodeValue::Dict(dict)).unwrap();
        assert_eq!(encoded, b"d5:applei2e5:mangoi3e5:zebrai1ee");
    }

    #[test]
    fn encodes_ping_query_exactly() {
        let mut args = HashMap::new();
        args.insert(
            b"id".to_vec(),
            BencodeValue::bytes(&b"abcdefghij0123456789"[..]),
        );
        let mut top = HashMap::new();
        top.insert(b"t".to_vec(), BencodeValue::bytes(&b"aa"[..]));
        top.insert(b"y".to_vec(), BencodeValue::bytes(&b"q"[..]));
        top.insert(b"q".to_vec(), BencodeValue::bytes(&b"ping"[..]));
        top.insert(b"a".to_vec(), BencodeValue::Dict(args));

        let encoded = super::super::encode(&BencodeValue::Dict(top)).unwrap();
        assert_eq!(
            encoded,
            b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe".to_vec()
        );
    }
}
