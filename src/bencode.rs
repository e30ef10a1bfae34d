//! Bencode encoding and decoding ([BEP-3]).
//!
//! Bencode is the serialization format used throughout the BitTorrent
//! protocol: metainfo files, tracker responses, and extension messages.
//! [`Value`] models the four bencode types; [`decode`] and [`encode`] convert
//! between bytes and values. Dictionaries are kept in a `BTreeMap` so
//! re-encoding a decoded dictionary reproduces the canonical key order, which
//! is what makes info-hashes stable.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

use std::collections::BTreeMap;
use std::io::Write;

use bytes::Bytes;
use thiserror::Error;

/// Nesting depth cap for decoding, to bound stack usage on hostile input.
const MAX_DEPTH: usize = 64;

/// Errors produced by the bencode codec.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended before the value was complete.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A byte that cannot start or continue a value at this position.
    #[error("unexpected character: {0:?}")]
    UnexpectedChar(char),

    /// An `i...e` integer that is empty, has leading zeros, or overflows.
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// A string length prefix that is not a decimal number.
    #[error("invalid string length")]
    InvalidStringLength,

    /// A dictionary key that is not a byte string.
    #[error("dictionary key is not a string")]
    NonStringKey,

    /// More than [`MAX_DEPTH`] levels of list/dict nesting.
    #[error("nesting too deep")]
    NestingTooDeep,

    /// Bytes left over after a complete value.
    #[error("trailing data after value")]
    TrailingData,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bencode value: integer, byte string, list, or dictionary.
///
/// # Examples
///
/// ```
/// use undertow::bencode::decode;
///
/// let v = decode(b"d4:spaml1:a1:bee").unwrap();
/// let spam = v.get(b"spam").and_then(|v| v.as_list()).unwrap();
/// assert_eq!(spam.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Byte-string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The value as a UTF-8 string, if it is a valid UTF-8 byte string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` if this is not a dictionary or the key is
    /// absent.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

/// Decodes exactly one bencode value; trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut pos = 0;
    let value = decode_at(data, &mut pos, 0)?;
    if pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes one value from the front of `data`, returning the value and the
/// number of bytes it occupied. Used where a bencoded dictionary is followed
/// by raw payload, as in `ut_metadata` data messages.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut pos = 0;
    let value = decode_at(data, &mut pos, 0)?;
    Ok((value, pos))
}

fn decode_at(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::NestingTooDeep);
    }
    match data.get(*pos) {
        None => Err(BencodeError::UnexpectedEof),
        Some(b'i') => decode_integer(data, pos),
        Some(b'l') => {
            *pos += 1;
            let mut list = Vec::new();
            loop {
                match data.get(*pos) {
                    None => return Err(BencodeError::UnexpectedEof),
                    Some(b'e') => break,
                    Some(_) => list.push(decode_at(data, pos, depth + 1)?),
                }
            }
            *pos += 1;
            Ok(Value::List(list))
        }
        Some(b'd') => {
            *pos += 1;
            let mut dict = BTreeMap::new();
            loop {
                match data.get(*pos) {
                    None => return Err(BencodeError::UnexpectedEof),
                    Some(b'e') => break,
                    Some(_) => {
                        let key = match decode_at(data, pos, depth + 1)? {
                            Value::Bytes(b) => b,
                            _ => return Err(BencodeError::NonStringKey),
                        };
                        let value = decode_at(data, pos, depth + 1)?;
                        dict.insert(key, value);
                    }
                }
            }
            *pos += 1;
            Ok(Value::Dict(dict))
        }
        Some(b'0'..=b'9') => decode_string(data, pos),
        Some(&c) => Err(BencodeError::UnexpectedChar(c as char)),
    }
}

fn decode_integer(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    *pos += 1;
    let start = *pos;
    while *pos < data.len() && data[*pos] != b'e' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    let digits = std::str::from_utf8(&data[start..*pos])
        .map_err(|_| BencodeError::InvalidInteger("not ascii".into()))?;
    if digits.is_empty()
        || digits == "-"
        || digits.starts_with("-0")
        || (digits.starts_with('0') && digits.len() > 1)
    {
        return Err(BencodeError::InvalidInteger(digits.into()));
    }
    let value: i64 = digits
        .parse()
        .map_err(|_| BencodeError::InvalidInteger(digits.into()))?;
    *pos += 1;
    Ok(Value::Integer(value))
}

fn decode_string(data: &[u8], pos: &mut usize) -> Result<Value, BencodeError> {
    let start = *pos;
    while *pos < data.len() && data[*pos] != b':' {
        *pos += 1;
    }
    if *pos >= data.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    let len: usize = std::str::from_utf8(&data[start..*pos])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::InvalidStringLength)?;
    *pos += 1;
    if data.len() - *pos < len {
        return Err(BencodeError::UnexpectedEof);
    }
    let bytes = Bytes::copy_from_slice(&data[*pos..*pos + len]);
    *pos += len;
    Ok(Value::Bytes(bytes))
}

/// Encodes a value to bencode bytes.
pub fn encode(value: &Value) -> Result<Vec<u8>, BencodeError> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf)?;
    Ok(buf)
}

fn encode_into<W: Write>(value: &Value, w: &mut W) -> Result<(), BencodeError> {
    match value {
        Value::Integer(i) => write!(w, "i{i}e")?,
        Value::Bytes(b) => {
            write!(w, "{}:", b.len())?;
            w.write_all(b)?;
        }
        Value::List(l) => {
            w.write_all(b"l")?;
            for item in l {
                encode_into(item, w)?;
            }
            w.write_all(b"e")?;
        }
        Value::Dict(d) => {
            w.write_all(b"d")?;
            for (key, val) in d {
                write!(w, "{}:", key.len())?;
                w.write_all(key)?;
                encode_into(val, w)?;
            }
            w.write_all(b"e")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
        assert_eq!(decode(b"4:spam").unwrap().as_str(), Some("spam"));
        assert_eq!(decode(b"0:").unwrap().as_bytes().unwrap().len(), 0);
    }

    #[test]
    fn reject_malformed_integers() {
        assert!(decode(b"ie").is_err());
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i1").is_err());
    }

    #[test]
    fn reject_trailing_data() {
        assert!(matches!(decode(b"i1ei2e"), Err(BencodeError::TrailingData)));
    }

    #[test]
    fn reject_truncated_string() {
        assert!(decode(b"10:short").is_err());
    }

    #[test]
    fn reject_unterminated_list() {
        assert!(decode(b"li1e").is_err());
    }

    #[test]
    fn dict_round_trip_is_canonical() {
        // Key order in the input must not affect the re-encoding.
        let v = decode(b"d1:bi2e1:ai1ee").unwrap();
        assert_eq!(encode(&v).unwrap(), b"d1:ai1e1:bi2ee");
    }

    #[test]
    fn nested_structures() {
        let v = decode(b"d4:dictd1:k1:ve4:listli1ei2eee").unwrap();
        assert_eq!(v.get(b"list").unwrap().as_list().unwrap().len(), 2);
        assert_eq!(v.get(b"dict").unwrap().get(b"k").unwrap().as_str(), Some("v"));
    }

    #[test]
    fn depth_limit() {
        let mut deep = Vec::new();
        deep.extend(std::iter::repeat(b'l').take(100));
        deep.extend(std::iter::repeat(b'e').take(100));
        assert!(matches!(decode(&deep), Err(BencodeError::NestingTooDeep)));
    }

    #[test]
    fn decode_prefix_leaves_tail() {
        let (v, used) = decode_prefix(b"d1:ai1eeTRAILER").unwrap();
        assert_eq!(v.get(b"a").and_then(|v| v.as_integer()), Some(1));
        assert_eq!(used, 8);
    }
}
