//! The bencode codec (component A).
//!
//! Bencode has four value kinds: integers (`i<digits>e`), byte strings
//! (`<len>:<bytes>`), lists (`l...e`) and dictionaries (`d...e`). This module
//! implements both directions and is deliberately stricter than a
//! best-effort parser: anything that isn't the single canonical encoding of
//! a value is rejected rather than guessed at, because torrent and tracker
//! wire formats depend on canonical dictionaries (info-hash hashing requires
//! byte-for-byte stable encoding of the `info` dict).

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};

pub use crate::error::bencode::{BencodeError, Result};

/// A decoded bencode value.
///
/// Dictionary keys are byte strings per the spec; we store them as `Vec<u8>`
/// rather than `String` since torrent files are not guaranteed to be valid
/// UTF-8 (binary fields like `pieces` live inside dictionaries too, though
/// never as keys).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
  /// An integer within the range of a 64-bit signed integer.
  Int(i64),
  /// An integer whose decimal representation didn't fit in 64 bits. Bencode
  /// places no bound on integer size, so the exact digit string is kept
  /// rather than losing precision.
  BigInt(String),
  /// A byte string. May or may not be valid UTF-8.
  Bytes(Vec<u8>),
  /// An ordered list of values.
  List(Vec<Value>),
  /// A dictionary. Kept as a `BTreeMap` so iteration is always in sorted key
  /// order, which is what makes re-encoding canonical "for free".
  Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      Value::Bytes(b) => Some(b),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Value]> {
    match self {
      Value::List(l) => Some(l),
      _ => None,
    }
  }

  pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
    match self {
      Value::Dict(d) => Some(d),
      _ => None,
    }
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.as_dict().and_then(|d| d.get(key.as_bytes()))
  }
}

/// Decodes a single bencode value from `input`.
///
/// The whole input must be consumed by exactly one value; any leftover bytes
/// are a `TrailingData` error, since this is the entry point used for
/// complete messages (metainfo files, tracker responses), not for framing a
/// stream of values.
pub fn decode(input: &[u8]) -> Result<Value> {
  let mut pos = 0;
  let value = decode_value(input, &mut pos)?;
  if pos != input.len() {
    return Err(BencodeError::TrailingData);
  }
  Ok(value)
}

fn decode_value(input: &[u8], pos: &mut usize) -> Result<Value> {
  match peek(input, *pos)? {
    b'i' => decode_int(input, pos),
    b'l' => decode_list(input, pos),
    b'd' => decode_dict(input, pos),
    b'0'..=b'9' => decode_bytes(input, pos).map(Value::Bytes),
    other => Err(BencodeError::UnknownToken(other)),
  }
}

fn peek(input: &[u8], pos: usize) -> Result<u8> {
  input.get(pos).copied().ok_or(BencodeError::UnexpectedEof)
}

fn expect(input: &[u8], pos: &mut usize, byte: u8) -> Result<()> {
  if peek(input, *pos)? != byte {
    return Err(BencodeError::UnexpectedEof);
  }
  *pos += 1;
  Ok(())
}

/// Decodes `i<digits>e`, rejecting leading zeros (except the literal `0`)
/// and the literal `-0`.
fn decode_int(input: &[u8], pos: &mut usize) -> Result<Value> {
  expect(input, pos, b'i')?;
  let start = *pos;
  let end = find(input, *pos, b'e')?;
  let digits = &input[start..end];
  validate_int_digits(digits)?;
  *pos = end + 1;

  let text =
    std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
  // Mirrors the float-safe-integer boundary of the source this was ported
  // from: anything outside ±(2^53 - 1) surfaces as arbitrary-precision, not
  // just values that overflow an i64.
  match text.parse::<i64>() {
    Ok(i) if i.unsigned_abs() <= MAX_SAFE_INT => Ok(Value::Int(i)),
    _ => Ok(Value::BigInt(text.to_owned())),
  }
}

/// 2^53 - 1, the largest integer a float can represent exactly.
const MAX_SAFE_INT: u64 = 9_007_199_254_740_991;

fn validate_int_digits(digits: &[u8]) -> Result<()> {
  if digits.is_empty() {
    return Err(BencodeError::InvalidInteger);
  }
  let (negative, rest) = match digits[0] {
    b'-' => (true, &digits[1..]),
    _ => (false, digits),
  };
  if rest.is_empty() || !rest.iter().all(u8::is_ascii_digit) {
    return Err(BencodeError::InvalidInteger);
  }
  if rest == b"0" && negative {
    return Err(BencodeError::NegativeZero);
  }
  if rest.len() > 1 && rest[0] == b'0' {
    return Err(BencodeError::LeadingZero);
  }
  Ok(())
}

/// Decodes `<len>:<bytes>`.
fn decode_bytes(input: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
  let len_start = *pos;
  let colon = find(input, *pos, b':')?;
  let len_digits = &input[len_start..colon];
  if len_digits.is_empty()
    || !len_digits.iter().all(u8::is_ascii_digit)
    || (len_digits.len() > 1 && len_digits[0] == b'0')
  {
    return Err(BencodeError::InvalidLength);
  }
  let len: usize = std::str::from_utf8(len_digits)
    .ok()
    .and_then(|s| s.parse().ok())
    .ok_or(BencodeError::InvalidLength)?;

  let data_start = colon + 1;
  let data_end = data_start
    .checked_add(len)
    .ok_or(BencodeError::InvalidLength)?;
  if data_end > input.len() {
    return Err(BencodeError::UnexpectedEof);
  }
  *pos = data_end;
  Ok(input[data_start..data_end].to_vec())
}

fn decode_list(input: &[u8], pos: &mut usize) -> Result<Value> {
  expect(input, pos, b'l')?;
  let mut items = Vec::new();
  loop {
    if peek(input, *pos)? == b'e' {
      *pos += 1;
      break;
    }
    items.push(decode_value(input, pos)?);
  }
  Ok(Value::List(items))
}

fn decode_dict(input: &[u8], pos: &mut usize) -> Result<Value> {
  expect(input, pos, b'd')?;
  let mut map = BTreeMap::new();
  let mut prev_key: Option<Vec<u8>> = None;
  loop {
    if peek(input, *pos)? == b'e' {
      *pos += 1;
      break;
    }
    if peek(input, *pos)? != b'0' && !peek(input, *pos)?.is_ascii_digit() {
      return Err(BencodeError::NonStringKey);
    }
    let key = decode_bytes(input, pos)?;
    if let Some(prev) = &prev_key {
      match key.as_slice().cmp(prev.as_slice()) {
        std::cmp::Ordering::Greater => {}
        std::cmp::Ordering::Equal => return Err(BencodeError::DuplicateKey),
        std::cmp::Ordering::Less => return Err(BencodeError::KeysNotSorted),
      }
    }
    let value = decode_value(input, pos)?;
    prev_key = Some(key.clone());
    map.insert(key, value);
  }
  Ok(Value::Dict(map))
}

fn find(input: &[u8], from: usize, byte: u8) -> Result<usize> {
  input[from..]
    .iter()
    .position(|&b| b == byte)
    .map(|i| from + i)
    .ok_or(BencodeError::UnexpectedEof)
}

/// Encodes a value into its canonical bencode representation.
///
/// Dictionary keys are always emitted in sorted order (guaranteed by
/// `Value::Dict` being a `BTreeMap`) and integers never carry a leading
/// zero, so `decode(encode(v)) == v` for any value produced by `decode`.
pub fn encode(value: &Value) -> Vec<u8> {
  let mut buf = BytesMut::new();
  encode_into(value, &mut buf);
  buf.to_vec()
}

fn encode_into(value: &Value, buf: &mut BytesMut) {
  match value {
    Value::Int(i) => {
      buf.put_u8(b'i');
      buf.extend_from_slice(i.to_string().as_bytes());
      buf.put_u8(b'e');
    }
    Value::BigInt(s) => {
      buf.put_u8(b'i');
      buf.extend_from_slice(s.as_bytes());
      buf.put_u8(b'e');
    }
    Value::Bytes(b) => {
      buf.extend_from_slice(b.len().to_string().as_bytes());
      buf.put_u8(b':');
      buf.extend_from_slice(b);
    }
    Value::List(items) => {
      buf.put_u8(b'l');
      for item in items {
        encode_into(item, buf);
      }
      buf.put_u8(b'e');
    }
    Value::Dict(map) => {
      buf.put_u8(b'd');
      for (key, val) in map {
        encode_into(&Value::Bytes(key.clone()), buf);
        encode_into(val, buf);
      }
      buf.put_u8(b'e');
    }
  }
}

/// Convenience constructor for a dictionary built from owned entries, always
/// sorted by insertion into the underlying `BTreeMap`.
pub fn dict(entries: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
  Value::Dict(
    entries
      .into_iter()
      .map(|(k, v)| (k.as_bytes().to_vec(), v))
      .collect(),
  )
}

pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
  Value::Bytes(b.into())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trip_concrete_scenario() {
    let value = decode(b"d3:bari2e3:foo4:spame").unwrap();
    let dict = value.as_dict().unwrap();
    assert_eq!(dict.get(b"bar".as_slice()).unwrap().as_int(), Some(2));
    assert_eq!(dict.get(b"foo".as_slice()).unwrap().as_str(), Some("spam"));

    let encoded = encode(&value);
    assert_eq!(encoded, b"d3:bari2e3:foo4:spame");
  }

  #[test]
  fn decode_encode_round_trip_is_lossless() {
    let value = dict([
      ("foo", bytes("spam")),
      ("bar", Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])),
      ("baz", Value::Int(-42)),
    ]);
    let encoded = encode(&value);
    let decoded = decode(&encoded).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(encode(&decoded), encoded);
  }

  #[test]
  fn rejects_leading_zero() {
    assert_eq!(decode(b"i03e"), Err(BencodeError::LeadingZero));
  }

  #[test]
  fn accepts_zero() {
    assert_eq!(decode(b"i0e").unwrap().as_int(), Some(0));
  }

  #[test]
  fn rejects_negative_zero() {
    assert_eq!(decode(b"i-0e"), Err(BencodeError::NegativeZero));
  }

  #[test]
  fn rejects_unsorted_keys() {
    assert_eq!(
      decode(b"d3:foo3:bar3:bar3:baze"),
      Err(BencodeError::KeysNotSorted)
    );
  }

  #[test]
  fn rejects_duplicate_keys() {
    assert_eq!(
      decode(b"d3:bari1e3:bari2ee"),
      Err(BencodeError::DuplicateKey)
    );
  }

  #[test]
  fn rejects_truncated_string() {
    assert_eq!(decode(b"5:abc"), Err(BencodeError::UnexpectedEof));
  }

  #[test]
  fn rejects_missing_terminator() {
    assert_eq!(decode(b"d3:bari2e"), Err(BencodeError::UnexpectedEof));
  }

  #[test]
  fn rejects_trailing_data() {
    assert_eq!(decode(b"i1eextra"), Err(BencodeError::TrailingData));
  }

  #[test]
  fn integers_past_the_53_bit_safe_range_surface_as_bigint() {
    // 2^53 + 1: well within i64 range, but outside the float-safe range.
    let decoded = decode(b"i9007199254740993e").unwrap();
    assert_eq!(decoded, Value::BigInt("9007199254740993".to_string()));
  }

  #[test]
  fn the_largest_safe_integer_still_decodes_as_int() {
    let decoded = decode(b"i9007199254740991e").unwrap();
    assert_eq!(decoded, Value::Int(9_007_199_254_740_991));
  }

  #[test]
  fn big_integers_round_trip_without_precision_loss() {
    let huge = "123456789012345678901234567890";
    let encoded = format!("i{huge}e");
    let decoded = decode(encoded.as_bytes()).unwrap();
    assert_eq!(decoded, Value::BigInt(huge.to_string()));
    assert_eq!(encode(&decoded), encoded.as_bytes());
  }

  #[test]
  fn nested_structures_round_trip() {
    let value = decode(b"d4:infod4:name3:foo6:lengthi1024eee").unwrap();
    assert_eq!(encode(&value), b"d4:infod4:name3:foo6:lengthi1024eee");
  }
}
