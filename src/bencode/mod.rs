//! A minimal bencode codec.
//!
//! Bencode has four kinds of values: byte strings (`<len>:<bytes>`),
//! integers (`i<signed-decimal>e`), lists (`l<items>e`), and dictionaries
//! (`d<key-value pairs>e`). This module implements a total serializer and a
//! partial deserializer for all four, plus the canonical-encoding rules
//! required to make info-hash computation well defined: dictionary keys are
//! always emitted in ascending byte order (guaranteed here by using a
//! `BTreeMap<Vec<u8>, Value>` as the dictionary representation) and integers
//! are always emitted in shortest decimal form.
//!
//! Decoding rejects anything that isn't canonical or well formed: a
//! non-decimal length prefix, trailing top-level data, an unterminated
//! container, a non-string dictionary key, or an integer with a leading
//! zero (other than a bare `0`) or a `-0`.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A decoded or to-be-encoded bencode value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
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
        self.as_dict()?.get(key.as_bytes())
    }
}

/// Serializes `value` into its canonical bencode representation.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            // `BTreeMap` iterates in ascending key order, which is exactly
            // the canonical ordering bencode dictionaries require.
            for (key, val) in map {
                encode_into(&Value::Bytes(key.clone()), out);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

/// Deserializes a single top-level bencode value from `input`.
///
/// Fails with `Error::MalformedBencode` if `input` contains anything other
/// than exactly one well-formed, canonical value.
pub fn decode(input: &[u8]) -> Result<Value> {
    let mut parser = Parser { buf: input, pos: 0 };
    let value = parser.parse_value()?;
    if parser.pos != parser.buf.len() {
        return Err(Error::MalformedBencode(
            "trailing data after top-level value".into(),
        ));
    }
    Ok(value)
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or_else(|| {
            Error::MalformedBencode("unexpected end of input".into())
        })
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => self.parse_bytes().map(Value::Bytes),
            other => Err(Error::MalformedBencode(format!(
                "unexpected byte {:?} at position {}",
                other as char, self.pos
            ))),
        }
    }

    /// Parses a decimal run (optionally signed) without interpreting it,
    /// returning the slice of digit bytes consumed and whether it was
    /// negative. Used by both integer and byte-string-length parsing so the
    /// leading-zero rule is enforced identically in both places.
    fn parse_decimal_digits(&mut self) -> Result<(bool, &'a [u8])> {
        let start = self.pos;
        let negative = self.peek()? == b'-';
        if negative {
            self.advance();
        }
        let digits_start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos].is_ascii_digit()
        {
            self.advance();
        }
        let digits = &self.buf[digits_start..self.pos];
        if digits.is_empty() {
            return Err(Error::MalformedBencode(format!(
                "expected decimal digits at position {}",
                start
            )));
        }
        // Reject leading zeros other than a bare "0", and reject "-0"
        // altogether (both forms are redundant and thus non-canonical).
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(Error::MalformedBencode(
                "integer has leading zero".into(),
            ));
        }
        if negative && digits == b"0" {
            return Err(Error::MalformedBencode("negative zero".into()));
        }
        Ok((negative, digits))
    }

    fn parse_int(&mut self) -> Result<Value> {
        debug_assert_eq!(self.peek()?, b'i');
        self.advance();
        let (negative, digits) = self.parse_decimal_digits()?;
        let text = std::str::from_utf8(digits)
            .map_err(|_| Error::MalformedBencode("non-utf8 integer".into()))?;
        let mut n: i64 = text
            .parse()
            .map_err(|_| Error::MalformedBencode("integer overflow".into()))?;
        if negative {
            n = -n;
        }
        if self.peek()? != b'e' {
            return Err(Error::MalformedBencode(
                "unterminated integer".into(),
            ));
        }
        self.advance();
        Ok(Value::Int(n))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let (negative, digits) = self.parse_decimal_digits()?;
        if negative {
            return Err(Error::MalformedBencode(
                "negative byte string length".into(),
            ));
        }
        let text = std::str::from_utf8(digits)
            .map_err(|_| Error::MalformedBencode("non-utf8 length".into()))?;
        let len: usize = text.parse().map_err(|_| {
            Error::MalformedBencode("byte string length overflow".into())
        })?;
        if self.peek()? != b':' {
            return Err(Error::MalformedBencode(
                "expected ':' after byte string length".into(),
            ));
        }
        self.advance();
        if self.pos + len > self.buf.len() {
            return Err(Error::MalformedBencode(
                "byte string runs past end of input".into(),
            ));
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Value> {
        debug_assert_eq!(self.peek()?, b'l');
        self.advance();
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.advance();
                return Ok(Value::List(items));
            }
            items.push(self.parse_value()?);
        }
    }

    fn parse_dict(&mut self) -> Result<Value> {
        debug_assert_eq!(self.peek()?, b'd');
        self.advance();
        let mut map = BTreeMap::new();
        let mut prev_key: Option<Vec<u8>> = None;
        loop {
            if self.peek()? == b'e' {
                self.advance();
                return Ok(Value::Dict(map));
            }
            if !self.peek()?.is_ascii_digit() {
                return Err(Error::MalformedBencode(
                    "dictionary key must be a byte string".into(),
                ));
            }
            let key = self.parse_bytes()?;
            if let Some(prev) = &prev_key {
                if key <= *prev {
                    return Err(Error::MalformedBencode(
                        "dictionary keys out of order".into(),
                    ));
                }
            }
            let val = self.parse_value()?;
            prev_key = Some(key.clone());
            map.insert(key, val);
        }
    }
}

/// Convenience constructors used throughout the metainfo/tracker modules.
impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Bytes(s.as_ref().as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: Vec<(&str, Value)>) -> Value {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.as_bytes().to_vec(), v);
        }
        Value::Dict(map)
    }

    #[test]
    fn decode_byte_string() {
        assert_eq!(decode(b"4:spam").unwrap(), Value::bytes(*b"spam"));
    }

    #[test]
    fn decode_empty_byte_string() {
        assert_eq!(decode(b"0:").unwrap(), Value::bytes(Vec::new()));
    }

    #[test]
    fn decode_positive_int() {
        assert_eq!(decode(b"i3e").unwrap(), Value::Int(3));
    }

    #[test]
    fn decode_negative_int() {
        assert_eq!(decode(b"i-3e").unwrap(), Value::Int(-3));
    }

    #[test]
    fn decode_zero() {
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
    }

    #[test]
    fn reject_negative_zero() {
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn reject_leading_zero() {
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"03:abc").is_err());
    }

    #[test]
    fn decode_list() {
        assert_eq!(
            decode(b"l4:spam4:eggse").unwrap(),
            Value::List(vec![Value::bytes(*b"spam"), Value::bytes(*b"eggs")])
        );
    }

    #[test]
    fn decode_dict() {
        assert_eq!(
            decode(b"d3:cow3:moo4:spam4:eggse").unwrap(),
            dict(vec![
                ("cow", Value::bytes(*b"moo")),
                ("spam", Value::bytes(*b"eggs")),
            ])
        );
    }

    #[test]
    fn reject_out_of_order_dict_keys() {
        assert!(decode(b"d4:spam4:eggs3:cow3:mooe").is_err());
    }

    #[test]
    fn reject_non_string_dict_key() {
        assert!(decode(b"di1e3:fooe").is_err());
    }

    #[test]
    fn reject_unterminated_container() {
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"d3:cow3:moo").is_err());
    }

    #[test]
    fn reject_trailing_data() {
        assert!(decode(b"i3eextra").is_err());
    }

    #[test]
    fn reject_non_decimal_length() {
        assert!(decode(b"a:bcde").is_err());
    }

    #[test]
    fn round_trip_well_formed_values() {
        let values = vec![
            Value::Int(0),
            Value::Int(-17),
            Value::bytes(*b"hello world"),
            Value::List(vec![Value::Int(1), Value::bytes(*b"two")]),
            dict(vec![
                ("a", Value::Int(1)),
                ("b", Value::List(vec![Value::Int(2), Value::Int(3)])),
            ]),
        ];
        for value in values {
            let encoded = encode(&value);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn round_trip_canonical_blob() {
        let blob: &[u8] = b"d3:bar4:spam3:fooi42ee";
        let decoded = decode(blob).unwrap();
        assert_eq!(encode(&decoded), blob);
    }

    #[test]
    fn dict_keys_are_emitted_in_ascending_order_regardless_of_insertion() {
        let mut map = BTreeMap::new();
        map.insert(b"zebra".to_vec(), Value::Int(1));
        map.insert(b"apple".to_vec(), Value::Int(2));
        let encoded = encode(&Value::Dict(map));
        assert_eq!(encoded, b"d5:applei2e5:zebrai1ee");
    }
}
