//! Compact binary value encoding.
//!
//! Every value starts with a [`ValTag`] byte. Lengths and counts are LEB128
//! varints, fixed-width numbers are big-endian. Numbers and strings pick
//! the smallest of several exact encodings.

mod varint;

pub use varint::{decode_varint, encode_varint, varint_size};

use crate::error::{ArborError, ArborResult};
use crate::storage::layout::{TypeTag, ValTag};

/// Nesting limit for arrays, objects, maps and sets.
const MAX_DEPTH: usize = 128;

/// Largest integer an f64 carries exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Hebrew block encoded by the single-byte string form.
const HEBREW_FIRST: u32 = 0x0590;
const HEBREW_LAST: u32 = 0x05FF;
const HEBREW_BASE: u8 = 0x80;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    /// Arbitrary-precision integer as a big-endian magnitude.
    BigInt {
        negative: bool,
        magnitude: Vec<u8>,
    },
    String(String),
    Buffer(Vec<u8>),
    Array(Vec<Value>),
    /// Key order is preserved.
    Object(Vec<(String, Value)>),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    RegExp {
        source: String,
        flags: String,
    },
    Error {
        name: String,
        message: String,
    },
    Symbol(String),
    TypedArray {
        kind: String,
        bytes: Vec<u8>,
    },
    Function(String),
}

impl Value {
    /// Tag used when addressing this value through a smart pointer.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Undefined => TypeTag::Undefined,
            Value::Bool(_) => TypeTag::Boolean,
            Value::Number(_) => TypeTag::Number,
            Value::BigInt { negative: false, .. } => TypeTag::BigIntPos,
            Value::BigInt { negative: true, .. } => TypeTag::BigIntNeg,
            Value::String(_) => TypeTag::String,
            Value::Buffer(_) => TypeTag::Buffer,
            Value::Array(_) | Value::Object(_) => TypeTag::Json,
            Value::Map(_) => TypeTag::Map,
            Value::Set(_) => TypeTag::Set,
            Value::Date(_) => TypeTag::Date,
            Value::RegExp { .. } => TypeTag::RegExp,
            Value::Error { .. } => TypeTag::Error,
            Value::Symbol(_) => TypeTag::Symbol,
            Value::TypedArray { .. } => TypeTag::TypedArray,
            Value::Function(_) => TypeTag::Function,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

// Encoding

pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

pub fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.push(ValTag::Null as u8),
        Value::Undefined => buf.push(ValTag::Undefined as u8),
        Value::Bool(true) => buf.push(ValTag::BooleanTrue as u8),
        Value::Bool(false) => buf.push(ValTag::BooleanFalse as u8),
        Value::Number(n) => encode_number(*n, buf),
        Value::BigInt {
            negative,
            magnitude,
        } => {
            let tag = if *negative {
                ValTag::BigIntNeg
            } else {
                ValTag::BigIntPos
            };
            buf.push(tag as u8);
            put_bytes(magnitude, buf);
        }
        Value::String(s) => encode_string(s, buf),
        Value::Buffer(bytes) => {
            buf.push(ValTag::Buffer as u8);
            put_bytes(bytes, buf);
        }
        Value::Array(items) => {
            buf.push(ValTag::Array as u8);
            encode_varint(items.len() as u64, buf);
            for item in items {
                encode_into(item, buf);
            }
        }
        Value::Object(fields) => {
            buf.push(ValTag::Object as u8);
            encode_varint(fields.len() as u64, buf);
            for (key, item) in fields {
                put_str(key, buf);
                encode_into(item, buf);
            }
        }
        Value::Map(pairs) => {
            buf.push(ValTag::Map as u8);
            encode_varint(pairs.len() as u64, buf);
            for (key, item) in pairs {
                encode_into(key, buf);
                encode_into(item, buf);
            }
        }
        Value::Set(items) => {
            buf.push(ValTag::Set as u8);
            encode_varint(items.len() as u64, buf);
            for item in items {
                encode_into(item, buf);
            }
        }
        Value::Date(ms) => {
            buf.push(ValTag::Date as u8);
            buf.extend_from_slice(&ms.to_be_bytes());
        }
        Value::RegExp { source, flags } => {
            buf.push(ValTag::RegExp as u8);
            put_str(source, buf);
            put_str(flags, buf);
        }
        Value::Error { name, message } => {
            buf.push(ValTag::Error as u8);
            put_str(name, buf);
            put_str(message, buf);
        }
        Value::Symbol(desc) => {
            buf.push(ValTag::Symbol as u8);
            put_str(desc, buf);
        }
        Value::TypedArray { kind, bytes } => {
            buf.push(ValTag::TypedArray as u8);
            put_str(kind, buf);
            put_bytes(bytes, buf);
        }
        Value::Function(source) => {
            buf.push(ValTag::Function as u8);
            put_str(source, buf);
        }
    }
}

fn put_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    encode_varint(bytes.len() as u64, buf);
    buf.extend_from_slice(bytes);
}

fn put_str(s: &str, buf: &mut Vec<u8>) {
    put_bytes(s.as_bytes(), buf);
}

fn encode_number(n: f64, buf: &mut Vec<u8>) {
    if n.is_nan() {
        buf.push(ValTag::NaN as u8);
        return;
    }
    if n.is_infinite() {
        let tag = if n > 0.0 {
            ValTag::Infinity
        } else {
            ValTag::NegInfinity
        };
        buf.push(tag as u8);
        return;
    }

    let negative = n.is_sign_negative();
    let magnitude = n.abs();

    // -0.0 keeps its sign only through the double form
    if negative && magnitude == 0.0 {
        buf.push(ValTag::DoubleNeg as u8);
        buf.extend_from_slice(&0f64.to_be_bytes());
        return;
    }

    if magnitude.fract() == 0.0 && magnitude <= MAX_SAFE_INTEGER {
        let m = magnitude as u64;
        let (tag, width) = match (negative, m) {
            (false, 0..=0xFF) => (ValTag::Uint8, 1),
            (false, 0x100..=0xFFFF) => (ValTag::Uint16, 2),
            (false, 0x1_0000..=0xFFFF_FFFF) => (ValTag::Uint32, 4),
            (false, _) => (ValTag::Uint64, 8),
            (true, 0..=0xFF) => (ValTag::Int8Neg, 1),
            (true, 0x100..=0xFFFF) => (ValTag::Int16Neg, 2),
            (true, 0x1_0000..=0xFFFF_FFFF) => (ValTag::Int32Neg, 4),
            (true, _) => (ValTag::Int64Neg, 8),
        };
        buf.push(tag as u8);
        buf.extend_from_slice(&m.to_be_bytes()[8 - width..]);
        return;
    }

    let hundredths = (magnitude * 100.0).round();
    if hundredths / 100.0 == magnitude && hundredths <= 0xFFFF as f64 {
        let h = hundredths as u16;
        if h <= 0xFF {
            let tag = if negative {
                ValTag::FloatNeg1
            } else {
                ValTag::Float1
            };
            buf.push(tag as u8);
            buf.push(h as u8);
        } else {
            let tag = if negative {
                ValTag::FloatNeg2
            } else {
                ValTag::Float2
            };
            buf.push(tag as u8);
            buf.extend_from_slice(&h.to_be_bytes());
        }
        return;
    }

    let single = magnitude as f32;
    if single as f64 == magnitude {
        let tag = if negative {
            ValTag::FloatNeg4
        } else {
            ValTag::Float4
        };
        buf.push(tag as u8);
        buf.extend_from_slice(&single.to_be_bytes());
        return;
    }

    let tag = if negative {
        ValTag::DoubleNeg
    } else {
        ValTag::DoublePos
    };
    buf.push(tag as u8);
    buf.extend_from_slice(&magnitude.to_be_bytes());
}

fn encode_string(s: &str, buf: &mut Vec<u8>) {
    let mut best = Vec::with_capacity(s.len() + 2);
    best.push(ValTag::String as u8);
    put_str(s, &mut best);

    if let Some(hebrew) = encode_hebrew(s)
        && hebrew.len() < best.len()
    {
        best = hebrew;
    }

    let rle = encode_rle(s);
    if rle.len() < best.len() {
        best = rle;
    }

    buf.extend_from_slice(&best);
}

/// Runs of repeated characters as `(count, codepoint)` pairs.
fn encode_rle(s: &str) -> Vec<u8> {
    let mut runs: Vec<(u64, u32)> = Vec::new();
    for ch in s.chars() {
        match runs.last_mut() {
            Some((count, cp)) if *cp == ch as u32 => *count += 1,
            _ => runs.push((1, ch as u32)),
        }
    }

    let mut out = vec![ValTag::StringRle as u8];
    encode_varint(runs.len() as u64, &mut out);
    for (count, cp) in runs {
        encode_varint(count, &mut out);
        encode_varint(cp as u64, &mut out);
    }
    out
}

/// One byte per character, for text made only of ASCII and Hebrew.
fn encode_hebrew(s: &str) -> Option<Vec<u8>> {
    let mut body = Vec::with_capacity(s.len());
    let mut count = 0u64;
    for ch in s.chars() {
        let cp = ch as u32;
        if cp < 0x80 {
            body.push(cp as u8);
        } else if (HEBREW_FIRST..=HEBREW_LAST).contains(&cp) {
            body.push(HEBREW_BASE + (cp - HEBREW_FIRST) as u8);
        } else {
            return None;
        }
        count += 1;
    }

    let mut out = vec![ValTag::StringHebrew as u8];
    encode_varint(count, &mut out);
    out.extend_from_slice(&body);
    Some(out)
}

// Decoding

/// Decode one value occupying all of `buf`.
pub fn decode(buf: &[u8]) -> ArborResult<Value> {
    let mut reader = Reader { buf, pos: 0 };
    let value = reader.value(0)?;
    if reader.pos != buf.len() {
        return Err(ArborError::Codec(format!(
            "{} trailing bytes after value",
            buf.len() - reader.pos
        )));
    }
    Ok(value)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> ArborResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| ArborError::Codec("unexpected end of input".into()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn byte(&mut self) -> ArborResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn varint(&mut self) -> ArborResult<u64> {
        let (value, used) = decode_varint(&self.buf[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    fn len(&mut self) -> ArborResult<usize> {
        let n = self.varint()?;
        // a length can never exceed what is left to read
        if n > (self.buf.len() - self.pos) as u64 {
            return Err(ArborError::Codec(format!("length {} overruns input", n)));
        }
        Ok(n as usize)
    }

    fn bytes(&mut self) -> ArborResult<Vec<u8>> {
        let n = self.len()?;
        Ok(self.take(n)?.to_vec())
    }

    fn string(&mut self) -> ArborResult<String> {
        let n = self.len()?;
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec()).map_err(|e| ArborError::Codec(e.to_string()))
    }

    fn uint(&mut self, width: usize) -> ArborResult<u64> {
        let raw = self.take(width)?;
        Ok(raw.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }

    fn f64(&mut self) -> ArborResult<f64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(f64::from_be_bytes(bytes))
    }

    fn value(&mut self, depth: usize) -> ArborResult<Value> {
        if depth > MAX_DEPTH {
            return Err(ArborError::Codec("value nested too deeply".into()));
        }

        let tag = ValTag::try_from(self.byte()?)?;
        let value = match tag {
            ValTag::Null => Value::Null,
            ValTag::Undefined => Value::Undefined,
            ValTag::BooleanTrue => Value::Bool(true),
            ValTag::BooleanFalse => Value::Bool(false),
            ValTag::NaN => Value::Number(f64::NAN),
            ValTag::Infinity => Value::Number(f64::INFINITY),
            ValTag::NegInfinity => Value::Number(f64::NEG_INFINITY),
            ValTag::Uint8 => Value::Number(self.uint(1)? as f64),
            ValTag::Uint16 => Value::Number(self.uint(2)? as f64),
            ValTag::Uint32 => Value::Number(self.uint(4)? as f64),
            ValTag::Uint64 => Value::Number(self.uint(8)? as f64),
            ValTag::Int8Neg => Value::Number(-(self.uint(1)? as f64)),
            ValTag::Int16Neg => Value::Number(-(self.uint(2)? as f64)),
            ValTag::Int32Neg => Value::Number(-(self.uint(4)? as f64)),
            ValTag::Int64Neg => Value::Number(-(self.uint(8)? as f64)),
            ValTag::DoublePos => Value::Number(self.f64()?),
            ValTag::DoubleNeg => Value::Number(-self.f64()?),
            ValTag::Float1 => Value::Number(self.uint(1)? as f64 / 100.0),
            ValTag::Float2 => Value::Number(self.uint(2)? as f64 / 100.0),
            ValTag::FloatNeg1 => Value::Number(-(self.uint(1)? as f64 / 100.0)),
            ValTag::FloatNeg2 => Value::Number(-(self.uint(2)? as f64 / 100.0)),
            ValTag::Float4 => Value::Number(f32::from_bits(self.uint(4)? as u32) as f64),
            ValTag::FloatNeg4 => Value::Number(-(f32::from_bits(self.uint(4)? as u32) as f64)),
            ValTag::String => Value::String(self.string()?),
            ValTag::StringRle => Value::String(self.rle()?),
            ValTag::StringHebrew => Value::String(self.hebrew()?),
            ValTag::Buffer => Value::Buffer(self.bytes()?),
            ValTag::Array => {
                let n = self.len()?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.value(depth + 1)?);
                }
                Value::Array(items)
            }
            ValTag::Object => {
                let n = self.len()?;
                let mut fields = Vec::with_capacity(n);
                for _ in 0..n {
                    let key = self.string()?;
                    fields.push((key, self.value(depth + 1)?));
                }
                Value::Object(fields)
            }
            ValTag::Map => {
                let n = self.len()?;
                let mut pairs = Vec::with_capacity(n);
                for _ in 0..n {
                    let key = self.value(depth + 1)?;
                    pairs.push((key, self.value(depth + 1)?));
                }
                Value::Map(pairs)
            }
            ValTag::Set => {
                let n = self.len()?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.value(depth + 1)?);
                }
                Value::Set(items)
            }
            ValTag::Date => Value::Date(self.f64()?),
            ValTag::RegExp => Value::RegExp {
                source: self.string()?,
                flags: self.string()?,
            },
            ValTag::Error => Value::Error {
                name: self.string()?,
                message: self.string()?,
            },
            ValTag::Symbol => Value::Symbol(self.string()?),
            ValTag::TypedArray => Value::TypedArray {
                kind: self.string()?,
                bytes: self.bytes()?,
            },
            ValTag::Function => Value::Function(self.string()?),
            ValTag::BigIntPos | ValTag::BigIntNeg => Value::BigInt {
                negative: tag == ValTag::BigIntNeg,
                magnitude: self.bytes()?,
            },
            ValTag::JsBigInt => {
                return Err(ArborError::Codec(
                    "legacy bigint encoding is not supported".into(),
                ));
            }
        };
        Ok(value)
    }

    fn rle(&mut self) -> ArborResult<String> {
        let runs = self.len()?;
        let mut out = String::new();
        for _ in 0..runs {
            let count = self.varint()?;
            let cp = self.varint()?;
            let ch = u32::try_from(cp)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| ArborError::Codec(format!("invalid code point {}", cp)))?;
            if count > (self.buf.len() as u64).saturating_mul(1 << 16) {
                return Err(ArborError::Codec(format!("run of {} is implausible", count)));
            }
            out.extend(std::iter::repeat_n(ch, count as usize));
        }
        Ok(out)
    }

    fn hebrew(&mut self) -> ArborResult<String> {
        let n = self.len()?;
        let raw = self.take(n)?;
        raw.iter()
            .map(|&b| {
                if b < 0x80 {
                    Ok(b as char)
                } else {
                    let cp = HEBREW_FIRST + (b - HEBREW_BASE) as u32;
                    if cp > HEBREW_LAST {
                        return Err(ArborError::Codec(format!("invalid hebrew byte {:#x}", b)));
                    }
                    char::from_u32(cp)
                        .ok_or_else(|| ArborError::Codec(format!("invalid code point {}", cp)))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn round_trip(value: Value) -> Vec<u8> {
        let bytes = encode(&value);
        assert_eq!(decode(&bytes).unwrap(), value);
        bytes
    }

    #[test]
    fn test_number_widths() {
        assert_eq!(round_trip(Value::Number(0.0)), vec![ValTag::Uint8 as u8, 0]);
        assert_eq!(round_trip(Value::Number(300.0))[0], ValTag::Uint16 as u8);
        assert_eq!(round_trip(Value::Number(-70_000.0))[0], ValTag::Int32Neg as u8);
        assert_eq!(round_trip(Value::Number(2f64.powi(40)))[0], ValTag::Uint64 as u8);
        assert_eq!(round_trip(Value::Number(1.5)), vec![ValTag::Float1 as u8, 150]);
        assert_eq!(round_trip(Value::Number(-12.34))[0], ValTag::FloatNeg2 as u8);
        assert_eq!(round_trip(Value::Number(0.125))[0], ValTag::Float4 as u8);
        assert_eq!(round_trip(Value::Number(std::f64::consts::PI))[0], ValTag::DoublePos as u8);
    }

    #[test]
    fn test_special_numbers() {
        let nan = encode(&Value::Number(f64::NAN));
        assert_eq!(nan, vec![ValTag::NaN as u8]);
        assert!(matches!(decode(&nan).unwrap(), Value::Number(n) if n.is_nan()));

        round_trip(Value::Number(f64::NEG_INFINITY));

        let neg_zero = encode(&Value::Number(-0.0));
        assert_eq!(neg_zero[0], ValTag::DoubleNeg as u8);
        match decode(&neg_zero).unwrap() {
            Value::Number(n) => assert!(n == 0.0 && n.is_sign_negative()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_string_forms() {
        let plain = round_trip(Value::from("hello world"));
        assert_eq!(plain[0], ValTag::String as u8);

        let runs = round_trip(Value::from("aaaaaaaaaaaaaaaaaaaabbbbbbbbbb"));
        assert_eq!(runs[0], ValTag::StringRle as u8);

        let hebrew = round_trip(Value::from("שלום world"));
        assert_eq!(hebrew[0], ValTag::StringHebrew as u8);
        assert_eq!(hebrew.len(), 2 + "שלום world".chars().count());

        let mixed = round_trip(Value::from("日本語"));
        assert_eq!(mixed[0], ValTag::String as u8);
    }

    #[test]
    fn test_containers() {
        let value = Value::Object(vec![
            ("name".into(), Value::from("arbor")),
            (
                "tags".into(),
                Value::Array(vec![Value::Bool(true), Value::Null, Value::Number(7.0)]),
            ),
            (
                "meta".into(),
                Value::Map(vec![(Value::Number(1.0), Value::Set(vec![Value::Undefined]))]),
            ),
            (
                "when".into(),
                Value::Date(1_700_000_000_000.0),
            ),
            (
                "err".into(),
                Value::Error {
                    name: "TypeError".into(),
                    message: "nope".into(),
                },
            ),
        ]);
        round_trip(value);

        round_trip(Value::BigInt {
            negative: true,
            magnitude: vec![1, 0, 0, 0, 0, 0, 0, 0, 0],
        });
        round_trip(Value::TypedArray {
            kind: "Uint8Array".into(),
            bytes: vec![1, 2, 3],
        });
    }

    #[test]
    fn test_type_tags() {
        assert_eq!(Value::Array(vec![]).type_tag(), TypeTag::Json);
        assert_eq!(Value::from("x").type_tag(), TypeTag::String);
        assert_eq!(
            Value::BigInt {
                negative: true,
                magnitude: vec![1]
            }
            .type_tag(),
            TypeTag::BigIntNeg
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(decode(&[ValTag::JsBigInt as u8, 0]).is_err());
        assert!(decode(&[200]).is_err());
        assert!(decode(&[ValTag::Uint16 as u8, 1]).is_err());
        assert!(decode(&[ValTag::Null as u8, 0]).is_err());
        assert!(decode(&[ValTag::String as u8, 50, b'a']).is_err());

        let mut deep = Vec::new();
        for _ in 0..200 {
            deep.extend_from_slice(&[ValTag::Array as u8, 1]);
        }
        deep.push(ValTag::Null as u8);
        assert!(decode(&deep).is_err());
    }
}
