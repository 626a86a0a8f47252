//! Payload field codec.
//!
//! Payloads are flat byte buffers described by a format string of
//! single-letter type codes:
//!
//! | code | type | encoding |
//! |------|------|----------|
//! | `I`  | int32 | 4 bytes, big-endian |
//! | `D`  | double | 8 bytes, big-endian IEEE-754 bits |
//! | `S`  | string | u32 length prefix, then the raw bytes |
//! | `A`  | array of strings | int32 count, then one `S`-encoded blob of NUL-joined strings |
//!
//! String length is authoritative: embedded NULs and bytes that are not
//! UTF-8 survive a round trip. [`Unpacker::string`] decodes lossily for
//! fields that are names; [`Unpacker::bytes`] returns the raw content.
//! Array elements are joined with NUL and therefore may not contain one.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Codec failures. All of them mean the payload cannot be trusted.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("unknown format code '{0}'")]
    UnknownCode(char),

    #[error("format expects {expected} values, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("value {index} does not match format code '{code}'")]
    TypeMismatch { index: usize, code: char },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("payload truncated: need {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("negative array count {0}")]
    NegativeCount(i32),

    #[error("array declares {declared} elements but blob holds {found}")]
    ArrayCountMismatch { declared: usize, found: usize },

    #[error("array element {index} contains an embedded NUL")]
    EmbeddedNul { index: usize },

    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),

    #[error("field too large to encode ({0} bytes)")]
    TooLarge(usize),
}

/// One decoded (or to-be-encoded) payload field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Double(f64),
    /// Raw `S` content, not necessarily UTF-8.
    Str(Vec<u8>),
    Array(Vec<String>),
}

impl Value {
    fn code(&self) -> char {
        match self {
            Value::Int(_) => 'I',
            Value::Double(_) => 'D',
            Value::Str(_) => 'S',
            Value::Array(_) => 'A',
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Str(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Str(v.to_vec())
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::Array(v)
    }
}

fn check_code(c: char) -> Result<(), CodecError> {
    match c {
        'I' | 'D' | 'S' | 'A' => Ok(()),
        other => Err(CodecError::UnknownCode(other)),
    }
}

fn validate(format: &str, values: &[Value]) -> Result<(), CodecError> {
    let expected = format.chars().count();
    if expected != values.len() {
        return Err(CodecError::ArityMismatch {
            expected,
            got: values.len(),
        });
    }
    for (index, (code, value)) in format.chars().zip(values).enumerate() {
        check_code(code)?;
        if value.code() != code {
            return Err(CodecError::TypeMismatch { index, code });
        }
        if let Value::Array(items) = value {
            if let Some(bad) = items.iter().position(|s| s.contains('\0')) {
                return Err(CodecError::EmbeddedNul { index: bad });
            }
        }
    }
    Ok(())
}

fn array_blob_len(items: &[String]) -> usize {
    if items.is_empty() {
        return 0;
    }
    items.iter().map(String::len).sum::<usize>() + items.len() - 1
}

fn value_len(value: &Value) -> usize {
    match value {
        Value::Int(_) => 4,
        Value::Double(_) => 8,
        Value::Str(s) => 4 + s.len(),
        Value::Array(items) => 4 + 4 + array_blob_len(items),
    }
}

/// Exact number of bytes `pack(format, values)` would produce.
pub fn encoded_len(format: &str, values: &[Value]) -> Result<usize, CodecError> {
    validate(format, values)?;
    Ok(values.iter().map(value_len).sum())
}

fn put_str<B: BufMut>(buf: &mut B, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(bytes.len()).map_err(|_| CodecError::TooLarge(bytes.len()))?;
    buf.put_u32(len);
    buf.put_slice(bytes);
    Ok(())
}

fn put_value<B: BufMut>(buf: &mut B, value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Int(v) => buf.put_i32(*v),
        Value::Double(v) => buf.put_u64(v.to_bits()),
        Value::Str(s) => put_str(buf, s)?,
        Value::Array(items) => {
            let count =
                i32::try_from(items.len()).map_err(|_| CodecError::TooLarge(items.len()))?;
            buf.put_i32(count);
            put_str(buf, items.join("\0").as_bytes())?;
        }
    }
    Ok(())
}

/// Encode `values` according to `format` into a freshly sized buffer.
pub fn pack(format: &str, values: &[Value]) -> Result<Vec<u8>, CodecError> {
    let len = encoded_len(format, values)?;
    let mut out = Vec::with_capacity(len);
    for value in values {
        put_value(&mut out, value)?;
    }
    Ok(out)
}

/// Encode into a caller-provided buffer, returning the number of bytes used.
///
/// Fails with [`CodecError::BufferTooSmall`] (carrying the required size)
/// without writing anything when `buf` is too short.
pub fn pack_into(buf: &mut [u8], format: &str, values: &[Value]) -> Result<usize, CodecError> {
    let needed = encoded_len(format, values)?;
    if needed > buf.len() {
        return Err(CodecError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    let mut cursor = &mut buf[..needed];
    for value in values {
        put_value(&mut cursor, value)?;
    }
    Ok(needed)
}

/// Decode a payload. The format must consume the buffer exactly.
pub fn unpack(bytes: &[u8], format: &str) -> Result<Vec<Value>, CodecError> {
    let mut reader = Unpacker::new(bytes);
    let mut out = Vec::with_capacity(format.len());
    for code in format.chars() {
        let value = match code {
            'I' => Value::Int(reader.int()?),
            'D' => Value::Double(reader.double()?),
            'S' => Value::Str(reader.bytes()?),
            'A' => Value::Array(reader.array()?),
            other => return Err(CodecError::UnknownCode(other)),
        };
        out.push(value);
    }
    reader.finish()?;
    Ok(out)
}

/// Incremental typed encoder. Records the format string as fields are added.
///
/// The first invalid field is remembered and reported by [`Packer::finish`].
#[derive(Debug, Default)]
pub struct Packer {
    format: String,
    buf: Vec<u8>,
    error: Option<CodecError>,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, value: Value) -> Self {
        self.format.push(value.code());
        if self.error.is_none() {
            if let Value::Array(items) = &value {
                if let Some(index) = items.iter().position(|s| s.contains('\0')) {
                    self.error = Some(CodecError::EmbeddedNul { index });
                    return self;
                }
            }
            if let Err(e) = put_value(&mut self.buf, &value) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn int(self, v: i32) -> Self {
        self.push(Value::Int(v))
    }

    pub fn double(self, v: f64) -> Self {
        self.push(Value::Double(v))
    }

    pub fn string(self, v: &str) -> Self {
        self.push(Value::from(v))
    }

    /// An `S` field with arbitrary content.
    pub fn bytes(self, v: &[u8]) -> Self {
        self.push(Value::from(v))
    }

    pub fn array<S: AsRef<str>>(self, items: &[S]) -> Self {
        let items = items.iter().map(|s| s.as_ref().to_string()).collect();
        self.push(Value::Array(items))
    }

    /// The format string describing what has been packed so far.
    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn finish(self) -> Result<Vec<u8>, CodecError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.buf),
        }
    }
}

/// Cursor-style decoder over a payload.
#[derive(Debug)]
pub struct Unpacker<'a> {
    buf: &'a [u8],
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn int(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn double(&mut self) -> Result<f64, CodecError> {
        self.need(8)?;
        Ok(f64::from_bits(self.buf.get_u64()))
    }

    fn raw_string(&mut self) -> Result<&'a [u8], CodecError> {
        self.need(4)?;
        let len = self.buf.get_u32() as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// An `S` field as text; invalid UTF-8 becomes U+FFFD.
    pub fn string(&mut self) -> Result<String, CodecError> {
        let raw = self.raw_string()?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// An `S` field exactly as sent.
    pub fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        Ok(self.raw_string()?.to_vec())
    }

    pub fn array(&mut self) -> Result<Vec<String>, CodecError> {
        let count = self.int()?;
        if count < 0 {
            return Err(CodecError::NegativeCount(count));
        }
        let blob = self.raw_string()?;
        let declared = count as usize;
        if declared == 0 {
            if !blob.is_empty() {
                return Err(CodecError::ArrayCountMismatch { declared, found: 1 });
            }
            return Ok(Vec::new());
        }
        let items: Vec<String> = blob
            .split(|&b| b == 0)
            .map(|item| String::from_utf8_lossy(item).into_owned())
            .collect();
        if items.len() != declared {
            return Err(CodecError::ArrayCountMismatch {
                declared,
                found: items.len(),
            });
        }
        Ok(items)
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Assert the payload was fully consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout_is_big_endian() {
        let bytes = pack("IS", &[Value::Int(258), Value::from("ab")]).unwrap();
        assert_eq!(bytes, vec![0, 0, 1, 2, 0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_unpack_mixed_fields() {
        let values = vec![
            Value::from("main.c"),
            Value::from("foo"),
            Value::Int(10),
            Value::Double(2.5),
            Value::Array(vec!["a".into(), "".into(), "c".into()]),
        ];
        let bytes = pack("SSIDA", &values).unwrap();
        assert_eq!(unpack(&bytes, "SSIDA").unwrap(), values);
    }

    #[test]
    fn test_string_with_embedded_nul_survives() {
        let text = "line one\0still the same field";
        let bytes = pack("S", &[Value::from(text)]).unwrap();
        assert_eq!(unpack(&bytes, "S").unwrap(), vec![Value::from(text)]);
    }

    #[test]
    fn test_non_utf8_string_is_kept_byte_exact() {
        let latin1 = b"caf\xe9\0x".to_vec();
        let bytes = Packer::new().bytes(&latin1).int(1).finish().unwrap();
        assert_eq!(
            unpack(&bytes, "SI").unwrap(),
            vec![Value::Str(latin1.clone()), Value::Int(1)]
        );

        let mut rd = Unpacker::new(&bytes);
        assert_eq!(rd.string().unwrap(), "caf\u{fffd}\0x");
        assert_eq!(rd.int().unwrap(), 1);

        let mut rd = Unpacker::new(&bytes);
        assert_eq!(rd.bytes().unwrap(), latin1);
    }

    #[test]
    fn test_empty_array_and_single_empty_string_differ() {
        let empty = pack("A", &[Value::Array(vec![])]).unwrap();
        let one = pack("A", &[Value::Array(vec![String::new()])]).unwrap();
        assert_ne!(empty, one);
        assert_eq!(unpack(&empty, "A").unwrap(), vec![Value::Array(vec![])]);
        assert_eq!(
            unpack(&one, "A").unwrap(),
            vec![Value::Array(vec![String::new()])]
        );
    }

    #[test]
    fn test_array_element_with_nul_rejected() {
        let err = pack("A", &[Value::Array(vec!["ok".into(), "b\0ad".into()])]).unwrap_err();
        assert_eq!(err, CodecError::EmbeddedNul { index: 1 });
    }

    #[test]
    fn test_pack_into_reports_needed_size() {
        let values = [Value::from("a somewhat longer string")];
        let mut small = [0u8; 8];
        let err = pack_into(&mut small, "S", &values).unwrap_err();
        let needed = match err {
            CodecError::BufferTooSmall { needed, available } => {
                assert_eq!(available, 8);
                needed
            }
            other => panic!("unexpected error {other:?}"),
        };

        let mut big = vec![0u8; needed];
        let used = pack_into(&mut big, "S", &values).unwrap();
        assert_eq!(used, needed);
        assert_eq!(big, pack("S", &values).unwrap());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let values = [
            Value::Int(-7),
            Value::Double(f64::MIN_POSITIVE),
            Value::Array(vec!["x".into(), "y".into()]),
        ];
        let a = pack("IDA", &values).unwrap();
        let b = pack("IDA", &values).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_type_and_arity_mismatch() {
        assert_eq!(
            pack("I", &[Value::from("x")]).unwrap_err(),
            CodecError::TypeMismatch { index: 0, code: 'I' }
        );
        assert_eq!(
            pack("II", &[Value::Int(1)]).unwrap_err(),
            CodecError::ArityMismatch { expected: 2, got: 1 }
        );
        assert_eq!(
            pack("Q", &[Value::Int(1)]).unwrap_err(),
            CodecError::UnknownCode('Q')
        );
    }

    #[test]
    fn test_truncated_and_trailing() {
        let bytes = pack("II", &[Value::Int(1), Value::Int(2)]).unwrap();
        assert!(matches!(
            unpack(&bytes[..6], "II"),
            Err(CodecError::Truncated { .. })
        ));
        assert_eq!(
            unpack(&bytes, "I").unwrap_err(),
            CodecError::TrailingBytes(4)
        );
    }

    #[test]
    fn test_packer_matches_pack() {
        let packer = Packer::new()
            .string("foo")
            .int(3)
            .double(1.5)
            .array(&["a", "b"]);
        assert_eq!(packer.format(), "SIDA");
        let built = packer.finish().unwrap();
        let expected = pack(
            "SIDA",
            &[
                Value::from("foo"),
                Value::Int(3),
                Value::Double(1.5),
                Value::Array(vec!["a".into(), "b".into()]),
            ],
        )
        .unwrap();
        assert_eq!(built, expected);

        let mut rd = Unpacker::new(&built);
        assert_eq!(rd.string().unwrap(), "foo");
        assert_eq!(rd.int().unwrap(), 3);
        assert_eq!(rd.double().unwrap(), 1.5);
        assert_eq!(rd.array().unwrap(), vec!["a", "b"]);
        rd.finish().unwrap();
    }

    #[test]
    fn test_packer_rejects_nul_in_array() {
        let err = Packer::new()
            .array(&["ok"])
            .array(&["fine", "b\0ad"])
            .finish()
            .unwrap_err();
        assert_eq!(err, CodecError::EmbeddedNul { index: 1 });
    }
}
