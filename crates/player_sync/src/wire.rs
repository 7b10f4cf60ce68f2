//! Binary codec for channel messages.
//!
//! Every message on every channel is a type-tag string followed by a fixed
//! sequence of fields. Encoding is big-endian and matches the layout of a
//! Java data stream, so nodes written against `DataOutputStream` can talk to
//! the hub unchanged:
//!
//! | kind   | layout                                   |
//! |--------|------------------------------------------|
//! | string | u16 byte length + modified UTF-8 bytes   |
//! | i32    | 4 bytes                                  |
//! | i64    | 8 bytes                                  |
//! | f64    | 8 bytes, IEEE-754                        |
//! | bool   | 1 byte, `0` or `1`                       |
//!
//! Strings use the modified UTF-8 of `writeUTF`/`readUTF`: NUL travels as
//! `C0 80` and characters outside the Basic Multilingual Plane as two
//! three-byte surrogates. There is no overall length prefix and no checksum.

use crate::error::WireError;

/// Longest string the u16 length prefix can describe.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// The kind of a single field in a message schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Str,
    Int,
    Long,
    Double,
    Bool,
}

/// A single decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Str(String),
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
}

impl WireValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Str(_) => FieldKind::Str,
            Self::Int(_) => FieldKind::Int,
            Self::Long(_) => FieldKind::Long,
            Self::Double(_) => FieldKind::Double,
            Self::Bool(_) => FieldKind::Bool,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<i32> for WireValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<i64> for WireValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for WireValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for WireValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Append-only encoder for one message.
#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buffer: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a message with its type tag already written.
    pub fn with_tag(message_type: &str) -> Result<Self, WireError> {
        let mut writer = Self::new();
        writer.write_str(message_type)?;
        Ok(writer)
    }

    /// Writes a length-prefixed modified UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::StringTooLong`] if the encoded string does not fit
    /// the u16 length prefix. Nothing is written in that case.
    pub fn write_str(&mut self, value: &str) -> Result<(), WireError> {
        let bytes = encode_modified_utf8(value);
        if bytes.len() > MAX_STRING_LEN {
            return Err(WireError::StringTooLong(bytes.len()));
        }
        self.buffer.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        self.buffer.extend_from_slice(&bytes);
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    pub fn write_value(&mut self, value: &WireValue) -> Result<(), WireError> {
        match value {
            WireValue::Str(s) => self.write_str(s)?,
            WireValue::Int(v) => self.write_i32(*v),
            WireValue::Long(v) => self.write_i64(*v),
            WireValue::Double(v) => self.write_f64(*v),
            WireValue::Bool(v) => self.write_bool(*v),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Cursor-based decoder over one message payload.
///
/// Every read checks the remaining length first, so a truncated payload
/// surfaces as [`WireError::Truncated`] rather than a panic.
#[derive(Debug, Clone)]
pub struct WireReader {
    data: Vec<u8>,
    position: usize,
}

impl WireReader {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }

    /// Reads the type tag off a raw message and returns it together with a
    /// reader positioned on the first field.
    pub fn split_tag(raw: impl Into<Vec<u8>>) -> Result<(String, Self), WireError> {
        let mut reader = Self::new(raw);
        let message_type = reader.read_str()?;
        Ok((message_type, reader))
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn take(&mut self, needed: usize) -> Result<&[u8], WireError> {
        let available = self.remaining();
        if available < needed {
            return Err(WireError::Truncated {
                offset: self.position,
                needed,
                available,
            });
        }
        let start = self.position;
        self.position += needed;
        Ok(&self.data[start..start + needed])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.take(N)?);
        Ok(bytes)
    }

    pub fn read_str(&mut self) -> Result<String, WireError> {
        let length = u16::from_be_bytes(self.take_array::<2>()?) as usize;
        let offset = self.position;
        let bytes = self.take(length)?;
        decode_modified_utf8(bytes).ok_or(WireError::InvalidUtf8(offset))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_be_bytes(self.take_array::<4>()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_be_bytes(self.take_array::<8>()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_be_bytes(self.take_array::<8>()?))
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        let offset = self.position;
        match self.take_array::<1>()?[0] {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(WireError::InvalidBool { offset, value }),
        }
    }

    pub fn read_value(&mut self, kind: FieldKind) -> Result<WireValue, WireError> {
        Ok(match kind {
            FieldKind::Str => WireValue::Str(self.read_str()?),
            FieldKind::Int => WireValue::Int(self.read_i32()?),
            FieldKind::Long => WireValue::Long(self.read_i64()?),
            FieldKind::Double => WireValue::Double(self.read_f64()?),
            FieldKind::Bool => WireValue::Bool(self.read_bool()?),
        })
    }
}

fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => bytes.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                bytes.push(0xC0 | (unit >> 6) as u8);
                bytes.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                bytes.push(0xE0 | (unit >> 12) as u8);
                bytes.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                bytes.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    bytes
}

/// Decodes UTF-16 units from their one, two or three byte forms, then
/// pairs surrogates. Four-byte sequences and lone surrogates are invalid.
fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let continuation = |byte: u8| (byte & 0xC0 == 0x80).then_some(u16::from(byte & 0x3F));

    let mut units = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let lead = bytes[index];
        let unit = match lead {
            0x00..=0x7F => {
                index += 1;
                u16::from(lead)
            }
            0xC0..=0xDF => {
                let low = continuation(*bytes.get(index + 1)?)?;
                index += 2;
                (u16::from(lead & 0x1F) << 6) | low
            }
            0xE0..=0xEF => {
                let middle = continuation(*bytes.get(index + 1)?)?;
                let low = continuation(*bytes.get(index + 2)?)?;
                index += 3;
                (u16::from(lead & 0x0F) << 12) | (middle << 6) | low
            }
            _ => return None,
        };
        units.push(unit);
    }

    String::from_utf16(&units).ok()
}

/// A schema-less message: a type tag and an ordered list of fields.
///
/// Used for broadcasts whose shape is decided by the caller; the typed
/// catalog lives in [`crate::protocol`].
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub message_type: String,
    pub fields: Vec<WireValue>,
}

impl WireMessage {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field, builder style.
    pub fn with(mut self, field: impl Into<WireValue>) -> Self {
        self.fields.push(field.into());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut writer = WireWriter::with_tag(&self.message_type)?;
        for field in &self.fields {
            writer.write_value(field)?;
        }
        Ok(writer.into_bytes())
    }

    /// Decodes a message whose fields follow `schema`. Trailing bytes after
    /// the last field are ignored.
    pub fn decode(raw: &[u8], schema: &[FieldKind]) -> Result<Self, WireError> {
        let (message_type, mut reader) = WireReader::split_tag(raw)?;
        let fields = schema
            .iter()
            .map(|kind| reader.read_value(*kind))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            message_type,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout_is_length_prefixed_big_endian() {
        let mut writer = WireWriter::new();
        writer.write_str("PING").unwrap();
        writer.write_i32(258);
        writer.write_bool(true);

        assert_eq!(
            writer.into_bytes(),
            vec![0x00, 0x04, b'P', b'I', b'N', b'G', 0x00, 0x00, 0x01, 0x02, 0x01]
        );
    }

    #[test]
    fn test_multibyte_utf8_length_counts_bytes() {
        let mut writer = WireWriter::new();
        writer.write_str("conexión").unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(u16::from_be_bytes([bytes[0], bytes[1]]), 9);

        let mut reader = WireReader::new(bytes);
        assert_eq!(reader.read_str().unwrap(), "conexión");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_message_with_schema() {
        let message = WireMessage::new("PLAYER_UPDATE")
            .with("0d6f3a2c-1111-4222-8333-944455556666")
            .with(42.5)
            .with(7)
            .with(1_700_000_000_000i64)
            .with(false);
        let encoded = message.encode().unwrap();

        let decoded = WireMessage::decode(
            &encoded,
            &[
                FieldKind::Str,
                FieldKind::Double,
                FieldKind::Int,
                FieldKind::Long,
                FieldKind::Bool,
            ],
        )
        .unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_truncated_payload_fails() {
        let encoded = WireMessage::new("UPDATE_GEMS")
            .with("abc")
            .with(12)
            .encode()
            .unwrap();
        let truncated = &encoded[..encoded.len() - 2];

        let error = WireMessage::decode(truncated, &[FieldKind::Str, FieldKind::Int]).unwrap_err();
        assert!(matches!(error, WireError::Truncated { needed: 4, available: 2, .. }));
    }

    #[test]
    fn test_empty_payload_fails_on_tag() {
        let error = WireReader::split_tag(Vec::new()).unwrap_err();
        assert!(matches!(error, WireError::Truncated { offset: 0, .. }));
    }

    #[test]
    fn test_invalid_utf8_and_bool_are_rejected() {
        let mut reader = WireReader::new(vec![0x00, 0x02, 0xC3, 0x28]);
        assert_eq!(reader.read_str().unwrap_err(), WireError::InvalidUtf8(2));

        let mut reader = WireReader::new(vec![0x02]);
        assert_eq!(
            reader.read_bool().unwrap_err(),
            WireError::InvalidBool { offset: 0, value: 2 }
        );
    }

    #[test]
    fn test_nul_uses_two_byte_form() {
        let mut writer = WireWriter::new();
        writer.write_str("a\0b").unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(bytes, vec![0x00, 0x04, b'a', 0xC0, 0x80, b'b']);

        let mut reader = WireReader::new(bytes);
        assert_eq!(reader.read_str().unwrap(), "a\0b");
    }

    #[test]
    fn test_supplementary_characters_use_surrogate_pairs() {
        // writeUTF("😀") on a Java data stream.
        let java = vec![0x00, 0x06, 0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80];
        let mut reader = WireReader::new(java.clone());
        assert_eq!(reader.read_str().unwrap(), "😀");

        let mut writer = WireWriter::new();
        writer.write_str("😀").unwrap();
        assert_eq!(writer.into_bytes(), java);
    }

    #[test]
    fn test_standard_four_byte_utf8_is_rejected() {
        let mut reader = WireReader::new(vec![0x00, 0x04, 0xF0, 0x9F, 0x98, 0x80]);
        assert_eq!(reader.read_str().unwrap_err(), WireError::InvalidUtf8(2));

        // A high surrogate with no low half.
        let mut reader = WireReader::new(vec![0x00, 0x03, 0xED, 0xA0, 0xBD]);
        assert_eq!(reader.read_str().unwrap_err(), WireError::InvalidUtf8(2));
    }

    #[test]
    fn test_oversized_string_is_refused() {
        let long = "x".repeat(MAX_STRING_LEN + 1);
        let mut writer = WireWriter::new();
        assert_eq!(
            writer.write_str(&long).unwrap_err(),
            WireError::StringTooLong(MAX_STRING_LEN + 1)
        );
        assert!(writer.is_empty());
    }
}
