//! Framing of channel traffic inside WebSocket binary frames.
//!
//! A frame is the channel name as a wire string followed by the raw message
//! bytes, which are passed through untouched.

use player_sync::{WireError, WireReader, WireWriter};

pub fn encode_frame(channel: &str, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut writer = WireWriter::new();
    writer.write_str(channel)?;
    let mut frame = writer.into_bytes();
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Splits a frame into its channel name and message bytes.
pub fn decode_frame(mut frame: Vec<u8>) -> Result<(String, Vec<u8>), WireError> {
    let mut reader = WireReader::new(frame.as_slice());
    let channel = reader.read_str()?;
    if channel.is_empty() {
        return Err(WireError::InvalidField {
            field: "channel",
            reason: "empty channel name".to_string(),
        });
    }
    let payload = frame.split_off(reader.position());
    Ok((channel, payload))
}
