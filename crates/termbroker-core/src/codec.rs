//! Binary framing for the control socket.
//!
//! Wire format: `[1-byte type][4-byte big-endian length][payload]`

use crate::error::{BrokerError, BrokerResult};
use crate::protocol::{Message, MessageType};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 5;

/// Largest payload accepted on either side of the wire.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Frame a raw payload under the given type tag.
pub fn frame(msg_type: MessageType, payload: &[u8]) -> BrokerResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(BrokerError::protocol(format!(
            "payload of {} bytes exceeds limit of {MAX_PAYLOAD_SIZE}",
            payload.len()
        )));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(msg_type.into());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

impl Message {
    /// Encode this message as a complete frame.
    pub fn to_frame(&self) -> BrokerResult<Vec<u8>> {
        frame(self.message_type(), &self.encode_payload()?)
    }
}

/// Streaming frame parser: accumulates bytes and yields complete messages.
///
/// A frame with an unknown tag or malformed payload produces one `Err` and is
/// skipped by its declared length. A frame whose declared length exceeds
/// [`MAX_PAYLOAD_SIZE`] is reported once and its bytes are dropped as they
/// arrive.
#[derive(Debug, Default)]
pub struct MessageParser {
    buffer: Vec<u8>,
    /// Bytes of an oversized frame still to be dropped from incoming data.
    discard_remaining: usize,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data(&mut self, data: &[u8]) {
        let skip = self.discard_remaining.min(data.len());
        self.discard_remaining -= skip;
        self.buffer.extend_from_slice(&data[skip..]);
    }

    /// Iterate over every complete frame currently buffered. Consumed frames
    /// are removed when the iterator is dropped; partial trailing frames stay.
    pub fn parse_messages(&mut self) -> ParseMessages<'_> {
        ParseMessages {
            parser: self,
            offset: 0,
        }
    }

    /// Number of buffered bytes not yet consumed.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discard_remaining = 0;
    }
}

pub struct ParseMessages<'a> {
    parser: &'a mut MessageParser,
    offset: usize,
}

impl Iterator for ParseMessages<'_> {
    type Item = BrokerResult<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        let buf = &self.parser.buffer[self.offset..];
        if buf.len() < HEADER_LEN {
            return None;
        }
        let tag = buf[0];
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

        if len > MAX_PAYLOAD_SIZE {
            let available = buf.len() - HEADER_LEN;
            let dropped = available.min(len);
            self.offset += HEADER_LEN + dropped;
            self.parser.discard_remaining = len - dropped;
            return Some(Err(BrokerError::protocol(format!(
                "declared payload of {len} bytes exceeds limit of {MAX_PAYLOAD_SIZE}"
            ))));
        }
        if buf.len() < HEADER_LEN + len {
            return None;
        }

        let result = Message::decode(tag, &buf[HEADER_LEN..HEADER_LEN + len]);
        self.offset += HEADER_LEN + len;
        Some(result)
    }
}

impl Drop for ParseMessages<'_> {
    fn drop(&mut self) {
        self.parser.buffer.drain(..self.offset);
    }
}
