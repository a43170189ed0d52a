//! Length-prefixed EV3 wire frame.
//!
//! Wire form: `u16le(body_len) ‖ u16le(message_counter) ‖ u8(type) ‖ payload`
//! with `body_len = 3 + payload.len()`. The two-byte length prefix is not
//! counted by `body_len`, so a frame occupies `body_len + 2` bytes on the
//! wire.

use crate::error::TransportError;

pub const DIRECT_COMMAND_REPLY: u8 = 0x00;
pub const DIRECT_COMMAND_NO_REPLY: u8 = 0x80;
pub const SYSTEM_COMMAND_REPLY: u8 = 0x01;
pub const SYSTEM_COMMAND_NO_REPLY: u8 = 0x81;
pub const DIRECT_REPLY: u8 = 0x02;
pub const DIRECT_REPLY_ERROR: u8 = 0x04;
pub const SYSTEM_REPLY: u8 = 0x03;
pub const SYSTEM_REPLY_ERROR: u8 = 0x05;

/// Largest payload a u16 body length can carry (`0xffff - 3`).
pub const MAX_PAYLOAD: usize = 65532;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub message_counter: u16,
    pub packet_type: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(message_counter: u16, packet_type: u8, payload: Vec<u8>) -> Self {
        Self {
            message_counter,
            packet_type,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(TransportError::ValueOutOfRange(format!(
                "payload of {} bytes exceeds the u16 body length",
                self.payload.len()
            )));
        }
        let body_len = (3 + self.payload.len()) as u16;
        let mut out = Vec::with_capacity(self.payload.len() + 5);
        out.extend_from_slice(&body_len.to_le_bytes());
        out.extend_from_slice(&self.message_counter.to_le_bytes());
        out.push(self.packet_type);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < 5 {
            return Err(TransportError::MalformedFrame(format!(
                "{} bytes is shorter than the 5-byte frame header",
                bytes.len()
            )));
        }
        let body_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if body_len < 3 {
            return Err(TransportError::MalformedFrame(format!(
                "body length {body_len} is below the 3-byte minimum"
            )));
        }
        if bytes.len() != body_len + 2 {
            return Err(TransportError::MalformedFrame(format!(
                "frame is {} bytes but the body length announces {}",
                bytes.len(),
                body_len + 2
            )));
        }
        Ok(Self {
            message_counter: u16::from_le_bytes([bytes[2], bytes[3]]),
            packet_type: bytes[4],
            payload: bytes[5..].to_vec(),
        })
    }
}

/// True for the two command types that solicit a reply from the brick.
pub fn expects_reply(packet_type: u8) -> bool {
    matches!(packet_type, DIRECT_COMMAND_REPLY | SYSTEM_COMMAND_REPLY)
}

pub fn is_reply(packet_type: u8) -> bool {
    matches!(
        packet_type,
        DIRECT_REPLY | DIRECT_REPLY_ERROR | SYSTEM_REPLY | SYSTEM_REPLY_ERROR
    )
}

pub fn is_error_reply(packet_type: u8) -> bool {
    matches!(packet_type, DIRECT_REPLY_ERROR | SYSTEM_REPLY_ERROR)
}

/// Whether `reply_type` belongs to the reply family of `command_type`.
/// Direct commands are answered by direct replies, system commands by
/// system replies; the error variants count as members of their family.
pub fn reply_matches_command(command_type: u8, reply_type: u8) -> bool {
    match command_type {
        DIRECT_COMMAND_REPLY => matches!(reply_type, DIRECT_REPLY | DIRECT_REPLY_ERROR),
        SYSTEM_COMMAND_REPLY => matches!(reply_type, SYSTEM_REPLY | SYSTEM_REPLY_ERROR),
        _ => false,
    }
}
