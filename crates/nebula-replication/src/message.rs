//! Replication datagrams.
//!
//! Layout: `[kind: u8][sender network time: f32 LE][payload]`. State
//! payloads are the bytes produced by [`StateTemplate::pack`]; every other
//! payload is a postcard-encoded body.
//!
//! [`StateTemplate::pack`]: crate::StateTemplate::pack

use nebula_net::MAX_DATAGRAM_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// Bytes before the payload.
pub const HEADER_SIZE: usize = 5;

/// Room left for the topology's own framing, such as a relay wrapper.
pub const FRAMING_ALLOWANCE: usize = 32;

/// Largest encoded message a topology is guaranteed to carry.
pub const MAX_MESSAGE_SIZE: usize = MAX_DATAGRAM_SIZE - FRAMING_ALLOWANCE;

const KIND_PING: u8 = 1;
const KIND_PONG: u8 = 2;
const KIND_STATE: u8 = 3;
const KIND_EVENT: u8 = 4;
const KIND_EVENT_ACK: u8 = 5;

/// Body of a ping and of its reply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingBody {
    /// Sender's local clock when the ping left; echoed by the pong.
    pub origin: f64,
    /// Application status of the sender.
    pub status: u8,
    /// Sender's latency estimate towards the receiver.
    pub latency: f32,
    pub spread: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    pub sequence: u16,
    pub in_order: bool,
    pub kind: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    pub sequence: u16,
    pub in_order: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping(PingBody),
    Pong(PingBody),
    State(Vec<u8>),
    Event(EventBody),
    EventAck(AckBody),
}

impl Message {
    fn kind(&self) -> u8 {
        match self {
            Message::Ping(_) => KIND_PING,
            Message::Pong(_) => KIND_PONG,
            Message::State(_) => KIND_STATE,
            Message::Event(_) => KIND_EVENT,
            Message::EventAck(_) => KIND_EVENT_ACK,
        }
    }

    /// Encode with the sender's network time.
    pub fn encode(&self, time: f64) -> Result<Vec<u8>, MessageError> {
        let mut out = Vec::with_capacity(64);
        out.push(self.kind());
        out.extend_from_slice(&(time as f32).to_le_bytes());
        match self {
            Message::Ping(body) | Message::Pong(body) => {
                out.extend_from_slice(&postcard::to_allocvec(body)?);
            }
            Message::State(bytes) => out.extend_from_slice(bytes),
            Message::Event(body) => out.extend_from_slice(&postcard::to_allocvec(body)?),
            Message::EventAck(body) => out.extend_from_slice(&postcard::to_allocvec(body)?),
        }
        Ok(out)
    }

    /// Decode a datagram into the sender's network time and message.
    pub fn decode(bytes: &[u8]) -> Result<(f64, Message), MessageError> {
        if bytes.len() < HEADER_SIZE {
            return Err(MessageError::Truncated(bytes.len()));
        }
        let kind = bytes[0];
        let time = f32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let payload = &bytes[HEADER_SIZE..];
        let message = match kind {
            KIND_PING => Message::Ping(postcard::from_bytes(payload)?),
            KIND_PONG => Message::Pong(postcard::from_bytes(payload)?),
            KIND_STATE => Message::State(payload.to_vec()),
            KIND_EVENT => Message::Event(postcard::from_bytes(payload)?),
            KIND_EVENT_ACK => Message::EventAck(postcard::from_bytes(payload)?),
            other => return Err(MessageError::UnknownKind(other)),
        };
        Ok((f64::from(time), message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let bytes = Message::State(vec![9, 8, 7]).encode(1.5).unwrap();
        assert_eq!(bytes[0], KIND_STATE);
        assert_eq!(&bytes[1..5], &1.5f32.to_le_bytes());
        assert_eq!(&bytes[5..], &[9, 8, 7]);
    }

    #[test]
    fn test_event_survives_encoding() {
        let message = Message::Event(EventBody {
            sequence: 65535,
            in_order: true,
            kind: "chat".into(),
            payload: vec![1, 2, 3],
        });
        let bytes = message.encode(42.25).unwrap();
        let (time, decoded) = Message::decode(&bytes).unwrap();
        assert_eq!(time, 42.25);
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_rejects_short_and_unknown() {
        assert!(matches!(
            Message::decode(&[KIND_PING, 0, 0]),
            Err(MessageError::Truncated(3))
        ));
        assert!(matches!(
            Message::decode(&[0xee, 0, 0, 0, 0]),
            Err(MessageError::UnknownKind(0xee))
        ));
        assert!(matches!(
            Message::decode(&[KIND_PONG, 0, 0, 0, 0]),
            Err(MessageError::Codec(_))
        ));
    }

    #[test]
    fn test_timestamp_is_single_precision() {
        let bytes = Message::EventAck(AckBody {
            sequence: 3,
            in_order: false,
        })
        .encode(0.1)
        .unwrap();
        let (time, _) = Message::decode(&bytes).unwrap();
        assert_eq!(time, f64::from(0.1f32));
    }
}
