//! Wire Protocol
//!
//! Every UDP datagram exchanged between clients, the control server and the
//! relay carries one envelope:
//!
//! ```text
//! [1: version] [1: type] [1: flags] [4: length, big-endian] [length: payload]
//! ```
//!
//! `flags` bit 0 marks a payload sealed by the [`CryptoContext`]; `length`
//! always counts the payload bytes as transmitted (ciphertext when sealed).

mod payload;

pub use payload::{HandshakePayload, NatRequestPayload, RouteAdvertisePayload};

use std::fmt;
use std::sync::Arc;

use crate::crypto::CryptoContext;
use crate::error::ProtocolError;

/// Protocol version written into every envelope
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed envelope header size
pub const HEADER_SIZE: usize = 7;

/// Payload is sealed with the transport AEAD
pub const FLAG_ENCRYPTED: u8 = 0x01;

/// Largest plaintext payload accepted by `encode`
pub const MAX_PAYLOAD: usize = 65_000;

/// Acknowledgment payload carried by control replies
pub const ACK: &[u8] = b"OK";

/// KeepAlive reply telling a sender the server no longer knows it
pub const REJOIN: &[u8] = b"REJOIN";

/// Envelope message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 1,
    Data = 2,
    KeepAlive = 3,
    RouteAdvertise = 4,
    NatRequest = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Handshake),
            2 => Ok(MessageType::Data),
            3 => Ok(MessageType::KeepAlive),
            4 => Ok(MessageType::RouteAdvertise),
            5 => Ok(MessageType::NatRequest),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Handshake => "Handshake",
            MessageType::Data => "Data",
            MessageType::KeepAlive => "KeepAlive",
            MessageType::RouteAdvertise => "RouteAdvertise",
            MessageType::NatRequest => "NATRequest",
        };
        f.write_str(name)
    }
}

/// A decoded envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub msg_type: MessageType,
    /// Flags other than the transport's own encryption bit
    pub flags: u8,
    /// Payload length (plaintext size once decoded)
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message of the current protocol version
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            flags: 0,
            length: payload.len() as u32,
            payload,
        }
    }

    /// A Data message wrapping a raw IP packet
    pub fn data(packet: &[u8]) -> Self {
        Self::new(MessageType::Data, packet.to_vec())
    }

    /// A KeepAlive carrying the sender's peer id
    pub fn keepalive(peer_id: &str) -> Self {
        Self::new(MessageType::KeepAlive, peer_id.as_bytes().to_vec())
    }

    /// The `OK` reply to a control message
    pub fn ack(msg_type: MessageType) -> Self {
        Self::new(msg_type, ACK.to_vec())
    }

    /// Whether this is an `OK` reply
    pub fn is_ack(&self) -> bool {
        self.payload == ACK
    }

    /// The reply to a KeepAlive from a peer missing from the directory
    pub fn rejoin() -> Self {
        Self::new(MessageType::KeepAlive, REJOIN.to_vec())
    }

    /// Whether the server asked the sender to handshake again
    pub fn is_rejoin(&self) -> bool {
        self.msg_type == MessageType::KeepAlive && self.payload == REJOIN
    }

    /// Sender id carried by a KeepAlive
    pub fn keepalive_sender(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.payload).map_err(|e| ProtocolError::InvalidPayload {
            kind: "KeepAlive",
            reason: e.to_string(),
        })
    }
}

/// Encodes and decodes envelopes, sealing payloads when encryption is on.
/// Cheap to clone; clones share the crypto context.
#[derive(Debug, Clone)]
pub struct Protocol {
    crypto: Arc<CryptoContext>,
}

impl Protocol {
    pub fn new(crypto: Arc<CryptoContext>) -> Self {
        Self { crypto }
    }

    /// A processor without encryption
    pub fn plaintext() -> Self {
        Self::new(Arc::new(CryptoContext::disabled()))
    }

    pub fn crypto(&self) -> &CryptoContext {
        &self.crypto
    }

    /// Serialize a message into a datagram
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, ProtocolError> {
        if message.payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(message.payload.len()));
        }

        let (flags, payload) = if self.crypto.is_enabled() {
            let sealed = self
                .crypto
                .encrypt(&message.payload)
                .map_err(ProtocolError::EncryptionFailed)?;
            (message.flags | FLAG_ENCRYPTED, sealed)
        } else {
            (message.flags & !FLAG_ENCRYPTED, message.payload.clone())
        };

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.push(message.version);
        buf.push(message.msg_type as u8);
        buf.push(flags);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Parse and, if sealed, open a datagram
    pub fn decode(&self, data: &[u8]) -> Result<Message, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort {
                len: data.len(),
                min: HEADER_SIZE,
            });
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let msg_type = MessageType::try_from(data[1])?;
        let flags = data[2];
        let declared = u32::from_be_bytes([data[3], data[4], data[5], data[6]]);
        let body = &data[HEADER_SIZE..];
        if declared as usize != body.len() {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }

        let payload = match (flags & FLAG_ENCRYPTED != 0, self.crypto.is_enabled()) {
            (true, true) => self
                .crypto
                .decrypt(body)
                .map_err(ProtocolError::DecryptionFailed)?,
            (true, false) => return Err(ProtocolError::EncryptionNotConfigured),
            (false, true) => return Err(ProtocolError::PlaintextRejected),
            (false, false) => body.to_vec(),
        };

        Ok(Message {
            version,
            msg_type,
            flags: flags & !FLAG_ENCRYPTED,
            length: payload.len() as u32,
            payload,
        })
    }
}
