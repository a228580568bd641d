//! Typed payloads for control messages
//!
//! Handshake, RouteAdvertise and NATRequest carry structured records encoded
//! with bincode. KeepAlive and Data payloads are raw bytes and have no type here.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Message, MessageType};
use crate::error::{ProtocolError, Result};

/// Sent by a client when it joins the overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub node_id: String,
    /// Self-reported public address; unspecified if the client does not know it
    pub public_endpoint: SocketAddr,
    /// Address inside the overlay subnet
    pub private_endpoint: SocketAddr,
}

/// A route offered by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAdvertisePayload {
    pub destination: String,
    pub next_hop: String,
    pub metric: u8,
}

/// Ask the server to open a relayed session toward a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRequestPayload {
    pub target_id: String,
    pub target_endpoint: SocketAddr,
    pub relay_endpoint: SocketAddr,
}

fn encode_record<T: Serialize>(msg_type: MessageType, record: &T) -> Result<Message> {
    Ok(Message::new(msg_type, bincode::serialize(record)?))
}

fn decode_record<T: DeserializeOwned>(
    msg: &Message,
    expected: MessageType,
) -> std::result::Result<T, ProtocolError> {
    if msg.msg_type != expected {
        return Err(ProtocolError::InvalidPayload {
            kind: type_label(expected),
            reason: format!("message is {}", msg.msg_type),
        });
    }
    bincode::deserialize(&msg.payload).map_err(|e| ProtocolError::InvalidPayload {
        kind: type_label(expected),
        reason: e.to_string(),
    })
}

fn type_label(msg_type: MessageType) -> &'static str {
    match msg_type {
        MessageType::Handshake => "Handshake",
        MessageType::Data => "Data",
        MessageType::KeepAlive => "KeepAlive",
        MessageType::RouteAdvertise => "RouteAdvertise",
        MessageType::NatRequest => "NATRequest",
    }
}

impl HandshakePayload {
    pub fn to_message(&self) -> Result<Message> {
        encode_record(MessageType::Handshake, self)
    }

    pub fn from_message(msg: &Message) -> std::result::Result<Self, ProtocolError> {
        decode_record(msg, MessageType::Handshake)
    }
}

impl RouteAdvertisePayload {
    pub fn to_message(&self) -> Result<Message> {
        encode_record(MessageType::RouteAdvertise, self)
    }

    pub fn from_message(msg: &Message) -> std::result::Result<Self, ProtocolError> {
        decode_record(msg, MessageType::RouteAdvertise)
    }
}

impl NatRequestPayload {
    pub fn to_message(&self) -> Result<Message> {
        encode_record(MessageType::NatRequest, self)
    }

    pub fn from_message(msg: &Message) -> std::result::Result<Self, ProtocolError> {
        decode_record(msg, MessageType::NatRequest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_payload() {
        let hs = HandshakePayload {
            node_id: "node-1".into(),
            public_endpoint: "0.0.0.0:51000".parse().unwrap(),
            private_endpoint: "10.0.0.2:51000".parse().unwrap(),
        };
        let msg = hs.to_message().unwrap();
        assert_eq!(msg.msg_type, MessageType::Handshake);
        assert_eq!(HandshakePayload::from_message(&msg).unwrap(), hs);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let msg = Message::keepalive("node-1");
        let err = RouteAdvertisePayload::from_message(&msg).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { kind: "RouteAdvertise", .. }));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let msg = Message::new(MessageType::NatRequest, vec![0xFF; 3]);
        assert!(NatRequestPayload::from_message(&msg).is_err());
    }
}
