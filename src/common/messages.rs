//! # Message Protocol
//!
//! Defines the wire envelope and payload types exchanged between the master,
//! the workers, and the submitters.
//!
//! Every frame on the wire carries one [`NetworkMessage`]: a JSON object with
//! a message kind, a base64 `Data` field holding the serialized payload, a
//! unique message id, the sender address (filled in by the receiver, never
//! trusted from the wire), and a timestamp.
//!
//! Payloads are themselves JSON (encoded into `Data` as base64), except for
//! acknowledgments whose payload is the literal ASCII `OK`.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Payload of every [`MessageKind::Acknowledgment`] frame.
pub const ACK_PAYLOAD: &[u8] = b"OK";

// ============================================================================
// MESSAGE KIND
// ============================================================================

/// The five message kinds of the protocol.
///
/// On the wire the kind is encoded as an integer, but some senders emit the
/// enum name as a string instead, so the decoder accepts both shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Submitter -> master -> worker: an image job to process.
    ImageRequest = 0,
    /// Worker -> master -> submitter: the processed image.
    ImageResponse = 1,
    /// Worker -> master: registration with the worker's advertised address.
    SlaveRegister = 2,
    /// Master -> worker: registration accepted.
    Acknowledgment = 3,
    /// Worker -> master: cumulative processing statistics.
    SlaveStatistics = 4,
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::ImageRequest => "ImageRequest",
            MessageKind::ImageResponse => "ImageResponse",
            MessageKind::SlaveRegister => "SlaveRegister",
            MessageKind::Acknowledgment => "Acknowledgment",
            MessageKind::SlaveStatistics => "SlaveStatistics",
        }
    }

    fn from_u64(v: u64) -> Option<Self> {
        match v {
            0 => Some(MessageKind::ImageRequest),
            1 => Some(MessageKind::ImageResponse),
            2 => Some(MessageKind::SlaveRegister),
            3 => Some(MessageKind::Acknowledgment),
            4 => Some(MessageKind::SlaveStatistics),
            _ => None,
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        match s {
            "ImageRequest" => Some(MessageKind::ImageRequest),
            "ImageResponse" => Some(MessageKind::ImageResponse),
            "SlaveRegister" => Some(MessageKind::SlaveRegister),
            "Acknowledgment" => Some(MessageKind::Acknowledgment),
            "SlaveStatistics" => Some(MessageKind::SlaveStatistics),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*self as u64)
    }
}

struct KindVisitor;

impl<'de> Visitor<'de> for KindVisitor {
    type Value = MessageKind;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a message kind as integer 0-4 or its name as a string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        MessageKind::from_u64(v)
            .ok_or_else(|| E::custom(format!("unknown message kind {}", v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        if v < 0 {
            return Err(E::custom(format!("unknown message kind {}", v)));
        }
        self.visit_u64(v as u64)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        MessageKind::from_name(v)
            .ok_or_else(|| E::custom(format!("unknown message kind '{}'", v)))
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(KindVisitor)
    }
}

// ============================================================================
// WIRE ENVELOPE
// ============================================================================

/// The wire unit: one of these is serialized to JSON inside every frame.
///
/// `sender_ip` and `sender_port` are ignored on receive and overwritten with
/// the connection's observed remote endpoint via [`NetworkMessage::stamp_sender`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkMessage {
    #[serde(rename = "Type")]
    pub kind: MessageKind,
    /// Base64 of the payload bytes.
    pub data: String,
    pub message_id: Uuid,
    pub sender_ip: String,
    pub sender_port: u16,
    pub timestamp: DateTime<Utc>,
}

impl NetworkMessage {
    /// Create a message around raw payload bytes. A fresh id is minted per call.
    pub fn new(kind: MessageKind, payload: &[u8]) -> Self {
        Self {
            kind,
            data: BASE64.encode(payload),
            message_id: Uuid::new_v4(),
            sender_ip: "0.0.0.0".to_string(),
            sender_port: 0,
            timestamp: Utc::now(),
        }
    }

    /// Create a message whose payload is the JSON serialization of `body`.
    pub fn with_payload<T: Serialize>(kind: MessageKind, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)?;
        Ok(Self::new(kind, &bytes))
    }

    /// Create a message reusing an already-encoded `Data` string, so a payload
    /// can be forwarded byte-identical under a different kind.
    pub fn with_raw_data(kind: MessageKind, data: String) -> Self {
        Self {
            kind,
            data,
            message_id: Uuid::new_v4(),
            sender_ip: "0.0.0.0".to_string(),
            sender_port: 0,
            timestamp: Utc::now(),
        }
    }

    /// The standard registration acknowledgment.
    pub fn acknowledgment() -> Self {
        Self::new(MessageKind::Acknowledgment, ACK_PAYLOAD)
    }

    /// Decode the raw payload bytes from the base64 `Data` field.
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.data)
            .map_err(|e| anyhow!("invalid base64 in Data field: {}", e))
    }

    /// Decode the payload as JSON into `T`.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.payload_bytes()?;
        serde_json::from_slice(&bytes)
            .map_err(|e| anyhow!("{} payload did not parse: {}", self.kind, e))
    }

    /// True for an acknowledgment frame carrying the literal `OK`.
    pub fn is_ack_ok(&self) -> bool {
        self.kind == MessageKind::Acknowledgment
            && self.payload_bytes().map(|b| b == ACK_PAYLOAD).unwrap_or(false)
    }

    /// Overwrite the sender fields with the connection's remote endpoint.
    pub fn stamp_sender(&mut self, remote: SocketAddr) {
        self.sender_ip = remote.ip().to_string();
        self.sender_port = remote.port();
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ============================================================================
// PAYLOAD BODIES
// ============================================================================

/// One image job, end to end. The same shape travels as a request
/// (submitter -> master -> worker) and as a response (worker -> master ->
/// submitter); `packet_id` is preserved verbatim across the round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImagePacket {
    /// End-to-end correlation id, assigned by the submitter.
    pub packet_id: String,
    /// Opaque label for logs and output naming. Not used for routing.
    pub file_name: String,
    /// Encoded image bytes: the input on a request, the result on a response.
    #[serde(with = "base64_bytes")]
    pub image_data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: String,
    /// Gaussian kernel dimension. Odd.
    pub filter_size: u32,
    /// Set by the worker on responses so the master can resolve which worker
    /// finished the job. Zero on requests.
    #[serde(default)]
    pub slave_port: u16,
}

/// Sent by a worker right after dialing the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SlaveRegistrationData {
    pub ip_address: String,
    pub port: u16,
}

/// Cumulative per-worker statistics, pushed by the worker after every job.
/// Times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SlaveStatistics {
    pub port: u16,
    pub tasks_completed: u64,
    pub total_processing_time: f64,
    pub average_processing_time: f64,
}

impl SlaveStatistics {
    pub fn empty(port: u16) -> Self {
        Self {
            port,
            tasks_completed: 0,
            total_processing_time: 0.0,
            average_processing_time: 0.0,
        }
    }
}

/// Serde adapter: `Vec<u8>` as a base64 string in JSON.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s.as_bytes()).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> ImagePacket {
        ImagePacket {
            packet_id: "p1".to_string(),
            file_name: "sunset.png".to_string(),
            image_data: vec![1, 2, 3, 4, 5],
            width: 10,
            height: 10,
            format: "png".to_string(),
            filter_size: 3,
            slave_port: 0,
        }
    }

    #[test]
    fn test_kind_decodes_from_integer_and_string() {
        let from_int: MessageKind = serde_json::from_str("2").unwrap();
        assert_eq!(from_int, MessageKind::SlaveRegister);

        let from_str: MessageKind = serde_json::from_str("\"SlaveRegister\"").unwrap();
        assert_eq!(from_str, MessageKind::SlaveRegister);

        assert!(serde_json::from_str::<MessageKind>("9").is_err());
        assert!(serde_json::from_str::<MessageKind>("\"Bogus\"").is_err());
    }

    #[test]
    fn test_kind_serializes_as_integer() {
        let json = serde_json::to_string(&MessageKind::SlaveStatistics).unwrap();
        assert_eq!(json, "4");
    }

    #[test]
    fn test_packet_round_trip_preserves_identity_fields() {
        let packet = sample_packet();
        let msg = NetworkMessage::with_payload(MessageKind::ImageRequest, &packet).unwrap();
        let bytes = msg.to_bytes().unwrap();
        let decoded = NetworkMessage::from_bytes(&bytes).unwrap();
        let round: ImagePacket = decoded.payload().unwrap();

        assert_eq!(round.packet_id, packet.packet_id);
        assert_eq!(round.file_name, packet.file_name);
        assert_eq!(round.filter_size, packet.filter_size);
        assert_eq!(round.width, packet.width);
        assert_eq!(round.height, packet.height);
        assert_eq!(round.image_data, packet.image_data);
    }

    #[test]
    fn test_wire_field_names_are_pascal_case() {
        let packet = sample_packet();
        let value = serde_json::to_value(&packet).unwrap();
        assert!(value.get("PacketId").is_some());
        assert!(value.get("FileName").is_some());
        assert!(value.get("ImageData").unwrap().is_string());
        assert!(value.get("FilterSize").is_some());
        assert!(value.get("SlavePort").is_some());

        let msg = NetworkMessage::with_payload(MessageKind::ImageRequest, &packet).unwrap();
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("Type").is_some());
        assert!(value.get("Data").is_some());
        assert!(value.get("MessageId").is_some());
        assert!(value.get("SenderIp").is_some());
        assert!(value.get("SenderPort").is_some());
        assert!(value.get("Timestamp").is_some());
    }

    #[test]
    fn test_slave_port_defaults_to_zero_when_absent() {
        let json = r#"{"PacketId":"p9","FileName":"a.png","ImageData":"","Width":1,"Height":1,"Format":"png","FilterSize":3}"#;
        let packet: ImagePacket = serde_json::from_str(json).unwrap();
        assert_eq!(packet.slave_port, 0);
    }

    #[test]
    fn test_acknowledgment_carries_literal_ok() {
        let ack = NetworkMessage::acknowledgment();
        assert!(ack.is_ack_ok());
        assert_eq!(ack.payload_bytes().unwrap(), b"OK");

        let not_ack = NetworkMessage::new(MessageKind::ImageRequest, b"OK");
        assert!(!not_ack.is_ack_ok());
    }

    #[test]
    fn test_sender_fields_overwritten_from_endpoint() {
        let mut msg = NetworkMessage::new(MessageKind::SlaveRegister, b"{}");
        msg.sender_ip = "10.0.0.99".to_string();
        msg.sender_port = 4242;
        msg.stamp_sender("192.168.1.7:9100".parse().unwrap());
        assert_eq!(msg.sender_ip, "192.168.1.7");
        assert_eq!(msg.sender_port, 9100);
    }

    #[test]
    fn test_message_ids_are_unique_per_creation() {
        let a = NetworkMessage::new(MessageKind::ImageRequest, b"x");
        let b = NetworkMessage::new(MessageKind::ImageRequest, b"x");
        assert_ne!(a.message_id, b.message_id);
    }
}
