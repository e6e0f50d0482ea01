// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message catalog.
//!
//! [`Payload`] is a closed union: every kind the daemon understands has one
//! variant, plus [`Payload::Unknown`] for records from newer peers.

use crate::envelope::{now_millis, Envelope, MessageType, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A timestamped event or control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub schema_version: u16,
    pub payload: Payload,
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(payload: Payload) -> Self {
        Self::at(now_millis(), payload)
    }

    /// Build a message with an explicit timestamp.
    pub fn at(timestamp: i64, payload: Payload) -> Self {
        Self {
            timestamp,
            schema_version: SCHEMA_VERSION,
            payload,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn envelope(&self) -> Envelope {
        Envelope {
            schema_version: self.schema_version,
            message_type: self.message_type(),
            timestamp: self.timestamp,
        }
    }

    /// True for persisted / fanned-out event kinds.
    pub fn is_data(&self) -> bool {
        self.message_type().is_data()
    }

    /// Status reply helper.
    pub fn status(kind: StatusKind) -> Self {
        Self::new(Payload::Status(kind))
    }
}

/// Message bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Status(StatusKind),
    Test(TestMessage),
    Gps(GpsMessage),
    Label(LabelMessage),
    Edge(EdgeMessage),
    Color(ColorMessage),
    Connectivity(ConnectivityMessage),
    DataPoint(DataPointMessage),
    NodeStatus(NodeStatusMessage),
    Seek(SeekPosition),
    Start,
    Stop,
    /// Playback rate. Negative plays backwards.
    Speed(f32),
    /// Request (both zero) or answer with the stored time range.
    PlaybackTimeRange {
        min: i64,
        max: i64,
    },
    /// Request (empty) or answer with the stream catalog.
    ListStreams(Vec<StreamInfo>),
    SubscribeStream(u32),
    StreamDescription(String),
    Hello {
        version: u16,
    },
    Unknown {
        tag: u16,
        body: Vec<u8>,
    },
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Status(_) => MessageType::Status,
            Self::Test(_) => MessageType::Test,
            Self::Gps(_) => MessageType::Gps,
            Self::Label(_) => MessageType::Label,
            Self::Edge(_) => MessageType::Edge,
            Self::Color(_) => MessageType::Color,
            Self::Connectivity(_) => MessageType::Connectivity,
            Self::DataPoint(_) => MessageType::DataPoint,
            Self::NodeStatus(_) => MessageType::NodeStatus,
            Self::Seek(_) => MessageType::Seek,
            Self::Start => MessageType::Start,
            Self::Stop => MessageType::Stop,
            Self::Speed(_) => MessageType::Speed,
            Self::PlaybackTimeRange { .. } => MessageType::PlaybackTimeRange,
            Self::ListStreams(_) => MessageType::ListStreams,
            Self::SubscribeStream(_) => MessageType::SubscribeStream,
            Self::StreamDescription(_) => MessageType::StreamDescription,
            Self::Hello { .. } => MessageType::Hello,
            Self::Unknown { tag, .. } => MessageType::Unknown(*tag),
        }
    }
}

/// Outcome carried by a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusKind {
    Ok,
    Error,
    Ack,
    Nack,
    Disconnected,
}

impl StatusKind {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Error => 1,
            Self::Ack => 2,
            Self::Nack => 3,
            Self::Disconnected => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Error),
            2 => Some(Self::Ack),
            3 => Some(Self::Nack),
            4 => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// Seek target. On the wire `-1` means end of recorded history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekPosition {
    /// Absolute time in milliseconds. `0` is the start of history.
    Time(i64),
    Eof,
}

impl SeekPosition {
    pub const EOF_OFFSET: i64 = -1;

    pub fn to_offset(self) -> i64 {
        match self {
            Self::Time(t) => t,
            Self::Eof => Self::EOF_OFFSET,
        }
    }

    /// Decode a wire offset. Other negative values are rejected.
    pub fn from_offset(offset: i64) -> Option<Self> {
        match offset {
            Self::EOF_OFFSET => Some(Self::Eof),
            t if t >= 0 => Some(Self::Time(t)),
            _ => None,
        }
    }
}

/// RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);
    pub const RED: Color = Color::rgb(255, 0, 0);
    pub const GREEN: Color = Color::rgb(0, 255, 0);
    pub const BLUE: Color = Color::rgb(0, 0, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }
}

/// Free-form test payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMessage {
    pub text: String,
    pub ints: Vec<i32>,
}

/// Node position report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsMessage {
    pub node: IpAddr,
    pub lat: f64,
    pub lng: f64,
    pub alt: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelMessage {
    pub node: IpAddr,
    pub text: String,
    pub font_size: f32,
    pub foreground: Color,
    pub background: Color,
    /// Lifetime in milliseconds, `0` for permanent.
    pub expiration_ms: u32,
    /// `false` removes a previously added label.
    pub add: bool,
    pub layer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeMessage {
    pub node1: IpAddr,
    pub node2: IpAddr,
    pub color: Color,
    pub width: f32,
    pub bidirectional: bool,
    pub expiration_ms: u32,
    pub add: bool,
    pub layer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorMessage {
    pub node: IpAddr,
    pub color: Color,
    /// Flash period in milliseconds, `0` for steady.
    pub flash_period_ms: u32,
    pub expiration_ms: u32,
    pub layer: String,
}

/// Full neighbor list of one node on one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityMessage {
    pub node: IpAddr,
    pub layer: String,
    pub neighbors: Vec<IpAddr>,
}

/// Named scalar samples attached to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPointMessage {
    pub node: IpAddr,
    pub name: String,
    pub points: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusMessage {
    pub node: IpAddr,
    pub event: NodeEvent,
}

/// Catalog entry returned by `ListStreams`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub uid: u32,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_follows_payload() {
        let msg = Message::at(5, Payload::Speed(2.0));
        assert_eq!(msg.message_type(), MessageType::Speed);
        assert_eq!(msg.envelope().timestamp, 5);
        assert!(!msg.is_data());
    }

    #[test]
    fn test_seek_offsets() {
        assert_eq!(SeekPosition::from_offset(-1), Some(SeekPosition::Eof));
        assert_eq!(SeekPosition::from_offset(0), Some(SeekPosition::Time(0)));
        assert_eq!(SeekPosition::from_offset(-7), None);
        assert_eq!(SeekPosition::Eof.to_offset(), -1);
    }

    #[test]
    fn test_status_values() {
        for kind in [
            StatusKind::Ok,
            StatusKind::Error,
            StatusKind::Ack,
            StatusKind::Nack,
            StatusKind::Disconnected,
        ] {
            assert_eq!(StatusKind::from_u8(kind.to_u8()), Some(kind));
        }
        assert_eq!(StatusKind::from_u8(9), None);
    }
}
