// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message envelope and type tags.
//!
//! Every record on the wire starts with the same header:
//!
//! ```text
//! +-------------+----------------+----------------+
//! | type (u16)  | version (u16)  | timestamp (i64)|
//! +-------------+----------------+----------------+
//! ```
//!
//! Timestamps are milliseconds since the Unix epoch, assigned by the
//! producer when the message is built.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Body layout version written by this build.
pub const SCHEMA_VERSION: u16 = 1;

/// Protocol version exchanged in the `Hello` handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Stable wire tag for each message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Status,
    Test,
    Gps,
    Label,
    Edge,
    Color,
    Connectivity,
    DataPoint,
    NodeStatus,
    Seek,
    Start,
    Stop,
    Speed,
    PlaybackTimeRange,
    ListStreams,
    SubscribeStream,
    StreamDescription,
    Hello,
    /// A tag this build does not know. The record is carried opaquely.
    Unknown(u16),
}

impl MessageType {
    /// Numeric tag used on the wire.
    pub fn tag(self) -> u16 {
        match self {
            Self::Status => 1,
            Self::Test => 2,
            Self::Gps => 3,
            Self::Label => 4,
            Self::Edge => 5,
            Self::Color => 6,
            Self::Connectivity => 7,
            Self::DataPoint => 8,
            Self::NodeStatus => 9,
            Self::Seek => 20,
            Self::Start => 21,
            Self::Stop => 22,
            Self::Speed => 23,
            Self::PlaybackTimeRange => 24,
            Self::ListStreams => 25,
            Self::SubscribeStream => 26,
            Self::StreamDescription => 27,
            Self::Hello => 28,
            Self::Unknown(tag) => tag,
        }
    }

    /// Map a wire tag back to a kind. Never fails.
    pub fn from_tag(tag: u16) -> Self {
        match tag {
            1 => Self::Status,
            2 => Self::Test,
            3 => Self::Gps,
            4 => Self::Label,
            5 => Self::Edge,
            6 => Self::Color,
            7 => Self::Connectivity,
            8 => Self::DataPoint,
            9 => Self::NodeStatus,
            20 => Self::Seek,
            21 => Self::Start,
            22 => Self::Stop,
            23 => Self::Speed,
            24 => Self::PlaybackTimeRange,
            25 => Self::ListStreams,
            26 => Self::SubscribeStream,
            27 => Self::StreamDescription,
            28 => Self::Hello,
            other => Self::Unknown(other),
        }
    }

    /// True for event kinds that are persisted and fanned out to viewers.
    pub fn is_data(self) -> bool {
        matches!(
            self,
            Self::Test
                | Self::Gps
                | Self::Label
                | Self::Edge
                | Self::Color
                | Self::Connectivity
                | Self::DataPoint
                | Self::NodeStatus
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Status => "status",
            Self::Test => "test",
            Self::Gps => "gps",
            Self::Label => "label",
            Self::Edge => "edge",
            Self::Color => "color",
            Self::Connectivity => "connectivity",
            Self::DataPoint => "data point",
            Self::NodeStatus => "node status",
            Self::Seek => "seek",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Speed => "speed",
            Self::PlaybackTimeRange => "playback time range",
            Self::ListStreams => "list streams",
            Self::SubscribeStream => "subscribe stream",
            Self::StreamDescription => "stream description",
            Self::Hello => "hello",
            Self::Unknown(_) => "unknown",
        };
        write!(f, "{} ({})", self.tag(), name)
    }
}

/// Record header shared by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub schema_version: u16,
    pub message_type: MessageType,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Envelope {
    /// Envelope stamped with the current wall-clock time.
    pub fn new(message_type: MessageType) -> Self {
        Self::at(message_type, now_millis())
    }

    /// Envelope with an explicit timestamp.
    pub fn at(message_type: MessageType, timestamp: i64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            message_type,
            timestamp,
        }
    }
}

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
