// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Watcher protocol library
//!
//! Shared by the `watcherd` daemon and its clients (feeders, viewers,
//! operator tools):
//!
//! - [`Envelope`] / [`MessageType`] -- the header every event carries
//! - [`Payload`] -- the closed catalog of event and control bodies
//! - [`DataMarshaller`] -- batch framing to and from the wire
//! - [`FrameReader`] / [`write_frames`] -- framed I/O over async streams
//! - [`ClientConnection`] -- reconnecting client with a FIFO send queue
//!
//! # Example
//!
//! ```
//! use watcher::{DataMarshaller, Message, Payload, StatusKind};
//!
//! let marshaller = DataMarshaller::default();
//! let frame = marshaller
//!     .encode(&[Message::new(Payload::Status(StatusKind::Ack))])
//!     .unwrap();
//!
//! let header = marshaller.decode_header(&frame).unwrap();
//! assert_eq!(header.message_count, 1);
//! ```

pub mod client;
pub mod codec;
pub mod envelope;
pub mod message;
pub mod transport;

pub use client::{ClientConfig, ClientConnection, ConnectionState};
pub use codec::{
    CodecError, DataMarshaller, FrameHeader, PartialDecode, DEFAULT_MAX_MESSAGE_SIZE,
    FRAME_HEADER_SIZE, MAX_MESSAGES_PER_FRAME,
};
pub use envelope::{now_millis, Envelope, MessageType, PROTOCOL_VERSION, SCHEMA_VERSION};
pub use message::{
    Color, ColorMessage, ConnectivityMessage, DataPointMessage, EdgeMessage, GpsMessage,
    LabelMessage, Message, NodeEvent, NodeStatusMessage, Payload, SeekPosition, StatusKind,
    StreamInfo, TestMessage,
};
pub use transport::{write_frames, ConnectionError, FrameReader};
