// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batch framing for watcher messages.
//!
//! A frame carries one or more messages behind a fixed 6-byte header:
//!
//! ```text
//! +--------------------------+----------------------+-----------------+
//! | payload_length (u32 BE)  | message_count (u16)  | record * count  |
//! +--------------------------+----------------------+-----------------+
//! ```
//!
//! Each record is self-delimiting so that receivers can step over kinds
//! they do not understand:
//!
//! ```text
//! +-----------+--------------+----------------+---------------+--------+
//! | tag (u16) | version (u16)| timestamp (i64)| body_len (u32)| body   |
//! +-----------+--------------+----------------+---------------+--------+
//! ```
//!
//! All integers are big-endian. The length field is 32 bits and the count
//! 16 bits; peers agree on this layout through the `Hello` handshake.

mod body;

use crate::envelope::MessageType;
use crate::message::Message;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

/// Frame header size (4 bytes length + 2 bytes count).
pub const FRAME_HEADER_SIZE: usize = 6;

/// Record header size (tag + version + timestamp + body length).
pub const RECORD_HEADER_SIZE: usize = 16;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest batch a single frame can describe.
pub const MAX_MESSAGES_PER_FRAME: usize = u16::MAX as usize;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("too many messages for one frame: {0}")]
    TooManyMessages(usize),

    #[error("field '{field}' too long: {len} > {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("malformed {message_type} body: {reason}")]
    Malformed {
        message_type: MessageType,
        reason: String,
    },

    #[error("{0} trailing bytes after last record")]
    TrailingBytes(usize),

    #[error("record {index} of {count}: {source}")]
    Record {
        index: usize,
        count: usize,
        #[source]
        source: Box<CodecError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Exact byte length of the records that follow.
    pub payload_length: u32,
    pub message_count: u16,
}

/// A payload that failed part way through.
///
/// `decoded` holds every record before `index`. The frame as a whole is
/// considered rejected.
#[derive(Debug, Error)]
#[error("record {index} of {count} failed to decode: {source}")]
pub struct PartialDecode {
    pub decoded: Vec<Message>,
    pub index: usize,
    pub count: usize,
    #[source]
    pub source: CodecError,
}

impl From<PartialDecode> for CodecError {
    fn from(e: PartialDecode) -> Self {
        CodecError::Record {
            index: e.index,
            count: e.count,
            source: Box::new(e.source),
        }
    }
}

/// Encodes message batches into frames and back.
#[derive(Debug, Clone, Copy)]
pub struct DataMarshaller {
    max_payload: usize,
}

impl Default for DataMarshaller {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl DataMarshaller {
    /// Create a marshaller that refuses payloads above `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(u32::MAX as usize),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode a batch into one frame. Order is preserved; an empty batch
    /// yields a bare header.
    pub fn encode(&self, messages: &[Message]) -> Result<Vec<u8>, CodecError> {
        if messages.len() > MAX_MESSAGES_PER_FRAME {
            return Err(CodecError::TooManyMessages(messages.len()));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + messages.len() * 64);
        frame.extend_from_slice(&[0u8; FRAME_HEADER_SIZE]);
        for msg in messages {
            write_record(&mut frame, msg)?;
        }

        let payload_len = frame.len() - FRAME_HEADER_SIZE;
        if payload_len > self.max_payload {
            return Err(CodecError::FrameTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }

        let mut header: &mut [u8] = &mut frame[..FRAME_HEADER_SIZE];
        header.write_u32::<BigEndian>(payload_len as u32)?;
        header.write_u16::<BigEndian>(messages.len() as u16)?;
        Ok(frame)
    }

    /// Append `messages` to `out` as one or more frames, splitting batches
    /// that exceed the count or size limits. Returns the number of frames.
    pub fn encode_into(&self, messages: &[Message], out: &mut Vec<u8>) -> Result<usize, CodecError> {
        if messages.len() > MAX_MESSAGES_PER_FRAME {
            let (head, tail) = messages.split_at(MAX_MESSAGES_PER_FRAME);
            return Ok(self.encode_into(head, out)? + self.encode_into(tail, out)?);
        }

        match self.encode(messages) {
            Ok(frame) => {
                out.extend_from_slice(&frame);
                Ok(1)
            }
            Err(CodecError::FrameTooLarge { .. }) if messages.len() > 1 => {
                let (head, tail) = messages.split_at(messages.len() / 2);
                Ok(self.encode_into(head, out)? + self.encode_into(tail, out)?)
            }
            Err(e) => Err(e),
        }
    }

    /// Parse the fixed frame header from the front of `bytes`.
    pub fn decode_header(&self, bytes: &[u8]) -> Result<FrameHeader, CodecError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: FRAME_HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let mut cursor = &bytes[..FRAME_HEADER_SIZE];
        let payload_length = cursor.read_u32::<BigEndian>()?;
        let message_count = cursor.read_u16::<BigEndian>()?;

        if payload_length as usize > self.max_payload {
            return Err(CodecError::FrameTooLarge {
                size: payload_length as usize,
                max: self.max_payload,
            });
        }

        Ok(FrameHeader {
            payload_length,
            message_count,
        })
    }

    /// Decode exactly `count` records from `bytes`.
    pub fn decode_payload(&self, bytes: &[u8], count: u16) -> Result<Vec<Message>, PartialDecode> {
        let count = count as usize;
        let mut decoded = Vec::with_capacity(count);
        let mut cursor = bytes;

        for index in 0..count {
            match read_record(&mut cursor) {
                Ok(msg) => decoded.push(msg),
                Err(source) => {
                    return Err(PartialDecode {
                        decoded,
                        index,
                        count,
                        source,
                    })
                }
            }
        }

        if !cursor.is_empty() {
            return Err(PartialDecode {
                decoded,
                index: count,
                count,
                source: CodecError::TrailingBytes(cursor.len()),
            });
        }

        Ok(decoded)
    }

    /// Decode a complete frame held in memory.
    pub fn decode(&self, frame: &[u8]) -> Result<Vec<Message>, CodecError> {
        let header = self.decode_header(frame)?;
        let needed = FRAME_HEADER_SIZE + header.payload_length as usize;
        if frame.len() < needed {
            return Err(CodecError::Truncated {
                needed,
                available: frame.len(),
            });
        }
        if frame.len() > needed {
            return Err(CodecError::TrailingBytes(frame.len() - needed));
        }
        Ok(self.decode_payload(&frame[FRAME_HEADER_SIZE..], header.message_count)?)
    }
}

fn write_record(out: &mut Vec<u8>, msg: &Message) -> Result<(), CodecError> {
    let mut body = Vec::new();
    body::write_body(&mut body, &msg.payload)?;
    if body.len() > u32::MAX as usize {
        return Err(CodecError::FrameTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        });
    }

    out.write_u16::<BigEndian>(msg.message_type().tag())?;
    out.write_u16::<BigEndian>(msg.schema_version)?;
    out.write_i64::<BigEndian>(msg.timestamp)?;
    out.write_u32::<BigEndian>(body.len() as u32)?;
    out.extend_from_slice(&body);
    Ok(())
}

fn read_record(cursor: &mut &[u8]) -> Result<Message, CodecError> {
    if cursor.len() < RECORD_HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: RECORD_HEADER_SIZE,
            available: cursor.len(),
        });
    }

    let tag = cursor.read_u16::<BigEndian>()?;
    let schema_version = cursor.read_u16::<BigEndian>()?;
    let timestamp = cursor.read_i64::<BigEndian>()?;
    let body_len = cursor.read_u32::<BigEndian>()? as usize;

    if cursor.len() < body_len {
        return Err(CodecError::Truncated {
            needed: body_len,
            available: cursor.len(),
        });
    }
    let (body, rest) = cursor.split_at(body_len);
    *cursor = rest;

    let payload = body::read_body(MessageType::from_tag(tag), schema_version, body)?;
    Ok(Message {
        timestamp,
        schema_version,
        payload,
    })
}
