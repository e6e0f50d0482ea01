// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed I/O over async byte streams.
//!
//! [`FrameReader`] runs the receive state machine
//! (`ReadingHeader` -> `ReadingPayload` -> `ReadingHeader` ...) and
//! [`write_frames`] flushes a group of queued batches in a single write.

use crate::codec::{CodecError, DataMarshaller, FrameHeader, PartialDecode, FRAME_HEADER_SIZE};
use crate::message::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Connection error types.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing violation; the stream can no longer be trusted.
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("connection closed")]
    Closed,

    #[error("outbound queue full")]
    QueueFull,
}

/// Result of decoding one frame's payload.
pub type DecodedFrame = Result<Vec<Message>, PartialDecode>;

#[derive(Debug, Clone, Copy)]
enum ReadState {
    ReadingHeader,
    ReadingPayload(FrameHeader),
}

/// Incremental frame reader.
pub struct FrameReader<R> {
    reader: R,
    marshaller: DataMarshaller,
    state: ReadState,
    buffer: Vec<u8>,
    frames_read: u64,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, marshaller: DataMarshaller) -> Self {
        Self {
            reader,
            marshaller,
            state: ReadState::ReadingHeader,
            buffer: Vec::with_capacity(4096),
            frames_read: 0,
            bytes_read: 0,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closes the stream. The inner result
    /// reports payload decode failures, which leave the stream usable;
    /// the outer error is fatal for the connection.
    pub async fn read_frame(&mut self) -> Result<Option<DecodedFrame>, ConnectionError> {
        loop {
            match self.state {
                ReadState::ReadingHeader => {
                    let mut header = [0u8; FRAME_HEADER_SIZE];
                    match self.reader.read_exact(&mut header).await {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            return Ok(None);
                        }
                        Err(e) => return Err(e.into()),
                    }
                    let header = self.marshaller.decode_header(&header)?;
                    self.state = ReadState::ReadingPayload(header);
                }
                ReadState::ReadingPayload(header) => {
                    self.buffer.clear();
                    self.buffer.resize(header.payload_length as usize, 0);
                    match self.reader.read_exact(&mut self.buffer).await {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            return Err(ConnectionError::Closed);
                        }
                        Err(e) => return Err(e.into()),
                    }
                    self.state = ReadState::ReadingHeader;
                    self.frames_read += 1;
                    self.bytes_read += (FRAME_HEADER_SIZE + self.buffer.len()) as u64;
                    return Ok(Some(
                        self.marshaller
                            .decode_payload(&self.buffer, header.message_count),
                    ));
                }
            }
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Encode every batch as its own frame and write them all at once.
///
/// Batches that cannot be encoded are logged and dropped. Returns the
/// number of bytes written.
pub async fn write_frames<W: AsyncWrite + Unpin>(
    writer: &mut W,
    marshaller: &DataMarshaller,
    batches: &[Vec<Message>],
) -> Result<usize, ConnectionError> {
    let mut out = Vec::new();
    for batch in batches.iter().filter(|b| !b.is_empty()) {
        if let Err(e) = marshaller.encode_into(batch, &mut out) {
            warn!("Dropping batch of {} messages: {}", batch.len(), e);
        }
    }
    if out.is_empty() {
        return Ok(0);
    }

    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(out.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Payload, StatusKind};

    fn status(ts: i64, kind: StatusKind) -> Message {
        Message::at(ts, Payload::Status(kind))
    }

    #[tokio::test]
    async fn test_reads_consecutive_frames() {
        let marshaller = DataMarshaller::default();
        let (mut client, server) = tokio::io::duplex(1024);

        let batches = vec![
            vec![status(1, StatusKind::Ok)],
            vec![],
            vec![status(2, StatusKind::Ack), status(3, StatusKind::Nack)],
        ];
        write_frames(&mut client, &marshaller, &batches).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, marshaller);
        let first = reader.read_frame().await.unwrap().unwrap().unwrap();
        assert_eq!(first, batches[0]);
        let second = reader.read_frame().await.unwrap().unwrap().unwrap();
        assert_eq!(second, batches[2]);
        assert!(reader.read_frame().await.unwrap().is_none());
        assert_eq!(reader.frames_read(), 2);
    }

    #[tokio::test]
    async fn test_bad_payload_keeps_stream_usable() {
        let marshaller = DataMarshaller::default();
        let (mut client, server) = tokio::io::duplex(1024);

        let mut bad = marshaller.encode(&[status(1, StatusKind::Ok)]).unwrap();
        let last = bad.len() - 1;
        bad[last] = 0x77;
        client.write_all(&bad).await.unwrap();
        write_frames(&mut client, &marshaller, &[vec![status(2, StatusKind::Ok)]])
            .await
            .unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, marshaller);
        let err = reader.read_frame().await.unwrap().unwrap().unwrap_err();
        assert_eq!(err.index, 0);
        let ok = reader.read_frame().await.unwrap().unwrap().unwrap();
        assert_eq!(ok[0].timestamp, 2);
    }

    #[tokio::test]
    async fn test_oversized_header_is_fatal() {
        let marshaller = DataMarshaller::new(8);
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 1, 0, 0, 1]).await.unwrap();

        let mut reader = FrameReader::new(server, marshaller);
        assert!(matches!(
            reader.read_frame().await,
            Err(ConnectionError::Protocol(CodecError::FrameTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_eof_inside_payload() {
        let marshaller = DataMarshaller::default();
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 20, 0, 1, 1, 2]).await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, marshaller);
        assert!(matches!(
            reader.read_frame().await,
            Err(ConnectionError::Closed)
        ));
    }
}
