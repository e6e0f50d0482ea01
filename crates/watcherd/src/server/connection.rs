// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server side of a client connection.
//!
//! Each accepted socket gets a reader task (this module's [`serve`]) and a
//! writer task draining a bounded FIFO queue. Streams reach the connection
//! through weak references to its [`ConnectionHandle`].

use crate::handler::{MessageHandler, Session};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use watcher::{write_frames, ConnectionError, DataMarshaller, FrameReader, Message, StatusKind};

/// Shareable identity and send queue of one connection.
pub struct ConnectionHandle {
    id: u64,
    peer_addr: SocketAddr,
    outbound: mpsc::Sender<Vec<Message>>,
    closed: AtomicBool,
    close_signal: Notify,
    runtime: Handle,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its send queue.
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<Message>>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = Arc::new(Self {
            id,
            peer_addr,
            outbound: tx,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            runtime: Handle::current(),
        });
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Runtime the connection's tasks run on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn send_message(&self, msg: Message) -> Result<(), ConnectionError> {
        self.send_messages(vec![msg])
    }

    /// Queue a batch for the writer. A full queue closes this connection.
    pub fn send_messages(&self, messages: Vec<Message>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        match self.outbound.try_send(messages) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue full for connection {} ({}), closing",
                    self.id, self.peer_addr
                );
                self.close();
                Err(ConnectionError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(ConnectionError::Closed)
            }
        }
    }

    /// Ask the connection's tasks to stop.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn wait_closed(&self) {
        self.close_signal.notified().await;
    }
}

/// Serve one accepted socket until it closes.
pub async fn serve(
    stream: TcpStream,
    handle: Arc<ConnectionHandle>,
    outbound_rx: mpsc::Receiver<Vec<Message>>,
    handler: Arc<MessageHandler>,
    marshaller: DataMarshaller,
    shutdown: Arc<Notify>,
) -> Result<(), ConnectionError> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {}", e);
    }
    let (read_half, write_half) = stream.into_split();

    let writer_handle = handle.clone();
    let writer = tokio::spawn(write_loop(write_half, outbound_rx, marshaller, writer_handle));

    let mut reader = FrameReader::new(read_half, marshaller);
    let mut session = Session::new(handle.clone());

    let result = loop {
        tokio::select! {
            frame = reader.read_frame() => {
                match frame {
                    Ok(Some(Ok(messages))) => {
                        let replies = handler.handle_batch(&mut session, messages);
                        if !replies.is_empty() {
                            if let Err(e) = handle.send_messages(replies) {
                                break Err(e);
                            }
                        }
                    }
                    Ok(Some(Err(e))) => {
                        warn!("Did not understand frame from {}: {}; sending NACK", handle.peer_addr(), e);
                        if let Err(e) = handle.send_message(Message::status(StatusKind::Nack)) {
                            break Err(e);
                        }
                    }
                    Ok(None) => {
                        info!("Connection closed: {}", handle.peer_addr());
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                }
            }
            _ = handle.wait_closed() => {
                debug!("Connection {} closed locally", handle.id());
                break Ok(());
            }
            _ = shutdown.notified() => {
                debug!("Connection handler shutting down: {}", handle.peer_addr());
                break Ok(());
            }
        }
    };

    handler.disconnect(&mut session);
    handle.close();
    drop(session);
    writer.abort();
    result
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Vec<Message>>,
    marshaller: DataMarshaller,
    handle: Arc<ConnectionHandle>,
) {
    while let Some(first) = outbound_rx.recv().await {
        let mut batches = vec![first];
        while let Ok(more) = outbound_rx.try_recv() {
            batches.push(more);
        }
        if let Err(e) = write_frames(&mut write_half, &marshaller, &batches).await {
            warn!("Write to {} failed: {}", handle.peer_addr(), e);
            handle.close();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watcher::Payload;

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_preserves_order() {
        let (handle, mut rx) = ConnectionHandle::new(1, peer(), 8);
        handle.send_message(Message::at(1, Payload::Start)).unwrap();
        handle
            .send_messages(vec![Message::at(2, Payload::Stop), Message::at(3, Payload::Start)])
            .unwrap();

        assert_eq!(rx.recv().await.unwrap()[0].timestamp, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].timestamp, 3);
    }

    #[tokio::test]
    async fn test_full_queue_closes_connection() {
        let (handle, _rx) = ConnectionHandle::new(7, peer(), 1);
        handle.send_message(Message::new(Payload::Start)).unwrap();
        assert!(matches!(
            handle.send_message(Message::new(Payload::Start)),
            Err(ConnectionError::QueueFull)
        ));
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send_message(Message::new(Payload::Start)),
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let (handle, _rx) = ConnectionHandle::new(3, peer(), 1);
        handle.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.wait_closed())
            .await
            .unwrap();
    }
}
