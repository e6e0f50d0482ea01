// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client side of a watcher connection.
//!
//! Messages sent before the daemon is reachable are queued and flushed in
//! order once the connection is up. Connect attempts are retried at a fixed
//! interval until they succeed or the client is closed.

use crate::codec::{DataMarshaller, DEFAULT_MAX_MESSAGE_SIZE};
use crate::message::Message;
use crate::transport::{write_frames, ConnectionError, FrameReader};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay between connect attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Daemon address (`host:port`).
    pub address: String,
    pub retry_interval: Duration,
    pub max_message_size: usize,
    /// Capacity of the channel handing received messages to the caller.
    pub incoming_capacity: usize,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            incoming_capacity: 1024,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Handle to a background client connection.
pub struct ClientConnection {
    outbound: Option<mpsc::UnboundedSender<Vec<Message>>>,
    state: watch::Receiver<ConnectionState>,
    closing: Arc<Notify>,
    dropped: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Start connecting in the background.
    ///
    /// Returns the handle and the receiver for messages sent by the daemon.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::Receiver<Message>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let closing = Arc::new(Notify::new());
        let dropped = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(run(
            config,
            outbound_rx,
            Incoming {
                tx: incoming_tx,
                dropped: dropped.clone(),
                dropping: 0,
            },
            state_tx,
            closing.clone(),
        ));

        (
            Self {
                outbound: Some(outbound_tx),
                state: state_rx,
                closing,
                dropped,
                task: Some(task),
            },
            incoming_rx,
        )
    }

    /// Queue one message.
    pub fn send_message(&self, msg: Message) -> Result<(), ConnectionError> {
        self.send_messages(vec![msg])
    }

    /// Queue a batch; it is written as one frame.
    pub fn send_messages(&self, messages: Vec<Message>) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        match &self.outbound {
            Some(tx) => tx.send(messages).map_err(|_| ConnectionError::Closed),
            None => Err(ConnectionError::Closed),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Messages from the daemon discarded because the incoming channel was
    /// full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until the connection is established.
    pub async fn wait_connected(&mut self) -> Result<(), ConnectionError> {
        let state = self
            .state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
            .await
            .map_err(|_| ConnectionError::Closed)?;
        match *state {
            ConnectionState::Connected => Ok(()),
            _ => Err(ConnectionError::Closed),
        }
    }

    /// Flush queued messages and close.
    ///
    /// A client that never connected discards its queue.
    pub async fn close(mut self) {
        self.outbound.take();
        self.closing.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Hands received messages to the caller without ever blocking the socket.
struct Incoming {
    tx: mpsc::Sender<Message>,
    dropped: Arc<AtomicU64>,
    /// Length of the current run of dropped messages.
    dropping: u64,
}

impl Incoming {
    fn push(&mut self, msg: Message) {
        match self.tx.try_send(msg) {
            Ok(()) => {
                if self.dropping > 0 {
                    warn!("Incoming queue drained after dropping {} messages", self.dropping);
                    self.dropping = 0;
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if self.dropping == 0 {
                    warn!(
                        "Incoming queue full, dropping {} ({} dropped so far)",
                        msg.message_type(),
                        total
                    );
                }
                self.dropping += 1;
            }
        }
    }
}

async fn run(
    config: ClientConfig,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<Message>>,
    mut incoming: Incoming,
    state_tx: watch::Sender<ConnectionState>,
    closing: Arc<Notify>,
) {
    let _ = state_tx.send(ConnectionState::Connecting);

    let stream = loop {
        match TcpStream::connect(&config.address).await {
            Ok(stream) => break stream,
            Err(e) => {
                warn!(
                    "Connect to {} failed: {}; retrying in {:?}",
                    config.address, e, config.retry_interval
                );
                tokio::select! {
                    _ = tokio::time::sleep(config.retry_interval) => {}
                    _ = closing.notified() => {
                        let _ = state_tx.send(ConnectionState::Closed);
                        return;
                    }
                }
            }
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {}", e);
    }
    info!("Connected to {}", config.address);
    let _ = state_tx.send(ConnectionState::Connected);

    let marshaller = DataMarshaller::new(config.max_message_size);
    let (read_half, mut write_half) = stream.into_split();

    let result = tokio::select! {
        r = read_loop(read_half, marshaller, &mut incoming) => r,
        w = write_loop(&mut write_half, marshaller, &mut outbound_rx) => w,
    };
    match result {
        Ok(()) => debug!("Connection to {} finished", config.address),
        Err(e) => info!("Connection to {} closed: {}", config.address, e),
    }
    let _ = state_tx.send(ConnectionState::Closed);
}

async fn read_loop(
    read_half: OwnedReadHalf,
    marshaller: DataMarshaller,
    incoming: &mut Incoming,
) -> Result<(), ConnectionError> {
    let mut reader = FrameReader::new(read_half, marshaller);
    loop {
        match reader.read_frame().await? {
            Some(Ok(messages)) => {
                for msg in messages {
                    incoming.push(msg);
                }
            }
            Some(Err(e)) => warn!("Rejected frame: {}", e),
            None => return Err(ConnectionError::Closed),
        }
    }
}

async fn write_loop(
    write_half: &mut OwnedWriteHalf,
    marshaller: DataMarshaller,
    outbound_rx: &mut mpsc::UnboundedReceiver<Vec<Message>>,
) -> Result<(), ConnectionError> {
    while let Some(first) = outbound_rx.recv().await {
        let mut batches = vec![first];
        while let Ok(more) = outbound_rx.try_recv() {
            batches.push(more);
        }
        write_frames(write_half, &marshaller, &batches).await?;
    }
    Ok(())
}
