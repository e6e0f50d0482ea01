// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP front end of the watcher daemon.

use crate::config::{ConfigError, DaemonConfig};
use crate::handler::MessageHandler;
use crate::registry::Registry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use watcher::DataMarshaller;
use watcher_store::{EventStore, StoreError};

pub mod connection;

pub use connection::ConnectionHandle;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server already running")]
    AlreadyRunning,

    #[error("No tokio runtime: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Watcher daemon server.
#[derive(Clone)]
pub struct WatcherServer {
    config: Arc<DaemonConfig>,
    registry: Arc<Registry>,
    handler: Arc<MessageHandler>,
    marshaller: DataMarshaller,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    next_connection_id: Arc<AtomicU64>,
}

impl WatcherServer {
    /// Create a server over an opened event store. Must be called from
    /// within a tokio runtime.
    pub fn new(config: DaemonConfig, store: Arc<dyn EventStore>) -> Result<Self, ServerError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| ServerError::Runtime(e.to_string()))?;

        let registry = Registry::new(store, config.replay.clone(), runtime);
        let handler = Arc::new(MessageHandler::new(registry.clone(), config.read_only));
        Ok(Self {
            marshaller: DataMarshaller::new(config.max_message_size),
            config: Arc::new(config),
            registry,
            handler,
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Open the configured store and create a server over it.
    pub fn from_config(config: DaemonConfig) -> Result<Self, ServerError> {
        let store = watcher_store::open(&config.database)?;
        Self::new(config, store)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.listen_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }
        info!("Watcher daemon listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                            info!("New connection {} from {}", id, peer_addr);

                            let (handle, outbound_rx) = ConnectionHandle::new(
                                id,
                                peer_addr,
                                self.config.outbound_queue_capacity,
                            );
                            let handler = self.handler.clone();
                            let marshaller = self.marshaller;
                            let shutdown = self.shutdown.clone();

                            tokio::spawn(async move {
                                if let Err(e) = connection::serve(
                                    stream,
                                    handle,
                                    outbound_rx,
                                    handler,
                                    marshaller,
                                    shutdown,
                                ).await {
                                    warn!("Connection error from {}: {}", peer_addr, e);
                                }
                                debug!("Connection {} finished", id);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop accepting and close all connections.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
