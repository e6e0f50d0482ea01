// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream catalog and live fan-out.

use crate::config::ReplayConfig;
use crate::stream::SharedStream;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};
use watcher::{Message, StreamInfo};
use watcher_store::EventStore;

/// All known streams, plus the subset subscribed to the live feed.
pub struct Registry {
    streams: RwLock<HashMap<u32, Arc<SharedStream>>>,
    live: RwLock<HashMap<u32, Arc<SharedStream>>>,
    next_uid: Mutex<u32>,
    store: Arc<dyn EventStore>,
    replay_config: ReplayConfig,
    runtime: Handle,
}

impl Registry {
    pub fn new(store: Arc<dyn EventStore>, replay_config: ReplayConfig, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
            next_uid: Mutex::new(1),
            store,
            replay_config,
            runtime,
        })
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Build a new live, stopped stream and add it to the catalog.
    pub fn create_stream(self: &Arc<Self>) -> Arc<SharedStream> {
        let uid = {
            let mut next = self.next_uid.lock();
            let uid = *next;
            *next = next.wrapping_add(1).max(1);
            uid
        };
        let stream = SharedStream::new(
            uid,
            Arc::downgrade(self),
            self.store.clone(),
            &self.replay_config,
            self.runtime.clone(),
        );
        self.add_stream(stream.clone());
        info!("Created stream {}", uid);
        stream
    }

    pub fn add_stream(&self, stream: Arc<SharedStream>) {
        self.streams.write().insert(stream.uid(), stream);
    }

    /// Drop a stream from the catalog and the live fan-out.
    pub fn remove_stream(&self, uid: u32) -> Option<Arc<SharedStream>> {
        self.unsubscribe(uid);
        self.streams.write().remove(&uid)
    }

    /// Drop a stream nobody else can still be using. See
    /// [`SharedStream::is_abandoned`].
    pub fn remove_if_abandoned(&self, stream: &SharedStream) -> bool {
        let removed = {
            let mut streams = self.streams.write();
            stream.is_abandoned() && streams.remove(&stream.uid()).is_some()
        };
        if removed {
            self.unsubscribe(stream.uid());
            debug!("Removed abandoned stream {}", stream.uid());
        }
        removed
    }

    pub fn get_stream(&self, uid: u32) -> Option<Arc<SharedStream>> {
        self.streams.read().get(&uid).cloned()
    }

    /// Catalog entries ordered by uid.
    pub fn list_streams(&self) -> Vec<StreamInfo> {
        let streams: Vec<Arc<SharedStream>> = self.streams.read().values().cloned().collect();
        let mut infos: Vec<StreamInfo> = streams.iter().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.uid);
        infos
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Add a stream to the live fan-out. Subscribing twice is a no-op.
    pub fn subscribe(&self, stream: &Arc<SharedStream>) {
        let mut live = self.live.write();
        if live.insert(stream.uid(), stream.clone()).is_none() {
            debug!("Stream {} subscribed to live feed", stream.uid());
        }
    }

    pub fn unsubscribe(&self, uid: u32) {
        if self.live.write().remove(&uid).is_some() {
            debug!("Stream {} unsubscribed from live feed", uid);
        }
    }

    /// Leave the live fan-out if the stream has no subscribers left.
    pub fn unsubscribe_if_idle(&self, stream: &SharedStream) {
        let mut live = self.live.write();
        if stream.subscriber_count() == 0 && live.remove(&stream.uid()).is_some() {
            debug!("Idle stream {} left live feed", stream.uid());
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    /// Send a batch to every live stream. Streams left without subscribers
    /// are deregistered once the fan-out is done.
    pub fn broadcast_live(&self, messages: &[Message]) {
        if messages.is_empty() {
            return;
        }
        let idle: Vec<Arc<SharedStream>> = {
            let live = self.live.read();
            live.values()
                .filter(|stream| !stream.send_messages(messages))
                .cloned()
                .collect()
        };
        for stream in idle {
            self.unsubscribe_if_idle(&stream);
        }
    }

    pub fn broadcast_message(&self, message: Message) {
        self.broadcast_live(std::slice::from_ref(&message));
    }
}
