// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared event streams.
//!
//! A [`SharedStream`] is a playback session that any number of connections
//! can watch together. It is either *live* (fed by the registry's fan-out)
//! or *replaying* history through its [`ReplayState`], and independently
//! playing or stopped.
//!
//! Lock order: `control` before the replay lock, and `control` before the
//! registry's live set, which comes before `subscribers`.

use crate::config::ReplayConfig;
use crate::registry::Registry;
use crate::replay::{ReplayError, ReplaySink, ReplayState, RunOutcome};
use crate::server::ConnectionHandle;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use watcher::{now_millis, Message, Payload, SeekPosition, StreamInfo};
use watcher_store::{Direction, EventStore};

/// Stream control errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Replay(#[from] ReplayError),
}

#[derive(Debug, Clone, Copy)]
struct Control {
    is_live: bool,
    is_playing: bool,
}

/// Playback session shared by its subscribers.
pub struct SharedStream {
    uid: u32,
    description: Mutex<String>,
    registry: Weak<Registry>,
    store: Arc<dyn EventStore>,
    control: Mutex<Control>,
    replay: Arc<ReplayState>,
    subscribers: Mutex<Vec<Weak<ConnectionHandle>>>,
    /// Distinct connections that ever joined.
    joins: AtomicUsize,
    self_ref: Weak<SharedStream>,
}

impl SharedStream {
    /// Create a live, stopped stream.
    pub fn new(
        uid: u32,
        registry: Weak<Registry>,
        store: Arc<dyn EventStore>,
        config: &ReplayConfig,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref: &Weak<SharedStream>| {
            let sink: Weak<dyn ReplaySink> = self_ref.clone();
            Self {
                uid,
                description: Mutex::new(String::new()),
                registry,
                replay: ReplayState::new(store.clone(), sink, config, runtime),
                store,
                control: Mutex::new(Control {
                    is_live: true,
                    is_playing: false,
                }),
                subscribers: Mutex::new(Vec::new()),
                joins: AtomicUsize::new(0),
                self_ref: self_ref.clone(),
            }
        })
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn description(&self) -> String {
        self.description.lock().clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        *self.description.lock() = description.into();
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            uid: self.uid,
            description: self.description(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.control.lock().is_live
    }

    pub fn is_playing(&self) -> bool {
        self.control.lock().is_playing
    }

    /// Begin playback of the live feed or the replay.
    pub fn start(&self) {
        let mut control = self.control.lock();
        if control.is_playing {
            return;
        }
        control.is_playing = true;
        if control.is_live {
            self.register_live();
        } else {
            self.run_replay(&mut control);
        }
        debug!("Stream {} started (live={})", self.uid, control.is_live);
    }

    /// Pause playback. Stopping the live feed snapshots the current time
    /// into the replay position.
    pub fn stop(&self) {
        let mut control = self.control.lock();
        if !control.is_playing {
            return;
        }
        control.is_playing = false;
        if control.is_live {
            self.deregister_live();
            self.replay.seek(SeekPosition::Time(now_millis()));
        } else {
            self.replay.pause();
        }
        debug!("Stream {} stopped (live={})", self.uid, control.is_live);
    }

    pub fn seek(&self, position: SeekPosition) {
        let mut control = self.control.lock();
        match (control.is_live, position) {
            (true, SeekPosition::Eof) => {}
            (true, SeekPosition::Time(_)) => {
                control.is_live = false;
                self.replay.seek(position);
                if control.is_playing {
                    self.deregister_live();
                    self.run_replay(&mut control);
                }
            }
            (false, SeekPosition::Eof) => {
                if !control.is_playing {
                    self.replay.seek(position);
                    control.is_live = true;
                } else if self.replay.speed() >= 0.0 {
                    self.go_live(&mut control);
                } else {
                    self.replay.seek(position);
                    self.run_replay(&mut control);
                }
            }
            (false, SeekPosition::Time(_)) => {
                self.replay.seek(position);
                if control.is_playing {
                    self.run_replay(&mut control);
                }
            }
        }
        debug!("Stream {} seek {:?} (live={})", self.uid, position, control.is_live);
    }

    /// Change playback speed. Zero stops the stream. Slowing or reversing
    /// the live feed switches to replay from the end of history.
    pub fn set_speed(&self, speed: f32) -> Result<(), StreamError> {
        if speed == 0.0 {
            self.stop();
            return Ok(());
        }

        let mut control = self.control.lock();
        self.replay.set_speed(speed)?;
        if control.is_live {
            if speed >= 1.0 {
                return Ok(());
            }
            control.is_live = false;
            self.replay.seek(SeekPosition::Eof);
            if control.is_playing {
                self.deregister_live();
                self.run_replay(&mut control);
            }
        } else if control.is_playing {
            self.run_replay(&mut control);
        }
        debug!("Stream {} speed {} (live={})", self.uid, speed, control.is_live);
        Ok(())
    }

    /// Time span of the stored history, `(0, 0)` when empty.
    pub fn range(&self) -> Message {
        let (min, max) = match self.store.event_range() {
            Ok(range) => range.unwrap_or((0, 0)),
            Err(e) => {
                warn!("Could not read history range: {}", e);
                (0, 0)
            }
        };
        Message::new(Payload::PlaybackTimeRange { min, max })
    }

    /// Attach a connection. A playing stream joins the fan-out or resumes
    /// its replay.
    pub fn add_subscriber(&self, conn: &Arc<ConnectionHandle>) {
        let mut control = self.control.lock();
        {
            let mut subscribers = self.subscribers.lock();
            let id = conn.id();
            let present = subscribers
                .iter()
                .filter_map(Weak::upgrade)
                .any(|c| c.id() == id);
            if !present {
                subscribers.push(Arc::downgrade(conn));
                self.joins.fetch_add(1, Ordering::Relaxed);
            }
        }
        if control.is_playing {
            if control.is_live {
                self.register_live();
            } else {
                self.run_replay(&mut control);
            }
        }
    }

    /// Detach a connection by id. An emptied stream leaves the fan-out and
    /// pauses its replay, but stays in the catalog.
    pub fn remove_subscriber(&self, conn_id: u64) {
        let control = self.control.lock();
        let now_empty = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|w| w.upgrade().is_some_and(|c| c.id() != conn_id));
            subscribers.is_empty()
        };
        if now_empty {
            info!("Stream {} has no more subscribers", self.uid);
            self.idle(&control);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// No subscribers, no description, and never joined by anyone but the
    /// connection it was created for.
    pub fn is_abandoned(&self) -> bool {
        self.joins.load(Ordering::Relaxed) <= 1
            && self.subscriber_count() == 0
            && self.description.lock().is_empty()
    }

    /// Push a batch to every reachable subscriber, pruning dead or failed
    /// connections. Returns whether any subscriber remains.
    pub fn send_messages(&self, messages: &[Message]) -> bool {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| match weak.upgrade() {
            Some(conn) => match conn.send_messages(messages.to_vec()) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Dropping subscriber {} from stream {}: {}", conn.id(), self.uid, e);
                    false
                }
            },
            None => false,
        });
        !subscribers.is_empty()
    }

    pub fn send_message(&self, message: Message) -> bool {
        self.send_messages(std::slice::from_ref(&message))
    }

    fn run_replay(&self, control: &mut Control) {
        if self.subscriber_count() == 0 {
            self.replay.pause();
            return;
        }
        if self.replay.run() == RunOutcome::Exhausted {
            self.handle_exhausted(control);
        }
    }

    /// End of history: a forward replay hands off to the live feed, a
    /// reverse one stays paused at the beginning.
    fn handle_exhausted(&self, control: &mut Control) {
        match Direction::from_speed(self.replay.speed()) {
            Direction::Forward => {
                info!("Stream {} caught up with live feed", self.uid);
                self.go_live(control);
            }
            Direction::Reverse => {
                info!("Stream {} reached start of history", self.uid);
                control.is_playing = false;
            }
        }
    }

    fn go_live(&self, control: &mut Control) {
        self.replay.pause();
        control.is_live = true;
        if control.is_playing {
            self.register_live();
        }
    }

    /// Nobody is watching: leave the fan-out and stop the replay timer.
    fn idle(&self, control: &Control) {
        if !control.is_live {
            self.replay.pause();
        }
        self.leave_live_if_idle();
    }

    fn register_live(&self) {
        if self.subscriber_count() == 0 {
            return;
        }
        if let (Some(registry), Some(me)) = (self.registry.upgrade(), self.self_ref.upgrade()) {
            registry.subscribe(&me);
        }
    }

    fn deregister_live(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.uid);
        }
    }

    fn leave_live_if_idle(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe_if_idle(self);
        }
    }
}

impl ReplaySink for SharedStream {
    fn deliver(&self, events: Vec<Message>) {
        if self.send_messages(&events) {
            return;
        }
        let control = self.control.lock();
        if self.subscriber_count() == 0 {
            debug!("Stream {} lost its last subscriber during replay", self.uid);
            self.idle(&control);
        }
    }

    fn replay_exhausted(&self, epoch: u64) {
        let mut control = self.control.lock();
        if control.is_live || !control.is_playing || self.replay.epoch() != epoch {
            return;
        }
        self.handle_exhausted(&mut control);
    }
}

impl std::fmt::Debug for SharedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStream")
            .field("uid", &self.uid)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
