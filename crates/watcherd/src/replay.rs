// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-scaled replay of stored history.
//!
//! A [`ReplayState`] walks the event store from a seek position in either
//! direction, pacing deliveries by the gap between event timestamps divided
//! by the playback speed. Events are prefetched in small batches and handed
//! to a [`ReplaySink`] (the owning stream) from a one-shot timer task.
//!
//! The sink is never invoked while the replay lock is held.

use crate::config::ReplayConfig;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use watcher::{Message, SeekPosition};
use watcher_store::{Direction, EventStore};

/// Replay errors.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("invalid playback speed {0}")]
    InvalidSpeed(f32),
}

/// Receiver of replayed events.
pub trait ReplaySink: Send + Sync {
    /// Events due at the current replay time, in playback order.
    fn deliver(&self, events: Vec<Message>);

    /// A timer-driven `run` found no more events in the playback
    /// direction. `epoch` identifies the run that ended.
    fn replay_exhausted(&self, epoch: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Paused,
    Running,
}

/// Result of [`ReplayState::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Scheduled,
    Exhausted,
}

struct Inner {
    /// Replay clock. `None` until anchored to the first fetched event.
    current_time: Option<i64>,
    /// Fetch origin for the next store query.
    last_fetched: i64,
    /// A fresh seek includes the event at `last_fetched` itself.
    inclusive: bool,
    /// Events at `last_fetched` already taken into the buffer. A nonzero
    /// count refetches that timestamp and skips them.
    seen_at_last: usize,
    speed: f32,
    buffer: VecDeque<Message>,
    run_state: RunState,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

impl Inner {
    fn fetch_origin(&self, direction: Direction) -> i64 {
        let inclusive = self.inclusive || self.seen_at_last > 0;
        match (inclusive, direction) {
            (false, _) => self.last_fetched,
            (true, Direction::Forward) => self.last_fetched.saturating_sub(1),
            (true, Direction::Reverse) => self.last_fetched.saturating_add(1),
        }
    }

    /// Advance the fetch cursor past `events`, which follow the previous
    /// cursor in playback order.
    fn advance_cursor(&mut self, events: &[Message]) {
        let Some(last) = events.last().map(|m| m.timestamp) else {
            return;
        };
        let trailing = events.iter().rev().take_while(|m| m.timestamp == last).count();
        if !self.inclusive && last == self.last_fetched {
            self.seen_at_last += trailing;
        } else {
            self.seen_at_last = trailing;
        }
        self.last_fetched = last;
        self.inclusive = false;
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Playback cursor over an [`EventStore`].
pub struct ReplayState {
    inner: Mutex<Inner>,
    store: Arc<dyn EventStore>,
    sink: Weak<dyn ReplaySink>,
    runtime: Handle,
    buffer_size: usize,
    time_step_ms: u64,
    self_ref: Weak<ReplayState>,
}

impl ReplayState {
    /// Create a paused replay positioned at the start of history.
    pub fn new(
        store: Arc<dyn EventStore>,
        sink: Weak<dyn ReplaySink>,
        config: &ReplayConfig,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            inner: Mutex::new(Inner {
                current_time: None,
                last_fetched: 0,
                inclusive: true,
                seen_at_last: 0,
                speed: 1.0,
                buffer: VecDeque::with_capacity(config.buffer_size),
                run_state: RunState::Paused,
                epoch: 0,
                timer: None,
            }),
            store,
            sink,
            runtime,
            buffer_size: config.buffer_size.max(1),
            time_step_ms: config.time_step_ms.max(1),
            self_ref: self_ref.clone(),
        })
    }

    /// Move the cursor. The run state is kept; a running replay continues
    /// from the new position.
    pub fn seek(&self, position: SeekPosition) {
        let mut inner = self.inner.lock();
        inner.buffer.clear();
        inner.seen_at_last = 0;
        match position {
            SeekPosition::Time(t) => {
                inner.last_fetched = t;
                inner.inclusive = true;
                inner.current_time = (t > 0).then_some(t);
            }
            SeekPosition::Eof => {
                inner.last_fetched = i64::MAX;
                inner.inclusive = false;
                inner.current_time = None;
            }
        }
        debug!("Replay seek to {:?}", position);
        if inner.run_state == RunState::Running {
            self.schedule(&mut inner, Duration::ZERO);
        }
    }

    /// Change the playback rate. Reversing direction discards the prefetch
    /// buffer and continues from the current replay time.
    pub fn set_speed(&self, speed: f32) -> Result<(), ReplayError> {
        if speed == 0.0 || !speed.is_finite() {
            return Err(ReplayError::InvalidSpeed(speed));
        }

        let mut inner = self.inner.lock();
        let reversed = (speed < 0.0) != (inner.speed < 0.0);
        inner.speed = speed;
        if reversed {
            inner.buffer.clear();
            inner.seen_at_last = 0;
            if !inner.inclusive {
                if let Some(current) = inner.current_time {
                    inner.last_fetched = current;
                }
            }
            if inner.run_state == RunState::Running {
                self.schedule(&mut inner, Duration::ZERO);
            }
        }
        debug!("Replay speed set to {}", speed);
        Ok(())
    }

    /// Schedule delivery of the next event, fetching from the store first
    /// if the buffer is empty. Calling `run` on a replay that already has a
    /// pending delivery is a no-op.
    pub fn run(&self) -> RunOutcome {
        let mut inner = self.inner.lock();
        if inner.run_state == RunState::Running && inner.timer.is_some() {
            return RunOutcome::Scheduled;
        }
        self.run_locked(&mut inner)
    }

    /// Cancel any pending delivery.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.run_state == RunState::Running || inner.timer.is_some() {
            inner.epoch += 1;
            inner.cancel_timer();
            inner.run_state = RunState::Paused;
            debug!("Replay paused");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().run_state == RunState::Running
    }

    pub fn run_state(&self) -> RunState {
        self.inner.lock().run_state
    }

    pub fn speed(&self) -> f32 {
        self.inner.lock().speed
    }

    /// Replay clock, `None` when unanchored.
    pub fn current_time(&self) -> Option<i64> {
        self.inner.lock().current_time
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    fn run_locked(&self, inner: &mut Inner) -> RunOutcome {
        if inner.buffer.is_empty() {
            let direction = Direction::from_speed(inner.speed);
            let origin = inner.fetch_origin(direction);
            let skip = if inner.inclusive { 0 } else { inner.seen_at_last };
            match self.store.get_events(origin, direction, self.buffer_size + skip) {
                Ok(mut events) => {
                    let repeated = events
                        .iter()
                        .take(skip)
                        .take_while(|m| m.timestamp == inner.last_fetched)
                        .count();
                    events.drain(..repeated);
                    inner.advance_cursor(&events);
                    trace!("Fetched {} events {:?} of {}", events.len(), direction, origin);
                    inner.buffer.extend(events);
                }
                Err(e) => warn!("Replay fetch failed, pausing: {}", e),
            }
        }

        let next_ts = match inner.buffer.front() {
            Some(next) => next.timestamp,
            None => {
                inner.run_state = RunState::Paused;
                inner.cancel_timer();
                debug!("Replay reached end of history");
                return RunOutcome::Exhausted;
            }
        };

        let current = *inner.current_time.get_or_insert(next_ts);
        let delay_ms = ((next_ts - current) as f64 / inner.speed as f64).max(0.0);
        inner.current_time = Some(next_ts);
        inner.run_state = RunState::Running;
        self.schedule(inner, Duration::from_micros((delay_ms * 1000.0).round() as u64));
        RunOutcome::Scheduled
    }

    fn schedule(&self, inner: &mut Inner, delay: Duration) {
        inner.epoch += 1;
        inner.cancel_timer();
        let epoch = inner.epoch;
        let replay = self.self_ref.clone();
        inner.timer = Some(self.runtime.spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            if let Some(replay) = replay.upgrade() {
                replay.on_timer(epoch);
            }
        }));
    }

    fn on_timer(&self, epoch: u64) {
        let due = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.timer = None;

            let mut due = Vec::new();
            if let Some(current) = inner.current_time {
                while let Some(front) = inner.buffer.front() {
                    if front.timestamp.abs_diff(current) >= self.time_step_ms {
                        break;
                    }
                    if let Some(msg) = inner.buffer.pop_front() {
                        due.push(msg);
                    }
                }
            }
            due
        };

        let Some(sink) = self.sink.upgrade() else {
            self.pause();
            return;
        };
        if !due.is_empty() {
            sink.deliver(due);
        }

        let outcome = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch || inner.run_state != RunState::Running {
                return;
            }
            self.run_locked(&mut inner)
        };
        if outcome == RunOutcome::Exhausted {
            sink.replay_exhausted(epoch);
        }
    }
}

impl Drop for ReplayState {
    fn drop(&mut self) {
        self.inner.get_mut().cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use watcher::{Payload, TestMessage};
    use watcher_store::MemoryStore;

    /// Records `(ts, elapsed ms)` for each delivered event.
    struct Recorder {
        tx: mpsc::UnboundedSender<Delivery>,
        start: Instant,
    }

    #[derive(Debug, PartialEq)]
    enum Delivery {
        Event { ts: i64, at_ms: u128 },
        Exhausted,
    }

    impl ReplaySink for Recorder {
        fn deliver(&self, events: Vec<Message>) {
            let at_ms = self.start.elapsed().as_millis();
            for e in events {
                let _ = self.tx.send(Delivery::Event {
                    ts: e.timestamp,
                    at_ms,
                });
            }
        }

        fn replay_exhausted(&self, _epoch: u64) {
            let _ = self.tx.send(Delivery::Exhausted);
        }
    }

    fn store_with(timestamps: &[i64]) -> Arc<dyn EventStore> {
        let store = MemoryStore::new();
        for ts in timestamps {
            store
                .append(&Message::at(
                    *ts,
                    Payload::Test(TestMessage {
                        text: String::new(),
                        ints: vec![],
                    }),
                ))
                .unwrap();
        }
        Arc::new(store)
    }

    fn fine_grained() -> ReplayConfig {
        ReplayConfig {
            buffer_size: 10,
            time_step_ms: 1,
        }
    }

    fn setup(
        store: Arc<dyn EventStore>,
        config: ReplayConfig,
    ) -> (
        Arc<ReplayState>,
        Arc<Recorder>,
        mpsc::UnboundedReceiver<Delivery>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            tx,
            start: Instant::now(),
        });
        let sink: Arc<dyn ReplaySink> = recorder.clone();
        let replay = ReplayState::new(store, Arc::downgrade(&sink), &config, Handle::current());
        (replay, recorder, rx)
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<Delivery>, n: usize) -> Vec<(i64, u128)> {
        let mut out = Vec::new();
        while out.len() < n {
            match rx.recv().await {
                Some(Delivery::Event { ts, at_ms }) => out.push((ts, at_ms)),
                Some(Delivery::Exhausted) => break,
                None => break,
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_offsets_follow_timestamps() {
        let (replay, _rec, mut rx) = setup(store_with(&[100, 200, 350]), fine_grained());
        replay.seek(SeekPosition::Time(100));
        replay.set_speed(1.0).unwrap();
        assert_eq!(replay.run(), RunOutcome::Scheduled);

        let got = collect(&mut rx, 3).await;
        assert_eq!(got, vec![(100, 0), (200, 100), (350, 250)]);
        assert_eq!(rx.recv().await, Some(Delivery::Exhausted));
        assert!(!replay.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_from_eof() {
        let (replay, _rec, mut rx) = setup(store_with(&[100, 200, 350]), fine_grained());
        replay.seek(SeekPosition::Eof);
        replay.set_speed(-1.0).unwrap();
        replay.run();

        let got = collect(&mut rx, 3).await;
        assert_eq!(got, vec![(350, 0), (200, 150), (100, 250)]);
        assert_eq!(rx.recv().await, Some(Delivery::Exhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_speed_halves_gaps() {
        let (replay, _rec, mut rx) = setup(store_with(&[100, 200, 350]), fine_grained());
        replay.seek(SeekPosition::Time(100));
        replay.set_speed(2.0).unwrap();
        replay.run();

        let got = collect(&mut rx, 3).await;
        assert_eq!(got, vec![(100, 0), (200, 50), (350, 125)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_between_events_waits_for_first() {
        let (replay, _rec, mut rx) = setup(store_with(&[100, 200]), fine_grained());
        replay.seek(SeekPosition::Time(60));
        replay.run();

        let got = collect(&mut rx, 2).await;
        assert_eq!(got, vec![(100, 40), (200, 140)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_step_groups_close_events() {
        let config = ReplayConfig {
            buffer_size: 10,
            time_step_ms: 250,
        };
        let (replay, _rec, mut rx) = setup(store_with(&[100, 200, 350, 1000]), config);
        replay.seek(SeekPosition::Time(0));
        replay.run();

        // 200 is within one step of the clock at 100, 350 is not.
        let got = collect(&mut rx, 4).await;
        assert_eq!(got, vec![(100, 0), (200, 0), (350, 250), (1000, 900)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_refills_across_batches() {
        let timestamps: Vec<i64> = (1..=25).map(|i| i * 10).collect();
        let config = ReplayConfig {
            buffer_size: 4,
            time_step_ms: 1,
        };
        let (replay, _rec, mut rx) = setup(store_with(&timestamps), config);
        replay.seek(SeekPosition::Time(0));
        replay.run();

        let got = collect(&mut rx, 25).await;
        let seen: Vec<i64> = got.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(seen, timestamps);
        assert_eq!(got.last().unwrap().1, 240);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_timestamps_split_across_batches() {
        let mut timestamps: Vec<i64> = (1..=9).map(|i| i * 100).collect();
        timestamps.extend([1000, 1000, 1000]);
        let (replay, _rec, mut rx) = setup(store_with(&timestamps), fine_grained());
        replay.seek(SeekPosition::Time(100));
        replay.run();

        let got = collect(&mut rx, 12).await;
        let seen: Vec<i64> = got.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(seen, timestamps);
        assert_eq!(rx.recv().await, Some(Delivery::Exhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_larger_than_buffer() {
        let timestamps = [10, 20, 20, 20, 20, 20, 20, 20, 30, 30, 40];
        let config = ReplayConfig {
            buffer_size: 3,
            time_step_ms: 1,
        };

        let (replay, _rec, mut rx) = setup(store_with(&timestamps), config.clone());
        replay.seek(SeekPosition::Time(0));
        replay.run();
        let forward: Vec<i64> = collect(&mut rx, 11).await.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(forward, timestamps);

        let (replay, _rec, mut rx) = setup(store_with(&timestamps), config);
        replay.seek(SeekPosition::Eof);
        replay.set_speed(-1.0).unwrap();
        replay.run();
        let reverse: Vec<i64> = collect(&mut rx, 11).await.iter().map(|(ts, _)| *ts).collect();
        let mut expected = timestamps.to_vec();
        expected.reverse();
        assert_eq!(reverse, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_change_fetches_behind_clock() {
        let (replay, _rec, mut rx) = setup(store_with(&[100, 200, 300, 400, 500]), fine_grained());
        replay.seek(SeekPosition::Time(100));
        replay.run();

        let got = collect(&mut rx, 3).await;
        assert_eq!(got.last().unwrap().0, 300);
        let clock = replay.current_time().unwrap();

        replay.set_speed(-1.0).unwrap();
        let after = collect(&mut rx, 1).await;
        assert!(after[0].0 <= clock, "{} > {}", after[0].0, clock);
        assert!(replay.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_is_idempotent() {
        let (replay, _rec, mut rx) = setup(store_with(&[100, 5000]), fine_grained());
        replay.seek(SeekPosition::Time(100));
        replay.run();
        let first = collect(&mut rx, 1).await;
        assert_eq!(first[0].0, 100);

        replay.pause();
        let epoch = replay.epoch();
        replay.pause();
        assert_eq!(replay.epoch(), epoch);
        assert_eq!(replay.run_state(), RunState::Paused);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_pause() {
        let (replay, _rec, mut rx) = setup(store_with(&[100, 200, 300]), fine_grained());
        replay.seek(SeekPosition::Time(100));
        replay.run();
        collect(&mut rx, 1).await;
        replay.pause();

        replay.run();
        let rest = collect(&mut rx, 2).await;
        let seen: Vec<i64> = rest.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(seen, vec![200, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_speed_rejected() {
        let (replay, _rec, _rx) = setup(store_with(&[]), fine_grained());
        assert!(replay.set_speed(0.0).is_err());
        assert!(replay.set_speed(f32::NAN).is_err());
        assert_eq!(replay.speed(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_store_is_exhausted() {
        let (replay, _rec, _rx) = setup(store_with(&[]), fine_grained());
        assert_eq!(replay.run(), RunOutcome::Exhausted);
        assert!(!replay.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sink_stops_replay() {
        let (replay, rec, rx) = setup(store_with(&[100, 200, 300]), fine_grained());
        drop(rx);
        drop(rec);
        replay.seek(SeekPosition::Time(100));
        replay.run();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!replay.is_running());
    }
}
