// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory event store

use crate::store::{ensure_data, Direction, EventStore, StoreError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use watcher::Message;

/// Events keyed by `(timestamp, insertion sequence)`.
#[derive(Default)]
struct Inner {
    events: BTreeMap<(i64, u64), Message>,
    next_seq: u64,
}

/// Volatile store, mostly for tests and read-only demos.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryStore {
    fn get_events(
        &self,
        ts: i64,
        direction: Direction,
        max: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read();
        let events = match direction {
            Direction::Forward => {
                if ts == i64::MAX {
                    return Ok(Vec::new());
                }
                inner
                    .events
                    .range((Bound::Included((ts + 1, 0)), Bound::Unbounded))
                    .take(max)
                    .map(|(_, m)| m.clone())
                    .collect()
            }
            Direction::Reverse => inner
                .events
                .range((Bound::Unbounded, Bound::Excluded((ts, 0))))
                .rev()
                .take(max)
                .map(|(_, m)| m.clone())
                .collect(),
        };
        Ok(events)
    }

    fn event_range(&self) -> Result<Option<(i64, i64)>, StoreError> {
        let inner = self.inner.read();
        let first = inner.events.keys().next();
        let last = inner.events.keys().next_back();
        Ok(first.zip(last).map(|((min, _), (max, _))| (*min, *max)))
    }

    fn append(&self, msg: &Message) -> Result<(), StoreError> {
        ensure_data(msg)?;
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.events.insert((msg.timestamp, seq), msg.clone());
        Ok(())
    }

    fn count(&self) -> Result<u64, StoreError> {
        Ok(self.inner.read().events.len() as u64)
    }
}
