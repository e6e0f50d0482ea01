// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event store abstraction

use thiserror::Error;
use watcher::{CodecError, Message};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("stored record is corrupt: {0}")]
    Codec(#[from] CodecError),

    #[error("only data events are stored, got {0}")]
    NotData(watcher::MessageType),
}

/// Fetch direction relative to the requested timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    /// Direction of travel for a playback speed.
    pub fn from_speed(speed: f32) -> Self {
        if speed < 0.0 {
            Self::Reverse
        } else {
            Self::Forward
        }
    }
}

/// Persisted event history.
///
/// Implementations must be safe to call from several tasks at once.
pub trait EventStore: Send + Sync {
    /// Up to `max` events strictly after (`Forward`) or strictly before
    /// (`Reverse`) `ts`, nearest first. Events sharing a timestamp come
    /// back in insertion order for `Forward` and reversed for `Reverse`.
    fn get_events(&self, ts: i64, direction: Direction, max: usize)
        -> Result<Vec<Message>, StoreError>;

    /// Earliest and latest stored timestamps, `None` when empty.
    fn event_range(&self) -> Result<Option<(i64, i64)>, StoreError>;

    /// Persist one data event.
    fn append(&self, msg: &Message) -> Result<(), StoreError>;

    /// Persist several events.
    fn append_batch(&self, messages: &[Message]) -> Result<(), StoreError> {
        for msg in messages {
            self.append(msg)?;
        }
        Ok(())
    }

    /// Number of stored events.
    fn count(&self) -> Result<u64, StoreError>;
}

pub(crate) fn ensure_data(msg: &Message) -> Result<(), StoreError> {
    if msg.is_data() {
        Ok(())
    } else {
        Err(StoreError::NotData(msg.message_type()))
    }
}

/// Behavior every backend must share.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use watcher::{GpsMessage, Payload, TestMessage};

    pub fn event(ts: i64, tag: i32) -> Message {
        Message::at(
            ts,
            Payload::Test(TestMessage {
                text: format!("event-{}", ts),
                ints: vec![tag],
            }),
        )
    }

    fn tag_of(msg: &Message) -> i32 {
        match &msg.payload {
            Payload::Test(t) => t.ints[0],
            other => panic!("unexpected payload {:?}", other),
        }
    }

    fn timestamps(events: &[Message]) -> Vec<i64> {
        events.iter().map(|m| m.timestamp).collect()
    }

    pub fn fetch_is_strict_and_ordered(store: &dyn EventStore) {
        for ts in [350, 100, 200] {
            store.append(&event(ts, 0)).unwrap();
        }

        assert_eq!(
            timestamps(&store.get_events(99, Direction::Forward, 10).unwrap()),
            vec![100, 200, 350]
        );
        assert_eq!(
            timestamps(&store.get_events(100, Direction::Forward, 10).unwrap()),
            vec![200, 350]
        );
        assert_eq!(
            timestamps(&store.get_events(350, Direction::Reverse, 10).unwrap()),
            vec![200, 100]
        );
        assert_eq!(
            timestamps(&store.get_events(i64::MAX, Direction::Reverse, 10).unwrap()),
            vec![350, 200, 100]
        );
        assert!(store
            .get_events(350, Direction::Forward, 10)
            .unwrap()
            .is_empty());
        assert!(store
            .get_events(i64::MAX, Direction::Forward, 10)
            .unwrap()
            .is_empty());
    }

    pub fn fetch_respects_max(store: &dyn EventStore) {
        for ts in 1..=25 {
            store.append(&event(ts * 10, 0)).unwrap();
        }
        let first = store.get_events(0, Direction::Forward, 10).unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first[9].timestamp, 100);

        let last = store.get_events(i64::MAX, Direction::Reverse, 4).unwrap();
        assert_eq!(timestamps(&last), vec![250, 240, 230, 220]);
        assert_eq!(store.count().unwrap(), 25);
    }

    pub fn equal_timestamps_keep_insertion_order(store: &dyn EventStore) {
        for tag in 0..3 {
            store.append(&event(500, tag)).unwrap();
        }
        let fwd: Vec<i32> = store
            .get_events(0, Direction::Forward, 10)
            .unwrap()
            .iter()
            .map(tag_of)
            .collect();
        assert_eq!(fwd, vec![0, 1, 2]);

        let rev: Vec<i32> = store
            .get_events(501, Direction::Reverse, 10)
            .unwrap()
            .iter()
            .map(tag_of)
            .collect();
        assert_eq!(rev, vec![2, 1, 0]);
    }

    pub fn range_and_payloads(store: &dyn EventStore) {
        assert_eq!(store.event_range().unwrap(), None);

        let gps = Message::at(
            42,
            Payload::Gps(GpsMessage {
                node: IpAddr::V4(Ipv4Addr::new(10, 1, 1, 7)),
                lat: 1.5,
                lng: 2.5,
                alt: 3.5,
            }),
        );
        store
            .append_batch(&[event(7, 0), gps.clone(), event(90, 0)])
            .unwrap();
        assert_eq!(store.event_range().unwrap(), Some((7, 90)));

        let back = store.get_events(41, Direction::Forward, 1).unwrap();
        assert_eq!(back, vec![gps]);
    }

    pub fn rejects_control_messages(store: &dyn EventStore) {
        let err = store.append(&Message::at(1, Payload::Start)).unwrap_err();
        assert!(matches!(err, StoreError::NotData(_)));
        assert_eq!(store.count().unwrap(), 0);
    }
}
