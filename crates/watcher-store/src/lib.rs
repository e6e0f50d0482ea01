// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Watcher event history
//!
//! Backends that persist data events and serve them back in time order for
//! replay.
//!
//! # Backends
//!
//! - [`MemoryStore`] -- ordered map, lost on restart
//! - [`SqliteStore`] -- SQLite file (or `:memory:`), survives restarts
//!
//! # Example
//!
//! ```
//! use watcher::{Message, Payload, TestMessage};
//! use watcher_store::{Direction, EventStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! for ts in [100, 200, 350] {
//!     let msg = Message::at(ts, Payload::Test(TestMessage { text: "x".into(), ints: vec![] }));
//!     store.append(&msg).unwrap();
//! }
//!
//! let next = store.get_events(100, Direction::Forward, 10).unwrap();
//! assert_eq!(next.len(), 2);
//! assert_eq!(store.event_range().unwrap(), Some((100, 350)));
//! ```

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{Direction, EventStore, StoreError};

use std::sync::Arc;

/// Open a backend from a location string.
///
/// `memory` selects [`MemoryStore`], anything else is handed to SQLite
/// (including `:memory:`).
pub fn open(location: &str) -> Result<Arc<dyn EventStore>, StoreError> {
    if location == "memory" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(SqliteStore::open(location)?))
}
