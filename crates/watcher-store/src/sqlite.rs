// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite event store
//!
//! Each event is stored as its encoded wire frame next to the indexed
//! timestamp.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE events (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     timestamp INTEGER NOT NULL,
//!     message_type INTEGER NOT NULL,
//!     record BLOB NOT NULL
//! );
//! CREATE INDEX idx_events_timestamp ON events(timestamp, id);
//! ```

use crate::store::{ensure_data, Direction, EventStore, StoreError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use watcher::{DataMarshaller, Message};

/// SQLite-backed history. The connection is guarded by a mutex since
/// `rusqlite::Connection` is not `Sync`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    marshaller: DataMarshaller,
}

impl SqliteStore {
    /// Open (or create) a database file. `:memory:` opens a private
    /// in-memory database.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_string(),
            source,
        })?;
        debug!("Opened event database at {}", path);
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
            marshaller: DataMarshaller::default(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                message_type INTEGER NOT NULL,
                record BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp, id);",
        )?;
        Ok(())
    }

    fn decode_rows(&self, records: Vec<Vec<u8>>) -> Result<Vec<Message>, StoreError> {
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.extend(self.marshaller.decode(&record)?);
        }
        Ok(out)
    }
}

impl EventStore for SqliteStore {
    fn get_events(
        &self,
        ts: i64,
        direction: Direction,
        max: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let sql = match direction {
            Direction::Forward => {
                "SELECT record FROM events WHERE timestamp > ?1
                 ORDER BY timestamp ASC, id ASC LIMIT ?2"
            }
            Direction::Reverse => {
                "SELECT record FROM events WHERE timestamp < ?1
                 ORDER BY timestamp DESC, id DESC LIMIT ?2"
            }
        };
        let limit = i64::try_from(max).unwrap_or(i64::MAX);

        let records = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params![ts, limit], |row| row.get::<_, Vec<u8>>(0))?;
            let records = rows.collect::<Result<Vec<_>, _>>()?;
            records
        };
        self.decode_rows(records)
    }

    fn event_range(&self) -> Result<Option<(i64, i64)>, StoreError> {
        let conn = self.conn.lock();
        let range = conn
            .query_row(
                "SELECT MIN(timestamp), MAX(timestamp) FROM events",
                [],
                |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;
        Ok(match range {
            Some((Some(min), Some(max))) => Some((min, max)),
            _ => None,
        })
    }

    fn append(&self, msg: &Message) -> Result<(), StoreError> {
        self.append_batch(std::slice::from_ref(msg))
    }

    fn append_batch(&self, messages: &[Message]) -> Result<(), StoreError> {
        let mut rows = Vec::with_capacity(messages.len());
        for msg in messages {
            ensure_data(msg)?;
            let record = self.marshaller.encode(std::slice::from_ref(msg))?;
            rows.push((msg.timestamp, msg.message_type().tag(), record));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO events (timestamp, message_type, record) VALUES (?1, ?2, ?3)",
            )?;
            for (ts, tag, record) in &rows {
                stmt.execute(params![ts, tag, record])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use tempfile::TempDir;

    #[test]
    fn test_fetch_is_strict_and_ordered() {
        conformance::fetch_is_strict_and_ordered(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_fetch_respects_max() {
        conformance::fetch_respects_max(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_equal_timestamps() {
        conformance::equal_timestamps_keep_insertion_order(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_range_and_payloads() {
        conformance::range_and_payloads(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_rejects_control_messages() {
        conformance::rejects_control_messages(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStore::open(path).unwrap();
            store.append(&conformance::event(10, 1)).unwrap();
            store.append(&conformance::event(20, 2)).unwrap();
        }

        let store = SqliteStore::open(path).unwrap();
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.event_range().unwrap(), Some((10, 20)));
    }

    #[test]
    fn test_open_helper_selects_backend() {
        let store = crate::open("memory").unwrap();
        store.append(&conformance::event(1, 0)).unwrap();
        assert_eq!(store.count().unwrap(), 1);

        let store = crate::open(":memory:").unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }
}
