// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Watcher daemon
//!
//! Accepts topology events from feeders, stores them, and serves them to
//! watchers either live or as a time-scaled replay of the stored history.
//!
//! # Architecture
//!
//! ```text
//! feeder --> [connection] --> MessageHandler --> EventStore
//!                                   |
//!                                   v
//!                              Registry (live fan-out)
//!                                   |
//!                     +-------------+-------------+
//!                     v                           v
//!               SharedStream (live)      SharedStream (replay)
//!                     |                           |
//!                 watchers                ReplayState <-- EventStore
//! ```

pub mod config;
pub mod handler;
pub mod registry;
pub mod replay;
pub mod server;
pub mod stream;

pub use config::{ConfigError, DaemonConfig, ReplayConfig};
pub use handler::{MessageHandler, Session};
pub use registry::Registry;
pub use replay::{ReplayError, ReplaySink, ReplayState, RunOutcome, RunState};
pub use server::{ConnectionHandle, ServerError, WatcherServer};
pub use stream::{SharedStream, StreamError};
