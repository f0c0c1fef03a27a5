//! photomirror: incremental, deletion-respecting photo catalog mirror.
//!
//! Mirrors a remote photo catalog into a local directory tree. A SQLite state
//! store remembers what was downloaded and what the user deliberately removed,
//! so deleted items are never fetched again. A scheduler runs sync and store
//! maintenance on separate timers behind a single gate, and an instance lock
//! keeps two processes from mutating the same state.

#![warn(clippy::all)]

pub mod catalog;
pub mod cli;
pub mod config;
pub mod lock;
pub mod notify;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod state;
pub mod sync;
pub mod systemd;
pub mod types;
