//! Persistent storage layer for room broadcasts.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐   write(bytes)   ┌───────────────────────────┐
//! │ BroadcastRadio│ ───────────────► │ PersistentLog             │
//! │ (one per room)│ ◄─────────────── │  buffer ──flush──► file   │
//! └───────────────┘  read_at(range)  └─────────────┬─────────────┘
//!                                                  │
//!                                    <data_dir>/<signature>.data
//! ```
//!
//! The file is the raw concatenation of every framed packet written to the
//! room, in write order, so replay is a verbatim byte-range copy.

pub mod log_file;

pub use log_file::{LogConfig, LogError, PersistentLog};
