//! # logos-radio — Persistent broadcast-and-replay for collaborative rooms
//!
//! Every room records its event stream in one append-only log and fans it
//! out live to every connected subscriber. A subscriber joining late first
//! replays history from any byte offset, then follows live traffic, each at
//! its own pace and without ever blocking the writer.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────┐   write / send    ┌──────────────────┐
//!  │ RadioSender │ ─────────────────► │ BroadcastRadio   │
//!  │ (per room)  │   RadioCommand     │ (one per room)   │
//!  └─────────────┘                    └────────┬─────────┘
//!                                              │
//!                        ┌─────────────────────┼─────────────────────┐
//!                        ▼                     ▼                     ▼
//!                 ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!                 │PendingQueue │       │PendingQueue │       │PendingQueue │
//!                 │ + delivery  │       │ + delivery  │       │ + delivery  │
//!                 └──────┬──────┘       └──────┬──────┘       └──────┬──────┘
//!                        │    read_at          │                     │
//!                        └──────────► PersistentLog ◄────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`] — Buffered append-only log file
//! - [`queue`] — Per-subscriber pending queue with merge and split
//! - [`radio`] — Broadcast radio, subscriptions and delivery loops
//! - [`rooms`] — Registry of named rooms
//! - [`signature`] — Content-generation signatures
//! - [`config`] — Radio configuration

pub mod config;
pub mod queue;
pub mod radio;
pub mod rooms;
pub mod signature;
pub mod storage;

// Re-exports for convenience
pub use config::RadioConfig;
pub use queue::{split_range, Chunk, PendingQueue, QueueLimits};
pub use radio::{
    BroadcastRadio, Packet, RadioCommand, RadioError, RadioSender, RadioStats, SubscriberId,
    Subscription,
};
pub use rooms::RoomManager;
pub use signature::derive_signature;
pub use storage::{LogConfig, LogError, PersistentLog};
