//! Streamlog Storage Layer
//!
//! This crate implements the append-only log storage engine at the heart
//! of a replicated stream-storage cluster: durable segmented persistence
//! of ordered record streams, indexed chunk-granularity lookup, leader and
//! follower write paths, consumer and replication read paths, and
//! retention.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────┐ write / write_tracking      ┌────────────────┐
//! │ writer process │ ───────────────────────────▶│ Log (writer)   │
//! └────────────────┘                             │ - chunk encode │
//!                                                │ - segment roll │
//!                                                │ - dedup state  │
//!                                                └───────┬────────┘
//!                                 .segment / .index      │
//!                                                        ▼
//! ┌────────────────┐   sendfile   ┌───────────┐   ┌─────────────┐
//! │ ReplicaReader  │ ◀────────────│ LogReader │◀──│  log dir    │
//! └──────┬─────────┘              │ data mode │   └─────────────┘
//!        │ socket                 └───────────┘          ▲
//!        ▼                                               │
//! ┌────────────────┐ accept_chunk ┌────────────────┐     │
//! │ replica process│ ────────────▶│ Log (acceptor) │─────┘
//! └────────────────┘              └────────────────┘
//!
//! consumers ──▶ LogReader (offset mode, gated by the committed offset)
//! retention ──▶ evaluate() deletes whole segments from the oldest end
//! ```
//!
//! ## Main Components
//!
//! - [`Log`]: the single-owner write path, in writer or acceptor mode
//! - [`LogReader`]: data and offset readers, with zero-copy socket send
//! - [`ReplicaReader`]: the replica follower pumping chunks to a socket
//! - [`retention::evaluate`]: `max_bytes` / `max_age` whole-segment deletion
//! - [`LogOverview`]: directory scan and offset/timestamp lookup
//!
//! ## Concurrency Model
//!
//! Every log instance is owned by a single task; segment file handles and
//! in-memory maps are never shared. The only cross-task state is a pair of
//! atomic cells per log ([`SharedOffsets`]): the committed offset (written
//! by the writer, read by offset readers) and the first offset (written by
//! retention, read by the writer at rollover). Retention deletes whole
//! files only; readers tolerate a vanished segment by rebuilding their
//! overview or surfacing a clean end of stream.

pub mod config;
pub mod counters;
pub mod error;
pub mod log;
pub mod overview;
pub mod reader;
pub mod replica;
pub mod retention;
pub mod segment;

pub use config::{LogConfig, SyncPolicy};
pub use counters::{LogCounters, ReplicaCounters, REGISTRY};
pub use error::{Error, Result};
pub use log::{
    delete_directory, overview, EpochOffset, Log, SharedOffsets, TailInfo, TrackingKind,
    TrackingMap, WriterState,
};
pub use overview::{ChunkInfo, LogOverview, SegmentInfo, SegmentSearch};
pub use reader::{LogReader, OffsetSpec, ReaderMode};
pub use replica::{ReplicaReader, ReplicaReaderConfig};
pub use retention::RetentionSpec;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
