//! Storage Error Types
//!
//! This module defines all error types that can occur during log storage
//! operations.
//!
//! ## Recoverable vs Fatal
//!
//! Two kinds are recoverable by the caller and are part of normal operation:
//! - `OffsetOutOfRange`: a reader asked for data that does not exist
//! - `MissingFile`: a segment or index vanished mid-read (retention runs
//!   concurrently); the caller rebuilds its overview and retries
//!
//! Everything else signals either corruption (`Core` integrity errors),
//! replication protocol violations (`AcceptChunkOutOfOrder`,
//! `InvalidLastOffsetEpoch`), or invariant violations (`SegmentNotFound`,
//! `InvalidEpoch`). Those crash the owning task; the supervisor is
//! responsible for restart or cluster-level remediation. Corruption is
//! never silently swallowed.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Offset {offset} out of range {range:?}")]
    OffsetOutOfRange {
        offset: u64,
        range: Option<(u64, u64)>,
    },

    #[error("Last offset epoch mismatch: expected {expected}, found {found}")]
    InvalidLastOffsetEpoch { expected: u64, found: u64 },

    #[error("Log epoch {found} on disk is ahead of configured epoch {configured}")]
    InvalidEpoch { found: u64, configured: u64 },

    #[error("Accepted chunk out of order: got {got}, expected {expected}")]
    AcceptChunkOutOfOrder { got: u64, expected: u64 },

    #[error("No segment found for offset {0}")]
    SegmentNotFound(u64),

    #[error("Segment or index file missing: {0}")]
    MissingFile(String),

    #[error("Chunk codec error: {0}")]
    Core(#[from] streamlog_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for kinds a reader recovers from by rebuilding its overview and
    /// retrying the whole operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::MissingFile(_))
            || matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
