//! Error Types for the Chunk Codec
//!
//! This module defines all error types that can occur while encoding or
//! decoding chunks.
//!
//! ## Error Categories
//!
//! ### Data Integrity Errors
//! - `InvalidChunkHeader`: First header byte does not carry the expected magic nibble
//! - `CrcMismatch`: Chunk entry bytes do not match the CRC recorded in the header
//! - `TruncatedChunk`: Fewer bytes available than the header claims
//!
//! ### Version/Compatibility Errors
//! - `UnsupportedVersion`: Chunk was written by a newer format version
//! - `InvalidChunkType`: Unknown chunk type tag
//! - `InvalidCompression`: Unknown sub-batch compression tag
//!
//! ### Encoding Errors
//! - `EntryTooLarge`: A single entry exceeds the 31-bit size field
//! - `IdTooLong`: A tracking or writer id exceeds the 1-byte length prefix
//!
//! ## Usage
//! All codec functions return `Result<T>` which is aliased to
//! `Result<T, Error>`, allowing `?` propagation.
//!
//! Integrity errors (`InvalidChunkHeader`, `CrcMismatch`) indicate on-disk
//! corruption. Callers must treat them as unrecoverable: the owning task is
//! expected to crash and leave remediation to its supervisor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid chunk header: unexpected leading byte {0:#04x}")]
    InvalidChunkHeader(u8),

    #[error("Unsupported chunk format version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid chunk type: {0}")]
    InvalidChunkType(u8),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(u8),

    #[error("CRC validation failure for chunk {chunk_id}")]
    CrcMismatch { chunk_id: u64 },

    #[error("Truncated chunk: expected {expected} bytes, got {got}")]
    TruncatedChunk { expected: usize, got: usize },

    #[error("Entry too large: {0} bytes exceeds the 31-bit size field")]
    EntryTooLarge(usize),

    #[error("Too many entries for one chunk: {0}")]
    TooManyEntries(usize),

    #[error("Id too long: {0} bytes exceeds the 1-byte length prefix")]
    IdTooLong(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
