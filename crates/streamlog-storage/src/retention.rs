//! Retention
//!
//! Retention deletes whole segments from the oldest end of a log. It never
//! rewrites a file and never touches the newest segment, so an active
//! writer and in-flight readers are undisturbed: a reader holding an open
//! handle to a deleted segment keeps reading it until it crosses to the
//! next segment.
//!
//! Two policies exist and are evaluated in the order configured:
//!
//! - `max_bytes`: delete the oldest segment while the total size of all
//!   segments exceeds the limit and more than one segment remains.
//! - `max_age`: delete the oldest segment while its first chunk is older
//!   than the age limit and it is not the sole segment.
//!
//! The surviving range is returned so the caller can bump its first-offset
//! counter; the counter never decreases.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::now_ms;
use crate::overview::LogOverview;
use crate::segment::delete_segment_files;

/// A single retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetentionSpec {
    /// Keep total log size at or below `bytes`.
    MaxBytes { bytes: u64 },
    /// Keep no segment whose first chunk is older than `ms` milliseconds.
    MaxAge { ms: u64 },
}

/// Evaluate `specs` in order against the segments in `dir`, deleting the
/// oldest segments that violate a policy.
///
/// Returns the offset range of the surviving log, `None` when it is empty.
pub async fn evaluate(dir: &Path, specs: &[RetentionSpec]) -> Result<Option<(u64, u64)>> {
    let mut overview = LogOverview::build(dir).await?;

    for spec in specs {
        match spec {
            RetentionSpec::MaxBytes { bytes } => {
                while overview.segments.len() > 1 && overview.total_size() > *bytes {
                    let oldest = overview.segments.remove(0);
                    info!(
                        first_offset = oldest.first_offset,
                        size = oldest.size,
                        "max_bytes retention deleting oldest segment"
                    );
                    delete_segment_files(dir, oldest.first_offset).await?;
                }
            }
            RetentionSpec::MaxAge { ms } => {
                let cutoff = now_ms() - *ms as i64;
                while overview.segments.len() > 1 {
                    let expired = match &overview.segments[0].first {
                        Some(first) => first.timestamp < cutoff,
                        None => false,
                    };
                    if !expired {
                        break;
                    }
                    let oldest = overview.segments.remove(0);
                    info!(
                        first_offset = oldest.first_offset,
                        "max_age retention deleting oldest segment"
                    );
                    delete_segment_files(dir, oldest.first_offset).await?;
                }
            }
        }
    }

    Ok(overview.range())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentAppender;
    use bytes::Bytes;
    use std::collections::HashMap;
    use streamlog_core::{encode_chunk, ChunkType, Entry};
    use tempfile::TempDir;

    async fn write_segment(dir: &Path, first_offset: u64, timestamp: i64, payload: &[u8]) {
        let mut appender = SegmentAppender::open(dir, first_offset).await.unwrap();
        let (bytes, header) = encode_chunk(
            ChunkType::User,
            timestamp,
            1,
            first_offset,
            &[Entry::Simple(Bytes::copy_from_slice(payload))],
            &HashMap::new(),
        )
        .unwrap();
        appender.append_chunk(&header, &bytes).await.unwrap();
    }

    // ---------------------------------------------------------------
    // max_bytes
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_max_bytes_deletes_oldest() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 0, 100, &[0u8; 512]).await;
        write_segment(dir.path(), 1, 200, &[0u8; 512]).await;
        write_segment(dir.path(), 2, 300, &[0u8; 512]).await;

        let range = evaluate(dir.path(), &[RetentionSpec::MaxBytes { bytes: 1400 }])
            .await
            .unwrap();

        let overview = LogOverview::build(dir.path()).await.unwrap();
        assert_eq!(overview.segments.len(), 2);
        assert_eq!(overview.segments[0].first_offset, 1);
        assert_eq!(range, Some((1, 2)));
    }

    #[tokio::test]
    async fn test_max_bytes_never_deletes_sole_segment() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 0, 100, &[0u8; 4096]).await;

        let range = evaluate(dir.path(), &[RetentionSpec::MaxBytes { bytes: 10 }])
            .await
            .unwrap();

        let overview = LogOverview::build(dir.path()).await.unwrap();
        assert_eq!(overview.segments.len(), 1);
        assert_eq!(range, Some((0, 0)));
    }

    #[tokio::test]
    async fn test_max_bytes_under_limit_is_noop() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 0, 100, b"small").await;
        write_segment(dir.path(), 1, 200, b"small").await;

        evaluate(dir.path(), &[RetentionSpec::MaxBytes { bytes: 1 << 20 }])
            .await
            .unwrap();

        let overview = LogOverview::build(dir.path()).await.unwrap();
        assert_eq!(overview.segments.len(), 2);
    }

    // ---------------------------------------------------------------
    // max_age
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_max_age_deletes_expired() {
        let dir = TempDir::new().unwrap();
        // Two ancient segments, one current.
        write_segment(dir.path(), 0, 1_000, b"old").await;
        write_segment(dir.path(), 1, 2_000, b"old").await;
        write_segment(dir.path(), 2, now_ms(), b"new").await;

        let range = evaluate(dir.path(), &[RetentionSpec::MaxAge { ms: 60_000 }])
            .await
            .unwrap();

        let overview = LogOverview::build(dir.path()).await.unwrap();
        assert_eq!(overview.segments.len(), 1);
        assert_eq!(overview.segments[0].first_offset, 2);
        assert_eq!(range, Some((2, 2)));
    }

    #[tokio::test]
    async fn test_max_age_keeps_sole_segment() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 0, 1_000, b"ancient").await;

        evaluate(dir.path(), &[RetentionSpec::MaxAge { ms: 1 }])
            .await
            .unwrap();

        let overview = LogOverview::build(dir.path()).await.unwrap();
        assert_eq!(overview.segments.len(), 1);
    }

    // ---------------------------------------------------------------
    // combined specs
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_specs_evaluated_in_order() {
        let dir = TempDir::new().unwrap();
        write_segment(dir.path(), 0, 1_000, &[0u8; 256]).await;
        write_segment(dir.path(), 1, now_ms(), &[0u8; 256]).await;
        write_segment(dir.path(), 2, now_ms(), &[0u8; 256]).await;

        // max_age removes segment 0, max_bytes then trims to one survivor.
        let range = evaluate(
            dir.path(),
            &[
                RetentionSpec::MaxAge { ms: 60_000 },
                RetentionSpec::MaxBytes { bytes: 400 },
            ],
        )
        .await
        .unwrap();

        let overview = LogOverview::build(dir.path()).await.unwrap();
        assert_eq!(overview.segments.len(), 1);
        assert_eq!(overview.segments[0].first_offset, 2);
        assert_eq!(range, Some((2, 2)));
    }

    #[tokio::test]
    async fn test_empty_dir() {
        let dir = TempDir::new().unwrap();
        let range = evaluate(dir.path(), &[RetentionSpec::MaxBytes { bytes: 1 }])
            .await
            .unwrap();
        assert_eq!(range, None);
    }
}
