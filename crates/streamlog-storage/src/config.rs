//! Log Configuration
//!
//! This module defines configuration for a single log instance.
//!
//! ## LogConfig
//!
//! Controls where a log lives and how its writer behaves:
//!
//! - **dir**: Data directory; the log itself lives in `dir/name/`
//! - **name**: Log name, also the counter label
//! - **epoch**: The leader term this writer claims; chunks on disk must not
//!   be ahead of it
//! - **max_segment_size**: Roll the segment after the append that pushes it
//!   past this size (default: 500 MB)
//! - **retention**: Retention specs evaluated in order at segment rollover
//! - **max_writers**: Bound on the writer-deduplication map (default: 255)
//! - **sync_policy**: When to fsync segment and index files
//!
//! ## Usage
//!
//! ```ignore
//! use streamlog_storage::{LogConfig, RetentionSpec};
//!
//! let config = LogConfig {
//!     dir: "/var/lib/streamlog".into(),
//!     name: "orders".to_string(),
//!     epoch: 1,
//!     retention: vec![RetentionSpec::MaxBytes { bytes: 10 * 1024 * 1024 * 1024 }],
//!     ..Default::default()
//! };
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::retention::RetentionSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Data directory; the log directory is `dir/name/`.
    pub dir: PathBuf,

    /// Log name.
    pub name: String,

    /// The epoch this writer claims.
    #[serde(default)]
    pub epoch: u64,

    /// Maximum segment size in bytes before rolling (default: 500 MB).
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,

    /// Retention specs, evaluated in order.
    #[serde(default)]
    pub retention: Vec<RetentionSpec>,

    /// Bound on the writer-deduplication map (default: 255).
    #[serde(default = "default_max_writers")]
    pub max_writers: usize,

    /// Durability policy for segment and index appends.
    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

impl LogConfig {
    /// The directory this log's segment and index files live in.
    pub fn log_dir(&self) -> PathBuf {
        self.dir.join(&self.name)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            name: "log".to_string(),
            epoch: 0,
            max_segment_size: default_max_segment_size(),
            retention: Vec::new(),
            max_writers: default_max_writers(),
            sync_policy: SyncPolicy::default(),
        }
    }
}

/// When segment and index writes are synced to stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Sync after every chunk append (safest, slowest).
    Always,

    /// Sync the outgoing segment and index on rollover only.
    OnRoll,

    /// Never sync; rely on OS write-back (fastest, least safe).
    #[default]
    Never,
}

fn default_max_segment_size() -> u64 {
    500 * 1000 * 1000 // 500 MB
}

fn default_max_writers() -> usize {
    255
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.max_segment_size, 500 * 1000 * 1000);
        assert_eq!(config.max_writers, 255);
        assert_eq!(config.sync_policy, SyncPolicy::Never);
        assert!(config.retention.is_empty());
    }

    #[test]
    fn test_log_dir_joins_name() {
        let config = LogConfig {
            dir: PathBuf::from("/data"),
            name: "orders".to_string(),
            ..Default::default()
        };
        assert_eq!(config.log_dir(), PathBuf::from("/data/orders"));
    }

    #[test]
    fn test_serde_defaults_fill_in() {
        let config: LogConfig =
            serde_json::from_str(r#"{"dir": "/data", "name": "orders"}"#).unwrap();
        assert_eq!(config.epoch, 0);
        assert_eq!(config.max_segment_size, 500 * 1000 * 1000);
        assert_eq!(config.max_writers, 255);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = LogConfig {
            dir: PathBuf::from("/data"),
            name: "orders".to_string(),
            epoch: 3,
            max_segment_size: 1024,
            retention: vec![RetentionSpec::MaxBytes { bytes: 4096 }],
            max_writers: 16,
            sync_policy: SyncPolicy::Always,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: LogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.epoch, 3);
        assert_eq!(back.retention, config.retention);
        assert_eq!(back.sync_policy, SyncPolicy::Always);
    }
}
