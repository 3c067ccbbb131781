//! Log Counters
//!
//! Per-log and per-replica-reader observability counters, kept in a
//! process-global Prometheus registry. Counter blocks are registered lazily
//! when a log or replica reader opens and their label values are removed on
//! close, so an idle process carries no stale series.

use lazy_static::lazy_static;
use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry for the engine.
    pub static ref REGISTRY: Registry = Registry::new();

    static ref LOG_OFFSET: IntGaugeVec = IntGaugeVec::new(
        Opts::new("streamlog_log_offset", "Last committed offset of the log"),
        &["log"]
    ).expect("metric can be created");

    static ref LOG_FIRST_OFFSET: IntGaugeVec = IntGaugeVec::new(
        Opts::new("streamlog_log_first_offset", "First offset still present in the log"),
        &["log"]
    ).expect("metric can be created");

    static ref LOG_CHUNKS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("streamlog_log_chunks", "Chunks written to the log"),
        &["log"]
    ).expect("metric can be created");

    static ref REPLICA_CHUNKS_SENT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("streamlog_replica_chunks_sent", "Chunks streamed to the replica"),
        &["log"]
    ).expect("metric can be created");

    static ref REPLICA_OFFSET: IntGaugeVec = IntGaugeVec::new(
        Opts::new("streamlog_replica_offset", "Last offset streamed to the replica"),
        &["log"]
    ).expect("metric can be created");

    static ref REPLICA_OFFSET_LISTENERS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("streamlog_replica_offset_listeners", "Times the replica reader re-registered for wake-up"),
        &["log"]
    ).expect("metric can be created");
}

fn register_metrics() {
    INIT.call_once(|| {
        for collector in [
            &*LOG_OFFSET,
            &*LOG_FIRST_OFFSET,
            &*LOG_CHUNKS,
            &*REPLICA_CHUNKS_SENT,
            &*REPLICA_OFFSET,
            &*REPLICA_OFFSET_LISTENERS,
        ] {
            REGISTRY
                .register(Box::new(collector.clone()))
                .expect("metric can be registered");
        }
    });
}

/// Counter block for one log instance.
#[derive(Debug)]
pub struct LogCounters {
    name: String,
    pub offset: IntGauge,
    pub first_offset: IntGauge,
    pub chunks: IntGauge,
}

impl LogCounters {
    pub fn register(name: &str) -> Self {
        register_metrics();
        Self {
            name: name.to_string(),
            offset: LOG_OFFSET.with_label_values(&[name]),
            first_offset: LOG_FIRST_OFFSET.with_label_values(&[name]),
            chunks: LOG_CHUNKS.with_label_values(&[name]),
        }
    }

    /// Remove this log's series from the registry.
    pub fn delete(&self) {
        let _ = LOG_OFFSET.remove_label_values(&[&self.name]);
        let _ = LOG_FIRST_OFFSET.remove_label_values(&[&self.name]);
        let _ = LOG_CHUNKS.remove_label_values(&[&self.name]);
    }
}

/// Counter block for one replica reader.
pub struct ReplicaCounters {
    name: String,
    pub chunks_sent: IntGauge,
    pub offset: IntGauge,
    pub offset_listeners: IntGauge,
}

impl ReplicaCounters {
    pub fn register(name: &str) -> Self {
        register_metrics();
        Self {
            name: name.to_string(),
            chunks_sent: REPLICA_CHUNKS_SENT.with_label_values(&[name]),
            offset: REPLICA_OFFSET.with_label_values(&[name]),
            offset_listeners: REPLICA_OFFSET_LISTENERS.with_label_values(&[name]),
        }
    }

    pub fn delete(&self) {
        let _ = REPLICA_CHUNKS_SENT.remove_label_values(&[&self.name]);
        let _ = REPLICA_OFFSET.remove_label_values(&[&self.name]);
        let _ = REPLICA_OFFSET_LISTENERS.remove_label_values(&[&self.name]);
    }
}
