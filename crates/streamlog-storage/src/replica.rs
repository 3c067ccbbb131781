//! Replica Follower
//!
//! The replica follower is the leader-side half of replication for one
//! replica. It owns three things: a data reader over the leader's log, a
//! stream socket connected back to the replica's listener, and a wake
//! handle the leader pokes whenever new data lands.
//!
//! ```text
//! leader log ──▶ LogReader ──▶ sendfile ──▶ socket ──▶ replica acceptor
//!                    ▲
//!                wake (more_data)
//! ```
//!
//! Chunks are streamed verbatim with no extra framing: the replica's
//! acceptor reconstructs chunk boundaries by parsing headers out of the
//! byte stream. On wake the follower drains the log to end of stream, then
//! re-registers and parks. A socket error tears the task down; the
//! supervisor restarts replication from the replica's new tail.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::counters::ReplicaCounters;
use crate::error::Result;
use crate::log::EpochOffset;
use crate::reader::LogReader;

/// Configuration for one replica follower.
#[derive(Debug, Clone)]
pub struct ReplicaReaderConfig {
    /// The leader's log directory.
    pub dir: PathBuf,
    /// Log name, used as the counter label.
    pub name: String,
    /// Address of the replica's listener.
    pub replica_addr: std::net::SocketAddr,
    /// Offset to resume from (the replica's next offset).
    pub start_offset: u64,
    /// The replica's record of its last chunk, for epoch validation.
    pub last_chunk: Option<EpochOffset>,
}

/// One replica's follower: a data reader pumping chunks into a socket.
pub struct ReplicaReader {
    reader: LogReader,
    socket: TcpStream,
    wake: Arc<Notify>,
    counters: ReplicaCounters,
}

impl ReplicaReader {
    /// Connect to the replica and open the data reader at its tail.
    pub async fn connect(config: ReplicaReaderConfig) -> Result<ReplicaReader> {
        let socket = TcpStream::connect(config.replica_addr).await?;
        let reader =
            LogReader::init_data(&config.dir, config.start_offset, config.last_chunk).await?;
        let counters = ReplicaCounters::register(&config.name);
        info!(
            log = %config.name,
            replica = %config.replica_addr,
            start_offset = config.start_offset,
            "replica follower connected"
        );
        Ok(ReplicaReader {
            reader,
            socket,
            wake: Arc::new(Notify::new()),
            counters,
        })
    }

    /// Handle the leader uses to signal that more data is available.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// The next offset this follower will stream.
    pub fn next_offset(&self) -> u64 {
        self.reader.next_offset()
    }

    /// Stream until torn down. Each cycle drains the log to end of stream,
    /// re-registers for wake-up, and parks.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let ReplicaReader {
                reader,
                socket,
                counters,
                ..
            } = &mut self;
            let sent = reader
                .send_chunks(socket, |_header| {
                    counters.chunks_sent.inc();
                })
                .await?;
            if sent > 0 {
                counters.offset.set(reader.next_offset() as i64 - 1);
                debug!(chunks = sent, next_offset = reader.next_offset(), "streamed to replica");
            }
            counters.offset_listeners.inc();
            self.wake.notified().await;
        }
    }
}

impl Drop for ReplicaReader {
    fn drop(&mut self) {
        self.counters.delete();
    }
}
