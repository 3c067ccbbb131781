//! Writer and Acceptor State
//!
//! This module implements `Log` - the single owner of a log directory's
//! write path. A `Log` runs in one of two modes:
//!
//! - **Writer**: the leader side. Encodes chunks from caller-supplied
//!   entries, maintains the tracking and writer-deduplication maps, and
//!   emits snapshot chunks at segment rollover so recovery from the newest
//!   segment alone is self-contained.
//! - **Acceptor**: the follower side. Appends pre-formed chunks received
//!   from the leader verbatim, after verifying ordering and CRC. Before an
//!   acceptor opens, the local log is truncated to the last chunk it has in
//!   common with the leader's per-epoch offset list.
//!
//! ## Write Path
//!
//! ```text
//! write(entries)
//!     ↓
//! need a segment? → open new pair, emit TRK_SNAPSHOT + WRT_SNAPSHOT,
//!     ↓              run retention
//! encode chunk (header | entries | trailer)
//!     ↓
//! append chunk bytes, then the index record
//!     ↓
//! bump next offset, tail info, committed-offset cell, counters
//!     ↓
//! position ≥ max_segment_size? → close the pair; the *next* write
//!                                opens the new segment
//! ```
//!
//! The roll decision is made after the append, so the chunk that crosses
//! the threshold is the last chunk of the prior segment and the first
//! chunks of the new segment are the snapshot pair.
//!
//! ## Concurrency
//!
//! A `Log` is owned by exactly one task. The only state it shares is a
//! pair of atomic cells ([`SharedOffsets`]): the committed offset read by
//! offset readers and the first offset updated by retention.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::File;
use tracing::{debug, info, warn};

use streamlog_core::{
    encode_chunk, encode_tracking, encode_writer_snapshot, parse_entries, parse_tracking,
    parse_trailer, parse_writer_snapshot, verify_crc, ChunkHeader, ChunkType, Entry, RecordEntry,
    WriterEntry, HEADER_SIZE,
};

use crate::config::{LogConfig, SyncPolicy};
use crate::counters::LogCounters;
use crate::error::{Error, Result};
use crate::now_ms;
use crate::overview::{
    open_existing, read_header_at, read_index_record, scan_index, LogOverview, SegmentSearch,
};
use crate::retention;
use crate::segment::{
    delete_segment_files, read_at, truncate_files, SegmentAppender, FILE_HEADER_SIZE,
    INDEX_RECORD_SIZE,
};

/// Offset-per-id map exposed to clients (consumer progress and the like).
pub type TrackingMap = HashMap<Bytes, u64>;

/// Identity of a chunk by its epoch and first offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochOffset {
    pub epoch: u64,
    pub chunk_id: u64,
}

/// What a new writer or follower must know to resume correctly: the next
/// offset to write and the identity of the last chunk, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailInfo {
    pub next_offset: u64,
    pub last_chunk: Option<EpochOffset>,
}

/// One writer's deduplication state, as held in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterState {
    /// Chunk the writer's last sequence landed in.
    pub chunk_id: u64,
    /// Milliseconds since epoch of the writer's last append.
    pub timestamp: u64,
    /// Last accepted sequence number.
    pub sequence: u64,
}

/// How a tracking write is applied to the in-memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingKind {
    /// Merge into the current map and persist as a TRK_DELTA chunk.
    Delta,
    /// Replace the current map and persist as a TRK_SNAPSHOT chunk.
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogMode {
    Writer,
    Acceptor,
}

/// The two per-log atomic cells shared across tasks.
///
/// `committed` is the highest offset declared durable (`-1` when empty); it
/// gates offset readers. `first` is the smallest offset still present,
/// bumped by retention. Both are monotonic.
#[derive(Debug, Clone)]
pub struct SharedOffsets {
    committed: Arc<AtomicI64>,
    first: Arc<AtomicU64>,
}

impl SharedOffsets {
    pub fn new() -> Self {
        Self {
            committed: Arc::new(AtomicI64::new(-1)),
            first: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn committed(&self) -> i64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn set_committed(&self, offset: i64) {
        self.committed.fetch_max(offset, Ordering::Relaxed);
    }

    pub fn first_offset(&self) -> u64 {
        self.first.load(Ordering::Relaxed)
    }

    pub fn set_first_offset(&self, offset: u64) {
        self.first.fetch_max(offset, Ordering::Relaxed);
    }
}

impl Default for SharedOffsets {
    fn default() -> Self {
        Self::new()
    }
}

/// A log's write path: the active segment pair plus in-memory state.
#[derive(Debug)]
pub struct Log {
    config: LogConfig,
    dir: PathBuf,
    mode: LogMode,
    /// `None` between the append that crossed the size threshold and the
    /// next write, which opens the new segment.
    seg: Option<SegmentAppender>,
    next_offset: u64,
    tail: TailInfo,
    epoch: u64,
    tracking: TrackingMap,
    writers: HashMap<Bytes, WriterState>,
    shared: SharedOffsets,
    counters: LogCounters,
}

impl Log {
    /// Open a log for writing, recovering tracking and writer state from
    /// the most recent segment.
    pub async fn init(config: LogConfig) -> Result<Log> {
        Self::init_with_mode(config, LogMode::Writer).await
    }

    /// Truncate the local log against the leader's per-epoch last-offset
    /// list, then open it in acceptor mode.
    ///
    /// `epoch_offsets` pairs are processed in descending epoch order; the
    /// first pair that names a chunk present locally with a matching epoch
    /// is the truncation point. If no pair matches, the local log is
    /// entirely divergent and every segment is deleted.
    pub async fn init_acceptor(config: LogConfig, epoch_offsets: &[(u64, u64)]) -> Result<Log> {
        let dir = config.log_dir();
        tokio::fs::create_dir_all(&dir).await?;
        truncate_to(&dir, epoch_offsets).await?;
        Self::init_with_mode(config, LogMode::Acceptor).await
    }

    async fn init_with_mode(config: LogConfig, mode: LogMode) -> Result<Log> {
        let dir = config.log_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let overview = LogOverview::build(&dir).await?;

        let last_with_records = overview.segments.iter().rev().find(|s| s.last.is_some());

        let (next_offset, tail, tracking, writers) = match last_with_records {
            Some(seg) => {
                let last = seg.last.as_ref().expect("segment has records");
                if last.epoch > config.epoch {
                    return Err(Error::InvalidEpoch {
                        found: last.epoch,
                        configured: config.epoch,
                    });
                }
                let next_offset = last.chunk_id + last.num_records as u64;
                let tail = TailInfo {
                    next_offset,
                    last_chunk: Some(EpochOffset {
                        epoch: last.epoch,
                        chunk_id: last.chunk_id,
                    }),
                };
                let (tracking, writers) = recover_state(&seg.segment_path).await?;
                (next_offset, tail, tracking, writers)
            }
            None => (
                0,
                TailInfo {
                    next_offset: 0,
                    last_chunk: None,
                },
                TrackingMap::new(),
                HashMap::new(),
            ),
        };

        let appender_first = overview
            .segments
            .last()
            .map(|s| s.first_offset)
            .unwrap_or(0);
        let appender = SegmentAppender::open(&dir, appender_first).await?;

        let shared = SharedOffsets::new();
        let counters = LogCounters::register(&config.name);
        if let Some((first, last)) = overview.range() {
            shared.set_first_offset(first);
            shared.set_committed(last as i64);
            counters.first_offset.set(first as i64);
            counters.offset.set(last as i64);
        }

        let epoch = config.epoch;
        let mut log = Log {
            config,
            dir,
            mode,
            seg: Some(appender),
            next_offset,
            tail,
            epoch,
            tracking,
            writers,
            shared,
            counters,
        };

        info!(
            log = %log.config.name,
            next_offset = log.next_offset,
            epoch = log.epoch,
            mode = ?log.mode,
            "log opened"
        );

        if log.mode == LogMode::Writer {
            log.run_retention().await?;
        }

        Ok(log)
    }

    /// Append one chunk of user entries. Returns the chunk id.
    pub async fn write(&mut self, entries: Vec<Entry>) -> Result<u64> {
        let chunk_id = self
            .append_chunk(ChunkType::User, &entries, &HashMap::new())
            .await?;
        self.maybe_roll().await?;
        Ok(chunk_id)
    }

    /// Append one chunk of user entries with a writer-deduplication
    /// contribution.
    ///
    /// When every writer in `writers` has a sequence at or below its last
    /// recorded sequence, the batch is a duplicate delivery and the whole
    /// append is elided; `Ok(None)` is returned.
    pub async fn write_with_writers(
        &mut self,
        entries: Vec<Entry>,
        writers: &HashMap<Bytes, WriterEntry>,
    ) -> Result<Option<u64>> {
        if !writers.is_empty() {
            let fresh = writers.iter().any(|(id, entry)| {
                match self.writers.get(id) {
                    Some(state) => entry.sequence > state.sequence,
                    None => true,
                }
            });
            if !fresh {
                debug!(log = %self.config.name, "duplicate batch elided");
                return Ok(None);
            }
        }
        let chunk_id = self.append_chunk(ChunkType::User, &entries, writers).await?;
        self.maybe_roll().await?;
        Ok(Some(chunk_id))
    }

    /// Apply a tracking update and persist it as a delta or snapshot chunk.
    /// An empty delta is skipped.
    pub async fn write_tracking(&mut self, map: TrackingMap, kind: TrackingKind) -> Result<()> {
        match kind {
            TrackingKind::Delta => {
                if map.is_empty() {
                    return Ok(());
                }
                let body = encode_tracking(&map)?;
                for (id, offset) in map {
                    self.tracking.insert(id, offset);
                }
                self.append_chunk(
                    ChunkType::TrackingDelta,
                    &[Entry::Simple(body)],
                    &HashMap::new(),
                )
                .await?;
            }
            TrackingKind::Snapshot => {
                let body = encode_tracking(&map)?;
                self.tracking = map;
                self.append_chunk(
                    ChunkType::TrackingSnapshot,
                    &[Entry::Simple(body)],
                    &HashMap::new(),
                )
                .await?;
            }
        }
        self.maybe_roll().await
    }

    /// Append a pre-formed chunk received from the leader, verbatim.
    ///
    /// The chunk must be the next expected one; a gap means replication has
    /// derailed and the acceptor must be restarted from scratch. The CRC is
    /// verified over the entry region. The trailer is not parsed - writer
    /// state reaches acceptors through the writer-snapshot chunks the
    /// leader emits at rollover.
    pub async fn accept_chunk(&mut self, chunk: &[u8]) -> Result<u64> {
        let header = ChunkHeader::parse(chunk)?;
        if header.chunk_id != self.next_offset {
            return Err(Error::AcceptChunkOutOfOrder {
                got: header.chunk_id,
                expected: self.next_offset,
            });
        }
        let expected = header.total_size() as usize;
        if chunk.len() != expected {
            return Err(streamlog_core::Error::TruncatedChunk {
                expected,
                got: chunk.len(),
            }
            .into());
        }
        let data_end = HEADER_SIZE + header.data_len as usize;
        verify_crc(&header, &chunk[HEADER_SIZE..data_end])?;

        if self.seg.is_none() {
            self.open_new_segment().await?;
        }
        let seg = match self.seg.as_mut() {
            Some(seg) => seg,
            None => return Err(Error::SegmentNotFound(header.chunk_id)),
        };
        seg.append_chunk(&header, chunk).await?;
        if self.config.sync_policy == SyncPolicy::Always {
            seg.sync().await?;
        }
        self.note_append(&header);
        self.maybe_roll().await?;
        Ok(header.chunk_id)
    }

    /// The offset the next chunk will be written at.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn tail_info(&self) -> TailInfo {
        self.tail
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn tracking(&self) -> &TrackingMap {
        &self.tracking
    }

    pub fn writers(&self) -> &HashMap<Bytes, WriterState> {
        &self.writers
    }

    /// Handle to the shared committed/first-offset cells, for readers and
    /// retention tasks.
    pub fn shared(&self) -> SharedOffsets {
        self.shared.clone()
    }

    pub fn counters_ref(&self) -> &LogCounters {
        &self.counters
    }

    pub fn committed_offset(&self) -> i64 {
        self.shared.committed()
    }

    pub fn first_offset(&self) -> u64 {
        self.shared.first_offset()
    }

    /// Close the log. Counters are unregistered.
    pub fn close(self) {}

    // --- internals -----------------------------------------------------

    async fn append_chunk(
        &mut self,
        chunk_type: ChunkType,
        entries: &[Entry],
        writers: &HashMap<Bytes, WriterEntry>,
    ) -> Result<u64> {
        if self.seg.is_none() {
            self.open_new_segment().await?;
        }
        self.append_to_current(chunk_type, entries, writers).await
    }

    /// Encode and append to the already-open segment. Does not roll.
    async fn append_to_current(
        &mut self,
        chunk_type: ChunkType,
        entries: &[Entry],
        writers: &HashMap<Bytes, WriterEntry>,
    ) -> Result<u64> {
        let chunk_id = self.next_offset;
        let (bytes, header) = encode_chunk(
            chunk_type,
            now_ms(),
            self.epoch,
            chunk_id,
            entries,
            writers,
        )?;
        let sync = self.config.sync_policy == SyncPolicy::Always;
        let seg = match self.seg.as_mut() {
            Some(seg) => seg,
            None => return Err(Error::SegmentNotFound(chunk_id)),
        };
        seg.append_chunk(&header, &bytes).await?;
        if sync {
            seg.sync().await?;
        }
        for (id, entry) in writers {
            self.writers.insert(
                id.clone(),
                WriterState {
                    chunk_id,
                    timestamp: entry.timestamp,
                    sequence: entry.sequence,
                },
            );
        }
        self.note_append(&header);
        Ok(chunk_id)
    }

    /// Advance offset state and counters after a durable append. The index
    /// record is already on disk, so readers that observe the new committed
    /// offset will find the chunk.
    fn note_append(&mut self, header: &ChunkHeader) {
        self.next_offset = header.next_offset();
        self.tail = TailInfo {
            next_offset: self.next_offset,
            last_chunk: Some(EpochOffset {
                epoch: header.epoch,
                chunk_id: header.chunk_id,
            }),
        };
        if header.epoch > self.epoch {
            self.epoch = header.epoch;
        }
        self.shared.set_committed(self.next_offset as i64 - 1);
        self.counters.offset.set(self.next_offset as i64 - 1);
        self.counters.chunks.inc();
    }

    /// Close the segment pair if the last append pushed it past the size
    /// threshold. The new segment is opened lazily by the next write.
    async fn maybe_roll(&mut self) -> Result<()> {
        if let Some(seg) = self.seg.as_mut() {
            if seg.position >= self.config.max_segment_size {
                if self.config.sync_policy != SyncPolicy::Never {
                    seg.sync().await?;
                }
                debug!(
                    log = %self.config.name,
                    size = seg.position,
                    "segment reached max size, rolling on next write"
                );
                self.seg = None;
            }
        }
        Ok(())
    }

    async fn open_new_segment(&mut self) -> Result<()> {
        let first_offset = self.next_offset;
        let appender = SegmentAppender::open(&self.dir, first_offset).await?;
        info!(log = %self.config.name, first_offset = first_offset, "opened new segment");
        self.seg = Some(appender);

        // Drop tracking entries below the retained range.
        let first = self.shared.first_offset();
        self.tracking.retain(|_, offset| *offset >= first);

        // Bound the writer map, evicting the longest-idle writers.
        while self.writers.len() > self.config.max_writers {
            let oldest = self
                .writers
                .iter()
                .min_by_key(|(_, state)| state.timestamp)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.writers.remove(&id);
                }
                None => break,
            }
        }

        // The snapshot pair makes recovery from this segment alone
        // self-contained. Acceptors receive these chunks over the wire
        // instead of emitting their own.
        if self.mode == LogMode::Writer && self.next_offset > 0 {
            let tracking_body = encode_tracking(&self.tracking)?;
            self.append_to_current(
                ChunkType::TrackingSnapshot,
                &[Entry::Simple(tracking_body)],
                &HashMap::new(),
            )
            .await?;

            let writer_body = encode_writer_snapshot(&self.writer_entries())?;
            self.append_to_current(
                ChunkType::WriterSnapshot,
                &[Entry::Simple(writer_body)],
                &HashMap::new(),
            )
            .await?;
        }

        if self.mode == LogMode::Writer {
            self.run_retention().await?;
        }

        Ok(())
    }

    async fn run_retention(&mut self) -> Result<()> {
        if self.config.retention.is_empty() {
            return Ok(());
        }
        if let Some((first, _)) = retention::evaluate(&self.dir, &self.config.retention).await? {
            self.shared.set_first_offset(first);
            self.counters.first_offset.set(first as i64);
        }
        Ok(())
    }

    fn writer_entries(&self) -> HashMap<Bytes, WriterEntry> {
        self.writers
            .iter()
            .map(|(id, state)| {
                (
                    id.clone(),
                    WriterEntry {
                        timestamp: state.timestamp,
                        sequence: state.sequence,
                    },
                )
            })
            .collect()
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        self.counters.delete();
    }
}

/// Scan a directory and report `(offset range, per-epoch last offsets)`.
pub async fn overview(dir: &Path) -> Result<(Option<(u64, u64)>, Vec<(u64, u64)>)> {
    let overview = LogOverview::build(dir).await?;
    let range = overview.range();
    let epochs = overview.last_offset_epochs().await?;
    Ok((range, epochs))
}

/// Remove a log directory and everything in it.
pub async fn delete_directory(config: &LogConfig) -> Result<()> {
    match tokio::fs::remove_dir_all(config.log_dir()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Re-read the most recent segment to rebuild the tracking and
/// writer-deduplication maps.
///
/// Only the newest segment is read; the snapshot pair written at every
/// rollover makes it self-contained. For each chunk, only what is needed
/// is decoded: tracking chunks have their bodies parsed, USER chunks have
/// their data skipped and only the trailer read.
async fn recover_state(
    segment_path: &Path,
) -> Result<(TrackingMap, HashMap<Bytes, WriterState>)> {
    let mut tracking = TrackingMap::new();
    let mut writers: HashMap<Bytes, WriterState> = HashMap::new();

    let mut file = open_existing(segment_path).await?;
    let mut pos = FILE_HEADER_SIZE;

    loop {
        let header = match read_header_at(&mut file, pos).await? {
            Some(header) => header,
            None => break,
        };
        let data_start = pos + HEADER_SIZE as u64;

        match header.chunk_type {
            ChunkType::TrackingDelta | ChunkType::TrackingSnapshot => {
                let Some(data) =
                    read_chunk_bytes(&mut file, data_start, header.data_len as usize).await?
                else {
                    break; // partial tail chunk
                };
                if header.chunk_type == ChunkType::TrackingSnapshot {
                    tracking.clear();
                }
                for entry in parse_entries(&header, &data)? {
                    if let RecordEntry::Simple { data, .. } = entry {
                        for (id, offset) in parse_tracking(&data)? {
                            tracking.insert(id, offset);
                        }
                    }
                }
            }
            ChunkType::WriterSnapshot => {
                let Some(data) =
                    read_chunk_bytes(&mut file, data_start, header.data_len as usize).await?
                else {
                    break;
                };
                writers.clear();
                for entry in parse_entries(&header, &data)? {
                    if let RecordEntry::Simple { data, .. } = entry {
                        for (id, entry) in parse_writer_snapshot(&data)? {
                            writers.insert(
                                id,
                                WriterState {
                                    chunk_id: header.chunk_id,
                                    timestamp: entry.timestamp,
                                    sequence: entry.sequence,
                                },
                            );
                        }
                    }
                }
            }
            ChunkType::User => {
                if header.trailer_len > 0 {
                    let trailer_start = data_start + header.data_len as u64;
                    let Some(trailer) =
                        read_chunk_bytes(&mut file, trailer_start, header.trailer_len as usize)
                            .await?
                    else {
                        break;
                    };
                    for (id, entry) in parse_trailer(&trailer)? {
                        writers.insert(
                            id,
                            WriterState {
                                chunk_id: header.chunk_id,
                                timestamp: entry.timestamp,
                                sequence: entry.sequence,
                            },
                        );
                    }
                }
            }
        }

        pos += header.total_size();
    }

    Ok((tracking, writers))
}

async fn read_chunk_bytes(file: &mut File, pos: u64, len: usize) -> Result<Option<Bytes>> {
    let mut buf = vec![0u8; len];
    let n = read_at(file, pos, &mut buf).await?;
    if n < len {
        return Ok(None);
    }
    Ok(Some(Bytes::from(buf)))
}

/// Find the last chunk shared with the leader and cut everything above it.
async fn truncate_to(dir: &Path, epoch_offsets: &[(u64, u64)]) -> Result<()> {
    let overview = LogOverview::build(dir).await?;
    if overview.segments.iter().all(|s| s.last.is_none()) {
        return Ok(());
    }

    let mut pairs: Vec<(u64, u64)> = epoch_offsets.to_vec();
    pairs.sort_by(|a, b| b.0.cmp(&a.0));

    for (epoch, last_offset) in &pairs {
        let seg = match overview.find_segment_for_offset(*last_offset) {
            SegmentSearch::Found(seg) => seg,
            _ => continue,
        };
        let Some((chunk_id, file_pos)) = scan_index(seg, *last_offset).await? else {
            continue;
        };
        if chunk_id != *last_offset {
            continue;
        }
        let mut file = open_existing(&seg.segment_path).await?;
        let Some(header) = read_header_at(&mut file, file_pos).await? else {
            continue;
        };
        if header.epoch != *epoch {
            continue;
        }

        // Truncation point found: cut both files at the end of this chunk
        // and drop every segment above it.
        let kept_records = index_records_until(&seg.index_path, chunk_id).await?;
        truncate_files(
            dir,
            seg.first_offset,
            file_pos + header.total_size(),
            FILE_HEADER_SIZE + kept_records * INDEX_RECORD_SIZE,
        )
        .await?;
        for other in &overview.segments {
            if other.first_offset > chunk_id {
                delete_segment_files(dir, other.first_offset).await?;
            }
        }
        info!(
            epoch = epoch,
            chunk_id = chunk_id,
            "acceptor truncated to last common chunk"
        );
        return Ok(());
    }

    warn!("no common epoch offset with leader, deleting entire local log");
    for seg in &overview.segments {
        delete_segment_files(dir, seg.first_offset).await?;
    }
    Ok(())
}

/// Number of index records up to and including the one for `chunk_id`.
async fn index_records_until(index_path: &Path, chunk_id: u64) -> Result<u64> {
    let mut index = open_existing(index_path).await?;
    let mut pos = FILE_HEADER_SIZE;
    let mut count = 0;
    while let Some(record) = read_index_record(&mut index, pos).await? {
        count += 1;
        if record.chunk_id == chunk_id {
            break;
        }
        pos += INDEX_RECORD_SIZE;
    }
    Ok(count)
}
