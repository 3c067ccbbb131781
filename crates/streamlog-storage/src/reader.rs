//! Readers
//!
//! Two reader flavors share one state shell:
//!
//! - **Data readers** follow a log from a chunk offset and are unthrottled.
//!   Replication uses them: a follower streams raw chunks from the leader's
//!   disk to a socket without parsing entry bodies.
//! - **Offset readers** serve consumers. They are gated by the shared
//!   committed-offset cell - a read never surfaces a chunk whose id is
//!   above the committed offset - and they skip non-USER chunks, so
//!   consumers only ever see application records.
//!
//! ## Read Flow
//!
//! ```text
//! read_header / read_chunk / send_chunks
//!     ↓
//! gated? (offset readers only) → end of stream
//!     ↓
//! read 56 bytes at the cursor
//!     ├─ full header  → advance past data + trailer, bump next offset
//!     ├─ partial      → rewind to the header start, end of stream
//!     └─ raw EOF      → compute the next segment's filename from the next
//!                       offset; open it and continue, or end of stream if
//!                       it does not exist (or is this segment)
//! ```
//!
//! Segment boundaries are invisible to callers. Retention may delete the
//! segment a reader is positioned in; the open handle keeps working, and
//! the reader only notices at the next boundary, where a missing file is a
//! plain end of stream.
//!
//! ## Zero-copy transmission
//!
//! [`LogReader::send_chunks`] moves chunk bytes from the segment file to a
//! stream socket with `sendfile(2)`, never copying them through user space.
//! The primitive takes an explicit file offset and does not advance the
//! file position, so the reader advances its own cursor after each chunk.
//! On platforms without `sendfile` a read-and-write fallback is used.

use std::path::PathBuf;

use bytes::Bytes;
use tokio::fs::File;
use tokio::net::TcpStream;
use tracing::debug;

use streamlog_core::{
    parse_entries, verify_crc, ChunkHeader, ChunkType, RecordEntry, HEADER_SIZE,
};

use crate::error::{Error, Result};
use crate::log::{EpochOffset, SharedOffsets};
use crate::overview::{
    chunk_id_for_timestamp, open_existing, read_header_at, scan_index, LogOverview, SegmentInfo,
    SegmentSearch,
};
use crate::segment::{read_at, segment_filename, FILE_HEADER_SIZE};

/// Attempts before a failed init stops retrying on vanished files.
const INIT_RETRIES: usize = 8;

/// Where an offset reader attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    /// The first offset still present in the log.
    First,
    /// The first offset of the last chunk.
    Last,
    /// The next offset to be written.
    Next,
    /// An exact offset; out of range is an error.
    Abs(u64),
    /// An offset, clamped into `[first, last + 1]`.
    Offset(u64),
    /// The first chunk whose timestamp is at or after the given time.
    Timestamp(i64),
}

/// Reader flavor. The offset variant carries the shared committed cell.
#[derive(Debug)]
pub enum ReaderMode {
    Data,
    Offset { shared: SharedOffsets },
}

/// A cursor over one log's chunks.
#[derive(Debug)]
pub struct LogReader {
    dir: PathBuf,
    mode: ReaderMode,
    file: File,
    /// First offset of the currently open segment (its filename).
    segment_first_offset: u64,
    /// Byte position of the next chunk header in the current segment.
    position: u64,
    /// Offset of the next record to be read.
    next_offset: u64,
}

impl LogReader {
    /// Open a data reader at `start_offset`.
    ///
    /// `last_chunk` is the follower's record of the last chunk it holds;
    /// its epoch is validated against the chunk actually on the leader's
    /// disk so a diverged follower is told to truncate
    /// ([`Error::InvalidLastOffsetEpoch`]) instead of silently forking.
    /// A `start_offset` below the retained range is forwarded to the range
    /// start; the follower discards its log below that point.
    pub async fn init_data(
        dir: impl Into<PathBuf>,
        start_offset: u64,
        last_chunk: Option<EpochOffset>,
    ) -> Result<LogReader> {
        let dir = dir.into();
        let mut attempts = 0;
        loop {
            match Self::try_init_data(&dir, start_offset, last_chunk).await {
                Ok(reader) => return Ok(reader),
                Err(e) if e.is_retriable() && attempts < INIT_RETRIES => {
                    attempts += 1;
                    debug!(attempts, "data reader init raced a deletion, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open an offset reader positioned per `spec`, gated by `shared`'s
    /// committed offset.
    pub async fn init_offset(
        dir: impl Into<PathBuf>,
        spec: OffsetSpec,
        shared: SharedOffsets,
    ) -> Result<LogReader> {
        let dir = dir.into();
        let mut attempts = 0;
        loop {
            let mode = ReaderMode::Offset {
                shared: shared.clone(),
            };
            match Self::try_init_offset(&dir, spec, mode).await {
                Ok(reader) => return Ok(reader),
                Err(e) if e.is_retriable() && attempts < INIT_RETRIES => {
                    attempts += 1;
                    debug!(attempts, "offset reader init raced a deletion, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_init_data(
        dir: &PathBuf,
        start_offset: u64,
        last_chunk: Option<EpochOffset>,
    ) -> Result<LogReader> {
        let overview = LogOverview::build(dir).await?;

        let Some((first, last)) = overview.range() else {
            if start_offset > 0 {
                return Err(Error::OffsetOutOfRange {
                    offset: start_offset,
                    range: None,
                });
            }
            let seg = overview
                .segments
                .last()
                .ok_or_else(|| Error::MissingFile(dir.display().to_string()))?;
            return Self::attach_at_end(dir.clone(), ReaderMode::Data, seg, 0).await;
        };

        let mut start = start_offset;
        let mut forwarded = false;
        if start < first {
            debug!(
                start_offset,
                first, "start offset below retained range, forwarding"
            );
            start = first;
            forwarded = true;
        }
        if start > last + 1 {
            return Err(Error::OffsetOutOfRange {
                offset: start,
                range: Some((first, last)),
            });
        }

        // Confirm the follower's view of its last chunk against ours. A
        // forwarded follower is about to discard its log anyway, and a
        // chunk below the retained range can no longer be checked.
        if !forwarded {
            if let Some(prev) = last_chunk {
                if prev.chunk_id >= first {
                    if let SegmentSearch::Found(seg) =
                        overview.find_segment_for_offset(prev.chunk_id)
                    {
                        if let Some((chunk_id, pos)) = scan_index(seg, prev.chunk_id).await? {
                            let mut file = open_existing(&seg.segment_path).await?;
                            if let Some(header) = read_header_at(&mut file, pos).await? {
                                if chunk_id != prev.chunk_id || header.epoch != prev.epoch {
                                    return Err(Error::InvalidLastOffsetEpoch {
                                        expected: prev.epoch,
                                        found: header.epoch,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }

        Self::attach(dir.clone(), ReaderMode::Data, &overview, start).await
    }

    async fn try_init_offset(
        dir: &PathBuf,
        spec: OffsetSpec,
        mode: ReaderMode,
    ) -> Result<LogReader> {
        let overview = LogOverview::build(dir).await?;

        let Some((first, last)) = overview.range() else {
            if let OffsetSpec::Abs(offset) = spec {
                if offset > 0 {
                    return Err(Error::OffsetOutOfRange {
                        offset,
                        range: None,
                    });
                }
            }
            let seg = overview
                .segments
                .last()
                .ok_or_else(|| Error::MissingFile(dir.display().to_string()))?;
            return Self::attach_at_end(dir.clone(), mode, seg, 0).await;
        };

        let target = match spec {
            OffsetSpec::First => first,
            OffsetSpec::Last => last,
            OffsetSpec::Next => last + 1,
            OffsetSpec::Abs(offset) => {
                if offset < first || offset > last + 1 {
                    return Err(Error::OffsetOutOfRange {
                        offset,
                        range: Some((first, last)),
                    });
                }
                offset
            }
            OffsetSpec::Offset(offset) => offset.clamp(first, last + 1),
            OffsetSpec::Timestamp(ts) => {
                let mut target = last + 1;
                for seg in &overview.segments {
                    let Some(seg_last) = &seg.last else { continue };
                    if seg_last.timestamp >= ts {
                        target = match chunk_id_for_timestamp(seg, ts).await? {
                            Some(chunk_id) => chunk_id,
                            None => last + 1,
                        };
                        break;
                    }
                }
                target
            }
        };

        Self::attach(dir.clone(), mode, &overview, target).await
    }

    async fn attach(
        dir: PathBuf,
        mode: ReaderMode,
        overview: &LogOverview,
        target: u64,
    ) -> Result<LogReader> {
        match overview.find_segment_for_offset(target) {
            SegmentSearch::Found(seg) => {
                let Some((chunk_id, pos)) = scan_index(seg, target).await? else {
                    return Err(Error::SegmentNotFound(target));
                };
                let file = open_existing(&seg.segment_path).await?;
                Ok(LogReader {
                    dir,
                    mode,
                    file,
                    segment_first_offset: seg.first_offset,
                    position: pos,
                    next_offset: chunk_id,
                })
            }
            SegmentSearch::EndOfLog(seg) => Self::attach_at_end(dir, mode, seg, target).await,
            SegmentSearch::NotFound => Err(Error::SegmentNotFound(target)),
        }
    }

    /// Attach after the last complete chunk of `seg`.
    async fn attach_at_end(
        dir: PathBuf,
        mode: ReaderMode,
        seg: &SegmentInfo,
        next_offset: u64,
    ) -> Result<LogReader> {
        let mut file = open_existing(&seg.segment_path).await?;
        let position = match &seg.last {
            Some(last) => match read_header_at(&mut file, last.file_pos).await? {
                Some(header) => last.file_pos + header.total_size(),
                None => return Err(Error::MissingFile(seg.segment_path.display().to_string())),
            },
            None => FILE_HEADER_SIZE,
        };
        Ok(LogReader {
            dir,
            mode,
            file,
            segment_first_offset: seg.first_offset,
            position,
            next_offset,
        })
    }

    /// Offset of the next record this reader will deliver.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// The committed offset cell's current value, for offset readers.
    pub fn committed_offset(&self) -> Option<i64> {
        match &self.mode {
            ReaderMode::Data => None,
            ReaderMode::Offset { shared } => Some(shared.committed()),
        }
    }

    pub fn close(self) {}

    fn is_gated(&self) -> bool {
        match &self.mode {
            ReaderMode::Data => false,
            ReaderMode::Offset { shared } => shared.committed() < self.next_offset as i64,
        }
    }

    fn is_offset_mode(&self) -> bool {
        matches!(self.mode, ReaderMode::Offset { .. })
    }

    /// Read the next chunk header and skip over its payload.
    ///
    /// Returns `None` at end of stream: the reader is gated, the log has no
    /// further complete chunk, or the next segment does not exist yet.
    pub async fn read_header(&mut self) -> Result<Option<ChunkHeader>> {
        if self.is_gated() {
            return Ok(None);
        }
        match self.next_header().await? {
            Some(header) => {
                self.position += header.total_size();
                self.next_offset = header.next_offset();
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    /// Read the next chunk in full and validate its CRC.
    ///
    /// Returns the header and the complete chunk bytes (header, entries,
    /// trailer).
    pub async fn read_chunk(&mut self) -> Result<Option<(ChunkHeader, Bytes)>> {
        if self.is_gated() {
            return Ok(None);
        }
        let Some(header) = self.next_header().await? else {
            return Ok(None);
        };
        let total = header.total_size() as usize;
        let mut buf = vec![0u8; total];
        let n = read_at(&mut self.file, self.position, &mut buf).await?;
        if n < total {
            // The chunk is still landing; the cursor stays at its header.
            return Ok(None);
        }
        let bytes = Bytes::from(buf);
        let data = bytes.slice(HEADER_SIZE..HEADER_SIZE + header.data_len as usize);
        verify_crc(&header, &data)?;
        self.position += total as u64;
        self.next_offset = header.next_offset();
        Ok(Some((header, bytes)))
    }

    /// Read the next chunk and parse its entry region into records.
    ///
    /// Offset readers skip non-USER chunks transparently; data readers get
    /// the parsed bodies of tracking and snapshot chunks too.
    pub async fn read_chunk_parsed(
        &mut self,
    ) -> Result<Option<(ChunkHeader, Vec<RecordEntry>)>> {
        loop {
            let Some((header, bytes)) = self.read_chunk().await? else {
                return Ok(None);
            };
            if header.chunk_type != ChunkType::User && self.is_offset_mode() {
                continue;
            }
            let data = bytes.slice(HEADER_SIZE..HEADER_SIZE + header.data_len as usize);
            let records = parse_entries(&header, &data)?;
            return Ok(Some((header, records)));
        }
    }

    /// Stream chunks to `socket` with the zero-copy primitive until end of
    /// stream, invoking `on_chunk` for each chunk sent.
    ///
    /// Data readers send chunks whole. Offset readers send `header + data`
    /// only - trailers are not client-visible - and skip non-USER chunks.
    /// Returns the number of chunks sent.
    pub async fn send_chunks<F>(&mut self, socket: &TcpStream, mut on_chunk: F) -> Result<u64>
    where
        F: FnMut(&ChunkHeader),
    {
        let mut sent = 0u64;
        loop {
            if self.is_gated() {
                return Ok(sent);
            }
            let Some(header) = self.next_header().await? else {
                return Ok(sent);
            };
            let total = header.total_size();

            if self.is_offset_mode() && header.chunk_type != ChunkType::User {
                self.position += total;
                self.next_offset = header.next_offset();
                continue;
            }

            // Only complete chunks leave the machine; a partially landed
            // chunk would desynchronize the byte stream.
            let file_len = self.file.metadata().await?.len();
            if file_len < self.position + total {
                return Ok(sent);
            }

            let to_send = if self.is_offset_mode() {
                HEADER_SIZE as u64 + header.data_len as u64
            } else {
                total
            };
            self.transfer(socket, self.position, to_send).await?;

            // The zero-copy primitive does not move the file position;
            // advance the cursor past the whole chunk ourselves.
            self.position += total;
            self.next_offset = header.next_offset();
            sent += 1;
            on_chunk(&header);
        }
    }

    /// Read the header at the cursor without consuming the chunk, crossing
    /// into the next segment on end of file.
    async fn next_header(&mut self) -> Result<Option<ChunkHeader>> {
        loop {
            let mut buf = [0u8; HEADER_SIZE];
            let n = read_at(&mut self.file, self.position, &mut buf).await?;
            if n == HEADER_SIZE {
                return Ok(Some(ChunkHeader::parse(&buf)?));
            }
            if n > 0 {
                // Partial header: an append in flight. Stay at the header
                // start so the next call re-reads it.
                return Ok(None);
            }

            // Raw end of file at a chunk boundary. The segment holding the
            // next offset, if rolled, is named by it. When that name is
            // this segment the log simply has nothing more (an empty log's
            // first segment names offset zero).
            if self.next_offset == self.segment_first_offset {
                return Ok(None);
            }
            let next_path = self.dir.join(segment_filename(self.next_offset));
            match File::open(&next_path).await {
                Ok(file) => {
                    debug!(
                        next_offset = self.next_offset,
                        "reader crossing segment boundary"
                    );
                    self.file = file;
                    self.segment_first_offset = self.next_offset;
                    self.position = FILE_HEADER_SIZE;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[cfg(target_os = "linux")]
    async fn transfer(&mut self, socket: &TcpStream, pos: u64, len: u64) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        use tokio::io::Interest;

        let mut offset = pos as libc::off_t;
        let mut remaining = len as usize;
        while remaining > 0 {
            socket.writable().await?;
            let result = socket.try_io(Interest::WRITABLE, || {
                let n = unsafe {
                    libc::sendfile(
                        socket.as_raw_fd(),
                        self.file.as_raw_fd(),
                        &mut offset,
                        remaining,
                    )
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(n) => remaining -= n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    async fn transfer(&mut self, socket: &TcpStream, pos: u64, len: u64) -> Result<()> {
        let mut buf = vec![0u8; len as usize];
        let n = read_at(&mut self.file, pos, &mut buf).await?;
        if n < buf.len() {
            return Err(Error::MissingFile(format!(
                "short read at {} in segment {}",
                pos, self.segment_first_offset
            )));
        }
        let mut written = 0;
        while written < buf.len() {
            socket.writable().await?;
            match socket.try_write(&buf[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
