//! Log Overview and Lookup
//!
//! This module reconstructs a log's segment metadata from its directory and
//! answers the lookup questions every other component asks:
//!
//! - which segments exist, and what offset range does the log cover?
//! - which segment contains a given offset? a given timestamp?
//! - where inside a segment does the chunk containing an offset start?
//! - what is the highest chunk id written in each epoch?
//!
//! ## Scan
//!
//! The scan lists `*.index` files in ascending filename order (filenames
//! are zero-padded first offsets, so lexicographic order is numeric order)
//! and derives one [`SegmentInfo`] per segment from the segment's first
//! chunk header and the chunk referenced by the last index record.
//!
//! Retention deletes segments concurrently with scans. Any file that
//! vanishes mid-scan restarts the whole scan; a fresh listing no longer
//! contains the deleted segment, so the restart terminates.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tracing::debug;

use streamlog_core::{ChunkHeader, HEADER_SIZE};

use crate::error::{Error, Result};
use crate::segment::{
    first_offset_from_filename, read_at, FILE_HEADER_SIZE, INDEX_RECORD_SIZE, INDEX_SUFFIX,
    SEGMENT_SUFFIX,
};

/// Identity of one chunk as recorded in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_id: u64,
    pub epoch: u64,
    pub timestamp: i64,
    pub num_records: u32,
    pub file_pos: u64,
}

/// Metadata for one segment, derived from a directory scan.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub first_offset: u64,
    pub segment_path: PathBuf,
    pub index_path: PathBuf,
    /// Byte size of the segment file at scan time.
    pub size: u64,
    /// First chunk in the segment, `None` when the segment is empty.
    pub first: Option<ChunkInfo>,
    /// Last chunk in the segment, `None` when the segment is empty.
    pub last: Option<ChunkInfo>,
}

impl SegmentInfo {
    /// One past the last offset in this segment; the segment's first offset
    /// when it is empty.
    pub fn end_offset_excl(&self) -> u64 {
        match &self.last {
            Some(last) => last.chunk_id + last.num_records as u64,
            None => self.first_offset,
        }
    }
}

/// Result of an offset lookup across segments.
#[derive(Debug)]
pub enum SegmentSearch<'a> {
    /// The offset lies inside this segment.
    Found(&'a SegmentInfo),
    /// The offset is the next offset to be written; this is the last segment.
    EndOfLog(&'a SegmentInfo),
    NotFound,
}

/// All segments of one log, in first-offset order.
#[derive(Debug, Clone)]
pub struct LogOverview {
    pub segments: Vec<SegmentInfo>,
}

impl LogOverview {
    /// Scan `dir`, restarting whenever a file vanishes mid-scan.
    ///
    /// A missing directory yields an empty overview.
    pub async fn build(dir: &Path) -> Result<LogOverview> {
        loop {
            match Self::try_build(dir).await {
                Ok(overview) => return Ok(overview),
                Err(e) if e.is_retriable() => {
                    debug!(dir = %dir.display(), "file vanished during scan, restarting");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_build(dir: &Path) -> Result<LogOverview> {
        let mut first_offsets = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LogOverview {
                    segments: Vec::new(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.ends_with(INDEX_SUFFIX) {
                continue;
            }
            if let Some(first_offset) = first_offset_from_filename(name) {
                first_offsets.push(first_offset);
            }
        }
        first_offsets.sort_unstable();

        let mut segments = Vec::with_capacity(first_offsets.len());
        for first_offset in first_offsets {
            segments.push(Self::scan_segment(dir, first_offset).await?);
        }
        Ok(LogOverview { segments })
    }

    async fn scan_segment(dir: &Path, first_offset: u64) -> Result<SegmentInfo> {
        let segment_path = dir.join(format!("{:020}{}", first_offset, SEGMENT_SUFFIX));
        let index_path = dir.join(format!("{:020}{}", first_offset, INDEX_SUFFIX));

        let size = match tokio::fs::metadata(&segment_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(missing(&segment_path))
            }
            Err(e) => return Err(e.into()),
        };

        let index_len = match tokio::fs::metadata(&index_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(missing(&index_path))
            }
            Err(e) => return Err(e.into()),
        };
        let num_index_records = index_len.saturating_sub(FILE_HEADER_SIZE) / INDEX_RECORD_SIZE;

        if num_index_records == 0 {
            return Ok(SegmentInfo {
                first_offset,
                segment_path,
                index_path,
                size,
                first: None,
                last: None,
            });
        }

        let mut segment = open_existing(&segment_path).await?;

        // The first chunk sits directly after the 8-byte file header.
        let first_header = match read_header_at(&mut segment, FILE_HEADER_SIZE).await? {
            Some(header) => header,
            None => return Err(missing(&segment_path)),
        };
        let first = ChunkInfo {
            chunk_id: first_header.chunk_id,
            epoch: first_header.epoch,
            timestamp: first_header.timestamp,
            num_records: first_header.num_records,
            file_pos: FILE_HEADER_SIZE,
        };

        let mut index = open_existing(&index_path).await?;
        let last_record_pos = FILE_HEADER_SIZE + (num_index_records - 1) * INDEX_RECORD_SIZE;
        let last_record = match read_index_record(&mut index, last_record_pos).await? {
            Some(record) => record,
            None => return Err(missing(&index_path)),
        };
        let last_header = match read_header_at(&mut segment, last_record.file_pos).await? {
            Some(header) => header,
            None => return Err(missing(&segment_path)),
        };
        let last = ChunkInfo {
            chunk_id: last_header.chunk_id,
            epoch: last_header.epoch,
            timestamp: last_header.timestamp,
            num_records: last_header.num_records,
            file_pos: last_record.file_pos,
        };

        Ok(SegmentInfo {
            first_offset,
            segment_path,
            index_path,
            size,
            first: Some(first),
            last: Some(last),
        })
    }

    /// The inclusive offset range of the log, `None` when empty.
    pub fn range(&self) -> Option<(u64, u64)> {
        let first = self
            .segments
            .iter()
            .find_map(|seg| seg.first.as_ref().map(|c| c.chunk_id))?;
        let last = self
            .segments
            .iter()
            .rev()
            .find_map(|seg| seg.last.as_ref().map(|c| c.chunk_id + c.num_records as u64 - 1))?;
        Some((first, last))
    }

    /// Sum of all segment file sizes.
    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|seg| seg.size).sum()
    }

    /// Locate the segment containing `offset`.
    pub fn find_segment_for_offset(&self, offset: u64) -> SegmentSearch<'_> {
        for seg in &self.segments {
            if let Some(first) = &seg.first {
                if offset >= first.chunk_id && offset < seg.end_offset_excl() {
                    return SegmentSearch::Found(seg);
                }
            }
        }
        if let Some(last_seg) = self.segments.last() {
            if offset == last_seg.end_offset_excl() {
                return SegmentSearch::EndOfLog(last_seg);
            }
        }
        SegmentSearch::NotFound
    }

    /// Walk every index record, aggregating the highest chunk id observed
    /// for each epoch. Epochs are non-decreasing across the log; the result
    /// is ordered by epoch.
    pub async fn last_offset_epochs(&self) -> Result<Vec<(u64, u64)>> {
        let mut out: Vec<(u64, u64)> = Vec::new();
        for seg in &self.segments {
            let mut index = open_existing(&seg.index_path).await?;
            let mut pos = FILE_HEADER_SIZE;
            while let Some(record) = read_index_record(&mut index, pos).await? {
                pos += INDEX_RECORD_SIZE;
                match out.last_mut() {
                    Some((epoch, last)) if *epoch == record.epoch => *last = record.chunk_id,
                    Some((epoch, _)) => {
                        debug_assert!(
                            record.epoch > *epoch,
                            "epochs must be non-decreasing across the log"
                        );
                        out.push((record.epoch, record.chunk_id));
                    }
                    None => out.push((record.epoch, record.chunk_id)),
                }
            }
        }
        Ok(out)
    }
}

/// One 28-byte index record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IndexRecord {
    pub chunk_id: u64,
    pub timestamp: i64,
    pub epoch: u64,
    pub file_pos: u64,
}

/// Read the index record at `pos`, `None` when fewer than 28 bytes remain.
pub(crate) async fn read_index_record(
    index: &mut File,
    pos: u64,
) -> Result<Option<IndexRecord>> {
    let mut buf = [0u8; INDEX_RECORD_SIZE as usize];
    let n = read_at(index, pos, &mut buf).await?;
    if n < buf.len() {
        return Ok(None);
    }
    Ok(Some(IndexRecord {
        chunk_id: u64::from_be_bytes(buf[0..8].try_into().expect("slice is 8 bytes")),
        timestamp: i64::from_be_bytes(buf[8..16].try_into().expect("slice is 8 bytes")),
        epoch: u64::from_be_bytes(buf[16..24].try_into().expect("slice is 8 bytes")),
        file_pos: u32::from_be_bytes(buf[24..28].try_into().expect("slice is 4 bytes")) as u64,
    }))
}

/// Walk a segment's index to find the chunk containing `target`.
///
/// Records are read in pairs so the span `[current, next)` can be decided
/// without touching the segment file; only the final record needs a
/// cross-check against the chunk header's record count.
///
/// Returns `(chunk id, file position)` or `None` when the target lies past
/// the last chunk of the segment.
pub async fn scan_index(seg: &SegmentInfo, target: u64) -> Result<Option<(u64, u64)>> {
    let mut index = open_existing(&seg.index_path).await?;
    let mut pos = FILE_HEADER_SIZE;
    let mut current = match read_index_record(&mut index, pos).await? {
        Some(record) => record,
        None => return Ok(None),
    };

    loop {
        if target < current.chunk_id {
            // Target sits below the first retained chunk; forward to it.
            return Ok(Some((current.chunk_id, current.file_pos)));
        }
        pos += INDEX_RECORD_SIZE;
        match read_index_record(&mut index, pos).await? {
            Some(next) => {
                if target < next.chunk_id {
                    return Ok(Some((current.chunk_id, current.file_pos)));
                }
                current = next;
            }
            None => {
                let mut segment = open_existing(&seg.segment_path).await?;
                let header = match read_header_at(&mut segment, current.file_pos).await? {
                    Some(header) => header,
                    None => return Err(missing(&seg.segment_path)),
                };
                if target < current.chunk_id + header.num_records as u64 {
                    return Ok(Some((current.chunk_id, current.file_pos)));
                }
                return Ok(None);
            }
        }
    }
}

/// Linear-scan a segment's index for the first chunk whose timestamp is at
/// or after `ts`.
pub async fn chunk_id_for_timestamp(seg: &SegmentInfo, ts: i64) -> Result<Option<u64>> {
    let mut index = open_existing(&seg.index_path).await?;
    let mut pos = FILE_HEADER_SIZE;
    while let Some(record) = read_index_record(&mut index, pos).await? {
        if record.timestamp >= ts {
            return Ok(Some(record.chunk_id));
        }
        pos += INDEX_RECORD_SIZE;
    }
    Ok(None)
}

/// Parse the chunk header at `pos`, `None` when fewer than 56 bytes remain.
pub(crate) async fn read_header_at(
    segment: &mut File,
    pos: u64,
) -> Result<Option<ChunkHeader>> {
    let mut buf = [0u8; HEADER_SIZE];
    let n = read_at(segment, pos, &mut buf).await?;
    if n < HEADER_SIZE {
        return Ok(None);
    }
    Ok(Some(ChunkHeader::parse(&buf)?))
}

pub(crate) async fn open_existing(path: &Path) -> Result<File> {
    match File::open(path).await {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(missing(path)),
        Err(e) => Err(e.into()),
    }
}

fn missing(path: &Path) -> Error {
    Error::MissingFile(path.display().to_string())
}
