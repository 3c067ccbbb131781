//! Segment and Index Files
//!
//! A log is a directory of paired files, both named by the 20-digit
//! zero-padded first offset they contain:
//!
//! ```text
//! 00000000000000000000.segment    "OSIL" | u32 version | chunks...
//! 00000000000000000000.index      "OSII" | u32 version | 28-byte records...
//! ```
//!
//! Each index record is `chunk id (u64) | timestamp (i64) | epoch (u64) |
//! file position (u32)`, one per chunk, pointing at the start of the chunk
//! header in the paired segment file.
//!
//! Writes are append-only. The chunk bytes are written before the index
//! record so a reader that finds an index record always finds the complete
//! chunk it points at. Truncation is performed only by the acceptor's
//! recovery path and cuts both files at a chunk boundary.

use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::info;

use streamlog_core::ChunkHeader;

use crate::error::Result;

/// Magic bytes opening every segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"OSIL";

/// Magic bytes opening every index file.
pub const INDEX_MAGIC: [u8; 4] = *b"OSII";

/// On-disk format version for both file kinds.
pub const FILE_VERSION: u32 = 1;

/// Size of the 8-byte file header (magic + version).
pub const FILE_HEADER_SIZE: u64 = 8;

/// Size of one index record.
pub const INDEX_RECORD_SIZE: u64 = 28;

pub const SEGMENT_SUFFIX: &str = ".segment";
pub const INDEX_SUFFIX: &str = ".index";

/// Segment filename for a first offset: `printf("%020d.segment", offset)`.
pub fn segment_filename(first_offset: u64) -> String {
    format!("{:020}{}", first_offset, SEGMENT_SUFFIX)
}

/// Index filename for a first offset.
pub fn index_filename(first_offset: u64) -> String {
    format!("{:020}{}", first_offset, INDEX_SUFFIX)
}

/// Parse the first offset out of a segment or index filename.
pub fn first_offset_from_filename(name: &str) -> Option<u64> {
    let stem = name
        .strip_suffix(SEGMENT_SUFFIX)
        .or_else(|| name.strip_suffix(INDEX_SUFFIX))?;
    if stem.len() != 20 {
        return None;
    }
    stem.parse().ok()
}

/// Append handles for the active segment/index pair.
///
/// Owned exclusively by the writer or acceptor of one log; never shared.
#[derive(Debug)]
pub(crate) struct SegmentAppender {
    pub first_offset: u64,
    pub segment_path: PathBuf,
    pub index_path: PathBuf,
    segment: File,
    index: File,
    /// Byte size of the segment file, i.e. the position of the next chunk.
    pub position: u64,
    pub index_position: u64,
}

impl SegmentAppender {
    /// Open the pair for appending, creating files and writing the 8-byte
    /// file headers if they do not exist yet.
    pub async fn open(dir: &Path, first_offset: u64) -> Result<Self> {
        let segment_path = dir.join(segment_filename(first_offset));
        let index_path = dir.join(index_filename(first_offset));

        let mut segment = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&segment_path)
            .await?;
        let mut index = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&index_path)
            .await?;

        let mut position = segment.metadata().await?.len();
        let mut index_position = index.metadata().await?.len();

        if position == 0 {
            let mut header = BytesMut::with_capacity(FILE_HEADER_SIZE as usize);
            header.put_slice(&SEGMENT_MAGIC);
            header.put_u32(FILE_VERSION);
            segment.write_all(&header).await?;
            position = FILE_HEADER_SIZE;
        }
        if index_position == 0 {
            let mut header = BytesMut::with_capacity(FILE_HEADER_SIZE as usize);
            header.put_slice(&INDEX_MAGIC);
            header.put_u32(FILE_VERSION);
            index.write_all(&header).await?;
            index_position = FILE_HEADER_SIZE;
        }

        Ok(Self {
            first_offset,
            segment_path,
            index_path,
            segment,
            index,
            position,
            index_position,
        })
    }

    /// Append a chunk and its index record. Chunk bytes land before the
    /// index record so the index never points past the data.
    ///
    /// Returns the file position the chunk was written at.
    pub async fn append_chunk(&mut self, header: &ChunkHeader, chunk: &[u8]) -> Result<u64> {
        let pos = self.position;
        self.segment.write_all(chunk).await?;
        self.position += chunk.len() as u64;

        let mut record = BytesMut::with_capacity(INDEX_RECORD_SIZE as usize);
        record.put_u64(header.chunk_id);
        record.put_i64(header.timestamp);
        record.put_u64(header.epoch);
        record.put_u32(pos as u32);
        self.index.write_all(&record).await?;
        self.index_position += INDEX_RECORD_SIZE;

        Ok(pos)
    }

    /// Sync both files to stable storage.
    pub async fn sync(&mut self) -> Result<()> {
        self.segment.sync_all().await?;
        self.index.sync_all().await?;
        Ok(())
    }
}

/// Cut a segment/index pair down to the given lengths (a chunk boundary).
pub(crate) async fn truncate_files(
    dir: &Path,
    first_offset: u64,
    segment_len: u64,
    index_len: u64,
) -> Result<()> {
    let segment = OpenOptions::new()
        .write(true)
        .open(dir.join(segment_filename(first_offset)))
        .await?;
    segment.set_len(segment_len).await?;
    segment.sync_all().await?;

    let index = OpenOptions::new()
        .write(true)
        .open(dir.join(index_filename(first_offset)))
        .await?;
    index.set_len(index_len).await?;
    index.sync_all().await?;

    info!(
        first_offset = first_offset,
        segment_len = segment_len,
        "segment truncated"
    );
    Ok(())
}

/// Delete a segment/index pair. Missing files are tolerated so retention
/// and truncation can race with each other.
pub(crate) async fn delete_segment_files(dir: &Path, first_offset: u64) -> Result<()> {
    for path in [
        dir.join(segment_filename(first_offset)),
        dir.join(index_filename(first_offset)),
    ] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    info!(first_offset = first_offset, "segment deleted");
    Ok(())
}

/// Read into `buf` at `pos` until the buffer is full or the file ends.
/// Returns the number of bytes read.
pub(crate) async fn read_at(file: &mut File, pos: u64, buf: &mut [u8]) -> Result<usize> {
    file.seek(std::io::SeekFrom::Start(pos)).await?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
