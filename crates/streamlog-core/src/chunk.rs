//! Chunk Codec
//!
//! This module implements the binary layout of a *chunk* - the unit of
//! append, replication, and read in a streamlog log.
//!
//! ## Chunk Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (56 bytes, big-endian)                               │
//! │ - Magic nibble: 5, version nibble: 1 (1 byte, 0x51)         │
//! │ - Chunk type (1 byte)                                       │
//! │ - Number of entries (2 bytes)                               │
//! │ - Number of records (4 bytes)                               │
//! │ - Timestamp, ms since epoch (8 bytes, signed)               │
//! │ - Epoch (8 bytes)                                           │
//! │ - First offset / chunk id (8 bytes)                         │
//! │ - CRC32 of the entry region (4 bytes)                       │
//! │ - Data length (4 bytes)                                     │
//! │ - Trailer length (4 bytes)                                  │
//! │ - Reserved (12 bytes)                                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Entries (data length bytes)                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Trailer (trailer length bytes, USER chunks only)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Entry Framing
//!
//! The high bit of the first byte discriminates the two entry kinds:
//!
//! ```text
//! Simple record:  0 (1 bit) | size (31 bits)                  | size bytes
//! Sub-batch:      1 (1 bit) | compression (3 bits) | reserved (4 bits)
//!                 | record count (u16) | size (u32)           | size bytes
//! ```
//!
//! A simple record occupies one offset. A sub-batch is an opaque,
//! producer-encoded group of records that occupies `record count` offsets;
//! the engine never compresses or decompresses its payload.
//!
//! ## Trailer
//!
//! USER chunks carry a trailer of per-writer deduplication records, each
//! `id length (u8) | id | timestamp (u64) | sequence (u64)`. Tracking and
//! writer-snapshot chunks carry their maps in the entry region instead (see
//! [`encode_tracking`] and [`encode_writer_snapshot`]) and have no trailer.
//!
//! ## CRC
//!
//! The CRC32 in the header covers the entry region only - not the header
//! itself and not the trailer. A mismatch on read is unrecoverable data
//! corruption.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Size of the fixed chunk header in bytes.
pub const HEADER_SIZE: usize = 56;

/// Magic nibble carried in the high half of the first header byte.
pub const MAGIC: u8 = 5;

/// Format version carried in the low half of the first header byte.
pub const VERSION: u8 = 1;

/// Maximum size of a single entry payload (31-bit size field).
pub const MAX_ENTRY_SIZE: usize = (1 << 31) - 1;

/// The kind of payload a chunk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// Application records.
    User = 0,
    /// Incremental update to the offset-tracking map.
    TrackingDelta = 1,
    /// Full snapshot of the offset-tracking map.
    TrackingSnapshot = 2,
    /// Full snapshot of the writer-deduplication map.
    WriterSnapshot = 3,
}

impl TryFrom<u8> for ChunkType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ChunkType::User),
            1 => Ok(ChunkType::TrackingDelta),
            2 => Ok(ChunkType::TrackingSnapshot),
            3 => Ok(ChunkType::WriterSnapshot),
            _ => Err(Error::InvalidChunkType(value)),
        }
    }
}

/// Compression applied to a sub-batch by its producer (3-bit tag).
///
/// The engine carries the tag and the compressed bytes opaquely; consumers
/// that wrote compressed sub-batches are expected to decode them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl TryFrom<u8> for Compression {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            2 => Ok(Compression::Zstd),
            _ => Err(Error::InvalidCompression(value)),
        }
    }
}

/// The parsed fixed-size chunk header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: ChunkType,
    pub num_entries: u16,
    pub num_records: u32,
    pub timestamp: i64,
    pub epoch: u64,
    pub chunk_id: u64,
    pub crc: u32,
    pub data_len: u32,
    pub trailer_len: u32,
}

impl ChunkHeader {
    /// Total on-disk size of the chunk: header plus entries plus trailer.
    pub fn total_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.data_len as u64 + self.trailer_len as u64
    }

    /// The offset of the first record after this chunk.
    pub fn next_offset(&self) -> u64 {
        self.chunk_id + self.num_records as u64
    }

    /// Encode the header into `buf` (exactly [`HEADER_SIZE`] bytes).
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8((MAGIC << 4) | VERSION);
        buf.put_u8(self.chunk_type as u8);
        buf.put_u16(self.num_entries);
        buf.put_u32(self.num_records);
        buf.put_i64(self.timestamp);
        buf.put_u64(self.epoch);
        buf.put_u64(self.chunk_id);
        buf.put_u32(self.crc);
        buf.put_u32(self.data_len);
        buf.put_u32(self.trailer_len);
        buf.put_bytes(0, 12);
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<ChunkHeader> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::TruncatedChunk {
                expected: HEADER_SIZE,
                got: buf.len(),
            });
        }

        let lead = buf[0];
        if lead >> 4 != MAGIC {
            return Err(Error::InvalidChunkHeader(lead));
        }
        if lead & 0x0F != VERSION {
            return Err(Error::UnsupportedVersion(lead & 0x0F));
        }

        Ok(ChunkHeader {
            chunk_type: ChunkType::try_from(buf[1])?,
            num_entries: u16::from_be_bytes([buf[2], buf[3]]),
            num_records: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            timestamp: i64::from_be_bytes(buf[8..16].try_into().expect("slice is 8 bytes")),
            epoch: u64::from_be_bytes(buf[16..24].try_into().expect("slice is 8 bytes")),
            chunk_id: u64::from_be_bytes(buf[24..32].try_into().expect("slice is 8 bytes")),
            crc: u32::from_be_bytes(buf[32..36].try_into().expect("slice is 4 bytes")),
            data_len: u32::from_be_bytes(buf[36..40].try_into().expect("slice is 4 bytes")),
            trailer_len: u32::from_be_bytes(buf[40..44].try_into().expect("slice is 4 bytes")),
        })
    }
}

/// An entry supplied to [`encode_chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// A single opaque record.
    Simple(Bytes),
    /// A producer-encoded group of records, carried opaquely.
    SubBatch {
        compression: Compression,
        num_records: u16,
        data: Bytes,
    },
}

impl Entry {
    /// Number of offsets this entry occupies.
    pub fn num_records(&self) -> u32 {
        match self {
            Entry::Simple(_) => 1,
            Entry::SubBatch { num_records, .. } => *num_records as u32,
        }
    }
}

/// An entry parsed out of a chunk, with its absolute offset assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEntry {
    Simple {
        offset: u64,
        data: Bytes,
    },
    SubBatch {
        first_offset: u64,
        num_records: u16,
        compression: Compression,
        data: Bytes,
    },
}

/// One writer's deduplication state as carried in trailers and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterEntry {
    /// Milliseconds since epoch of the writer's last append.
    pub timestamp: u64,
    /// The writer's last sequence number.
    pub sequence: u64,
}

/// Encode a complete chunk: header, entries, and (for USER chunks with a
/// non-empty writer contribution) the deduplication trailer.
///
/// Entries are emitted in the order supplied. Returns the chunk bytes and
/// the header that was written, so callers can append an index record
/// without re-parsing.
pub fn encode_chunk(
    chunk_type: ChunkType,
    timestamp: i64,
    epoch: u64,
    chunk_id: u64,
    entries: &[Entry],
    writers: &HashMap<Bytes, WriterEntry>,
) -> Result<(Bytes, ChunkHeader)> {
    if entries.len() > u16::MAX as usize {
        return Err(Error::TooManyEntries(entries.len()));
    }

    let mut data = BytesMut::new();
    let mut num_records: u32 = 0;
    for entry in entries {
        match entry {
            Entry::Simple(bytes) => {
                if bytes.len() > MAX_ENTRY_SIZE {
                    return Err(Error::EntryTooLarge(bytes.len()));
                }
                data.put_u32(bytes.len() as u32);
                data.put_slice(bytes);
            }
            Entry::SubBatch {
                compression,
                num_records: batch_records,
                data: bytes,
            } => {
                if bytes.len() > u32::MAX as usize {
                    return Err(Error::EntryTooLarge(bytes.len()));
                }
                data.put_u8(0x80 | ((*compression as u8) << 4));
                data.put_u16(*batch_records);
                data.put_u32(bytes.len() as u32);
                data.put_slice(bytes);
            }
        }
        num_records += entry.num_records();
    }

    let trailer = if chunk_type == ChunkType::User && !writers.is_empty() {
        encode_trailer(writers)?
    } else {
        Bytes::new()
    };

    let header = ChunkHeader {
        chunk_type,
        num_entries: entries.len() as u16,
        num_records,
        timestamp,
        epoch,
        chunk_id,
        crc: crc32fast::hash(&data),
        data_len: data.len() as u32,
        trailer_len: trailer.len() as u32,
    };

    let mut chunk = BytesMut::with_capacity(HEADER_SIZE + data.len() + trailer.len());
    header.encode(&mut chunk);
    chunk.put_slice(&data);
    chunk.put_slice(&trailer);

    Ok((chunk.freeze(), header))
}

/// Verify the header CRC against the entry-region bytes.
pub fn verify_crc(header: &ChunkHeader, data: &[u8]) -> Result<()> {
    if crc32fast::hash(data) != header.crc {
        return Err(Error::CrcMismatch {
            chunk_id: header.chunk_id,
        });
    }
    Ok(())
}

/// Parse the entry region of a chunk into records with absolute offsets.
pub fn parse_entries(header: &ChunkHeader, data: &Bytes) -> Result<Vec<RecordEntry>> {
    let mut entries = Vec::with_capacity(header.num_entries as usize);
    let mut offset = header.chunk_id;
    let mut pos = 0usize;

    for _ in 0..header.num_entries {
        if pos >= data.len() {
            return Err(Error::TruncatedChunk {
                expected: pos + 1,
                got: data.len(),
            });
        }
        if data[pos] & 0x80 == 0 {
            let size = read_u32(data, pos)? as usize;
            pos += 4;
            let payload = slice_checked(data, pos, size)?;
            pos += size;
            entries.push(RecordEntry::Simple {
                offset,
                data: payload,
            });
            offset += 1;
        } else {
            let compression = Compression::try_from((data[pos] >> 4) & 0x07)?;
            if data.len() < pos + 7 {
                return Err(Error::TruncatedChunk {
                    expected: pos + 7,
                    got: data.len(),
                });
            }
            let num_records = u16::from_be_bytes([data[pos + 1], data[pos + 2]]);
            let size = read_u32(data, pos + 3)? as usize;
            pos += 7;
            let payload = slice_checked(data, pos, size)?;
            pos += size;
            entries.push(RecordEntry::SubBatch {
                first_offset: offset,
                num_records,
                compression,
                data: payload,
            });
            offset += num_records as u64;
        }
    }

    Ok(entries)
}

/// Encode the USER-chunk trailer from a writer contribution map.
///
/// Writers are emitted in id order so that identical maps produce identical
/// bytes.
pub fn encode_trailer(writers: &HashMap<Bytes, WriterEntry>) -> Result<Bytes> {
    let mut ids: Vec<&Bytes> = writers.keys().collect();
    ids.sort();

    let mut buf = BytesMut::new();
    for id in ids {
        if id.len() > u8::MAX as usize {
            return Err(Error::IdTooLong(id.len()));
        }
        let entry = &writers[id];
        buf.put_u8(id.len() as u8);
        buf.put_slice(id);
        buf.put_u64(entry.timestamp);
        buf.put_u64(entry.sequence);
    }
    Ok(buf.freeze())
}

/// Parse a USER-chunk trailer into `(writer id, entry)` pairs.
pub fn parse_trailer(trailer: &Bytes) -> Result<Vec<(Bytes, WriterEntry)>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < trailer.len() {
        let id_len = trailer[pos] as usize;
        pos += 1;
        let id = slice_checked(trailer, pos, id_len)?;
        pos += id_len;
        let timestamp = read_u64(trailer, pos)?;
        let sequence = read_u64(trailer, pos + 8)?;
        pos += 16;
        out.push((id, WriterEntry {
            timestamp,
            sequence,
        }));
    }
    Ok(out)
}

/// Encode a tracking map (delta or snapshot body) as `id length | id |
/// offset` records, in id order.
pub fn encode_tracking(tracking: &HashMap<Bytes, u64>) -> Result<Bytes> {
    let mut ids: Vec<&Bytes> = tracking.keys().collect();
    ids.sort();

    let mut buf = BytesMut::new();
    for id in ids {
        if id.len() > u8::MAX as usize {
            return Err(Error::IdTooLong(id.len()));
        }
        buf.put_u8(id.len() as u8);
        buf.put_slice(id);
        buf.put_u64(tracking[id]);
    }
    Ok(buf.freeze())
}

/// Parse a tracking body into `(id, offset)` pairs.
pub fn parse_tracking(body: &Bytes) -> Result<Vec<(Bytes, u64)>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < body.len() {
        let id_len = body[pos] as usize;
        pos += 1;
        let id = slice_checked(body, pos, id_len)?;
        pos += id_len;
        let offset = read_u64(body, pos)?;
        pos += 8;
        out.push((id, offset));
    }
    Ok(out)
}

/// Encode a writer-snapshot body as `id length | id | timestamp | sequence`
/// records, in id order.
pub fn encode_writer_snapshot(writers: &HashMap<Bytes, WriterEntry>) -> Result<Bytes> {
    // Same shape as the trailer.
    encode_trailer(writers)
}

/// Parse a writer-snapshot body into `(id, entry)` pairs.
pub fn parse_writer_snapshot(body: &Bytes) -> Result<Vec<(Bytes, WriterEntry)>> {
    parse_trailer(body)
}

fn read_u32(buf: &Bytes, pos: usize) -> Result<u32> {
    if buf.len() < pos + 4 {
        return Err(Error::TruncatedChunk {
            expected: pos + 4,
            got: buf.len(),
        });
    }
    Ok(u32::from_be_bytes([
        buf[pos],
        buf[pos + 1],
        buf[pos + 2],
        buf[pos + 3],
    ]))
}

fn read_u64(buf: &Bytes, pos: usize) -> Result<u64> {
    if buf.len() < pos + 8 {
        return Err(Error::TruncatedChunk {
            expected: pos + 8,
            got: buf.len(),
        });
    }
    Ok(u64::from_be_bytes(
        buf[pos..pos + 8].try_into().expect("slice is 8 bytes"),
    ))
}

fn slice_checked(buf: &Bytes, pos: usize, len: usize) -> Result<Bytes> {
    if buf.len() < pos + len {
        return Err(Error::TruncatedChunk {
            expected: pos + len,
            got: buf.len(),
        });
    }
    Ok(buf.slice(pos..pos + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_chunk(chunk_id: u64, payloads: &[&str]) -> (Bytes, ChunkHeader) {
        let entries: Vec<Entry> = payloads
            .iter()
            .map(|p| Entry::Simple(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        encode_chunk(
            ChunkType::User,
            1_700_000_000_000,
            1,
            chunk_id,
            &entries,
            &HashMap::new(),
        )
        .unwrap()
    }

    // ---------------------------------------------------------------
    // Header encode/parse round-trip
    // ---------------------------------------------------------------

    #[test]
    fn test_header_roundtrip() {
        let header = ChunkHeader {
            chunk_type: ChunkType::User,
            num_entries: 3,
            num_records: 7,
            timestamp: 1_700_000_000_123,
            epoch: 42,
            chunk_id: 9000,
            crc: 0xDEADBEEF,
            data_len: 512,
            trailer_len: 25,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let parsed = ChunkHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_reencode_identical_bytes() {
        let (chunk, header) = user_chunk(5, &["hello"]);
        let parsed = ChunkHeader::parse(&chunk).unwrap();
        let mut reencoded = BytesMut::new();
        parsed.encode(&mut reencoded);
        assert_eq!(&reencoded[..], &chunk[..HEADER_SIZE]);
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_leading_byte() {
        let (chunk, _) = user_chunk(0, &["x"]);
        assert_eq!(chunk[0], 0x51);
    }

    #[test]
    fn test_header_bad_magic_nibble() {
        let (chunk, _) = user_chunk(0, &["x"]);
        let mut bad = chunk.to_vec();
        bad[0] = 0x31;
        let err = ChunkHeader::parse(&bad).unwrap_err();
        assert!(matches!(err, Error::InvalidChunkHeader(0x31)));
    }

    #[test]
    fn test_header_bad_version_nibble() {
        let (chunk, _) = user_chunk(0, &["x"]);
        let mut bad = chunk.to_vec();
        bad[0] = 0x52;
        let err = ChunkHeader::parse(&bad).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(2)));
    }

    #[test]
    fn test_header_too_short() {
        let err = ChunkHeader::parse(&[0x51; 20]).unwrap_err();
        assert!(matches!(err, Error::TruncatedChunk { .. }));
    }

    #[test]
    fn test_header_invalid_chunk_type() {
        let (chunk, _) = user_chunk(0, &["x"]);
        let mut bad = chunk.to_vec();
        bad[1] = 9;
        let err = ChunkHeader::parse(&bad).unwrap_err();
        assert!(matches!(err, Error::InvalidChunkType(9)));
    }

    // ---------------------------------------------------------------
    // Chunk type / compression tags
    // ---------------------------------------------------------------

    #[test]
    fn test_chunk_type_tags() {
        for (tag, ty) in [
            (0u8, ChunkType::User),
            (1, ChunkType::TrackingDelta),
            (2, ChunkType::TrackingSnapshot),
            (3, ChunkType::WriterSnapshot),
        ] {
            assert_eq!(ChunkType::try_from(tag).unwrap(), ty);
            assert_eq!(ty as u8, tag);
        }
        assert!(ChunkType::try_from(4).is_err());
    }

    #[test]
    fn test_compression_tags() {
        for (tag, c) in [
            (0u8, Compression::None),
            (1, Compression::Lz4),
            (2, Compression::Zstd),
        ] {
            assert_eq!(Compression::try_from(tag).unwrap(), c);
        }
        assert!(Compression::try_from(7).is_err());
    }

    // ---------------------------------------------------------------
    // Entry encode/parse
    // ---------------------------------------------------------------

    #[test]
    fn test_simple_entries_roundtrip() {
        let (chunk, header) = user_chunk(100, &["a", "bb", "ccc"]);
        assert_eq!(header.num_entries, 3);
        assert_eq!(header.num_records, 3);

        let data = Bytes::copy_from_slice(
            &chunk[HEADER_SIZE..HEADER_SIZE + header.data_len as usize],
        );
        let records = parse_entries(&header, &data).unwrap();
        assert_eq!(
            records,
            vec![
                RecordEntry::Simple {
                    offset: 100,
                    data: Bytes::from("a")
                },
                RecordEntry::Simple {
                    offset: 101,
                    data: Bytes::from("bb")
                },
                RecordEntry::Simple {
                    offset: 102,
                    data: Bytes::from("ccc")
                },
            ]
        );
    }

    #[test]
    fn test_sub_batch_roundtrip() {
        let entries = vec![
            Entry::Simple(Bytes::from("lead")),
            Entry::SubBatch {
                compression: Compression::Lz4,
                num_records: 5,
                data: Bytes::from("opaque-compressed-bytes"),
            },
            Entry::Simple(Bytes::from("tail")),
        ];
        let (chunk, header) =
            encode_chunk(ChunkType::User, 0, 1, 10, &entries, &HashMap::new()).unwrap();
        assert_eq!(header.num_records, 7);

        let data = Bytes::copy_from_slice(
            &chunk[HEADER_SIZE..HEADER_SIZE + header.data_len as usize],
        );
        let records = parse_entries(&header, &data).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[1],
            RecordEntry::SubBatch {
                first_offset: 11,
                num_records: 5,
                compression: Compression::Lz4,
                data: Bytes::from("opaque-compressed-bytes"),
            }
        );
        // The sub-batch occupies five offsets.
        assert_eq!(
            records[2],
            RecordEntry::Simple {
                offset: 16,
                data: Bytes::from("tail")
            }
        );
    }

    #[test]
    fn test_empty_payload_entry() {
        let (chunk, header) = user_chunk(0, &[""]);
        let data = Bytes::copy_from_slice(
            &chunk[HEADER_SIZE..HEADER_SIZE + header.data_len as usize],
        );
        let records = parse_entries(&header, &data).unwrap();
        assert_eq!(
            records,
            vec![RecordEntry::Simple {
                offset: 0,
                data: Bytes::new()
            }]
        );
    }

    #[test]
    fn test_parse_entries_truncated_data() {
        let (chunk, header) = user_chunk(0, &["hello world"]);
        let data = Bytes::copy_from_slice(&chunk[HEADER_SIZE..HEADER_SIZE + 6]);
        assert!(matches!(
            parse_entries(&header, &data),
            Err(Error::TruncatedChunk { .. })
        ));
    }

    // ---------------------------------------------------------------
    // CRC
    // ---------------------------------------------------------------

    #[test]
    fn test_crc_valid() {
        let (chunk, header) = user_chunk(0, &["payload"]);
        let data = &chunk[HEADER_SIZE..HEADER_SIZE + header.data_len as usize];
        verify_crc(&header, data).unwrap();
    }

    #[test]
    fn test_crc_detects_corruption() {
        let (chunk, header) = user_chunk(7, &["payload"]);
        let mut data = chunk[HEADER_SIZE..HEADER_SIZE + header.data_len as usize].to_vec();
        data[5] ^= 0xFF;
        let err = verify_crc(&header, &data).unwrap_err();
        assert!(matches!(err, Error::CrcMismatch { chunk_id: 7 }));
    }

    // ---------------------------------------------------------------
    // Trailer
    // ---------------------------------------------------------------

    #[test]
    fn test_trailer_roundtrip() {
        let mut writers = HashMap::new();
        writers.insert(
            Bytes::from("writer-a"),
            WriterEntry {
                timestamp: 111,
                sequence: 5,
            },
        );
        writers.insert(
            Bytes::from("writer-b"),
            WriterEntry {
                timestamp: 222,
                sequence: 9,
            },
        );

        let trailer = encode_trailer(&writers).unwrap();
        let parsed = parse_trailer(&trailer).unwrap();
        assert_eq!(parsed.len(), 2);
        // Emitted in id order.
        assert_eq!(parsed[0].0, Bytes::from("writer-a"));
        assert_eq!(parsed[0].1.sequence, 5);
        assert_eq!(parsed[1].0, Bytes::from("writer-b"));
        assert_eq!(parsed[1].1.timestamp, 222);
    }

    #[test]
    fn test_user_chunk_carries_trailer() {
        let mut writers = HashMap::new();
        writers.insert(
            Bytes::from("w1"),
            WriterEntry {
                timestamp: 1,
                sequence: 2,
            },
        );
        let (chunk, header) = encode_chunk(
            ChunkType::User,
            0,
            1,
            0,
            &[Entry::Simple(Bytes::from("x"))],
            &writers,
        )
        .unwrap();
        assert_eq!(header.trailer_len as usize, 1 + 2 + 8 + 8);
        let trailer = Bytes::copy_from_slice(
            &chunk[HEADER_SIZE + header.data_len as usize..],
        );
        let parsed = parse_trailer(&trailer).unwrap();
        assert_eq!(parsed[0].0, Bytes::from("w1"));
    }

    #[test]
    fn test_non_user_chunk_has_no_trailer() {
        let mut writers = HashMap::new();
        writers.insert(
            Bytes::from("w1"),
            WriterEntry {
                timestamp: 1,
                sequence: 2,
            },
        );
        let (_, header) = encode_chunk(
            ChunkType::TrackingDelta,
            0,
            1,
            0,
            &[Entry::Simple(Bytes::from("x"))],
            &writers,
        )
        .unwrap();
        assert_eq!(header.trailer_len, 0);
    }

    // ---------------------------------------------------------------
    // Tracking / writer-snapshot bodies
    // ---------------------------------------------------------------

    #[test]
    fn test_tracking_body_roundtrip() {
        let mut tracking = HashMap::new();
        tracking.insert(Bytes::from("consumer-1"), 100u64);
        tracking.insert(Bytes::from("consumer-2"), 250u64);

        let body = encode_tracking(&tracking).unwrap();
        let parsed = parse_tracking(&body).unwrap();
        assert_eq!(
            parsed,
            vec![
                (Bytes::from("consumer-1"), 100),
                (Bytes::from("consumer-2"), 250),
            ]
        );
    }

    #[test]
    fn test_tracking_body_empty() {
        let body = encode_tracking(&HashMap::new()).unwrap();
        assert!(body.is_empty());
        assert!(parse_tracking(&body).unwrap().is_empty());
    }

    #[test]
    fn test_writer_snapshot_roundtrip() {
        let mut writers = HashMap::new();
        writers.insert(
            Bytes::from("w"),
            WriterEntry {
                timestamp: 9,
                sequence: 77,
            },
        );
        let body = encode_writer_snapshot(&writers).unwrap();
        let parsed = parse_writer_snapshot(&body).unwrap();
        assert_eq!(parsed[0].1.sequence, 77);
    }

    #[test]
    fn test_id_too_long_rejected() {
        let mut tracking = HashMap::new();
        tracking.insert(Bytes::from(vec![b'x'; 300]), 1u64);
        assert!(matches!(
            encode_tracking(&tracking),
            Err(Error::IdTooLong(300))
        ));
    }

    // ---------------------------------------------------------------
    // Offset accounting
    // ---------------------------------------------------------------

    #[test]
    fn test_next_offset() {
        let (_, header) = user_chunk(10, &["a", "b", "c"]);
        assert_eq!(header.next_offset(), 13);
    }

    #[test]
    fn test_total_size_matches_encoded_length() {
        let (chunk, header) = user_chunk(0, &["some", "payload", "bytes"]);
        assert_eq!(header.total_size(), chunk.len() as u64);
    }
}
