pub mod chunk;
pub mod error;

pub use chunk::{
    encode_chunk, encode_tracking, encode_trailer, encode_writer_snapshot, parse_entries,
    parse_tracking, parse_trailer, parse_writer_snapshot, verify_crc, ChunkHeader, ChunkType,
    Compression, Entry, RecordEntry, WriterEntry, HEADER_SIZE,
};
pub use error::{Error, Result};
