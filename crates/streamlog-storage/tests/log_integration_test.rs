//! Log Integration Tests
//!
//! End-to-end scenarios across the writer, readers, retention, and the
//! replica streaming path, against real files and real sockets.

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use streamlog_core::{ChunkHeader, ChunkType, Entry, RecordEntry, WriterEntry, HEADER_SIZE};
use streamlog_storage::{
    Log, LogConfig, LogReader, ReplicaReader, ReplicaReaderConfig, RetentionSpec, TrackingKind,
    TrackingMap,
};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

const FILE_HEADER_SIZE: usize = 8;

fn config(dir: &Path, name: &str, epoch: u64) -> LogConfig {
    LogConfig {
        dir: dir.to_path_buf(),
        name: name.to_string(),
        epoch,
        ..Default::default()
    }
}

fn entries(payloads: &[&str]) -> Vec<Entry> {
    payloads
        .iter()
        .map(|p| Entry::Simple(Bytes::copy_from_slice(p.as_bytes())))
        .collect()
}

/// Write-roll-reopen: everything a restart must restore comes back.
#[tokio::test]
async fn test_write_roll_reopen_recover() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path(), "reopen", 1);
    cfg.max_segment_size = 512;

    {
        let mut log = Log::init(cfg.clone()).await.unwrap();
        log.write_tracking(
            TrackingMap::from([(Bytes::from("consumer-a"), 0u64)]),
            TrackingKind::Snapshot,
        )
        .await
        .unwrap();

        let mut writers = HashMap::new();
        writers.insert(
            Bytes::from("producer-1"),
            WriterEntry {
                timestamp: 1_000,
                sequence: 42,
            },
        );
        // Large enough to force a rollover before the last write.
        log.write_with_writers(entries(&[&"x".repeat(600)]), &writers)
            .await
            .unwrap();
        log.write(entries(&["after-roll"])).await.unwrap();
    }

    let mut log = Log::init(cfg.clone()).await.unwrap();
    let tail = log.tail_info();
    assert_eq!(tail.next_offset, log.next_offset());
    assert_eq!(
        log.tracking().get(&Bytes::from("consumer-a")),
        Some(&0u64)
    );
    assert_eq!(
        log.writers().get(&Bytes::from("producer-1")).unwrap().sequence,
        42
    );

    // The log keeps going where it left off, and a reader sees one
    // uninterrupted stream.
    let resumed_at = log.next_offset();
    log.write(entries(&["after-reopen"])).await.unwrap();

    let mut reader = LogReader::init_data(cfg.log_dir(), 0, None).await.unwrap();
    let mut next_expected = 0u64;
    let mut payload_offsets = Vec::new();
    while let Some((header, records)) = reader.read_chunk_parsed().await.unwrap() {
        // Chunk offsets are contiguous with their predecessor.
        assert_eq!(header.chunk_id, next_expected);
        next_expected = header.next_offset();
        if header.chunk_type == ChunkType::User {
            for record in &records {
                if let RecordEntry::Simple { offset, .. } = record {
                    payload_offsets.push(*offset);
                }
            }
        }
    }
    assert_eq!(next_expected, log.next_offset());
    assert!(payload_offsets.contains(&resumed_at));
}

/// Index faithfulness: every index record points at a chunk header with
/// exactly the recorded id, timestamp, and epoch.
#[tokio::test]
async fn test_index_records_match_chunk_headers() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path(), "index-faith", 3);
    let mut log = Log::init(cfg.clone()).await.unwrap();
    log.write(entries(&["a", "b"])).await.unwrap();
    log.write(entries(&["c"])).await.unwrap();
    log.write_tracking(
        TrackingMap::from([(Bytes::from("t"), 1u64)]),
        TrackingKind::Delta,
    )
    .await
    .unwrap();

    let segment = tokio::fs::read(cfg.log_dir().join("00000000000000000000.segment"))
        .await
        .unwrap();
    let index = tokio::fs::read(cfg.log_dir().join("00000000000000000000.index"))
        .await
        .unwrap();

    assert_eq!(&index[0..4], b"OSII");
    assert_eq!(&segment[0..4], b"OSIL");

    let records = (index.len() - FILE_HEADER_SIZE) / 28;
    assert_eq!(records, 3);
    for i in 0..records {
        let at = FILE_HEADER_SIZE + i * 28;
        let chunk_id = u64::from_be_bytes(index[at..at + 8].try_into().unwrap());
        let timestamp = i64::from_be_bytes(index[at + 8..at + 16].try_into().unwrap());
        let epoch = u64::from_be_bytes(index[at + 16..at + 24].try_into().unwrap());
        let pos = u32::from_be_bytes(index[at + 24..at + 28].try_into().unwrap()) as usize;

        let header = ChunkHeader::parse(&segment[pos..]).unwrap();
        assert_eq!(header.chunk_id, chunk_id);
        assert_eq!(header.timestamp, timestamp);
        assert_eq!(header.epoch, epoch);
    }
}

/// Append-only: two reads of the same range return identical bytes.
#[tokio::test]
async fn test_reads_are_repeatable() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path(), "repeatable", 1);
    let mut log = Log::init(cfg.clone()).await.unwrap();
    log.write(entries(&["one", "two"])).await.unwrap();

    let mut first_pass = Vec::new();
    let mut reader = LogReader::init_data(cfg.log_dir(), 0, None).await.unwrap();
    while let Some((_, bytes)) = reader.read_chunk().await.unwrap() {
        first_pass.push(bytes);
    }

    log.write(entries(&["three"])).await.unwrap();

    let mut second_pass = Vec::new();
    let mut reader = LogReader::init_data(cfg.log_dir(), 0, None).await.unwrap();
    while let Some((_, bytes)) = reader.read_chunk().await.unwrap() {
        second_pass.push(bytes);
    }

    assert_eq!(second_pass.len(), first_pass.len() + 1);
    for (a, b) in first_pass.iter().zip(second_pass.iter()) {
        assert_eq!(a, b);
    }
}

/// Retention with an in-flight reader: the oldest segment is deleted while
/// a reader is positioned inside it; the reader finishes the deleted
/// segment through its open handle and crosses into the survivors.
#[tokio::test]
async fn test_retention_with_inflight_reader() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path(), "retention-reader", 1);
    cfg.max_segment_size = 400;
    cfg.retention = vec![RetentionSpec::MaxBytes { bytes: 900 }];
    let mut log = Log::init(cfg.clone()).await.unwrap();

    // Two user chunks fill the first segment.
    log.write(entries(&[&"a".repeat(150)])).await.unwrap();
    log.write(entries(&[&"b".repeat(150)])).await.unwrap();

    // Reader attaches before anything is deleted.
    let mut reader = LogReader::init_data(cfg.log_dir(), 0, None).await.unwrap();
    let (header, _) = reader.read_chunk_parsed().await.unwrap().unwrap();
    assert_eq!(header.chunk_id, 0);

    // Keep writing; the rollovers run retention, which eventually deletes
    // the first segment out from under the reader.
    log.write(entries(&[&"c".repeat(150)])).await.unwrap();
    log.write(entries(&[&"d".repeat(150)])).await.unwrap();
    log.write(entries(&[&"e".repeat(150)])).await.unwrap();

    assert!(
        log.first_offset() > 0,
        "retention should have advanced the first offset"
    );
    assert!(!cfg
        .log_dir()
        .join("00000000000000000000.segment")
        .exists());

    // The reader drains the rest of the log without surfacing an error.
    let mut user_chunks = vec![0u64];
    while let Some((header, _)) = reader.read_chunk_parsed().await.unwrap() {
        if header.chunk_type == ChunkType::User {
            user_chunks.push(header.chunk_id);
        }
    }
    assert_eq!(reader.next_offset(), log.next_offset());
    // All five user chunks were observed, in order.
    assert_eq!(user_chunks.len(), 5);
    assert!(user_chunks.windows(2).all(|w| w[0] < w[1]));
}

/// Replica streaming end to end: the follower pumps chunks over a real
/// socket, the acceptor reconstructs them from the byte stream, and the
/// replica's segment file comes out bit-identical to the leader's.
#[tokio::test]
async fn test_replica_streams_to_acceptor() {
    let leader_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();
    let leader_cfg = config(leader_dir.path(), "repl-leader", 1);
    let replica_cfg = config(replica_dir.path(), "repl-replica", 1);

    let mut leader = Log::init(leader_cfg.clone()).await.unwrap();
    leader.write(entries(&["alpha", "beta"])).await.unwrap();
    leader.write(entries(&["gamma"])).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let follower = ReplicaReader::connect(ReplicaReaderConfig {
        dir: leader_cfg.log_dir(),
        name: "repl-follower".to_string(),
        replica_addr: addr,
        start_offset: 0,
        last_chunk: None,
    })
    .await
    .unwrap();
    let wake = follower.wake_handle();
    let task = tokio::spawn(follower.run());

    let (mut socket, _) = listener.accept().await.unwrap();
    let mut acceptor = Log::init_acceptor(replica_cfg.clone(), &[]).await.unwrap();

    // The wire carries chunks verbatim with no framing; split them back
    // apart by parsing headers out of the stream.
    let mut buffer: Vec<u8> = Vec::new();
    let mut accepted = 0usize;
    let mut woke = false;
    let mut chunk = [0u8; 4096];
    while accepted < 3 {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "socket closed before all chunks arrived");
        buffer.extend_from_slice(&chunk[..n]);

        loop {
            if buffer.len() < HEADER_SIZE {
                break;
            }
            let header = ChunkHeader::parse(&buffer).unwrap();
            let total = header.total_size() as usize;
            if buffer.len() < total {
                break;
            }
            acceptor.accept_chunk(&buffer[..total]).await.unwrap();
            buffer.drain(..total);
            accepted += 1;
        }

        if accepted == 2 && !woke {
            // More data lands after the initial drain; poke the follower.
            leader.write(entries(&["delta"])).await.unwrap();
            wake.notify_one();
            woke = true;
        }
    }

    assert_eq!(acceptor.next_offset(), leader.next_offset());
    assert_eq!(
        acceptor.tail_info().last_chunk,
        leader.tail_info().last_chunk
    );

    let leader_bytes = tokio::fs::read(
        leader_cfg.log_dir().join("00000000000000000000.segment"),
    )
    .await
    .unwrap();
    let replica_bytes = tokio::fs::read(
        replica_cfg.log_dir().join("00000000000000000000.segment"),
    )
    .await
    .unwrap();
    assert_eq!(leader_bytes, replica_bytes);

    task.abort();
}

/// A promoted replica carries the leader's writer-dedup state, received
/// through the snapshot chunks streamed at rollover.
#[tokio::test]
async fn test_acceptor_recovers_state_from_streamed_snapshots() {
    let leader_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();
    let mut leader_cfg = config(leader_dir.path(), "snap-leader", 1);
    leader_cfg.max_segment_size = 512;
    let replica_cfg = config(replica_dir.path(), "snap-replica", 1);

    let mut leader = Log::init(leader_cfg.clone()).await.unwrap();
    leader
        .write_tracking(
            TrackingMap::from([(Bytes::from("consumer"), 0u64)]),
            TrackingKind::Snapshot,
        )
        .await
        .unwrap();
    let mut writers = HashMap::new();
    writers.insert(
        Bytes::from("producer"),
        WriterEntry {
            timestamp: 7,
            sequence: 99,
        },
    );
    leader
        .write_with_writers(entries(&[&"x".repeat(600)]), &writers)
        .await
        .unwrap();
    // Rolls; the new segment opens with the snapshot pair.
    leader.write(entries(&["tip"])).await.unwrap();

    // Replicate every chunk by reading the leader's log directly.
    let mut acceptor = Log::init_acceptor(replica_cfg.clone(), &[]).await.unwrap();
    let mut reader = LogReader::init_data(leader_cfg.log_dir(), 0, None)
        .await
        .unwrap();
    while let Some((_, bytes)) = reader.read_chunk().await.unwrap() {
        acceptor.accept_chunk(&bytes).await.unwrap();
    }
    assert_eq!(acceptor.next_offset(), leader.next_offset());
    drop(acceptor);

    // Promotion: reopen the replica as a writer. Recovery reads the newest
    // segment, whose head is the streamed snapshot pair.
    let promoted = Log::init(config(replica_dir.path(), "snap-replica", 2))
        .await
        .unwrap();
    assert_eq!(
        promoted.tracking().get(&Bytes::from("consumer")),
        Some(&0u64)
    );
    assert_eq!(
        promoted.writers().get(&Bytes::from("producer")).unwrap().sequence,
        99
    );
}
