//! Event log: one time-ordered stream (messages, audit logs)
//!
//! Composes a [`TimeIndex`] with a [`BlockStore`]:
//!
//! ```text
//! Write Path:
//!   append → write chain → BlockStore::add_entry → TimeIndex
//!
//! Read Path:
//!   query → wait for earlier writes → read gate → TimeIndex → block scans
//! ```
//!
//! On disk a stream is a directory holding `index.idx` and `blocks/<n>.blk`.

use crate::index::TimeIndex;
use crate::storage::block::BlockStore;
use crate::storage::error::StorageResult;
use crate::storage::sync::{ReadGate, WriteChain};
use crate::storage::types::{Entry, LogStats};
use futures_util::{stream, StreamExt, TryStreamExt};
use std::future::Future;
use std::path::{Path, PathBuf};

/// Default entries per block
pub const DEFAULT_BLOCK_CAPACITY: u64 = 1000;

/// Default number of reads allowed in flight
pub const DEFAULT_READ_LIMIT: usize = 20;

/// Blocks scanned at once by a single range query
const BLOCK_SCAN_CONCURRENCY: usize = 4;

const INDEX_FILE: &str = "index.idx";
const BLOCK_DIR: &str = "blocks";
const BLOCK_EXTENSION: &str = "blk";

/// A single event stream
pub struct EventLog {
    dir: PathBuf,
    index: TimeIndex,
    blocks: BlockStore,
    writes: WriteChain,
    reads: ReadGate,
}

impl EventLog {
    /// Open (creating if needed) the stream stored in `dir`
    pub async fn open(
        dir: impl Into<PathBuf>,
        block_capacity: u64,
        read_limit: usize,
    ) -> StorageResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(dir.join(BLOCK_DIR)).await?;

        let index = TimeIndex::new(dir.join(INDEX_FILE));
        index.create(false).await?;
        let header = index.header().await?;

        tracing::info!(
            "Opened event log {:?} ({} blocks, range [{}, {}])",
            dir,
            header.entry_count,
            header.lowest_timestamp,
            header.highest_timestamp
        );

        Ok(Self {
            blocks: BlockStore::new(dir.join(BLOCK_DIR), BLOCK_EXTENSION, block_capacity),
            index,
            writes: WriteChain::new(),
            reads: ReadGate::new(read_limit),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index(&self) -> &TimeIndex {
        &self.index
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn read_gate(&self) -> &ReadGate {
        &self.reads
    }

    /// Append an entry. Timestamps must not go backwards.
    pub async fn append(&self, timestamp: i64, payload: impl Into<Vec<u8>>) -> StorageResult<()> {
        self.append_entry(Entry::new(timestamp, payload)).await
    }

    pub async fn append_entry(&self, entry: Entry) -> StorageResult<()> {
        self.writes
            .run(self.blocks.add_entry(&self.index, entry))
            .await
    }

    /// Run a read after every write queued before it, within the read limit
    async fn read<F, T>(&self, read: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        self.writes.barrier().await;
        self.reads.run(read).await
    }

    /// All live entries with timestamps in `[start, end]`, oldest first
    pub async fn range_query(&self, start: i64, end: i64) -> StorageResult<Vec<Entry>> {
        self.read(async {
            let blocks = self.index.blocks(start, end).await?;
            // Results come back in block order
            let chunks: Vec<Vec<Entry>> = stream::iter(blocks)
                .map(|block| self.blocks.entries_between(block, start, end))
                .buffered(BLOCK_SCAN_CONCURRENCY)
                .try_collect()
                .await?;
            Ok(chunks.into_iter().flatten().collect())
        })
        .await
    }

    /// Up to `count` live entries next to `timestamp`, oldest first.
    ///
    /// `preceding` gathers the latest entries at or before `timestamp`;
    /// otherwise the earliest entries at or after it.
    pub async fn near_query(
        &self,
        timestamp: i64,
        count: usize,
        preceding: bool,
    ) -> StorageResult<Vec<Entry>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        self.read(async {
            if preceding {
                self.gather_preceding(timestamp, count).await
            } else {
                self.gather_following(timestamp, count).await
            }
        })
        .await
    }

    async fn gather_preceding(&self, timestamp: i64, count: usize) -> StorageResult<Vec<Entry>> {
        let Some(last) = self.index.last_position_until(timestamp).await? else {
            return Ok(Vec::new());
        };

        // Newest block first; each chunk is in file order
        let mut chunks: Vec<Vec<Entry>> = Vec::new();
        let mut gathered = 0;
        for position in (0..=last).rev() {
            let block = self.index.entry_at(position).await?.block_number;
            let positions = self
                .blocks
                .entries_near(block, timestamp, count - gathered, true)
                .await?;
            let entries = self.blocks.entries_from_positions(block, &positions).await?;
            gathered += entries.len();
            chunks.push(entries);
            if gathered >= count {
                break;
            }
        }
        Ok(chunks.into_iter().rev().flatten().collect())
    }

    async fn gather_following(&self, timestamp: i64, count: usize) -> StorageResult<Vec<Entry>> {
        let Some(first) = self.index.first_position_from(timestamp).await? else {
            return Ok(Vec::new());
        };
        let total = self.index.header().await?.entry_count;

        let mut entries = Vec::new();
        for position in first..total {
            let block = self.index.entry_at(position).await?.block_number;
            let positions = self
                .blocks
                .entries_near(block, timestamp, count - entries.len(), false)
                .await?;
            entries.extend(self.blocks.entries_from_positions(block, &positions).await?);
            if entries.len() >= count {
                break;
            }
        }
        Ok(entries)
    }

    /// Tombstone every entry in `[start, end]`; returns how many were wiped
    pub async fn wipe(&self, start: i64, end: i64) -> StorageResult<u64> {
        self.writes
            .run(async {
                let mut wiped = 0;
                for block in self.index.blocks(start, end).await? {
                    wiped += self.blocks.wipe_entries(block, start, end).await?;
                }
                tracing::debug!("Wiped {} entries in [{}, {}] from {:?}", wiped, start, end, self.dir);
                Ok(wiped)
            })
            .await
    }

    pub async fn stats(&self) -> StorageResult<LogStats> {
        let header = self.index.header().await?;
        Ok(LogStats {
            block_count: header.entry_count,
            lowest_timestamp: header.lowest_timestamp,
            highest_timestamp: header.highest_timestamp,
            queued_writes: self.writes.queued(),
            reads_in_flight: self.reads.in_flight(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::error::StorageError;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn create_test_log(capacity: u64) -> (EventLog, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path().join("messages"), capacity, DEFAULT_READ_LIMIT)
            .await
            .unwrap();
        (log, dir)
    }

    fn timestamps(entries: &[Entry]) -> Vec<i64> {
        entries.iter().map(|e| e.timestamp).collect()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (log, _dir) = create_test_log(10).await;
        log.append(5, "hello").await.unwrap();
        log.append(7, vec![0u8, 255, 1]).await.unwrap();

        assert_eq!(log.range_query(5, 5).await.unwrap(), vec![Entry::new(5, "hello")]);
        assert_eq!(
            log.range_query(7, 7).await.unwrap(),
            vec![Entry::new(7, vec![0u8, 255, 1])]
        );
        assert!(log.range_query(6, 6).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_leaves_log_unchanged() {
        let (log, _dir) = create_test_log(10).await;
        log.append(10, "a").await.unwrap();
        let before = log.stats().await.unwrap();

        let err = log.append(9, "b").await.unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrder { timestamp: 9, highest: 10 }));

        assert_eq!(log.stats().await.unwrap(), before);
        assert_eq!(log.range_query(0, 100).await.unwrap().len(), 1);
        assert_eq!(log.blocks().header(1).await.unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_rollover() {
        let (log, _dir) = create_test_log(4).await;
        for ts in 0..5 {
            log.append(ts, format!("m{}", ts)).await.unwrap();
        }

        let stats = log.stats().await.unwrap();
        assert_eq!(stats.block_count, 2);
        let first = log.blocks().header(1).await.unwrap();
        assert!(first.is_full);
        assert_eq!(first.entry_count, 4);
        assert_eq!(log.blocks().header(2).await.unwrap().entry_count, 1);
        assert_eq!(timestamps(&log.range_query(0, 10).await.unwrap()), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_example_scenario() {
        let (log, _dir) = create_test_log(3).await;
        for ts in [100, 100, 100, 200] {
            log.append(ts, format!("at {}", ts)).await.unwrap();
        }

        assert_eq!(log.blocks().header(1).await.unwrap().entry_count, 3);
        assert_eq!(log.blocks().header(2).await.unwrap().entry_count, 1);
        assert_eq!(
            log.range_query(150, 250).await.unwrap(),
            vec![Entry::new(200, "at 200")]
        );
        assert_eq!(log.index().blocks(150, 250).await.unwrap(), vec![2]);
        assert_eq!(log.range_query(100, 100).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_back_to_back_appends_are_serialized() {
        let (log, _dir) = create_test_log(2).await;
        let (a, b, c) = tokio::join!(log.append(1, "p1"), log.append(2, "p2"), log.append(3, "p3"));
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let all = log.range_query(0, 10).await.unwrap();
        assert_eq!(
            all,
            vec![Entry::new(1, "p1"), Entry::new(2, "p2"), Entry::new(3, "p3")]
        );
        assert_eq!(log.stats().await.unwrap().block_count, 2);
    }

    #[tokio::test]
    async fn test_read_waits_for_earlier_write() {
        let (log, _dir) = create_test_log(10).await;
        let (_, found) = tokio::join!(log.append(42, "x"), log.range_query(0, 100));
        assert_eq!(found.unwrap(), vec![Entry::new(42, "x")]);
    }

    #[tokio::test]
    async fn test_near_queries_cross_blocks() {
        let (log, _dir) = create_test_log(3).await;
        for ts in 1..=10 {
            log.append(ts * 10, format!("{}", ts * 10)).await.unwrap();
        }

        let before = log.near_query(70, 5, true).await.unwrap();
        assert_eq!(timestamps(&before), vec![30, 40, 50, 60, 70]);

        let between = log.near_query(75, 2, true).await.unwrap();
        assert_eq!(timestamps(&between), vec![60, 70]);

        let after = log.near_query(35, 4, false).await.unwrap();
        assert_eq!(timestamps(&after), vec![40, 50, 60, 70]);

        let tail = log.near_query(90, 10, false).await.unwrap();
        assert_eq!(timestamps(&tail), vec![90, 100]);

        assert!(log.near_query(5, 3, true).await.unwrap().is_empty());
        assert!(log.near_query(101, 3, false).await.unwrap().is_empty());
        assert!(log.near_query(50, 0, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_near_query_without_limit() {
        let (log, _dir) = create_test_log(3).await;
        for ts in 1..=7 {
            log.append(ts, format!("m{}", ts)).await.unwrap();
        }
        log.wipe(4, 4).await.unwrap();

        let before = log.near_query(5, usize::MAX, true).await.unwrap();
        assert_eq!(timestamps(&before), vec![1, 2, 3, 5]);

        let after = log.near_query(0, usize::MAX, false).await.unwrap();
        assert_eq!(timestamps(&after), vec![1, 2, 3, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_wipe() {
        let (log, _dir) = create_test_log(3).await;
        for ts in 1..=7 {
            log.append(ts, "secret").await.unwrap();
        }

        assert_eq!(log.wipe(3, 5).await.unwrap(), 3);
        assert_eq!(
            timestamps(&log.range_query(0, 10).await.unwrap()),
            vec![1, 2, 6, 7]
        );
        assert_eq!(timestamps(&log.near_query(6, 3, true).await.unwrap()), vec![1, 2, 6]);

        // Appends continue after the last live timestamp
        log.append(8, "new").await.unwrap();
        assert_eq!(log.wipe(100, 200).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reads_respect_limit() {
        let dir = tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path().join("logs"), 5, 3).await.unwrap());
        for ts in 0..20 {
            log.append(ts, "event").await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move { log.range_query(i, i + 5).await }));
        }
        for handle in handles {
            assert!(!handle.await.unwrap().unwrap().is_empty());
        }

        assert_eq!(log.read_gate().limit(), 3);
        assert!(log.read_gate().peak() <= 3);
        assert_eq!(log.stats().await.unwrap().reads_in_flight, 0);
    }

    #[tokio::test]
    async fn test_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages");
        {
            let log = EventLog::open(&path, 2, DEFAULT_READ_LIMIT).await.unwrap();
            for ts in [1, 2, 3] {
                log.append(ts, "before").await.unwrap();
            }
        }

        let log = EventLog::open(&path, 2, DEFAULT_READ_LIMIT).await.unwrap();
        assert!(log.append(2, "stale").await.is_err());
        log.append(4, "after").await.unwrap();
        log.append(5, "after").await.unwrap();

        assert_eq!(log.stats().await.unwrap().block_count, 3);
        assert_eq!(timestamps(&log.range_query(0, 10).await.unwrap()), vec![1, 2, 3, 4, 5]);
    }
}
