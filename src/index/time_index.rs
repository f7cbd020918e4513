//! Time Index - sparse directory of block time ranges
//!
//! One entry per block, sorted by the block's lowest timestamp and never
//! overlapping. Lookups binary-search the entry array directly on disk.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (24 bytes)                       │
//! │   entry_count: u64                      │
//! │   lowest_timestamp: i64                 │
//! │   highest_timestamp: i64                │
//! ├─────────────────────────────────────────┤
//! │ ENTRIES (24 bytes each)                 │
//! │   block_lowest_timestamp: i64           │
//! │   block_highest_timestamp: i64          │
//! │   block_number: u64                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! An entry is always written before the header that counts it, so a crash
//! between the two leaves an orphan that the next `add_block` overwrites.

use crate::storage::codec::{get_i64, get_u64, put_i64, put_u64};
use crate::storage::file::{exists, StoreFile};
use crate::storage::{StorageError, StorageResult};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Header size in bytes
pub const INDEX_HEADER_SIZE: u64 = 24;

/// Entry size in bytes
pub const INDEX_ENTRY_SIZE: u64 = 24;

/// Entries fetched per disk read during searches
const WINDOW_ENTRIES: u64 = 64;

/// Index file header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexHeader {
    pub entry_count: u64,
    pub lowest_timestamp: i64,
    pub highest_timestamp: i64,
}

impl IndexHeader {
    pub fn to_bytes(&self) -> [u8; INDEX_HEADER_SIZE as usize] {
        let mut buf = [0u8; INDEX_HEADER_SIZE as usize];
        put_u64(&mut buf, 0, self.entry_count);
        put_i64(&mut buf, 8, self.lowest_timestamp);
        put_i64(&mut buf, 16, self.highest_timestamp);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            entry_count: get_u64(buf, 0),
            lowest_timestamp: get_i64(buf, 8),
            highest_timestamp: get_i64(buf, 16),
        }
    }
}

/// One block's time range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub lowest_timestamp: i64,
    pub highest_timestamp: i64,
    pub block_number: u64,
}

impl IndexEntry {
    pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_SIZE as usize] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
        put_i64(&mut buf, 0, self.lowest_timestamp);
        put_i64(&mut buf, 8, self.highest_timestamp);
        put_u64(&mut buf, 16, self.block_number);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            lowest_timestamp: get_i64(buf, 0),
            highest_timestamp: get_i64(buf, 8),
            block_number: get_u64(buf, 16),
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.lowest_timestamp <= timestamp && timestamp <= self.highest_timestamp
    }
}

fn entry_offset(position: u64) -> u64 {
    INDEX_HEADER_SIZE + position * INDEX_ENTRY_SIZE
}

/// Reads index entries through a window of neighbouring entries, so that
/// nearby probes of a binary search or a forward walk share one disk read.
struct EntryReader<'a> {
    file: &'a mut StoreFile,
    count: u64,
    window_start: u64,
    window: Vec<IndexEntry>,
}

impl<'a> EntryReader<'a> {
    fn new(file: &'a mut StoreFile, count: u64) -> Self {
        Self {
            file,
            count,
            window_start: 0,
            window: Vec::new(),
        }
    }

    async fn get(&mut self, position: u64) -> StorageResult<IndexEntry> {
        if position >= self.count {
            return Err(StorageError::InvalidArgument(format!(
                "index position {} beyond entry count {}",
                position, self.count
            )));
        }

        let window_end = self.window_start + self.window.len() as u64;
        if position < self.window_start || position >= window_end {
            // Walking forward continues from the old window's end;
            // a random probe centres the window on itself
            let start = if position == window_end && !self.window.is_empty() {
                position
            } else {
                position.saturating_sub(WINDOW_ENTRIES / 2)
            };
            let len = WINDOW_ENTRIES.min(self.count - start);

            let mut buf = vec![0u8; (len * INDEX_ENTRY_SIZE) as usize];
            self.file.read_exact_at(entry_offset(start), &mut buf).await?;
            self.window = buf
                .chunks_exact(INDEX_ENTRY_SIZE as usize)
                .map(IndexEntry::from_bytes)
                .collect();
            self.window_start = start;
        }

        Ok(self.window[(position - self.window_start) as usize])
    }

    /// First position whose block ends at or after `timestamp`
    async fn lower_bound_by_high(&mut self, timestamp: i64) -> StorageResult<u64> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mid).await?.highest_timestamp < timestamp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// First position whose block starts after `timestamp`
    async fn upper_bound_by_low(&mut self, timestamp: i64) -> StorageResult<u64> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mid).await?.lowest_timestamp <= timestamp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

/// Sparse block index for one event stream
pub struct TimeIndex {
    path: PathBuf,
    /// Lazily loaded, replaced by every header write
    header: Mutex<Option<IndexHeader>>,
}

impl TimeIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            header: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the index file, or validate the one already on disk
    pub async fn create(&self, overwrite: bool) -> StorageResult<()> {
        if overwrite || !exists(&self.path).await? {
            let header = IndexHeader::default();
            let mut file = StoreFile::create(&self.path).await?;
            let result = file.write_at(0, &header.to_bytes()).await;
            file.finish(result).await?;
            *self.header.lock()? = Some(header);
            tracing::debug!("Created index {:?}", self.path);
            return Ok(());
        }

        let mut file = StoreFile::open_read(&self.path).await?;
        let result = Self::validate(&mut file).await;
        let header = file.finish(result).await?;
        *self.header.lock()? = Some(header);
        Ok(())
    }

    async fn validate(file: &mut StoreFile) -> StorageResult<IndexHeader> {
        // Each header field is read on its own and must be non-negative
        let mut fields = [0i64; 3];
        for (i, field) in fields.iter_mut().enumerate() {
            let mut word = [0u8; 8];
            file.read_exact_at(i as u64 * 8, &mut word).await?;
            *field = i64::from_be_bytes(word);
            if *field < 0 {
                return Err(StorageError::Corruption(format!(
                    "{}: header field {} is negative ({})",
                    file.path().display(),
                    i,
                    field
                )));
            }
        }

        let header = IndexHeader {
            entry_count: fields[0] as u64,
            lowest_timestamp: fields[1],
            highest_timestamp: fields[2],
        };
        let needed = entry_offset(header.entry_count);
        let len = file.len().await?;
        if len < needed {
            return Err(StorageError::Corruption(format!(
                "{}: header counts {} entries but file holds {} bytes",
                file.path().display(),
                header.entry_count,
                len
            )));
        }
        Ok(header)
    }

    /// Current header, read from disk on first access
    pub async fn header(&self) -> StorageResult<IndexHeader> {
        if let Some(header) = *self.header.lock()? {
            return Ok(header);
        }

        let mut file = StoreFile::open_read(&self.path).await?;
        let mut buf = [0u8; INDEX_HEADER_SIZE as usize];
        let result = file.read_exact_at(0, &mut buf).await;
        file.finish(result).await?;

        let header = IndexHeader::from_bytes(&buf);
        *self.header.lock()? = Some(header);
        Ok(header)
    }

    pub async fn write_header(&self, header: IndexHeader) -> StorageResult<()> {
        let mut file = StoreFile::open(&self.path).await?;
        let result = file.write_at(0, &header.to_bytes()).await;
        file.finish(result).await?;
        *self.header.lock()? = Some(header);
        Ok(())
    }

    /// Register a new block covering `[low, high]`
    pub async fn add_block(&self, low: i64, high: i64, block_number: u64) -> StorageResult<()> {
        if low < 0 || high < low {
            return Err(StorageError::InvalidArgument(format!(
                "invalid block range [{}, {}]",
                low, high
            )));
        }

        let header = self.header().await?;
        if header.entry_count > 0 && low < header.highest_timestamp {
            return Err(StorageError::OutOfOrder {
                timestamp: low,
                highest: header.highest_timestamp,
            });
        }

        let entry = IndexEntry {
            lowest_timestamp: low,
            highest_timestamp: high,
            block_number,
        };
        let updated = IndexHeader {
            entry_count: header.entry_count + 1,
            lowest_timestamp: if header.entry_count == 0 {
                low
            } else {
                header.lowest_timestamp
            },
            highest_timestamp: high.max(header.highest_timestamp),
        };

        let mut file = StoreFile::open(&self.path).await?;
        let result = async {
            file.write_at(entry_offset(header.entry_count), &entry.to_bytes())
                .await?;
            file.write_at(0, &updated.to_bytes()).await
        }
        .await;
        file.finish(result).await?;

        *self.header.lock()? = Some(updated);
        tracing::debug!(
            "Indexed block {} [{}, {}] in {:?}",
            block_number,
            low,
            high,
            self.path
        );
        Ok(())
    }

    /// Extend the open (last) block's upper bound
    pub async fn change_last_block_highest_timestamp(&self, timestamp: i64) -> StorageResult<()> {
        let header = self.header().await?;
        if header.entry_count == 0 {
            return Err(StorageError::NotFound(format!(
                "{}: index has no blocks",
                self.path.display()
            )));
        }
        if timestamp < header.highest_timestamp {
            return Err(StorageError::OutOfOrder {
                timestamp,
                highest: header.highest_timestamp,
            });
        }
        if timestamp == header.highest_timestamp {
            return Ok(());
        }

        let updated = IndexHeader {
            highest_timestamp: timestamp,
            ..header
        };
        let high_field = entry_offset(header.entry_count - 1) + 8;

        let mut file = StoreFile::open(&self.path).await?;
        let result = async {
            file.write_at(high_field, &timestamp.to_be_bytes()).await?;
            file.write_at(0, &updated.to_bytes()).await
        }
        .await;
        file.finish(result).await?;

        *self.header.lock()? = Some(updated);
        Ok(())
    }

    /// Entry at `position` (0-based)
    pub async fn entry_at(&self, position: u64) -> StorageResult<IndexEntry> {
        let header = self.header().await?;
        if position >= header.entry_count {
            return Err(StorageError::NotFound(format!(
                "index position {} (index holds {})",
                position, header.entry_count
            )));
        }

        let mut file = StoreFile::open_read(&self.path).await?;
        let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
        let result = file.read_exact_at(entry_offset(position), &mut buf).await;
        file.finish(result).await?;
        Ok(IndexEntry::from_bytes(&buf))
    }

    /// Number of the most recent block, if any
    pub async fn last_block_number(&self) -> StorageResult<Option<u64>> {
        let header = self.header().await?;
        if header.entry_count == 0 {
            return Ok(None);
        }

        let mut file = StoreFile::open_read(&self.path).await?;
        let mut buf = [0u8; 8];
        let result = file
            .read_exact_at(entry_offset(header.entry_count - 1) + 16, &mut buf)
            .await;
        file.finish(result).await?;
        Ok(Some(u64::from_be_bytes(buf)))
    }

    /// Block numbers whose ranges intersect `[start, end]`, in order
    pub async fn blocks(&self, start: i64, end: i64) -> StorageResult<Vec<u64>> {
        let header = self.header().await?;
        if header.entry_count == 0
            || start > end
            || end < header.lowest_timestamp
            || start > header.highest_timestamp
        {
            return Ok(Vec::new());
        }

        let mut file = StoreFile::open_read(&self.path).await?;
        let result = async {
            let mut reader = EntryReader::new(&mut file, header.entry_count);
            let mut position = reader.lower_bound_by_high(start).await?;
            let mut blocks = Vec::new();
            while position < header.entry_count {
                let entry = reader.get(position).await?;
                if entry.lowest_timestamp > end {
                    break;
                }
                blocks.push(entry.block_number);
                position += 1;
            }
            Ok(blocks)
        }
        .await;
        file.finish(result).await
    }

    /// Position of the first block that ends at or after `timestamp`
    pub async fn first_position_from(&self, timestamp: i64) -> StorageResult<Option<u64>> {
        let header = self.header().await?;
        if header.entry_count == 0 || timestamp > header.highest_timestamp {
            return Ok(None);
        }

        let mut file = StoreFile::open_read(&self.path).await?;
        let result = EntryReader::new(&mut file, header.entry_count)
            .lower_bound_by_high(timestamp)
            .await;
        file.finish(result).await.map(Some)
    }

    /// Position of the last block that starts at or before `timestamp`
    pub async fn last_position_until(&self, timestamp: i64) -> StorageResult<Option<u64>> {
        let header = self.header().await?;
        if header.entry_count == 0 || timestamp < header.lowest_timestamp {
            return Ok(None);
        }

        let mut file = StoreFile::open_read(&self.path).await?;
        let result = EntryReader::new(&mut file, header.entry_count)
            .upper_bound_by_low(timestamp)
            .await;
        Ok(file.finish(result).await?.checked_sub(1))
    }
}
