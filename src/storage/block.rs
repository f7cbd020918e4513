//! Block file format for event streams
//!
//! A stream's entries live in numbered block files (`<n>.<ext>`), each
//! holding up to `capacity` entries in non-decreasing timestamp order.
//! Entries are never moved once written; wiping one overwrites its
//! timestamp with [`TOMBSTONE`] and zeroes its payload.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (25 bytes)                       │
//! │   is_full: u8                           │
//! │   entry_count: u64                      │
//! │   next_free_offset: u64                 │
//! │   middle_entry_offset: u64              │
//! ├─────────────────────────────────────────┤
//! │ ENTRIES (variable)                      │
//! │   For each entry:                       │
//! │     entry_length: u64 (payload bytes)   │
//! │     timestamp: i64                      │
//! │     payload: [u8; entry_length]         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! `middle_entry_offset` points at entry ⌈entry_count/2⌉ (1-based). Scans
//! use it to skip the first half of a block when the target lies beyond it.

use crate::index::TimeIndex;
use crate::storage::codec::{get_i64, get_u64, put_i64, put_u64};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::StoreFile;
use crate::storage::sync::{wait_queued, Claim, CreationQueue, Pending};
use crate::storage::types::{Entry, TOMBSTONE};
use crate::storage::window::FixedWindow;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Header size in bytes
pub const BLOCK_HEADER_SIZE: u64 = 25;

/// Per-entry prefix: length + timestamp
pub const ENTRY_HEADER_SIZE: u64 = 16;

/// Read-ahead used by scans
const READ_AHEAD: usize = 64 * 1024;

/// Block file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub is_full: bool,
    pub entry_count: u64,
    pub next_free_offset: u64,
    pub middle_entry_offset: u64,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            is_full: false,
            entry_count: 0,
            next_free_offset: BLOCK_HEADER_SIZE,
            middle_entry_offset: 0,
        }
    }
}

impl BlockHeader {
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE as usize] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE as usize];
        buf[0] = self.is_full as u8;
        put_u64(&mut buf, 1, self.entry_count);
        put_u64(&mut buf, 9, self.next_free_offset);
        put_u64(&mut buf, 17, self.middle_entry_offset);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        let header = Self {
            is_full: buf[0] != 0,
            entry_count: get_u64(buf, 1),
            next_free_offset: get_u64(buf, 9),
            middle_entry_offset: get_u64(buf, 17),
        };

        if header.next_free_offset < BLOCK_HEADER_SIZE
            || (header.entry_count > 0
                && (header.middle_entry_offset < BLOCK_HEADER_SIZE
                    || header.middle_entry_offset >= header.next_free_offset))
        {
            return Err(StorageError::Corruption(format!(
                "Inconsistent block header: {:?}",
                header
            )));
        }
        Ok(header)
    }
}

/// Serialize an entry as it sits on disk
pub fn encode_entry(entry: &Entry) -> Vec<u8> {
    let mut buf = vec![0u8; ENTRY_HEADER_SIZE as usize + entry.payload.len()];
    put_u64(&mut buf, 0, entry.payload.len() as u64);
    put_i64(&mut buf, 8, entry.timestamp);
    buf[ENTRY_HEADER_SIZE as usize..].copy_from_slice(&entry.payload);
    buf
}

/// Location and prefix of one entry found by a scan
#[derive(Debug, Clone, Copy)]
struct RawEntry {
    offset: u64,
    timestamp: i64,
    payload_len: u64,
}

impl RawEntry {
    fn is_tombstone(&self) -> bool {
        self.timestamp == TOMBSTONE
    }
}

/// Forward cursor over a block's entries with a reusable read-ahead buffer.
///
/// The buffer is refilled whenever the cursor needs bytes outside of it and
/// grows only for entries larger than the read-ahead.
struct EntryCursor {
    buf: Vec<u8>,
    buf_start: u64,
    buf_len: usize,
    position: u64,
    end: u64,
}

impl EntryCursor {
    fn new(position: u64, end: u64) -> Self {
        Self {
            buf: Vec::new(),
            buf_start: 0,
            buf_len: 0,
            position,
            end,
        }
    }

    fn seek(&mut self, position: u64) {
        self.position = position;
    }

    async fn ensure(
        &mut self,
        file: &mut StoreFile,
        offset: u64,
        len: usize,
    ) -> StorageResult<&[u8]> {
        if offset + len as u64 > self.end {
            return Err(StorageError::Corruption(format!(
                "{}: entry at {} runs past the written region ({})",
                file.path().display(),
                offset,
                self.end
            )));
        }

        let buffered = offset >= self.buf_start
            && offset + len as u64 <= self.buf_start + self.buf_len as u64;
        if !buffered {
            let remaining = (self.end - offset) as usize;
            let want = len.max(READ_AHEAD.min(remaining));
            if self.buf.len() < want {
                self.buf.resize(want, 0);
            }
            let n = file.read_at(offset, &mut self.buf[..want]).await?;
            if n < len {
                return Err(StorageError::Corruption(format!(
                    "{}: short read at {} ({} of {} bytes)",
                    file.path().display(),
                    offset,
                    n,
                    len
                )));
            }
            self.buf_start = offset;
            self.buf_len = n;
        }

        let at = (offset - self.buf_start) as usize;
        Ok(&self.buf[at..at + len])
    }

    async fn next(&mut self, file: &mut StoreFile) -> StorageResult<Option<RawEntry>> {
        if self.position >= self.end {
            return Ok(None);
        }

        let offset = self.position;
        let prefix = self
            .ensure(file, offset, ENTRY_HEADER_SIZE as usize)
            .await?;
        let entry = RawEntry {
            offset,
            payload_len: get_u64(prefix, 0),
            timestamp: get_i64(prefix, 8),
        };

        let total = ENTRY_HEADER_SIZE
            .checked_add(entry.payload_len)
            .filter(|total| offset + total <= self.end)
            .ok_or_else(|| {
                StorageError::Corruption(format!(
                    "{}: entry at {} claims {} payload bytes",
                    file.path().display(),
                    offset,
                    entry.payload_len
                ))
            })?;
        self.position = offset + total;
        Ok(Some(entry))
    }

    async fn payload(&mut self, file: &mut StoreFile, entry: &RawEntry) -> StorageResult<Vec<u8>> {
        let bytes = self
            .ensure(
                file,
                entry.offset + ENTRY_HEADER_SIZE,
                entry.payload_len as usize,
            )
            .await?;
        Ok(bytes.to_vec())
    }
}

/// Block files for one event stream
pub struct BlockStore {
    dir: PathBuf,
    extension: String,
    capacity: u64,
    /// Header of the newest block seen; older blocks are read from disk
    open_header: Mutex<Option<(u64, BlockHeader)>>,
    creating: CreationQueue<PathBuf, Entry>,
}

impl BlockStore {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>, capacity: u64) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            capacity: capacity.max(1),
            open_header: Mutex::new(None),
            creating: CreationQueue::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn block_path(&self, block_number: u64) -> PathBuf {
        self.dir
            .join(format!("{}.{}", block_number, self.extension))
    }

    /// Header of a block, read from disk on first access
    pub async fn header(&self, block_number: u64) -> StorageResult<BlockHeader> {
        if let Some((cached, header)) = *self.open_header.lock()? {
            if cached == block_number {
                return Ok(header);
            }
        }

        let mut file = StoreFile::open_read(self.block_path(block_number)).await?;
        let mut buf = [0u8; BLOCK_HEADER_SIZE as usize];
        let result = file.read_exact_at(0, &mut buf).await;
        file.finish(result).await?;

        let header = BlockHeader::from_bytes(&buf)?;
        self.remember(block_number, header)?;
        Ok(header)
    }

    fn remember(&self, block_number: u64, header: BlockHeader) -> StorageResult<()> {
        let mut slot = self.open_header.lock()?;
        if slot.map_or(true, |(cached, _)| block_number >= cached) {
            *slot = Some((block_number, header));
        }
        Ok(())
    }

    /// Append an entry to the stream, opening a new block when needed
    pub async fn add_entry(&self, index: &TimeIndex, entry: Entry) -> StorageResult<()> {
        if entry.timestamp < 0 {
            return Err(StorageError::InvalidArgument(format!(
                "timestamp {} is negative",
                entry.timestamp
            )));
        }

        let range = index.header().await?;
        if range.entry_count > 0 && entry.timestamp < range.highest_timestamp {
            return Err(StorageError::OutOfOrder {
                timestamp: entry.timestamp,
                highest: range.highest_timestamp,
            });
        }

        // A creation in flight owns the tail of the stream; queue behind it
        if self.creating.in_flight(&self.dir)? {
            return self.create_block(index, entry).await.map(|_| ());
        }

        let Some(block_number) = index.last_block_number().await? else {
            return self.create_block(index, entry).await.map(|_| ());
        };

        let mut header = self.header(block_number).await?;
        if header.is_full {
            return self.create_block(index, entry).await.map(|_| ());
        }

        self.write_entry_to_block(block_number, &mut header, &entry)
            .await?;
        index
            .change_last_block_highest_timestamp(entry.timestamp)
            .await
    }

    /// Open the next block with `first` as its first entry.
    ///
    /// Concurrent creations for this directory are coalesced: the first
    /// caller does the work and also writes every entry queued while it was
    /// in flight. Returns the block that received `first`.
    pub async fn create_block(&self, index: &TimeIndex, first: Entry) -> StorageResult<u64> {
        let first = match self.creating.claim(&self.dir, first)? {
            Claim::Queued(waiter) => return wait_queued(waiter).await,
            Claim::Leader(first) => first,
        };

        match self.run_creation(index, first).await {
            Ok(block_number) => Ok(block_number),
            Err(e) => {
                self.creating.abort(&self.dir, &e.to_string());
                Err(e)
            }
        }
    }

    async fn run_creation(&self, index: &TimeIndex, first: Entry) -> StorageResult<u64> {
        let mut block_number = index.last_block_number().await?.map_or(1, |n| n + 1);
        let first_block = block_number;

        let mut header = self.start_block(block_number, &first).await?;
        let (mut low, mut high) = (first.timestamp, first.timestamp);
        let mut registered = false;
        // Queued writers whose entries sit in a block the index doesn't show yet
        let mut unannounced: Vec<Pending<Entry>> = Vec::new();

        loop {
            let batch = self.creating.take(&self.dir)?;

            if batch.is_empty() {
                if !registered {
                    index.add_block(low, high, block_number).await?;
                    registered = true;
                    for pending in unannounced.drain(..) {
                        pending.resolve(Ok(block_number));
                    }
                    // Registering suspended us; more may have queued
                    continue;
                }
                if self.creating.release_if_idle(&self.dir)? {
                    return Ok(first_block);
                }
                continue;
            }

            for pending in batch {
                let timestamp = pending.payload.timestamp;
                if timestamp < high {
                    pending.resolve(Err(StorageError::OutOfOrder {
                        timestamp,
                        highest: high,
                    }));
                    continue;
                }

                if header.is_full {
                    if !registered {
                        index.add_block(low, high, block_number).await?;
                        for waiting in unannounced.drain(..) {
                            waiting.resolve(Ok(block_number));
                        }
                    }
                    block_number += 1;
                    header = self.start_block(block_number, &pending.payload).await?;
                    low = timestamp;
                    high = timestamp;
                    registered = false;
                    unannounced.push(pending);
                    continue;
                }

                self.write_entry_to_block(block_number, &mut header, &pending.payload)
                    .await?;
                high = timestamp;
                if registered {
                    index.change_last_block_highest_timestamp(high).await?;
                    pending.resolve(Ok(block_number));
                } else {
                    unannounced.push(pending);
                }
            }
        }
    }

    /// Write a fresh block file holding a single entry
    async fn start_block(&self, block_number: u64, first: &Entry) -> StorageResult<BlockHeader> {
        let bytes = encode_entry(first);
        let header = BlockHeader {
            is_full: self.capacity <= 1,
            entry_count: 1,
            next_free_offset: BLOCK_HEADER_SIZE + bytes.len() as u64,
            middle_entry_offset: BLOCK_HEADER_SIZE,
        };

        let path = self.block_path(block_number);
        let mut file = StoreFile::create(&path).await?;
        let result = async {
            file.write_at(BLOCK_HEADER_SIZE, &bytes).await?;
            file.write_at(0, &header.to_bytes()).await
        }
        .await;
        file.finish(result).await?;

        self.remember(block_number, header)?;
        tracing::info!("Created block {} at {:?}", block_number, path);
        Ok(header)
    }

    /// Append one entry to an open block and rewrite its header
    async fn write_entry_to_block(
        &self,
        block_number: u64,
        header: &mut BlockHeader,
        entry: &Entry,
    ) -> StorageResult<()> {
        if header.is_full {
            return Err(StorageError::InvalidArgument(format!(
                "block {} is full",
                block_number
            )));
        }

        let bytes = encode_entry(entry);
        let mut updated = *header;
        updated.entry_count += 1;
        updated.next_free_offset += bytes.len() as u64;

        let mut file = StoreFile::open(self.block_path(block_number)).await?;
        let result = async {
            file.write_at(header.next_free_offset, &bytes).await?;

            if updated.entry_count == 1 {
                updated.middle_entry_offset = header.next_free_offset;
            } else if updated.entry_count % 2 == 1 {
                // ⌈count/2⌉ moved forward by one: step over the old middle
                let mut word = [0u8; 8];
                file.read_exact_at(header.middle_entry_offset, &mut word)
                    .await?;
                updated.middle_entry_offset += ENTRY_HEADER_SIZE + u64::from_be_bytes(word);
            }
            if updated.entry_count >= self.capacity {
                updated.is_full = true;
            }

            file.write_at(0, &updated.to_bytes()).await
        }
        .await;
        file.finish(result).await?;

        *header = updated;
        self.remember(block_number, updated)?;
        tracing::debug!(
            "Appended {} bytes to block {} ({} entries)",
            bytes.len(),
            block_number,
            updated.entry_count
        );
        Ok(())
    }

    /// Where a scan may begin: the middle entry when everything before it
    /// is known to sort below `skip_below`, else the first entry
    async fn scan_start(
        file: &mut StoreFile,
        header: &BlockHeader,
        skip_below: i64,
    ) -> StorageResult<u64> {
        if header.entry_count < 2 {
            return Ok(BLOCK_HEADER_SIZE);
        }

        let mut word = [0u8; 8];
        file.read_exact_at(header.middle_entry_offset + 8, &mut word)
            .await?;
        let middle_timestamp = i64::from_be_bytes(word);

        // A wiped middle entry says nothing about what precedes it
        if middle_timestamp != TOMBSTONE && middle_timestamp < skip_below {
            Ok(header.middle_entry_offset)
        } else {
            Ok(BLOCK_HEADER_SIZE)
        }
    }

    /// Live entries with timestamps in `[start, end]`
    pub(crate) async fn entries_between(
        &self,
        block_number: u64,
        start: i64,
        end: i64,
    ) -> StorageResult<Vec<Entry>> {
        if start > end {
            return Ok(Vec::new());
        }
        let header = self.header(block_number).await?;

        let mut file = StoreFile::open_read(self.block_path(block_number)).await?;
        let result = async {
            let from = Self::scan_start(&mut file, &header, start).await?;
            let mut cursor = EntryCursor::new(from, header.next_free_offset);
            let mut entries = Vec::new();

            while let Some(raw) = cursor.next(&mut file).await? {
                if raw.is_tombstone() {
                    continue;
                }
                if raw.timestamp > end {
                    break;
                }
                if raw.timestamp >= start {
                    let payload = cursor.payload(&mut file, &raw).await?;
                    entries.push(Entry::new(raw.timestamp, payload));
                }
            }
            Ok(entries)
        }
        .await;
        file.finish(result).await
    }

    /// Positions of up to `count` live entries next to `timestamp`.
    ///
    /// `preceding` collects the latest entries at or before `timestamp`,
    /// otherwise the earliest entries at or after it. Positions come back in
    /// file order.
    pub(crate) async fn entries_near(
        &self,
        block_number: u64,
        timestamp: i64,
        count: usize,
        preceding: bool,
    ) -> StorageResult<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let header = self.header(block_number).await?;

        let mut file = StoreFile::open_read(self.block_path(block_number)).await?;
        let result = async {
            if !preceding {
                let from = Self::scan_start(&mut file, &header, timestamp).await?;
                let mut cursor = EntryCursor::new(from, header.next_free_offset);
                let mut positions = Vec::with_capacity(count.min(header.entry_count as usize));
                while let Some(raw) = cursor.next(&mut file).await? {
                    if raw.is_tombstone() || raw.timestamp < timestamp {
                        continue;
                    }
                    positions.push(raw.offset);
                    if positions.len() == count {
                        break;
                    }
                }
                return Ok(positions);
            }

            let middle = Self::scan_start(&mut file, &header, timestamp.saturating_add(1)).await?;
            let mut window = Self::collect_preceding(
                &mut file,
                middle,
                header.next_free_offset,
                timestamp,
                count,
            )
            .await?;

            // Not enough past the midpoint: top up from the first half
            if !window.is_full() && middle > BLOCK_HEADER_SIZE {
                let mut earlier =
                    Self::collect_preceding(&mut file, BLOCK_HEADER_SIZE, middle, timestamp, count)
                        .await?;
                earlier.merge(window);
                window = earlier;
            }
            Ok(window.into_vec())
        }
        .await;
        file.finish(result).await
    }

    async fn collect_preceding(
        file: &mut StoreFile,
        from: u64,
        until: u64,
        timestamp: i64,
        count: usize,
    ) -> StorageResult<FixedWindow<u64>> {
        let mut cursor = EntryCursor::new(from, until);
        let mut window = FixedWindow::new(count);
        while let Some(raw) = cursor.next(file).await? {
            if raw.is_tombstone() {
                continue;
            }
            if raw.timestamp > timestamp {
                break;
            }
            window.push(raw.offset);
        }
        Ok(window)
    }

    /// Read entries at explicit positions
    pub(crate) async fn entries_from_positions(
        &self,
        block_number: u64,
        positions: &[u64],
    ) -> StorageResult<Vec<Entry>> {
        let header = self.header(block_number).await?;
        if let Some(&bad) = positions
            .iter()
            .find(|&&p| p < BLOCK_HEADER_SIZE || p >= header.next_free_offset)
        {
            return Err(StorageError::PositionOutOfBounds {
                position: bad,
                start: BLOCK_HEADER_SIZE,
                end: header.next_free_offset,
            });
        }

        let mut file = StoreFile::open_read(self.block_path(block_number)).await?;
        let result = async {
            let mut cursor = EntryCursor::new(BLOCK_HEADER_SIZE, header.next_free_offset);
            let mut entries = Vec::with_capacity(positions.len());
            for &position in positions {
                cursor.seek(position);
                let raw = cursor.next(&mut file).await?.ok_or_else(|| {
                    StorageError::NotFound(format!(
                        "no entry at position {} of block {}",
                        position, block_number
                    ))
                })?;
                let payload = cursor.payload(&mut file, &raw).await?;
                entries.push(Entry::new(raw.timestamp, payload));
            }
            Ok(entries)
        }
        .await;
        file.finish(result).await
    }

    /// Tombstone every live entry in `[start, end]`; returns how many
    pub(crate) async fn wipe_entries(
        &self,
        block_number: u64,
        start: i64,
        end: i64,
    ) -> StorageResult<u64> {
        if start > end {
            return Ok(0);
        }
        let header = self.header(block_number).await?;

        let mut file = StoreFile::open(self.block_path(block_number)).await?;
        let result = async {
            let from = Self::scan_start(&mut file, &header, start).await?;
            let mut cursor = EntryCursor::new(from, header.next_free_offset);
            let mut doomed = Vec::new();
            while let Some(raw) = cursor.next(&mut file).await? {
                if raw.is_tombstone() {
                    continue;
                }
                if raw.timestamp > end {
                    break;
                }
                if raw.timestamp >= start {
                    doomed.push(raw);
                }
            }

            // Writes come after the scan so the read-ahead never goes stale
            for raw in &doomed {
                let mut tombstone = vec![0u8; 8 + raw.payload_len as usize];
                put_i64(&mut tombstone, 0, TOMBSTONE);
                file.write_at(raw.offset + 8, &tombstone).await?;
            }
            Ok(doomed.len() as u64)
        }
        .await;
        let wiped = file.finish(result).await?;

        if wiped > 0 {
            tracing::debug!(
                "Wiped {} entries in [{}, {}] from block {}",
                wiped,
                start,
                end,
                block_number
            );
        }
        Ok(wiped)
    }
}
