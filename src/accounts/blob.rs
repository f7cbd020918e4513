//! Chunked blob heap for attachments and profile pictures
//!
//! One flat file divided into fixed-size chunks. Allocations are rounded up
//! to whole chunks; reclaimed runs of chunks are threaded into an
//! address-ordered free list.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (16 bytes)                       │
//! │   next_free_chunk_pointer: u64          │
//! │   total_chunks_used: u64                │
//! ├─────────────────────────────────────────┤
//! │ CHUNKS (chunk_size bytes each)          │
//! │   allocated entry, first chunk:         │
//! │     chunks_allocated: u64               │
//! │     actual_data_length: u64             │
//! │     data...                             │
//! │   free area, first chunk:               │
//! │     free_area_size_in_chunks: u64       │
//! │     next_free_area_pointer: u64         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Pointers are byte offsets; 0 is null. `total_chunks_used` is a
//! high-water mark and never shrinks.

use crate::storage::codec::{get_u64, put_u64};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::{exists, StoreFile};
use crate::storage::sync::WriteChain;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, Take};

/// Header size in bytes
pub const BLOB_HEADER_SIZE: u64 = 16;

/// Prefix of an allocated entry (and of a free area)
pub const BLOB_ENTRY_PREFIX: u64 = 16;

/// Default chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: u64 = 128;

/// Location of an allocated blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobHandle(pub u64);

impl BlobHandle {
    pub fn offset(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "blob@{}", self.0)
    }
}

/// Blob heap header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobHeader {
    pub next_free_chunk_pointer: u64,
    pub total_chunks_used: u64,
}

impl BlobHeader {
    pub fn to_bytes(&self) -> [u8; BLOB_HEADER_SIZE as usize] {
        let mut buf = [0u8; BLOB_HEADER_SIZE as usize];
        put_u64(&mut buf, 0, self.next_free_chunk_pointer);
        put_u64(&mut buf, 8, self.total_chunks_used);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            next_free_chunk_pointer: get_u64(buf, 0),
            total_chunks_used: get_u64(buf, 8),
        }
    }
}

/// A run of free chunks as linked in the free list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeArea {
    offset: u64,
    chunks: u64,
    next: u64,
}

/// Reader over a blob's payload
pub type BlobReader = Take<File>;

/// Usage summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStats {
    pub chunk_size: u64,
    pub total_chunks_used: u64,
    pub free_chunks: u64,
    pub free_areas: u64,
}

/// Free-list allocator over one file
pub struct BlobHeap {
    path: PathBuf,
    chunk_size: u64,
    header: Mutex<Option<BlobHeader>>,
    writes: WriteChain,
}

impl BlobHeap {
    pub fn new(path: impl Into<PathBuf>, chunk_size: u64) -> Self {
        Self {
            path: path.into(),
            chunk_size: chunk_size.max(BLOB_ENTRY_PREFIX),
            header: Mutex::new(None),
            writes: WriteChain::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Create the heap file, or validate the one already on disk
    pub async fn create(&self, overwrite: bool) -> StorageResult<()> {
        self.writes
            .run(async {
                if overwrite || !exists(&self.path).await? {
                    let header = BlobHeader::default();
                    let mut file = StoreFile::create(&self.path).await?;
                    let result = file.write_at(0, &header.to_bytes()).await;
                    file.finish(result).await?;
                    *self.header.lock()? = Some(header);
                    tracing::debug!("Created blob heap {:?}", self.path);
                    return Ok(());
                }

                let mut file = StoreFile::open_read(&self.path).await?;
                let result = async {
                    let mut buf = [0u8; BLOB_HEADER_SIZE as usize];
                    file.read_exact_at(0, &mut buf).await?;
                    let header = BlobHeader::from_bytes(&buf);
                    let needed = self.chunk_offset(header.total_chunks_used);
                    let len = file.len().await?;
                    if len < needed {
                        return Err(StorageError::Corruption(format!(
                            "{}: {} chunks in use but file holds {} bytes",
                            self.path.display(),
                            header.total_chunks_used,
                            len
                        )));
                    }
                    if header.next_free_chunk_pointer != 0
                        && !self.is_chunk_start(header, header.next_free_chunk_pointer)
                    {
                        return Err(StorageError::Corruption(format!(
                            "{}: free list head {} is not a chunk",
                            self.path.display(),
                            header.next_free_chunk_pointer
                        )));
                    }
                    Ok(header)
                }
                .await;
                let header = file.finish(result).await?;
                *self.header.lock()? = Some(header);
                Ok(())
            })
            .await
    }

    /// Current header, read from disk on first access
    pub async fn header(&self) -> StorageResult<BlobHeader> {
        if let Some(header) = *self.header.lock()? {
            return Ok(header);
        }

        let mut file = StoreFile::open_read(&self.path).await?;
        let mut buf = [0u8; BLOB_HEADER_SIZE as usize];
        let result = file.read_exact_at(0, &mut buf).await;
        file.finish(result).await?;

        let header = BlobHeader::from_bytes(&buf);
        *self.header.lock()? = Some(header);
        Ok(header)
    }

    fn chunk_offset(&self, chunk: u64) -> u64 {
        BLOB_HEADER_SIZE + chunk * self.chunk_size
    }

    fn is_chunk_start(&self, header: BlobHeader, offset: u64) -> bool {
        offset >= BLOB_HEADER_SIZE
            && (offset - BLOB_HEADER_SIZE) % self.chunk_size == 0
            && (offset - BLOB_HEADER_SIZE) / self.chunk_size < header.total_chunks_used
    }

    /// Chunks needed to hold `size` payload bytes plus the entry prefix
    pub fn chunks_needed(&self, size: u64) -> u64 {
        (size + BLOB_ENTRY_PREFIX).div_ceil(self.chunk_size)
    }

    fn check_handle(&self, header: BlobHeader, handle: BlobHandle) -> StorageResult<()> {
        if !self.is_chunk_start(header, handle.0) {
            return Err(StorageError::InvalidArgument(format!(
                "{} is not an allocated chunk of {:?}",
                handle, self.path
            )));
        }
        Ok(())
    }

    async fn read_area(
        &self,
        file: &mut StoreFile,
        header: BlobHeader,
        offset: u64,
    ) -> StorageResult<FreeArea> {
        if !self.is_chunk_start(header, offset) {
            return Err(StorageError::Corruption(format!(
                "{}: free list points at {}",
                self.path.display(),
                offset
            )));
        }
        let mut buf = [0u8; 16];
        file.read_exact_at(offset, &mut buf).await?;
        let area = FreeArea {
            offset,
            chunks: get_u64(&buf, 0),
            next: get_u64(&buf, 8),
        };
        if area.chunks == 0 || area.offset + area.chunks * self.chunk_size
            > self.chunk_offset(header.total_chunks_used)
            || (area.next != 0 && area.next <= area.offset)
        {
            return Err(StorageError::Corruption(format!(
                "{}: malformed free area {:?}",
                self.path.display(),
                area
            )));
        }
        Ok(area)
    }

    async fn write_area(file: &mut StoreFile, area: &FreeArea) -> StorageResult<()> {
        let mut buf = [0u8; 16];
        put_u64(&mut buf, 0, area.chunks);
        put_u64(&mut buf, 8, area.next);
        file.write_at(area.offset, &buf).await
    }

    /// Point whatever precedes a free-list slot (an area or the header) at `target`
    async fn relink(
        &self,
        file: &mut StoreFile,
        header: &mut BlobHeader,
        previous: Option<FreeArea>,
        target: u64,
    ) -> StorageResult<()> {
        match previous {
            Some(prev) => file.write_at(prev.offset + 8, &target.to_be_bytes()).await,
            None => {
                header.next_free_chunk_pointer = target;
                file.write_at(0, &header.to_bytes()).await
            }
        }
    }

    /// Reserve room for `size` payload bytes
    pub async fn allocate(&self, size: u64) -> StorageResult<BlobHandle> {
        let needed = self.chunks_needed(size);
        self.writes
            .run(async {
                let mut header = self.header().await?;
                let mut file = StoreFile::open(&self.path).await?;
                let result = self.allocate_in(&mut file, &mut header, needed).await;
                let handle = file.finish(result).await?;
                *self.header.lock()? = Some(header);
                tracing::debug!(
                    "Allocated {} chunks at {} in {:?}",
                    needed,
                    handle,
                    self.path
                );
                Ok(handle)
            })
            .await
    }

    async fn allocate_in(
        &self,
        file: &mut StoreFile,
        header: &mut BlobHeader,
        needed: u64,
    ) -> StorageResult<BlobHandle> {
        let mut previous: Option<FreeArea> = None;
        let mut cursor = header.next_free_chunk_pointer;
        let mut hops = 0u64;

        while cursor != 0 {
            hops += 1;
            if hops > header.total_chunks_used {
                return Err(StorageError::Corruption(format!(
                    "{}: free list does not terminate",
                    self.path.display()
                )));
            }

            let area = self.read_area(file, *header, cursor).await?;
            if area.chunks >= needed {
                let link = if area.chunks == needed {
                    area.next
                } else {
                    let remainder = FreeArea {
                        offset: area.offset + needed * self.chunk_size,
                        chunks: area.chunks - needed,
                        next: area.next,
                    };
                    // Remainder must exist before anything points at it
                    Self::write_area(file, &remainder).await?;
                    remainder.offset
                };
                self.relink(file, header, previous, link).await?;
                Self::write_prefix(file, area.offset, needed, 0).await?;
                return Ok(BlobHandle(area.offset));
            }

            previous = Some(area);
            cursor = area.next;
        }

        // Nothing fits: grow past the high-water mark
        let offset = self.chunk_offset(header.total_chunks_used);
        file.ensure_len(offset + needed * self.chunk_size).await?;
        Self::write_prefix(file, offset, needed, 0).await?;
        header.total_chunks_used += needed;
        file.write_at(0, &header.to_bytes()).await?;
        Ok(BlobHandle(offset))
    }

    async fn write_prefix(
        file: &mut StoreFile,
        offset: u64,
        chunks: u64,
        data_length: u64,
    ) -> StorageResult<()> {
        let mut buf = [0u8; BLOB_ENTRY_PREFIX as usize];
        put_u64(&mut buf, 0, chunks);
        put_u64(&mut buf, 8, data_length);
        file.write_at(offset, &buf).await
    }

    async fn clear_prefix(file: &mut StoreFile, offset: u64) -> StorageResult<()> {
        file.write_at(offset, &[0u8; BLOB_ENTRY_PREFIX as usize]).await
    }

    /// `(chunks_allocated, actual_data_length)` of an entry
    async fn read_prefix(
        &self,
        file: &mut StoreFile,
        header: BlobHeader,
        handle: BlobHandle,
    ) -> StorageResult<(u64, u64)> {
        let mut buf = [0u8; BLOB_ENTRY_PREFIX as usize];
        file.read_exact_at(handle.0, &mut buf).await?;
        let chunks = get_u64(&buf, 0);
        let length = get_u64(&buf, 8);
        if chunks == 0 {
            return Err(StorageError::InvalidArgument(format!(
                "{} is not the start of an allocation",
                handle
            )));
        }

        let end = handle.0.checked_add(chunks.saturating_mul(self.chunk_size));
        if end.map_or(true, |end| end > self.chunk_offset(header.total_chunks_used))
            || length > chunks * self.chunk_size - BLOB_ENTRY_PREFIX
        {
            return Err(StorageError::Corruption(format!(
                "{}: malformed entry at {} ({} chunks, {} bytes)",
                self.path.display(),
                handle.0,
                chunks,
                length
            )));
        }
        Ok((chunks, length))
    }

    /// Return an allocation's chunks to the free list.
    ///
    /// The list stays sorted by address and the freed run is merged with
    /// free neighbours on either side.
    pub async fn deallocate(&self, handle: BlobHandle) -> StorageResult<()> {
        self.writes
            .run(async {
                let mut header = self.header().await?;
                self.check_handle(header, handle)?;

                let mut file = StoreFile::open(&self.path).await?;
                let result = self.deallocate_in(&mut file, &mut header, handle).await;
                let chunks = file.finish(result).await?;
                *self.header.lock()? = Some(header);
                tracing::debug!("Freed {} chunks at {} in {:?}", chunks, handle, self.path);
                Ok(())
            })
            .await
    }

    async fn deallocate_in(
        &self,
        file: &mut StoreFile,
        header: &mut BlobHeader,
        handle: BlobHandle,
    ) -> StorageResult<u64> {
        let offset = handle.0;

        // Locate the free neighbours first: a handle inside a free area is a double free
        let mut previous: Option<FreeArea> = None;
        let mut following: Option<FreeArea> = None;
        let mut cursor = header.next_free_chunk_pointer;
        let mut hops = 0u64;
        while cursor != 0 {
            hops += 1;
            if hops > header.total_chunks_used {
                return Err(StorageError::Corruption(format!(
                    "{}: free list does not terminate",
                    self.path.display()
                )));
            }
            let area = self.read_area(file, *header, cursor).await?;
            if area.offset > offset {
                following = Some(area);
                break;
            }
            if offset < area.offset + area.chunks * self.chunk_size {
                return Err(StorageError::InvalidArgument(format!(
                    "{} is already free",
                    handle
                )));
            }
            previous = Some(area);
            cursor = area.next;
        }

        let (chunks, _) = self.read_prefix(file, *header, handle).await?;
        let end = offset + chunks * self.chunk_size;

        let mut freed = FreeArea {
            offset,
            chunks,
            next: following.map_or(0, |area| area.offset),
        };
        if let Some(next) = following {
            if end > next.offset {
                return Err(StorageError::Corruption(format!(
                    "{}: entry at {} overlaps free area at {}",
                    self.path.display(),
                    offset,
                    next.offset
                )));
            }
            if end == next.offset {
                freed.chunks += next.chunks;
                freed.next = next.next;
            }
        }

        match previous {
            Some(mut prev) if prev.offset + prev.chunks * self.chunk_size == offset => {
                prev.chunks += freed.chunks;
                prev.next = freed.next;
                Self::write_area(file, &prev).await?;
                Self::clear_prefix(file, offset).await?;
            }
            _ => {
                Self::write_area(file, &freed).await?;
                self.relink(file, header, previous, freed.offset).await?;
            }
        }

        // Absorbed headers must not pass for allocations once reused
        if let Some(next) = following.filter(|next| next.offset == end) {
            Self::clear_prefix(file, next.offset).await?;
        }
        Ok(chunks)
    }

    /// Overwrite a blob's payload and record its length
    pub async fn write_to_entry(&self, handle: BlobHandle, data: &[u8]) -> StorageResult<()> {
        self.writes
            .run(async {
                let header = self.header().await?;
                self.check_handle(header, handle)?;

                let mut file = StoreFile::open(&self.path).await?;
                let result = async {
                    let (chunks, _) = self.read_prefix(&mut file, header, handle).await?;
                    let capacity = chunks * self.chunk_size - BLOB_ENTRY_PREFIX;
                    if data.len() as u64 > capacity {
                        return Err(StorageError::InvalidArgument(format!(
                            "{} bytes do not fit in {} ({} bytes)",
                            data.len(),
                            handle,
                            capacity
                        )));
                    }
                    file.write_at(handle.0 + BLOB_ENTRY_PREFIX, data).await?;
                    file.write_at(handle.0 + 8, &(data.len() as u64).to_be_bytes())
                        .await
                }
                .await;
                file.finish(result).await
            })
            .await
    }

    /// Read a blob's payload
    pub async fn get_data(&self, handle: BlobHandle) -> StorageResult<Vec<u8>> {
        let header = self.header().await?;
        self.check_handle(header, handle)?;

        let mut file = StoreFile::open_read(&self.path).await?;
        let result = async {
            let (_, length) = self.read_prefix(&mut file, header, handle).await?;
            let mut data = vec![0u8; length as usize];
            file.read_exact_at(handle.0 + BLOB_ENTRY_PREFIX, &mut data)
                .await?;
            Ok(data)
        }
        .await;
        file.finish(result).await
    }

    /// Stream a blob's payload
    pub async fn read_stream(&self, handle: BlobHandle) -> StorageResult<BlobReader> {
        let header = self.header().await?;
        self.check_handle(header, handle)?;

        let mut file = StoreFile::open_read(&self.path).await?;
        let length = match self.read_prefix(&mut file, header, handle).await {
            Ok((_, length)) => length,
            Err(e) => return file.finish(Err(e)).await,
        };
        let inner = file.into_inner_at(handle.0 + BLOB_ENTRY_PREFIX).await?;
        Ok(inner.take(length))
    }

    /// Open a writer over a blob's payload. Nothing is visible to readers
    /// until [`BlobWriter::finish`] records the new length.
    pub async fn write_stream(&self, handle: BlobHandle) -> StorageResult<BlobWriter<'_>> {
        let header = self.header().await?;
        self.check_handle(header, handle)?;

        let mut file = StoreFile::open(&self.path).await?;
        let chunks = match self.read_prefix(&mut file, header, handle).await {
            Ok((chunks, _)) => chunks,
            Err(e) => return file.finish(Err(e)).await,
        };
        Ok(BlobWriter {
            heap: self,
            file,
            handle,
            capacity: chunks * self.chunk_size - BLOB_ENTRY_PREFIX,
            written: 0,
        })
    }

    /// Walk the free list
    pub async fn stats(&self) -> StorageResult<BlobStats> {
        let header = self.header().await?;
        let mut file = StoreFile::open_read(&self.path).await?;
        let result = async {
            let mut stats = BlobStats {
                chunk_size: self.chunk_size,
                total_chunks_used: header.total_chunks_used,
                ..Default::default()
            };
            let mut cursor = header.next_free_chunk_pointer;
            while cursor != 0 {
                if stats.free_areas >= header.total_chunks_used {
                    return Err(StorageError::Corruption(format!(
                        "{}: free list does not terminate",
                        self.path.display()
                    )));
                }
                let area = self.read_area(&mut file, header, cursor).await?;
                stats.free_areas += 1;
                stats.free_chunks += area.chunks;
                cursor = area.next;
            }
            Ok(stats)
        }
        .await;
        file.finish(result).await
    }
}

/// Sequential writer over one allocation's payload.
///
/// Each chunk is written in turn with the heap's other writes. The caller
/// must not free the allocation while the writer is open.
pub struct BlobWriter<'a> {
    heap: &'a BlobHeap,
    file: StoreFile,
    handle: BlobHandle,
    capacity: u64,
    written: u64,
}

impl BlobWriter<'_> {
    pub fn handle(&self) -> BlobHandle {
        self.handle
    }

    /// Bytes still available in the allocation
    pub fn remaining(&self) -> u64 {
        self.capacity - self.written
    }

    pub async fn write(&mut self, bytes: &[u8]) -> StorageResult<()> {
        if bytes.len() as u64 > self.remaining() {
            return Err(StorageError::InvalidArgument(format!(
                "{} has room for {} more bytes, got {}",
                self.handle,
                self.remaining(),
                bytes.len()
            )));
        }
        let at = self.handle.0 + BLOB_ENTRY_PREFIX + self.written;
        self.heap.writes.run(self.file.write_at(at, bytes)).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Commit the written length and close the file
    pub async fn finish(self) -> StorageResult<u64> {
        let Self {
            heap,
            mut file,
            handle,
            written,
            ..
        } = self;
        heap.writes
            .run(async {
                let result = file.write_at(handle.0 + 8, &written.to_be_bytes()).await;
                file.finish(result).await
            })
            .await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn create_test_heap(chunk_size: u64) -> (BlobHeap, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let heap = BlobHeap::new(dir.path().join("blobs.heap"), chunk_size);
        heap.create(false).await.unwrap();
        (heap, dir)
    }

    #[test]
    fn test_chunks_needed() {
        let heap = BlobHeap::new("unused", 64);
        assert_eq!(heap.chunks_needed(0), 1);
        assert_eq!(heap.chunks_needed(48), 1);
        assert_eq!(heap.chunks_needed(49), 2);
        assert_eq!(heap.chunks_needed(100), 2);
    }

    #[tokio::test]
    async fn test_free_space_reuse() {
        let (heap, _dir) = create_test_heap(64).await;

        let a = heap.allocate(100).await.unwrap();
        let b = heap.allocate(100).await.unwrap();
        assert_eq!(a, BlobHandle(BLOB_HEADER_SIZE));
        assert_eq!(b, BlobHandle(BLOB_HEADER_SIZE + 128));

        heap.deallocate(a).await.unwrap();
        let c = heap.allocate(100).await.unwrap();
        assert_eq!(c, a);

        // Free list empty again: D goes past the high-water mark
        let high_water = heap.header().await.unwrap().total_chunks_used;
        let d = heap.allocate(100).await.unwrap();
        assert_eq!(d.offset(), BLOB_HEADER_SIZE + high_water * 64);
        assert_eq!(heap.header().await.unwrap().total_chunks_used, high_water + 2);
    }

    #[tokio::test]
    async fn test_split_and_exact_fit() {
        let (heap, _dir) = create_test_heap(64).await;
        let big = heap.allocate(300).await.unwrap(); // 5 chunks
        let _guard = heap.allocate(10).await.unwrap();
        heap.deallocate(big).await.unwrap();

        // Front of the free area is handed out, the rest stays linked
        let small = heap.allocate(10).await.unwrap();
        assert_eq!(small, big);
        let stats = heap.stats().await.unwrap();
        assert_eq!(stats.free_areas, 1);
        assert_eq!(stats.free_chunks, 4);

        let rest = heap.allocate(4 * 64 - 16).await.unwrap();
        assert_eq!(rest.offset(), big.offset() + 64);
        assert_eq!(heap.stats().await.unwrap().free_chunks, 0);
        assert_eq!(heap.header().await.unwrap().total_chunks_used, 6);
    }

    #[tokio::test]
    async fn test_neighbours_coalesce() {
        let (heap, _dir) = create_test_heap(64).await;
        let a = heap.allocate(10).await.unwrap();
        let b = heap.allocate(10).await.unwrap();
        let c = heap.allocate(10).await.unwrap();
        let _d = heap.allocate(10).await.unwrap();

        heap.deallocate(a).await.unwrap();
        heap.deallocate(c).await.unwrap();
        assert_eq!(heap.stats().await.unwrap().free_areas, 2);

        // b bridges a and c into one run of three
        heap.deallocate(b).await.unwrap();
        let stats = heap.stats().await.unwrap();
        assert_eq!(stats.free_areas, 1);
        assert_eq!(stats.free_chunks, 3);
        assert_eq!(heap.header().await.unwrap().next_free_chunk_pointer, a.offset());

        let wide = heap.allocate(3 * 64 - 16).await.unwrap();
        assert_eq!(wide, a);
    }

    #[tokio::test]
    async fn test_stale_handle_after_coalesce() {
        let (heap, _dir) = create_test_heap(64).await;
        let a = heap.allocate(40).await.unwrap();
        let b = heap.allocate(40).await.unwrap();
        let _guard = heap.allocate(40).await.unwrap();

        // b merges backwards into a
        heap.deallocate(a).await.unwrap();
        heap.deallocate(b).await.unwrap();
        let wide = heap.allocate(100).await.unwrap();
        assert_eq!(wide, a);

        let err = heap.deallocate(b).await.unwrap_err();
        assert!(err.is_validation());
        let next = heap.allocate(10).await.unwrap();
        assert!(next.offset() >= wide.offset() + 128);

        heap.write_to_entry(wide, &[7u8; 112]).await.unwrap();
        heap.write_to_entry(next, b"intact").await.unwrap();
        assert_eq!(heap.get_data(wide).await.unwrap(), vec![7u8; 112]);
        assert_eq!(heap.get_data(next).await.unwrap(), b"intact".to_vec());
    }

    #[tokio::test]
    async fn test_stale_handle_after_forward_merge() {
        let (heap, _dir) = create_test_heap(64).await;
        let a = heap.allocate(40).await.unwrap();
        let b = heap.allocate(40).await.unwrap();
        let _guard = heap.allocate(40).await.unwrap();

        // a absorbs the free area that b left behind
        heap.deallocate(b).await.unwrap();
        heap.deallocate(a).await.unwrap();
        assert_eq!(heap.stats().await.unwrap().free_areas, 1);
        let wide = heap.allocate(100).await.unwrap();
        assert_eq!(wide, a);

        let err = heap.deallocate(b).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(heap.stats().await.unwrap().free_chunks, 0);
    }

    #[tokio::test]
    async fn test_bad_handles_rejected() {
        let (heap, _dir) = create_test_heap(64).await;
        let a = heap.allocate(10).await.unwrap();

        let err = heap.deallocate(BlobHandle(a.offset() + 3)).await.unwrap_err();
        assert!(err.is_validation());
        let err = heap.deallocate(BlobHandle(10_000)).await.unwrap_err();
        assert!(err.is_validation());

        heap.deallocate(a).await.unwrap();
        let err = heap.deallocate(a).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let (heap, _dir) = create_test_heap(64).await;
        let handle = heap.allocate(100).await.unwrap();
        assert!(heap.get_data(handle).await.unwrap().is_empty());

        let picture = (0..100u8).collect::<Vec<_>>();
        heap.write_to_entry(handle, &picture).await.unwrap();
        assert_eq!(heap.get_data(handle).await.unwrap(), picture);

        let mut reader = heap.read_stream(handle).await.unwrap();
        let mut streamed = Vec::new();
        reader.read_to_end(&mut streamed).await.unwrap();
        assert_eq!(streamed, picture);

        // Capacity is two chunks minus the prefix
        let err = heap.write_to_entry(handle, &[0u8; 113]).await.unwrap_err();
        assert!(err.is_validation());
        heap.write_to_entry(handle, &[9u8; 112]).await.unwrap();
        assert_eq!(heap.get_data(handle).await.unwrap().len(), 112);
    }

    #[tokio::test]
    async fn test_write_stream() {
        let (heap, _dir) = create_test_heap(64).await;
        let handle = heap.allocate(40).await.unwrap();

        let mut writer = heap.write_stream(handle).await.unwrap();
        assert_eq!(writer.remaining(), 48);
        writer.write(b"hello ").await.unwrap();
        writer.write(b"world").await.unwrap();
        assert!(writer.write(&[0u8; 40]).await.is_err());
        assert_eq!(writer.finish().await.unwrap(), 11);

        assert_eq!(heap.get_data(handle).await.unwrap(), b"hello world".to_vec());
    }

    #[tokio::test]
    async fn test_reopen_validates_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blobs.heap");
        {
            let heap = BlobHeap::new(&path, 64);
            heap.create(false).await.unwrap();
            let handle = heap.allocate(10).await.unwrap();
            heap.write_to_entry(handle, b"kept").await.unwrap();
        }

        let heap = BlobHeap::new(&path, 64);
        heap.create(false).await.unwrap();
        assert_eq!(heap.header().await.unwrap().total_chunks_used, 1);
        assert_eq!(heap.get_data(BlobHandle(16)).await.unwrap(), b"kept".to_vec());

        // Claims more chunks than the file holds
        let mut bogus = BlobHeader::default().to_bytes();
        put_u64(&mut bogus, 8, 50);
        tokio::fs::write(&path, bogus).await.unwrap();
        let err = BlobHeap::new(&path, 64).create(false).await.unwrap_err();
        assert!(err.is_consistency());
    }
}
