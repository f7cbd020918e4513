//! Chatstore storage engine
//!
//! Opens every store of one data directory:
//! - `messages/`: chat message stream
//! - `logs/`: audit log stream
//! - `accounts.tree`: account records
//! - `blobs.heap`: profile pictures and attachments

use crate::accounts::{AccountField, AccountRecord, BlobHandle, BlobHeap, BlobStats, TreeStore};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::log::{EventLog, DEFAULT_BLOCK_CAPACITY, DEFAULT_READ_LIMIT};
use crate::storage::types::LogStats;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for all data
    pub data_dir: PathBuf,
    /// Entries per block file (default: 1000)
    pub block_capacity: u64,
    /// Reads allowed in flight per stream (default: 20)
    pub read_limit: usize,
    /// Blob heap chunk size in bytes (default: 128)
    pub chunk_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("chatstore_data"),
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            read_limit: DEFAULT_READ_LIMIT,
            chunk_size: crate::accounts::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn block_capacity(mut self, capacity: u64) -> Self {
        self.block_capacity = capacity;
        self
    }

    pub fn read_limit(mut self, limit: usize) -> Self {
        self.read_limit = limit;
        self
    }

    pub fn chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size;
        self
    }

    /// Get path to the message stream
    pub fn messages_dir(&self) -> PathBuf {
        self.data_dir.join("messages")
    }

    /// Get path to the audit log stream
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn tree_path(&self) -> PathBuf {
        self.data_dir.join("accounts.tree")
    }

    pub fn heap_path(&self) -> PathBuf {
        self.data_dir.join("blobs.heap")
    }
}

/// The chatstore storage engine
pub struct StorageEngine {
    config: StorageConfig,
    messages: EventLog,
    logs: EventLog,
    accounts: TreeStore,
    blobs: BlobHeap,
}

impl StorageEngine {
    /// Open (creating where missing) every store under the data directory
    pub async fn open(config: StorageConfig) -> StorageResult<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let messages =
            EventLog::open(config.messages_dir(), config.block_capacity, config.read_limit)
                .await?;
        let logs =
            EventLog::open(config.logs_dir(), config.block_capacity, config.read_limit).await?;

        let accounts = TreeStore::new(config.tree_path());
        accounts.create(false).await?;
        let blobs = BlobHeap::new(config.heap_path(), config.chunk_size);
        blobs.create(false).await?;

        tracing::info!("Opened storage engine at {:?}", config.data_dir);
        Ok(Self {
            config,
            messages,
            logs,
            accounts,
            blobs,
        })
    }

    pub fn messages(&self) -> &EventLog {
        &self.messages
    }

    pub fn logs(&self) -> &EventLog {
        &self.logs
    }

    pub fn accounts(&self) -> &TreeStore {
        &self.accounts
    }

    pub fn blobs(&self) -> &BlobHeap {
        &self.blobs
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Store a new profile picture and release the previous one
    pub async fn set_profile_picture(
        &self,
        username: &str,
        picture: &[u8],
    ) -> StorageResult<BlobHandle> {
        let previous = self.accounts.get(username).await?.blob_pointer;

        let handle = self.blobs.allocate(picture.len() as u64).await?;
        let linked = async {
            self.blobs.write_to_entry(handle, picture).await?;
            self.accounts
                .update_field(
                    username,
                    AccountField::BlobPointer,
                    &handle.offset().to_be_bytes(),
                )
                .await
        }
        .await;

        if let Err(e) = linked {
            if let Err(free_err) = self.blobs.deallocate(handle).await {
                tracing::warn!(
                    "Could not release {} after failed update of '{}': {}",
                    handle,
                    username,
                    free_err
                );
            }
            return Err(e);
        }

        if previous != 0 {
            self.blobs.deallocate(BlobHandle(previous)).await?;
        }
        Ok(handle)
    }

    /// The account's profile picture, if it has one
    pub async fn profile_picture(&self, username: &str) -> StorageResult<Option<Vec<u8>>> {
        match self.accounts.get(username).await?.blob_pointer {
            0 => Ok(None),
            pointer => self.blobs.get_data(BlobHandle(pointer)).await.map(Some),
        }
    }

    /// Delete an account together with its profile picture
    pub async fn remove_account(&self, username: &str) -> StorageResult<AccountRecord> {
        let record = self.accounts.get(username).await?;
        self.accounts.delete(username).await?;
        if record.blob_pointer != 0 {
            self.blobs
                .deallocate(BlobHandle(record.blob_pointer))
                .await
                .map_err(|e| {
                    StorageError::Corruption(format!(
                        "account '{}' removed but its picture was not freed: {}",
                        username, e
                    ))
                })?;
        }
        Ok(record)
    }

    /// Get storage statistics
    pub async fn stats(&self) -> StorageResult<StorageStats> {
        Ok(StorageStats {
            messages: self.messages.stats().await?,
            logs: self.logs.stats().await?,
            accounts: self.accounts.usernames().await?.len(),
            blobs: self.blobs.stats().await?,
        })
    }
}

/// Storage statistics
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub messages: LogStats,
    pub logs: LogStats,
    pub accounts: usize,
    pub blobs: BlobStats,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Messages: {}", self.messages)?;
        writeln!(f, "Logs: {}", self.logs)?;
        writeln!(f, "Accounts: {}", self.accounts)?;
        write!(
            f,
            "Blobs: {} chunks of {} bytes, {} free in {} areas",
            self.blobs.total_chunks_used,
            self.blobs.chunk_size,
            self.blobs.free_chunks,
            self.blobs.free_areas
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn create_test_engine() -> (StorageEngine, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path()).block_capacity(4).chunk_size(64);
        let engine = StorageEngine::open(config).await.unwrap();
        (engine, dir)
    }

    #[tokio::test]
    async fn test_engine_creation() {
        let (engine, dir) = create_test_engine().await;
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.messages.block_count, 0);
        assert_eq!(stats.accounts, 0);
        assert_eq!(stats.blobs.total_chunks_used, 0);

        assert!(dir.path().join("messages").join("index.idx").exists());
        assert!(dir.path().join("logs").join("index.idx").exists());
        assert!(dir.path().join("accounts.tree").exists());
        assert!(dir.path().join("blobs.heap").exists());
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (engine, _dir) = create_test_engine().await;
        engine.messages().append(100, "hi").await.unwrap();
        // Earlier than the last message, but a different stream
        engine.logs().append(5, "login bob").await.unwrap();

        assert_eq!(engine.messages().range_query(0, 1000).await.unwrap().len(), 1);
        assert_eq!(engine.logs().range_query(0, 1000).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_profile_picture_lifecycle() {
        let (engine, _dir) = create_test_engine().await;
        engine
            .accounts()
            .insert("bob", &AccountRecord::new("Bob", "Builder", "hash"))
            .await
            .unwrap();
        assert_eq!(engine.profile_picture("bob").await.unwrap(), None);

        let first = engine.set_profile_picture("bob", &[1u8; 100]).await.unwrap();
        assert_eq!(engine.profile_picture("bob").await.unwrap(), Some(vec![1u8; 100]));

        // Replacing frees the old picture, which the next one reuses
        let second = engine.set_profile_picture("bob", &[2u8; 10]).await.unwrap();
        assert_ne!(first, second);
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.blobs.free_chunks, 2);

        let third = engine.set_profile_picture("bob", &[3u8; 100]).await.unwrap();
        assert_eq!(third, first);

        let removed = engine.remove_account("bob").await.unwrap();
        assert_eq!(removed.blob_pointer, third.offset());
        assert!(engine.profile_picture("bob").await.unwrap_err().is_not_found());
        // Freed run merges with the neighbouring free chunk
        let blobs = engine.stats().await.unwrap().blobs;
        assert_eq!(blobs.free_chunks, 3);
        assert_eq!(blobs.free_areas, 1);
    }

    #[tokio::test]
    async fn test_picture_for_missing_account() {
        let (engine, _dir) = create_test_engine().await;
        let err = engine.set_profile_picture("ghost", b"png").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(engine.stats().await.unwrap().blobs.total_chunks_used, 0);
    }
}
