//! # Chatstore
//!
//! File-based storage engine for a chat application: message and audit
//! streams, user accounts and profile pictures, without a database.
//!
//! ## Features
//!
//! - **Event logs**: time-ordered entries in fixed-capacity block files
//! - **Sparse index**: binary search from a time range to its blocks
//! - **Account tree**: on-disk binary search tree of fixed-size records
//! - **Blob heap**: chunked free-list allocator for binary attachments
//! - **Safe concurrency**: serialized writes, bounded reads, coalesced block creation
//!
//! ## Modules
//!
//! - [`storage`]: Event logs, block files and the top-level engine
//! - [`index`]: Time index over blocks
//! - [`accounts`]: Account tree and blob heap
//! - [`config`]: TOML + environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatstore::accounts::AccountRecord;
//! use chatstore::storage::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = StorageEngine::open(StorageConfig::default()).await?;
//!
//!     engine
//!         .accounts()
//!         .insert("bob", &AccountRecord::new("Bob", "Builder", "$2b$10$..."))
//!         .await?;
//!     engine.messages().append_entry(Entry::now("bob: hi")).await?;
//!
//!     let stats = engine.stats().await?;
//!     println!("{}", stats);
//!
//!     Ok(())
//! }
//! ```

pub mod accounts;
pub mod config;
pub mod index;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    Entry, EventLog, LogStats, StorageConfig, StorageEngine, StorageError, StorageResult,
    StorageStats,
};

pub use accounts::{AccountField, AccountRecord, BlobHandle, BlobHeap, TreeStore};

pub use index::TimeIndex;

pub use config::{
    Config, ConfigError, LoggingConfig, StorageConfig as ConfigStorageConfig,
};
