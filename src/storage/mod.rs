//! Chatstore Storage Engine
//!
//! This module provides the event-log side of the engine and the plumbing
//! shared with the account stores:
//!
//! - **types**: Core data structures (Entry, LogStats)
//! - **window**: Fixed-size FIFO window for bounded result sets
//! - **block**: Block file format
//! - **log**: Event log facade over index + blocks
//! - **engine**: Opens every store of a data directory
//! - **sync**: Write chain, read gate, creation coalescing
//! - **file**: Scoped open-operate-close file access
//! - **codec**: Big-endian integer and fixed-width string fields
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Entry → WriteChain → BlockStore (open block | coalesced creation) → TimeIndex
//!
//! Read Path:
//!   Query → barrier → ReadGate → TimeIndex::blocks → block scans → Entries
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use chatstore::storage::{StorageConfig, StorageEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = StorageEngine::open(StorageConfig::new("./data")).await?;
//!
//!     engine.messages().append(1_700_000_000_000, "hello").await?;
//!     let recent = engine.messages().near_query(i64::MAX, 20, true).await?;
//!     println!("{} messages", recent.len());
//!
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod codec;
pub mod engine;
pub mod error;
pub mod file;
pub mod log;
pub mod sync;
pub mod types;
pub mod window;

// Re-export commonly used types
pub use block::{BlockHeader, BlockStore, BLOCK_HEADER_SIZE, ENTRY_HEADER_SIZE};
pub use engine::{StorageConfig, StorageEngine, StorageStats};
pub use error::{StorageError, StorageResult};
pub use log::{EventLog, DEFAULT_BLOCK_CAPACITY, DEFAULT_READ_LIMIT};
pub use sync::{ReadGate, WriteChain};
pub use types::{Entry, LogStats, TOMBSTONE};
pub use window::FixedWindow;
