//! Chatstore Index Structures
//!
//! - **TimeIndex**: sparse, sorted directory of block time ranges used to
//!   find the block files covering a query
//!
//! # Architecture
//!
//! ```text
//! Query: "messages between t1 and t2"
//!        ↓
//! TimeIndex: binary search for first block ending ≥ t1 → [blk 7, blk 8]
//!        ↓
//! Scan only those block files
//! ```

mod time_index;

pub use time_index::{IndexEntry, IndexHeader, TimeIndex, INDEX_ENTRY_SIZE, INDEX_HEADER_SIZE};
