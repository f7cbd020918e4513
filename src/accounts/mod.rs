//! Account storage
//!
//! - **tree**: binary search tree of fixed-size account records
//! - **blob**: chunked heap for profile pictures and attachments
//!
//! The two files are independent; an account refers to its picture by the
//! blob's offset in its `blob_pointer` field.

mod blob;
mod tree;

pub use blob::{
    BlobHandle, BlobHeader, BlobHeap, BlobReader, BlobStats, BlobWriter, BLOB_ENTRY_PREFIX,
    BLOB_HEADER_SIZE, DEFAULT_CHUNK_SIZE,
};
pub use tree::{
    calculate_username_value, AccountField, AccountRecord, Node, SearchResult, TreeHeader,
    TreeStore, NODE_SIZE, PAYLOAD_SIZE, TREE_HEADER_SIZE, USERNAME_LEN,
};
