//! Core data types for the event log
//!
//! - `Entry`: one timestamped payload in a message or audit stream
//! - `LogStats`: summary of a stream's blocks

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Timestamp written over a wiped entry
pub const TOMBSTONE: i64 = -1;

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn new(timestamp: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }

    /// Create an entry stamped with the current time
    pub fn now(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Utc::now().timestamp_millis(), payload)
    }

    /// Wiped entries keep their length but lose timestamp and payload
    pub fn is_tombstone(&self) -> bool {
        self.timestamp == TOMBSTONE
    }

    /// Payload as UTF-8, lossily
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Summary of one event stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStats {
    /// Number of blocks registered in the index
    pub block_count: u64,
    /// Lowest timestamp in the index (0 when empty)
    pub lowest_timestamp: i64,
    /// Highest timestamp in the index (0 when empty)
    pub highest_timestamp: i64,
    /// Writes waiting on the stream's write chain
    pub queued_writes: usize,
    /// Reads currently holding a slot
    pub reads_in_flight: usize,
}

impl std::fmt::Display for LogStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Blocks: {}, Range: [{}, {}], Queued writes: {}, Reads in flight: {}",
            self.block_count,
            self.lowest_timestamp,
            self.highest_timestamp,
            self.queued_writes,
            self.reads_in_flight
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = Entry::new(1000, "hello");
        assert_eq!(entry.timestamp, 1000);
        assert_eq!(entry.payload_str(), "hello");
        assert!(!entry.is_tombstone());

        let now = Entry::now(vec![1, 2, 3]);
        assert!(now.timestamp > 0);
    }

    #[test]
    fn test_tombstone() {
        let entry = Entry::new(TOMBSTONE, vec![0, 0]);
        assert!(entry.is_tombstone());
    }
}
