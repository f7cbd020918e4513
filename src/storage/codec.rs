//! Byte-level helpers shared by every file format
//!
//! All integers on disk are 64-bit big-endian. Strings are stored as
//! zero-padded UTF-8 in fixed-width fields.

use crate::storage::error::{StorageError, StorageResult};

/// Width of every integer field on disk
pub const WORD: usize = 8;

#[inline]
pub fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + WORD].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_i64(buf: &mut [u8], at: usize, value: i64) {
    buf[at..at + WORD].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; WORD];
    word.copy_from_slice(&buf[at..at + WORD]);
    u64::from_be_bytes(word)
}

#[inline]
pub fn get_i64(buf: &[u8], at: usize) -> i64 {
    let mut word = [0u8; WORD];
    word.copy_from_slice(&buf[at..at + WORD]);
    i64::from_be_bytes(word)
}

/// Encode `value` into a zero-padded field of exactly `width` bytes.
pub fn string_to_buffer(value: &str, width: usize) -> StorageResult<Vec<u8>> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(StorageError::InvalidArgument(format!(
            "'{}' is {} bytes, field holds {}",
            value,
            bytes.len(),
            width
        )));
    }
    if bytes.contains(&0) {
        return Err(StorageError::InvalidArgument(
            "strings may not contain NUL bytes".to_string(),
        ));
    }

    let mut buf = vec![0u8; width];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// Decode a zero-padded field back into a string.
pub fn buffer_to_string(buf: &[u8]) -> StorageResult<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec())
        .map_err(|e| StorageError::Corruption(format!("invalid UTF-8 in string field: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_big_endian() {
        let mut buf = [0u8; 16];
        put_u64(&mut buf, 0, 1);
        put_i64(&mut buf, 8, -1);

        assert_eq!(buf[7], 1);
        assert_eq!(&buf[8..16], &[0xff; 8]);
        assert_eq!(get_u64(&buf, 0), 1);
        assert_eq!(get_i64(&buf, 8), -1);
    }

    #[test]
    fn test_fixed_width_strings() {
        let buf = string_to_buffer("amy", 32).unwrap();
        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[..3], b"amy");
        assert!(buf[3..].iter().all(|&b| b == 0));
        assert_eq!(buffer_to_string(&buf).unwrap(), "amy");

        // A field filled to the brim has no terminator
        let full = string_to_buffer("abcd", 4).unwrap();
        assert_eq!(buffer_to_string(&full).unwrap(), "abcd");
    }

    #[test]
    fn test_oversized_string_rejected() {
        let err = string_to_buffer("this name is far too long", 8).unwrap_err();
        assert!(err.is_validation());
    }
}
