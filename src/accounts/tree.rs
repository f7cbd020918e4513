//! On-disk binary search tree of accounts
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (24 bytes)                       │
//! │   node_count: u64                       │
//! │   next_free_node_offset: u64            │
//! │   root_offset: u64                      │
//! ├─────────────────────────────────────────┤
//! │ NODES (188 bytes each)                  │
//! │   username: [u8; 32]                    │
//! │   username_hash: u64                    │
//! │   left_child_offset: u64                │
//! │   right_child_offset: u64               │
//! │   payload: [u8; 132]                    │
//! │     first_name: [u8; 32]                │
//! │     last_name: [u8; 32]                 │
//! │     password_hash: [u8; 60]             │
//! │     blob_pointer: u64                   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Nodes are ordered by `(username_hash, username)`. Offset 0 is null.
//! Deleted slots form a free list through their first 8 bytes;
//! `node_count` counts slots ever appended, not live accounts.

use crate::storage::codec::{buffer_to_string, get_u64, put_u64, string_to_buffer};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::{exists, StoreFile};
use crate::storage::sync::WriteChain;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Header size in bytes
pub const TREE_HEADER_SIZE: u64 = 24;

/// Node size in bytes
pub const NODE_SIZE: u64 = 188;

pub const USERNAME_LEN: usize = 32;

/// Account payload size in bytes
pub const PAYLOAD_SIZE: u64 = 132;

const HASH_AT: usize = 32;
const LEFT_AT: u64 = 40;
const RIGHT_AT: u64 = 48;
const PAYLOAD_AT: u64 = 56;

/// Fields of the account payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountField {
    FirstName,
    LastName,
    PasswordHash,
    BlobPointer,
}

impl AccountField {
    /// Byte offset within the payload
    pub fn offset(self) -> u64 {
        match self {
            AccountField::FirstName => 0,
            AccountField::LastName => 32,
            AccountField::PasswordHash => 64,
            AccountField::BlobPointer => 124,
        }
    }

    pub fn len(self) -> usize {
        match self {
            AccountField::FirstName | AccountField::LastName => 32,
            AccountField::PasswordHash => 60,
            AccountField::BlobPointer => 8,
        }
    }

    fn slice(self, payload: &[u8]) -> &[u8] {
        let at = self.offset() as usize;
        &payload[at..at + self.len()]
    }
}

/// Account data stored in a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
    /// Offset of the profile picture in the blob heap, 0 if none
    pub blob_pointer: u64,
}

impl AccountRecord {
    pub fn new(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            password_hash: password_hash.into(),
            blob_pointer: 0,
        }
    }

    pub fn to_bytes(&self) -> StorageResult<[u8; PAYLOAD_SIZE as usize]> {
        let mut buf = [0u8; PAYLOAD_SIZE as usize];
        for (field, value) in [
            (AccountField::FirstName, &self.first_name),
            (AccountField::LastName, &self.last_name),
            (AccountField::PasswordHash, &self.password_hash),
        ] {
            let at = field.offset() as usize;
            buf[at..at + field.len()].copy_from_slice(&string_to_buffer(value, field.len())?);
        }
        put_u64(&mut buf, AccountField::BlobPointer.offset() as usize, self.blob_pointer);
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        Ok(Self {
            first_name: buffer_to_string(AccountField::FirstName.slice(buf))?,
            last_name: buffer_to_string(AccountField::LastName.slice(buf))?,
            password_hash: buffer_to_string(AccountField::PasswordHash.slice(buf))?,
            blob_pointer: get_u64(buf, AccountField::BlobPointer.offset() as usize),
        })
    }
}

/// Sum of the username's UTF-16 code units
pub fn calculate_username_value(username: &str) -> u64 {
    username.encode_utf16().map(u64::from).sum()
}

fn compare_keys(hash: u64, username: &str, node: &Node) -> Ordering {
    hash.cmp(&node.username_hash)
        .then_with(|| username.cmp(node.username.as_str()))
}

/// Tree file header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeHeader {
    pub node_count: u64,
    pub next_free_node_offset: u64,
    pub root_offset: u64,
}

impl TreeHeader {
    pub fn to_bytes(&self) -> [u8; TREE_HEADER_SIZE as usize] {
        let mut buf = [0u8; TREE_HEADER_SIZE as usize];
        put_u64(&mut buf, 0, self.node_count);
        put_u64(&mut buf, 8, self.next_free_node_offset);
        put_u64(&mut buf, 16, self.root_offset);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            node_count: get_u64(buf, 0),
            next_free_node_offset: get_u64(buf, 8),
            root_offset: get_u64(buf, 16),
        }
    }

    fn end(&self) -> u64 {
        TREE_HEADER_SIZE + self.node_count * NODE_SIZE
    }

    fn is_slot(&self, offset: u64) -> bool {
        offset >= TREE_HEADER_SIZE
            && (offset - TREE_HEADER_SIZE) % NODE_SIZE == 0
            && offset < self.end()
    }
}

/// One decoded tree node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub username: String,
    pub username_hash: u64,
    pub left: u64,
    pub right: u64,
    pub record: AccountRecord,
}

impl Node {
    pub fn new(username: &str, record: AccountRecord) -> Self {
        Self {
            username: username.to_string(),
            username_hash: calculate_username_value(username),
            left: 0,
            right: 0,
            record,
        }
    }

    pub fn to_bytes(&self) -> StorageResult<[u8; NODE_SIZE as usize]> {
        let mut buf = [0u8; NODE_SIZE as usize];
        buf[..USERNAME_LEN].copy_from_slice(&string_to_buffer(&self.username, USERNAME_LEN)?);
        put_u64(&mut buf, HASH_AT, self.username_hash);
        put_u64(&mut buf, LEFT_AT as usize, self.left);
        put_u64(&mut buf, RIGHT_AT as usize, self.right);
        buf[PAYLOAD_AT as usize..].copy_from_slice(&self.record.to_bytes()?);
        Ok(buf)
    }

    pub fn from_bytes(buf: &[u8]) -> StorageResult<Self> {
        Ok(Self {
            username: buffer_to_string(&buf[..USERNAME_LEN])?,
            username_hash: get_u64(buf, HASH_AT),
            left: get_u64(buf, LEFT_AT as usize),
            right: get_u64(buf, RIGHT_AT as usize),
            record: AccountRecord::from_bytes(&buf[PAYLOAD_AT as usize..])?,
        })
    }

    fn child_count(&self) -> usize {
        (self.left != 0) as usize + (self.right != 0) as usize
    }
}

/// Outcome of a tree search.
///
/// When the username is missing, `offset`/`node` describe the node the
/// username would hang from. With `get_parent`, they describe the match's
/// parent instead (offset 0 and no node when the match is the root).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResult {
    pub file_empty: bool,
    pub node_exists: bool,
    pub offset: u64,
    pub node: Option<Node>,
}

/// A located node together with its parent
struct Located {
    parent: Option<(u64, Node)>,
    offset: u64,
    node: Node,
}

fn validate_username(username: &str) -> StorageResult<()> {
    if username.is_empty() {
        return Err(StorageError::InvalidArgument(
            "username must not be empty".to_string(),
        ));
    }
    string_to_buffer(username, USERNAME_LEN).map(|_| ())
}

/// Account tree over one file
pub struct TreeStore {
    path: PathBuf,
    header: Mutex<Option<TreeHeader>>,
    writes: WriteChain,
}

impl TreeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            header: Mutex::new(None),
            writes: WriteChain::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the tree file, or validate the one already on disk
    pub async fn create(&self, overwrite: bool) -> StorageResult<()> {
        self.writes
            .run(async {
                if overwrite || !exists(&self.path).await? {
                    let header = TreeHeader::default();
                    let mut file = StoreFile::create(&self.path).await?;
                    let result = file.write_at(0, &header.to_bytes()).await;
                    file.finish(result).await?;
                    *self.header.lock()? = Some(header);
                    tracing::debug!("Created account tree {:?}", self.path);
                    return Ok(());
                }

                let mut file = StoreFile::open_read(&self.path).await?;
                let result = async {
                    let mut buf = [0u8; TREE_HEADER_SIZE as usize];
                    file.read_exact_at(0, &mut buf).await?;
                    let header = TreeHeader::from_bytes(&buf);
                    let len = file.len().await?;
                    let pointers_ok = [header.root_offset, header.next_free_node_offset]
                        .iter()
                        .all(|&p| p == 0 || header.is_slot(p));
                    if len < header.end() || !pointers_ok {
                        return Err(StorageError::Corruption(format!(
                            "{}: inconsistent header {:?} for {} bytes",
                            self.path.display(),
                            header,
                            len
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
    pub async fn header(&self) -> StorageResult<TreeHeader> {
        if let Some(header) = *self.header.lock()? {
            return Ok(header);
        }

        let mut file = StoreFile::open_read(&self.path).await?;
        let mut buf = [0u8; TREE_HEADER_SIZE as usize];
        let result = file.read_exact_at(0, &mut buf).await;
        file.finish(result).await?;

        let header = TreeHeader::from_bytes(&buf);
        *self.header.lock()? = Some(header);
        Ok(header)
    }

    async fn write_header(&self, file: &mut StoreFile, header: TreeHeader) -> StorageResult<()> {
        file.write_at(0, &header.to_bytes()).await?;
        *self.header.lock()? = Some(header);
        Ok(())
    }

    async fn read_node(
        &self,
        file: &mut StoreFile,
        header: &TreeHeader,
        offset: u64,
    ) -> StorageResult<Node> {
        if !header.is_slot(offset) {
            return Err(StorageError::Corruption(format!(
                "{}: node pointer {} is not a slot",
                self.path.display(),
                offset
            )));
        }
        let mut buf = [0u8; NODE_SIZE as usize];
        file.read_exact_at(offset, &mut buf).await?;
        Node::from_bytes(&buf)
    }

    async fn write_pointer(file: &mut StoreFile, at: u64, target: u64) -> StorageResult<()> {
        file.write_at(at, &target.to_be_bytes()).await
    }

    /// Descend from `start` looking for `username`.
    ///
    /// Returns `Ok(Err(last))` with the would-be parent when it is missing.
    async fn descend(
        &self,
        file: &mut StoreFile,
        header: &TreeHeader,
        username: &str,
        start: u64,
    ) -> StorageResult<Result<Located, Option<(u64, Node)>>> {
        let hash = calculate_username_value(username);
        let mut parent: Option<(u64, Node)> = None;
        let mut cursor = start;
        let mut depth = 0u64;

        while cursor != 0 {
            depth += 1;
            if depth > header.node_count {
                return Err(StorageError::Corruption(format!(
                    "{}: cycle below offset {}",
                    self.path.display(),
                    start
                )));
            }

            let node = self.read_node(file, header, cursor).await?;
            let next = match compare_keys(hash, username, &node) {
                Ordering::Equal => {
                    return Ok(Ok(Located {
                        parent,
                        offset: cursor,
                        node,
                    }))
                }
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
            };
            parent = Some((cursor, node));
            cursor = next;
        }
        Ok(Err(parent))
    }

    /// Search for `username` from the root, or from `start` when given
    pub async fn search(
        &self,
        username: &str,
        get_parent: bool,
        start: Option<u64>,
    ) -> StorageResult<SearchResult> {
        let header = self.header().await?;
        let root = start.unwrap_or(header.root_offset);
        if root == 0 {
            return Ok(SearchResult {
                file_empty: header.root_offset == 0,
                ..Default::default()
            });
        }

        let mut file = StoreFile::open_read(&self.path).await?;
        let result = self.descend(&mut file, &header, username, root).await;
        let found = file.finish(result).await?;

        Ok(match found {
            Ok(located) if get_parent => {
                let (offset, node) = located.parent.map_or((0, None), |(o, n)| (o, Some(n)));
                SearchResult {
                    file_empty: false,
                    node_exists: true,
                    offset,
                    node,
                }
            }
            Ok(located) => SearchResult {
                file_empty: false,
                node_exists: true,
                offset: located.offset,
                node: Some(located.node),
            },
            Err(parent) => {
                let (offset, node) = parent.map_or((0, None), |(o, n)| (o, Some(n)));
                SearchResult {
                    file_empty: false,
                    node_exists: false,
                    offset,
                    node,
                }
            }
        })
    }

    /// Look up an account
    pub async fn get(&self, username: &str) -> StorageResult<AccountRecord> {
        validate_username(username)?;
        let result = self.search(username, false, None).await?;
        match result.node {
            Some(node) if result.node_exists => Ok(node.record),
            _ => Err(StorageError::NotFound(format!("account '{}'", username))),
        }
    }

    pub async fn contains(&self, username: &str) -> StorageResult<bool> {
        validate_username(username)?;
        Ok(self.search(username, false, None).await?.node_exists)
    }

    /// Insert a new account
    pub async fn insert(&self, username: &str, record: &AccountRecord) -> StorageResult<()> {
        self.add_node(username, record).await.map(|_| ())
    }

    /// Write a new node for `username`; returns its offset
    pub async fn add_node(&self, username: &str, record: &AccountRecord) -> StorageResult<u64> {
        validate_username(username)?;
        let node = Node::new(username, record.clone());
        let bytes = node.to_bytes()?;

        self.writes
            .run(async {
                let mut header = self.header().await?;
                let mut file = StoreFile::open(&self.path).await?;
                let result = async {
                    let parent = if header.root_offset == 0 {
                        None
                    } else {
                        match self.descend(&mut file, &header, username, header.root_offset).await? {
                            Ok(_) => {
                                return Err(StorageError::AlreadyExists(format!(
                                    "account '{}'",
                                    username
                                )))
                            }
                            Err(parent) => parent,
                        }
                    };

                    // Reuse the free-list head, else append a slot
                    let offset = if header.next_free_node_offset != 0 {
                        let slot = header.next_free_node_offset;
                        if !header.is_slot(slot) {
                            return Err(StorageError::Corruption(format!(
                                "{}: free list head {} is not a slot",
                                self.path.display(),
                                slot
                            )));
                        }
                        let mut word = [0u8; 8];
                        file.read_exact_at(slot, &mut word).await?;
                        header.next_free_node_offset = u64::from_be_bytes(word);
                        slot
                    } else {
                        let slot = header.end();
                        header.node_count += 1;
                        slot
                    };

                    file.write_at(offset, &bytes).await?;
                    if parent.is_none() {
                        header.root_offset = offset;
                    }
                    self.write_header(&mut file, header).await?;

                    if let Some((parent_offset, parent_node)) = parent {
                        let side = match compare_keys(node.username_hash, username, &parent_node) {
                            Ordering::Less => LEFT_AT,
                            _ => RIGHT_AT,
                        };
                        Self::write_pointer(&mut file, parent_offset + side, offset).await?;
                    }
                    Ok(offset)
                }
                .await;
                let offset = file.finish(result).await?;
                tracing::debug!("Inserted account '{}' at {} in {:?}", username, offset, self.path);
                Ok(offset)
            })
            .await
    }

    /// Overwrite part of an account's payload in place
    pub async fn modify_node(
        &self,
        username: &str,
        byte_offset: u64,
        data: &[u8],
    ) -> StorageResult<()> {
        validate_username(username)?;
        let past_end = byte_offset
            .checked_add(data.len() as u64)
            .map_or(true, |end| end > PAYLOAD_SIZE);
        if past_end {
            return Err(StorageError::InvalidArgument(format!(
                "{} bytes at payload offset {} exceed the {}-byte payload",
                data.len(),
                byte_offset,
                PAYLOAD_SIZE
            )));
        }

        self.writes
            .run(async {
                let header = self.header().await?;
                if header.root_offset == 0 {
                    return Err(StorageError::NotFound(format!("account '{}'", username)));
                }
                let mut file = StoreFile::open(&self.path).await?;
                let result = async {
                    let located = self
                        .descend(&mut file, &header, username, header.root_offset)
                        .await?
                        .map_err(|_| StorageError::NotFound(format!("account '{}'", username)))?;
                    file.write_at(located.offset + PAYLOAD_AT + byte_offset, data)
                        .await
                }
                .await;
                file.finish(result).await?;
                tracing::debug!("Modified account '{}' at payload offset {}", username, byte_offset);
                Ok(())
            })
            .await
    }

    pub async fn update(&self, username: &str, field_offset: u64, bytes: &[u8]) -> StorageResult<()> {
        self.modify_node(username, field_offset, bytes).await
    }

    /// Overwrite one payload field, zero-padding shorter values
    pub async fn update_field(
        &self,
        username: &str,
        field: AccountField,
        value: &[u8],
    ) -> StorageResult<()> {
        if value.len() > field.len() {
            return Err(StorageError::InvalidArgument(format!(
                "{:?} holds {} bytes, got {}",
                field,
                field.len(),
                value.len()
            )));
        }
        let mut padded = vec![0u8; field.len()];
        padded[..value.len()].copy_from_slice(value);
        self.modify_node(username, field.offset(), &padded).await
    }

    /// Delete an account
    pub async fn delete(&self, username: &str) -> StorageResult<()> {
        self.remove_node(username).await
    }

    /// Unlink `username` from the tree and push its slot onto the free list
    pub async fn remove_node(&self, username: &str) -> StorageResult<()> {
        validate_username(username)?;

        self.writes
            .run(async {
                let mut header = self.header().await?;
                if header.root_offset == 0 {
                    return Err(StorageError::NotFound(format!("account '{}'", username)));
                }
                let mut file = StoreFile::open(&self.path).await?;
                let result = async {
                    let located = self
                        .descend(&mut file, &header, username, header.root_offset)
                        .await?
                        .map_err(|_| StorageError::NotFound(format!("account '{}'", username)))?;
                    let node = &located.node;

                    let replacement = match node.child_count() {
                        0 => 0,
                        1 => node.left.max(node.right),
                        _ => {
                            // Right child takes the slot; the left subtree hangs
                            // off the leftmost node of the right subtree
                            let mut leftmost = node.right;
                            let mut leftmost_node =
                                self.read_node(&mut file, &header, leftmost).await?;
                            let mut depth = 0u64;
                            while leftmost_node.left != 0 {
                                depth += 1;
                                if depth > header.node_count {
                                    return Err(StorageError::Corruption(format!(
                                        "{}: cycle in right subtree of '{}'",
                                        self.path.display(),
                                        username
                                    )));
                                }
                                leftmost = leftmost_node.left;
                                leftmost_node = self.read_node(&mut file, &header, leftmost).await?;
                            }
                            Self::write_pointer(&mut file, leftmost + LEFT_AT, node.left).await?;
                            node.right
                        }
                    };

                    match &located.parent {
                        Some((parent_offset, parent_node)) => {
                            let side = if parent_node.left == located.offset {
                                LEFT_AT
                            } else {
                                RIGHT_AT
                            };
                            Self::write_pointer(&mut file, parent_offset + side, replacement)
                                .await?;
                        }
                        None => {
                            header.root_offset = replacement;
                            self.write_header(&mut file, header).await?;
                        }
                    }

                    let mut vacated = [0u8; NODE_SIZE as usize];
                    put_u64(&mut vacated, 0, header.next_free_node_offset);
                    file.write_at(located.offset, &vacated).await?;
                    header.next_free_node_offset = located.offset;
                    self.write_header(&mut file, header).await
                }
                .await;
                file.finish(result).await?;
                tracing::debug!("Removed account '{}' from {:?}", username, self.path);
                Ok(())
            })
            .await
    }

    /// Every username in tree order
    pub async fn usernames(&self) -> StorageResult<Vec<String>> {
        let header = self.header().await?;
        if header.root_offset == 0 {
            return Ok(Vec::new());
        }

        let mut file = StoreFile::open_read(&self.path).await?;
        let result = async {
            let mut names = Vec::new();
            let mut stack: Vec<Node> = Vec::new();
            let mut cursor = header.root_offset;
            let mut visited = 0u64;

            loop {
                while cursor != 0 {
                    visited += 1;
                    if visited > header.node_count {
                        return Err(StorageError::Corruption(format!(
                            "{}: tree visits more nodes than it holds",
                            self.path.display()
                        )));
                    }
                    let node = self.read_node(&mut file, &header, cursor).await?;
                    cursor = node.left;
                    stack.push(node);
                }
                match stack.pop() {
                    Some(node) => {
                        cursor = node.right;
                        names.push(node.username);
                    }
                    None => break,
                }
            }
            Ok(names)
        }
        .await;
        file.finish(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn create_test_tree() -> (TreeStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let tree = TreeStore::new(dir.path().join("accounts.tree"));
        tree.create(false).await.unwrap();
        (tree, dir)
    }

    fn record(first: &str) -> AccountRecord {
        AccountRecord::new(first, "Tester", "$2b$10$abcdefghijklmnopqrstuv")
    }

    #[test]
    fn test_username_value() {
        assert_eq!(calculate_username_value("bob"), 307);
        assert_eq!(calculate_username_value("amy"), 327);
        assert_eq!(calculate_username_value("zoe"), 334);
        assert_eq!(calculate_username_value("ab"), calculate_username_value("ba"));
        // Astral characters count as a surrogate pair
        assert_eq!(calculate_username_value("\u{1F600}"), 0xD83D + 0xDE00);
    }

    #[test]
    fn test_node_layout() {
        let mut node = Node::new("bob", record("Bob"));
        node.left = 212;
        node.record.blob_pointer = 16;
        let bytes = node.to_bytes().unwrap();
        assert_eq!(bytes.len(), 188);
        assert_eq!(&bytes[..3], b"bob");
        assert_eq!(get_u64(&bytes, 32), 307);
        assert_eq!(get_u64(&bytes, 40), 212);
        assert_eq!(&bytes[56..59], b"Bob");
        assert_eq!(get_u64(&bytes, 180), 16);
        assert_eq!(Node::from_bytes(&bytes).unwrap(), node);

        let long = AccountRecord::new("x".repeat(33), "", "");
        assert!(long.to_bytes().unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_insert_get_delete() {
        let (tree, _dir) = create_test_tree().await;
        assert!(tree.search("bob", false, None).await.unwrap().file_empty);

        for name in ["bob", "amy", "zoe"] {
            tree.insert(name, &record(name)).await.unwrap();
        }
        assert_eq!(tree.get("amy").await.unwrap().first_name, "amy");

        let err = tree.insert("bob", &record("again")).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));

        tree.delete("bob").await.unwrap();
        assert!(tree.get("bob").await.unwrap_err().is_not_found());
        assert_eq!(tree.get("amy").await.unwrap(), record("amy"));
        assert_eq!(tree.get("zoe").await.unwrap(), record("zoe"));
        assert_eq!(tree.usernames().await.unwrap(), vec!["amy", "zoe"]);

        assert!(tree.delete("bob").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_with_two_children() {
        let (tree, _dir) = create_test_tree().await;
        for name in ["m", "a", "z", "x", "y"] {
            tree.insert(name, &record(name)).await.unwrap();
        }

        let root = tree.header().await.unwrap().root_offset;
        let m = tree.search("m", false, None).await.unwrap();
        assert_eq!(m.offset, root);
        let m_node = m.node.unwrap();
        assert!(m_node.left != 0 && m_node.right != 0);

        tree.delete("m").await.unwrap();

        // z is promoted; a hangs off x, the leftmost node under z
        let z = tree.search("z", false, None).await.unwrap();
        assert_eq!(tree.header().await.unwrap().root_offset, z.offset);
        let x = tree.search("x", false, None).await.unwrap();
        let a = tree.search("a", false, None).await.unwrap();
        assert_eq!(x.node.unwrap().left, a.offset);

        let parent = tree.search("a", true, None).await.unwrap();
        assert_eq!(parent.node.unwrap().username, "x");
        assert_eq!(tree.usernames().await.unwrap(), vec!["a", "x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_hash_collisions_tie_break_on_name() {
        let (tree, _dir) = create_test_tree().await;
        tree.insert("ba", &record("second")).await.unwrap();
        tree.insert("ab", &record("first")).await.unwrap();

        assert_eq!(tree.get("ab").await.unwrap().first_name, "first");
        assert_eq!(tree.get("ba").await.unwrap().first_name, "second");
        assert_eq!(tree.usernames().await.unwrap(), vec!["ab", "ba"]);

        let parent = tree.search("ab", true, None).await.unwrap();
        assert!(parent.node_exists);
        assert_eq!(parent.node.unwrap().username, "ba");
    }

    #[tokio::test]
    async fn test_freed_slot_is_reused() {
        let (tree, _dir) = create_test_tree().await;
        tree.insert("ann", &record("ann")).await.unwrap();
        let slot = tree.add_node("ben", &record("ben")).await.unwrap();
        assert_eq!(tree.header().await.unwrap().node_count, 2);

        tree.delete("ben").await.unwrap();
        assert_eq!(tree.header().await.unwrap().next_free_node_offset, slot);

        let reused = tree.add_node("cat", &record("cat")).await.unwrap();
        assert_eq!(reused, slot);
        let header = tree.header().await.unwrap();
        assert_eq!(header.node_count, 2);
        assert_eq!(header.next_free_node_offset, 0);
        assert_eq!(tree.get("cat").await.unwrap().first_name, "cat");
    }

    #[tokio::test]
    async fn test_modify_fields() {
        let (tree, _dir) = create_test_tree().await;
        tree.insert("amy", &record("Amy")).await.unwrap();

        tree.update_field("amy", AccountField::LastName, b"Pond")
            .await
            .unwrap();
        tree.update_field("amy", AccountField::BlobPointer, &80u64.to_be_bytes())
            .await
            .unwrap();
        let amy = tree.get("amy").await.unwrap();
        assert_eq!(amy.last_name, "Pond");
        assert_eq!(amy.blob_pointer, 80);
        assert_eq!(amy.first_name, "Amy");

        let err = tree.update("amy", 130, &[1, 2, 3]).await.unwrap_err();
        assert!(err.is_validation());
        let err = tree.update("amy", u64::MAX, b"x").await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(tree.get("amy").await.unwrap().last_name, "Pond");
        let err = tree.update("nobody", 0, b"x").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_reopen_keeps_tree() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accounts.tree");
        {
            let tree = TreeStore::new(&path);
            tree.create(false).await.unwrap();
            tree.insert("bob", &record("bob")).await.unwrap();
        }
        let tree = TreeStore::new(&path);
        tree.create(false).await.unwrap();
        assert!(tree.contains("bob").await.unwrap());

        tree.create(true).await.unwrap();
        assert!(!tree.contains("bob").await.unwrap());
    }
}
