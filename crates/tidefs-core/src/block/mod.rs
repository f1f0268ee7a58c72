//! Content-addressed block model.
//!
//! The engine never sees ciphertext: blocks live here as plaintext directory
//! and file payloads, and the block server assigns content-addressed
//! pointers when a block is readied for upload. Directory blocks map child
//! names to entries; file blocks carry contents. Indirection (splitting
//! large files across many blocks) happens behind the block-server boundary
//! and is not modeled here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length in bytes of a block content hash.
pub const BLOCK_ID_LEN: usize = 32;

/// Errors from block encoding/decoding.
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("block serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("expected a directory block")]
    NotADirBlock,
    #[error("expected a file block")]
    NotAFileBlock,
}

/// SHA-256 content hash of a block's canonical encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId([u8; BLOCK_ID_LEN]);

impl BlockId {
    pub const ZERO: BlockId = BlockId([0; BLOCK_ID_LEN]);

    pub fn from_bytes(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary canonical bytes into an id.
    pub fn hash_of(data: &[u8]) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, data);
        let mut bytes = [0; BLOCK_ID_LEN];
        bytes.copy_from_slice(digest.as_ref());
        Self(bytes)
    }

    /// A random id for a block that has not been readied yet.
    ///
    /// New files and directories need an identity before their first sync
    /// assigns them a permanent content-addressed one.
    pub fn temporary() -> Self {
        let mut bytes = [0; BLOCK_ID_LEN];
        rand::Rng::fill(&mut rand::rng(), &mut bytes[..]);
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A reference to a stored block: content id plus a nonce distinguishing
/// multiple live references to identical content.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockPointer {
    pub id: BlockId,
    pub ref_nonce: u64,
}

impl BlockPointer {
    /// The null pointer.
    pub const ZERO: BlockPointer = BlockPointer {
        id: BlockId::ZERO,
        ref_nonce: 0,
    };

    pub fn new(id: BlockId, ref_nonce: u64) -> Self {
        Self { id, ref_nonce }
    }

    /// A fresh temporary pointer for a not-yet-synced block.
    pub fn temporary() -> Self {
        Self {
            id: BlockId::temporary(),
            ref_nonce: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.id.is_zero()
    }

    /// The identity used for dirty tracking.
    pub fn bref(&self) -> BlockRef {
        BlockRef(*self)
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.ref_nonce)
    }
}

impl fmt::Debug for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Block identity used as a key in dirty sets and caches.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRef(BlockPointer);

impl BlockRef {
    pub fn pointer(&self) -> BlockPointer {
        self.0
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// What kind of entry a directory child is.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Exec,
    Dir,
    Sym,
}

impl EntryType {
    pub fn is_file(self) -> bool {
        matches!(self, EntryType::File | EntryType::Exec)
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryType::File => "file",
            EntryType::Exec => "exec",
            EntryType::Dir => "dir",
            EntryType::Sym => "sym",
        };
        f.write_str(s)
    }
}

/// One child of a directory block.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DirEntry {
    pub pointer: BlockPointer,
    pub entry_type: EntryType,
    pub size: u64,
    /// Unix nanoseconds.
    pub mtime: i64,
    /// Unix nanoseconds.
    pub ctime: i64,
    /// Target path, for symlinks only.
    pub sym_path: Option<String>,
}

impl DirEntry {
    pub fn new(pointer: BlockPointer, entry_type: EntryType, now: i64) -> Self {
        Self {
            pointer,
            entry_type,
            size: 0,
            mtime: now,
            ctime: now,
            sym_path: None,
        }
    }
}

/// A directory's children, keyed by name (deterministic order for hashing).
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct DirBlock {
    pub children: BTreeMap<String, DirEntry>,
}

impl DirBlock {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A file's contents.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct FileBlock {
    #[serde(with = "serde_bytes_compat")]
    pub contents: Vec<u8>,
}

// serde_json has no native bytes type; encode contents as an array of
// numbers through the default Vec<u8> impl. Kept behind a module alias so
// the representation can change in one place.
mod serde_bytes_compat {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        v.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}

/// A block as the engine sees it: directory or file payload.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Block {
    Dir(DirBlock),
    File(FileBlock),
}

impl Block {
    pub fn empty_dir() -> Self {
        Block::Dir(DirBlock::new())
    }

    pub fn empty_file() -> Self {
        Block::File(FileBlock::default())
    }

    /// Canonical encoding used for content addressing.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, BlockError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BlockError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn as_dir(&self) -> Result<&DirBlock, BlockError> {
        match self {
            Block::Dir(d) => Ok(d),
            Block::File(_) => Err(BlockError::NotADirBlock),
        }
    }

    pub fn as_dir_mut(&mut self) -> Result<&mut DirBlock, BlockError> {
        match self {
            Block::Dir(d) => Ok(d),
            Block::File(_) => Err(BlockError::NotADirBlock),
        }
    }

    pub fn as_file(&self) -> Result<&FileBlock, BlockError> {
        match self {
            Block::File(b) => Ok(b),
            Block::Dir(_) => Err(BlockError::NotAFileBlock),
        }
    }

    pub fn as_file_mut(&mut self) -> Result<&mut FileBlock, BlockError> {
        match self {
            Block::File(b) => Ok(b),
            Block::Dir(_) => Err(BlockError::NotAFileBlock),
        }
    }
}

/// A block encoded (and, in a real deployment, encrypted) for upload.
#[derive(Clone, Debug)]
pub struct ReadiedBlock {
    pub bytes: Vec<u8>,
}

impl ReadiedBlock {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let mut block = DirBlock::new();
        block.children.insert(
            "a".to_string(),
            DirEntry::new(BlockPointer::ZERO, EntryType::File, 7),
        );
        let block = Block::Dir(block);
        let id1 = BlockId::hash_of(&block.canonical_bytes().unwrap());
        let id2 = BlockId::hash_of(&block.canonical_bytes().unwrap());
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let empty = Block::empty_dir();
        let mut one = DirBlock::new();
        one.children.insert(
            "a".to_string(),
            DirEntry::new(BlockPointer::ZERO, EntryType::File, 7),
        );
        let one = Block::Dir(one);
        assert_ne!(
            BlockId::hash_of(&empty.canonical_bytes().unwrap()),
            BlockId::hash_of(&one.canonical_bytes().unwrap()),
        );
    }

    #[test]
    fn test_decode_round_trip() {
        let mut file = FileBlock::default();
        file.contents = b"hello world".to_vec();
        let block = Block::File(file);
        let decoded = Block::decode(&block.canonical_bytes().unwrap()).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn test_temporary_pointers_are_distinct() {
        let a = BlockPointer::temporary();
        let b = BlockPointer::temporary();
        assert_ne!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn test_kind_accessors() {
        let dir = Block::empty_dir();
        assert!(dir.as_dir().is_ok());
        assert!(matches!(dir.as_file(), Err(BlockError::NotAFileBlock)));

        let file = Block::empty_file();
        assert!(file.as_file().is_ok());
        assert!(matches!(file.as_dir(), Err(BlockError::NotADirBlock)));
    }

    #[test]
    fn test_zero_pointer() {
        assert!(BlockPointer::ZERO.is_zero());
        assert_eq!(BlockPointer::ZERO.bref().pointer(), BlockPointer::ZERO);
    }
}
