use std::{
    collections::HashMap,
    fmt::{Debug, Display, Formatter},
};

use serde::{Deserialize, Serialize};
use tansu_common::{DataVer, KeyGen};

use crate::{entry::DirEntry, UserId};

pub const BLOCK_ID_BYTES: usize = 32;

/// Content-addressed block identifier. Permanent ids are the hash of
/// the readied bytes; temporary ids are random and only ever live in
/// the dirty cache.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct BlockId(pub [u8; BLOCK_ID_BYTES]);

impl BlockId {
    pub fn is_initialized(&self) -> bool {
        self.0 != [0u8; BLOCK_ID_BYTES]
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockId({})", self)
    }
}

/// Distinguishes logically distinct references that share a de-dup'd id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct RefNonce(pub [u8; 8]);

pub const ZERO_REF_NONCE: RefNonce = RefNonce([0u8; 8]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockPointer {
    pub id: BlockId,
    pub key_gen: KeyGen,
    pub data_ver: DataVer,
    pub creator: UserId,
    pub ref_nonce: RefNonce,
}

impl BlockPointer {
    pub fn is_valid(&self) -> bool {
        self.id.is_initialized()
    }

    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            id: self.id,
            ref_nonce: self.ref_nonce,
        }
    }
}

impl Display for BlockPointer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:02x?}", self.id, self.ref_nonce.0[0])
    }
}

/// The hash-map key for one logical reference to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockRef {
    pub id: BlockId,
    pub ref_nonce: RefNonce,
}

/// A pointer plus the size of the block's encoded form. A zero encoded
/// size marks a block that has not been readied yet, or was re-dirtied
/// after its last ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockInfo {
    pub ptr: BlockPointer,
    pub encoded_size: u32,
}

impl BlockInfo {
    pub fn block_ref(&self) -> BlockRef {
        self.ptr.block_ref()
    }
}

/// One entry in an indirect file block's pointer list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndirectFilePtr {
    pub info: BlockInfo,
    pub off: u64,
    /// Set when this subtree may contain unmaterialised holes.
    pub holes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileBlock {
    pub is_indirect: bool,
    /// Raw bytes; empty for indirect blocks.
    pub contents: Vec<u8>,
    /// Child pointers, offsets strictly increasing, `iptrs[0].off == 0`.
    /// Empty for direct blocks.
    pub iptrs: Vec<IndirectFilePtr>,
}

impl FileBlock {
    pub fn new_direct() -> FileBlock {
        FileBlock::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirBlock {
    pub children: HashMap<String, DirEntry>,
}

/// A block is either file data (direct or indirect) or a directory.
/// Mismatches at the public API surface as not-a-file-block /
/// not-a-dir-block errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Block {
    File(FileBlock),
    Dir(DirBlock),
}

impl Block {
    pub fn as_file(&self) -> Option<&FileBlock> {
        match self {
            Block::File(fb) => Some(fb),
            Block::Dir(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&DirBlock> {
        match self {
            Block::File(_) => None,
            Block::Dir(db) => Some(db),
        }
    }

    /// The plaintext payload size, before any encoding.
    pub fn plain_size(&self) -> usize {
        match self {
            Block::File(fb) => fb.contents.len(),
            Block::Dir(db) => db.children.len(),
        }
    }
}
