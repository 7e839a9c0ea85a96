use serde::{Deserialize, Serialize};

use crate::block::{BlockInfo, BlockPointer, BlockRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntryType {
    #[default]
    File,
    Executable,
    Dir,
    Symlink,
}

/// One name in a directory, pointing at the entry's top block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DirEntry {
    pub info: BlockInfo,
    pub entry_type: EntryType,
    pub size: u64,
    /// Unix nanoseconds.
    pub mtime: i64,
    pub ctime: i64,
    /// Target path, for symlinks only.
    pub sym_path: String,
}

impl DirEntry {
    pub fn ptr(&self) -> BlockPointer {
        self.info.ptr
    }

    pub fn block_ref(&self) -> BlockRef {
        self.info.ptr.block_ref()
    }
}
