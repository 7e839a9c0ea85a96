use serde::{Deserialize, Serialize};
use tansu_types::{
    block::BlockPointer,
    entry::EntryType,
    MetadataRevision,
};

/// One byte range touched by a write; a zero length records a truncate
/// to `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRange {
    pub off: u64,
    pub len: u64,
}

impl WriteRange {
    pub fn is_truncate(&self) -> bool {
        self.len == 0
    }
}

/// A pointer that was replaced in place: the old reference becomes
/// unreferenced once the new one is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUpdate {
    pub old: BlockPointer,
    pub new: BlockPointer,
}

/// Reference bookkeeping shared by every operation kind. This is the
/// "update-tracking" state a failed sync resets before retrying.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpCommon {
    pub refs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockPointer>,
    pub updates: Vec<BlockUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOp {
    pub common: OpCommon,
    /// The file's tail pointer when the op was created.
    pub file: BlockPointer,
    pub writes: Vec<WriteRange>,
}

impl SyncOp {
    pub fn new(file: BlockPointer) -> Self {
        Self {
            common: OpCommon::default(),
            file,
            writes: Vec::new(),
        }
    }

    pub fn add_write(&mut self, off: u64, len: u64) -> WriteRange {
        let range = WriteRange { off, len };
        self.writes.push(range);
        range
    }

    pub fn add_truncate(&mut self, size: u64) -> WriteRange {
        let range = WriteRange { off: size, len: 0 };
        self.writes.push(range);
        range
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameOp {
    pub common: OpCommon,
    pub old_name: String,
    pub old_dir: BlockPointer,
    pub new_name: String,
    pub new_dir: BlockPointer,
    pub renamed: BlockPointer,
    pub renamed_type: EntryType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrChange {
    Exec,
    Mtime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetAttrOp {
    pub common: OpCommon,
    pub name: String,
    pub dir: BlockPointer,
    pub file: BlockPointer,
    pub attr: AttrChange,
}

/// Records a completed quota reclamation: the highest revision it
/// inspected, with the ids whose last reference went away carried as
/// unrefs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcOp {
    pub common: OpCommon,
    pub latest_rev: MetadataRevision,
}

impl GcOp {
    pub fn new(latest_rev: MetadataRevision) -> Self {
        Self {
            common: OpCommon::default(),
            latest_rev,
        }
    }
}

/// The operations a metadata revision can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Sync(SyncOp),
    Rename(RenameOp),
    SetAttr(SetAttrOp),
    Gc(GcOp),
}

impl Op {
    pub fn common(&self) -> &OpCommon {
        match self {
            Op::Sync(op) => &op.common,
            Op::Rename(op) => &op.common,
            Op::SetAttr(op) => &op.common,
            Op::Gc(op) => &op.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut OpCommon {
        match self {
            Op::Sync(op) => &mut op.common,
            Op::Rename(op) => &mut op.common,
            Op::SetAttr(op) => &mut op.common,
            Op::Gc(op) => &mut op.common,
        }
    }

    pub fn refs(&self) -> &[BlockPointer] {
        &self.common().refs
    }

    pub fn unrefs(&self) -> &[BlockPointer] {
        &self.common().unrefs
    }

    pub fn all_updates(&self) -> &[BlockUpdate] {
        &self.common().updates
    }

    pub fn add_ref_block(&mut self, ptr: BlockPointer) {
        self.common_mut().refs.push(ptr);
    }

    pub fn add_unref_block(&mut self, ptr: BlockPointer) {
        self.common_mut().unrefs.push(ptr);
    }

    pub fn add_update(&mut self, old: BlockPointer, new: BlockPointer) {
        self.common_mut().updates.push(BlockUpdate { old, new });
    }

    /// Clear only the reference bookkeeping, so a retried sync can
    /// refill it without double counting. Payload fields (write
    /// ranges, names) survive.
    pub fn reset_update_state(&mut self) {
        let common = self.common_mut();
        common.refs.clear();
        common.unrefs.clear();
        common.updates.clear();
    }
}
