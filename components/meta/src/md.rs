use serde::{Deserialize, Serialize};
use tansu_common::KeyGen;
use tansu_types::{
    block::BlockInfo,
    entry::DirEntry,
    BranchId, KeyMeta, MetadataRevision, TlfId, UserId, MASTER_BRANCH,
};

use crate::ops::Op;

/// One revision of a folder's metadata: the root entry, the operations
/// that produced this revision, and the reference byte accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootMetadata {
    pub tlf: TlfId,
    pub branch: BranchId,
    pub revision: MetadataRevision,
    /// False while this revision sits on an unmerged (conflict) branch.
    pub merged: bool,
    pub writers: Vec<UserId>,
    pub key_gen: KeyGen,
    /// The folder's root directory entry.
    pub root: DirEntry,
    pub ops: Vec<Op>,
    pub ref_bytes: u64,
    pub unref_bytes: u64,
    pub disk_usage: u64,
}

impl RootMetadata {
    pub fn new(tlf: TlfId, writers: Vec<UserId>) -> Self {
        Self {
            tlf,
            branch: MASTER_BRANCH,
            revision: MetadataRevision::UNINITIALIZED,
            merged: true,
            writers,
            key_gen: 1,
            root: DirEntry::default(),
            ops: Vec::new(),
            ref_bytes: 0,
            unref_bytes: 0,
            disk_usage: 0,
        }
    }

    pub fn key_meta(&self) -> KeyMeta {
        KeyMeta {
            tlf: self.tlf,
            key_gen: self.key_gen,
        }
    }

    pub fn latest_key_generation(&self) -> KeyGen {
        self.key_gen
    }

    pub fn is_writer(&self, user: UserId) -> bool {
        self.writers.contains(&user)
    }

    pub fn add_op(&mut self, op: Op) {
        self.ops.push(op);
    }

    fn current_op_mut(&mut self) -> Option<&mut Op> {
        self.ops.last_mut()
    }

    /// Record a new reference created by the current operation.
    pub fn add_ref_block(&mut self, info: BlockInfo) {
        self.ref_bytes += u64::from(info.encoded_size);
        self.disk_usage += u64::from(info.encoded_size);
        if let Some(op) = self.current_op_mut() {
            op.add_ref_block(info.ptr);
        }
    }

    /// Record a reference the current operation retires. Calls for the
    /// same pointer repeat harmlessly: re-dirtied infos carry a zero
    /// size and are dropped entirely, since such a block never made it
    /// to the server under that reference.
    pub fn add_unref_block(&mut self, info: BlockInfo) {
        if info.encoded_size > 0 {
            self.unref_bytes += u64::from(info.encoded_size);
            self.disk_usage = self.disk_usage.saturating_sub(u64::from(info.encoded_size));
            if let Some(op) = self.current_op_mut() {
                op.add_unref_block(info.ptr);
            }
        }
    }

    /// Record an in-place replacement. An old info that was never
    /// uploaded (zero size) degenerates to a plain new reference.
    pub fn add_update(&mut self, old: BlockInfo, new: BlockInfo) {
        if old.encoded_size == 0 {
            self.add_ref_block(new);
            return;
        }
        self.unref_bytes += u64::from(old.encoded_size);
        self.disk_usage = self.disk_usage.saturating_sub(u64::from(old.encoded_size));
        self.ref_bytes += u64::from(new.encoded_size);
        self.disk_usage += u64::from(new.encoded_size);
        if let Some(op) = self.current_op_mut() {
            op.add_update(old.ptr, new.ptr);
        }
    }

    /// A fresh working copy for the next revision: same folder state,
    /// empty operation log.
    pub fn successor(&self) -> RootMetadata {
        let mut next = self.clone();
        next.revision = self.revision + 1;
        next.ops.clear();
        next.ref_bytes = 0;
        next.unref_bytes = 0;
        next
    }
}
