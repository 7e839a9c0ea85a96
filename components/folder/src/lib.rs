//! Per-folder block operations: byte-accounted dirty caching, deferred
//! writes during sync, recoverable-error rollback, and the background
//! archival and reclamation loops.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use tansu_storage::dirty_file::DirtyFile;
use tansu_types::{
    block::{Block, BlockPointer, BlockRef},
    entry::DirEntry,
    path::{FolderBranch, Path},
    BranchId, TlfId,
};
use tokio::sync::{mpsc, RwLock, RwLockReadGuard};

pub mod config;
pub mod err;
pub mod fetch;
pub mod file_ops;
pub mod manager;
pub mod node;
pub mod sync;

pub use config::FolderConfig;
pub use err::{is_recoverable_block_error, Error, Result};
pub use manager::FolderBlockManager;

use crate::{err::NoSyncInfoSnafu, sync::SyncInfo};

/// Whether a folder has outstanding local writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallBlockState {
    Clean,
    Dirty,
}

/// A write or truncate that arrived while its file was mid-sync,
/// recorded for replay on the post-sync path. The byte count is
/// refunded just before replay, since the replay re-dirties them.
#[derive(Debug, Clone)]
pub(crate) enum DeferredOp {
    Write {
        data: Bytes,
        off: u64,
        path: Path,
        newly_dirtied_child_bytes: i64,
    },
    Truncate {
        size: u64,
        path: Path,
        newly_dirtied_child_bytes: i64,
    },
}

/// All folder state guarded by the block-lock.
#[derive(Default)]
pub(crate) struct FolderBlocks {
    /// Files with dirty blocks that are syncing or waiting to sync,
    /// keyed by the file's tail pointer.
    pub(crate) dirty_files: HashMap<BlockPointer, Arc<DirtyFile>>,
    /// Per-file accumulated sync state for unsynced writes/truncates.
    pub(crate) unref_cache: HashMap<BlockRef, SyncInfo>,
    /// Modified but uncommitted directory entries, by entry ref.
    pub(crate) de_cache: HashMap<BlockRef, DirEntry>,
    /// Writes and truncates to replay once the current sync finishes.
    pub(crate) deferred_writes: Vec<DeferredOp>,
    /// Dirty-cache entries to drop before any deferred replay runs.
    pub(crate) deferred_dirty_deletes: Vec<BlockPointer>,
    /// Valid only while the block-lock is held for a write operation.
    pub(crate) do_defer_write: bool,
}

pub(crate) type BlocksGuard<'a> = RwLockReadGuard<'a, FolderBlocks>;

/// The orchestrator for one folder's block operations. One block-lock
/// (a reader-writer lock over [`FolderBlocks`]) serialises every
/// read/write/truncate/sync against cache mutations and the in-memory
/// overlays.
pub struct FolderBlockOps {
    pub(crate) config: Arc<FolderConfig>,
    pub(crate) folder: FolderBranch,
    /// Single-slot nudge towards the embedder's sync loop; sent when
    /// the dirty budget crosses its high-water mark.
    pub(crate) force_sync_tx: mpsc::Sender<()>,
    pub(crate) state: RwLock<FolderBlocks>,
}

impl FolderBlockOps {
    pub fn new(
        config: Arc<FolderConfig>,
        folder: FolderBranch,
        force_sync_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            config,
            folder,
            force_sync_tx,
            state: RwLock::new(FolderBlocks::default()),
        }
    }

    pub fn id(&self) -> TlfId {
        self.folder.tlf
    }

    pub fn branch(&self) -> BranchId {
        self.folder.branch
    }

    /// Clean means no uncommitted directory entries, which implies no
    /// unsynced file data either.
    pub async fn get_state(&self) -> OverallBlockState {
        let st = self.state.read().await;
        if st.de_cache.is_empty() {
            OverallBlockState::Clean
        } else {
            OverallBlockState::Dirty
        }
    }

    /// Refs of every entry with outstanding local modifications.
    pub async fn get_dirty_refs(&self) -> Vec<BlockRef> {
        let st = self.state.read().await;
        st.de_cache.keys().copied().collect()
    }

    /// Whether the file needs a sync at all.
    pub async fn is_dirty(&self, file: &Path) -> bool {
        let _st = self.state.read().await;
        self.config
            .dirty_bcache
            .is_dirty(file.tail_pointer(), self.folder.branch)
    }

    /// Remove all cached local state for the file. Wrapped by the sync
    /// finalisation, and available to external recovery paths.
    pub async fn clear_cache_info(&self, file: &Path) -> Result<()> {
        let mut st = self.state.write().await;
        self.clear_cache_info_locked(&mut st, file)
    }

    pub(crate) fn clear_cache_info_locked(
        &self,
        st: &mut FolderBlocks,
        file: &Path,
    ) -> Result<()> {
        let file_ref = file.tail_ref();
        st.de_cache.remove(&file_ref);
        st.unref_cache.remove(&file_ref);
        if let Some(df) = st.dirty_files.remove(&file.tail_pointer()) {
            df.finish_sync()?;
        }
        Ok(())
    }

    pub(crate) fn get_or_create_dirty_file_locked(
        &self,
        st: &mut FolderBlocks,
        file: &Path,
    ) -> Arc<DirtyFile> {
        st.dirty_files
            .entry(file.tail_pointer())
            .or_insert_with(|| {
                DirtyFile::new(self.folder.branch, self.config.dirty_bcache.clone())
            })
            .clone()
    }

    /// Route a freshly mutated block into the dirty cache through the
    /// file's tracker. Sets the defer flag when any block of the file
    /// is currently being uploaded.
    pub(crate) fn cache_block_if_not_yet_dirty_locked(
        &self,
        st: &mut FolderBlocks,
        ptr: BlockPointer,
        file: &Path,
        block: Block,
    ) -> Result<()> {
        let df = self.get_or_create_dirty_file_locked(st, file);
        let (_needs_caching, is_syncing) = df.set_block_dirty(ptr);
        self.config
            .dirty_bcache
            .put(ptr, self.folder.branch, block)?;
        if is_syncing {
            st.do_defer_write = true;
        }
        Ok(())
    }

    /// Ensure the write-session sync state for this entry exists.
    pub(crate) fn get_or_create_sync_info_locked(
        &self,
        st: &mut FolderBlocks,
        de: &DirEntry,
    ) {
        st.unref_cache
            .entry(de.block_ref())
            .or_insert_with(|| SyncInfo::new(de.info));
    }

    pub(crate) fn sync_info_mut<'a>(
        &self,
        st: &'a mut FolderBlocks,
        file_ref: BlockRef,
    ) -> Result<&'a mut SyncInfo> {
        st.unref_cache
            .get_mut(&file_ref)
            .ok_or_else(|| NoSyncInfoSnafu { file_ref }.build())
    }

    #[doc(hidden)]
    pub async fn deferred_write_count(&self) -> usize {
        let st = self.state.read().await;
        st.deferred_writes.len()
    }

    #[doc(hidden)]
    pub async fn deferred_delete_count(&self) -> usize {
        let st = self.state.read().await;
        st.deferred_dirty_deletes.len()
    }
}
