use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::StreamExt;
use tansu_common::{MAX_PARALLEL_BLOCK_PUTS, MAX_SYNC_RETRIES};
use tansu_meta::{ops::Op, ops::SyncOp, RootMetadata};
use tansu_storage::{
    block_cache::BlockCacheLifetime,
    dirty_file::DirtyFile,
    server::{BlockOps, ReadyBlockData},
};
use tansu_types::{
    block::{Block, BlockInfo, BlockPointer, FileBlock, ZERO_REF_NONCE},
    path::{Path, PathNode},
    KeyMeta, MetadataRevision,
};
use tracing::{debug, warn};

use crate::{
    err::{Error, InconsistentEncodedSizeSnafu, NoSyncInfoSnafu, Result},
    fetch::{as_dir_block, LocalBcache},
    manager::FolderBlockManager,
    FolderBlockOps, FolderBlocks,
};

/// Accumulated sync state for one file's unsynced writes, living in the
/// folder's unref cache between syncs.
#[derive(Clone)]
pub struct SyncInfo {
    /// The file's block info before any of these writes.
    pub old_info: BlockInfo,
    pub op: SyncOp,
    /// Infos to unreference when the next sync commits.
    pub unrefs: Vec<BlockInfo>,
    /// Upload state carried across recoverable failures. Handed to the
    /// uploader at sync time; never mutated after that hand-off.
    pub bps: Option<Arc<BlockPutState>>,
    pub ref_bytes: u64,
    pub unref_bytes: u64,
}

impl std::fmt::Debug for SyncInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncInfo")
            .field("old_info", &self.old_info)
            .field("op", &self.op)
            .field("unrefs", &self.unrefs)
            .field("bps_present", &self.bps.is_some())
            .field("ref_bytes", &self.ref_bytes)
            .field("unref_bytes", &self.unref_bytes)
            .finish()
    }
}

impl SyncInfo {
    pub fn new(old_info: BlockInfo) -> Self {
        Self {
            old_info,
            op: SyncOp::new(old_info.ptr),
            unrefs: Vec::new(),
            bps: None,
            ref_bytes: 0,
            unref_bytes: 0,
        }
    }

    pub fn deep_copy(&self) -> SyncInfo {
        self.clone()
    }
}

/// Flips one old pointer to synced when its replacement's upload lands.
#[derive(Clone)]
pub struct SyncedNotice {
    df: Arc<DirtyFile>,
    old_ptr: BlockPointer,
}

impl SyncedNotice {
    pub fn new(df: Arc<DirtyFile>, old_ptr: BlockPointer) -> Self {
        Self { df, old_ptr }
    }

    pub fn notify(&self) {
        if let Err(e) = self.df.set_block_synced(self.old_ptr) {
            warn!(old_ptr = %self.old_ptr, error = %e, "synced callback failed");
        }
    }
}

/// One readied block waiting for upload.
#[derive(Clone)]
pub struct BlockState {
    pub block_ptr: BlockPointer,
    pub block: Block,
    pub ready_data: ReadyBlockData,
    pub on_put: Option<SyncedNotice>,
}

#[derive(Clone, Default)]
pub struct BlockPutState {
    pub block_states: Vec<BlockState>,
}

/// Rollback state captured by `start_sync`, consumed by
/// `cleanup_sync_state` or `finish_sync`.
pub struct FileSyncState {
    /// Snapshot of the indirect top block from before the sync touched
    /// it; restored on a recoverable error.
    pub(crate) saved_fblock: Option<FileBlock>,
    pub(crate) saved_si: Option<SyncInfo>,
    /// New permanent pointer -> the old dirty pointer it replaced.
    pub(crate) redirty_on_recoverable: HashMap<BlockPointer, BlockPointer>,
    /// Dirty-cache entries to drop once the new path is live.
    pub(crate) old_file_block_ptrs: Vec<BlockPointer>,
    /// Permanent clean-cache entries to release after upload.
    pub(crate) new_indirect_file_block_ptrs: Vec<BlockPointer>,
}

/// Upload every readied block, bounded in flight, firing each block's
/// synced callback on success. On failure returns the pointers whose
/// puts failed alongside the first error.
pub async fn do_block_puts(
    block_ops: &dyn BlockOps,
    kmd: &KeyMeta,
    states: &[BlockState],
) -> std::result::Result<(), (Vec<BlockPointer>, tansu_storage::Error)> {
    let results = futures::stream::iter(states.iter().map(|bs| async move {
        match block_ops.put(kmd, bs.block_ptr, &bs.ready_data).await {
            Ok(()) => {
                if let Some(notice) = &bs.on_put {
                    notice.notify();
                }
                Ok(())
            }
            Err(e) => Err((bs.block_ptr, e)),
        }
    }))
    .buffer_unordered(MAX_PARALLEL_BLOCK_PUTS)
    .collect::<Vec<_>>()
    .await;

    let mut failed = Vec::new();
    let mut first_err = None;
    for r in results {
        if let Err((ptr, e)) = r {
            failed.push(ptr);
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    match first_err {
        None => Ok(()),
        Some(e) => Err((failed, e)),
    }
}

impl FolderBlockOps {
    /// Ready a block for upload: encode it, derive the permanent id,
    /// and de-duplicate against bytes this folder already uploaded.
    pub(crate) async fn ready_block(
        &self,
        md: &RootMetadata,
        block: &Block,
    ) -> Result<(BlockInfo, usize, ReadyBlockData)> {
        let mut dup_ptr = None;
        if let Block::File(fblock) = block {
            if !fblock.is_indirect {
                dup_ptr = self.config.bcache.check_for_known_ptr(self.folder.tlf, fblock);
            }
        }

        // Ready even a duplicate, so the encoded size is known.
        let (id, plain_size, ready_data) =
            self.config.block_ops.ready(&md.key_meta(), block).await?;

        let ptr = match dup_ptr {
            Some(mut ptr) => {
                ptr.ref_nonce = self.config.crypto.make_block_ref_nonce();
                ptr.creator = self.config.current_user;
                ptr
            }
            None => BlockPointer {
                id,
                key_gen: md.latest_key_generation(),
                data_ver: 1,
                creator: self.config.current_user,
                ref_nonce: ZERO_REF_NONCE,
            },
        };

        Ok((
            BlockInfo {
                ptr,
                encoded_size: ready_data.encoded_size() as u32,
            },
            plain_size,
            ready_data,
        ))
    }

    /// Phase 1, under the exclusive block-lock: settle split points,
    /// ready every dirty child under a permanent id, and mark the whole
    /// file syncing. Writes that land after this defer until
    /// `finish_sync`.
    async fn start_sync_write_locked(
        &self,
        md: &mut RootMetadata,
        file: &Path,
    ) -> Result<(FileBlock, Arc<BlockPutState>, FileSyncState)> {
        let mut state_guard = self.state.write().await;
        let st = &mut *state_guard;
        let branch = self.folder.branch;

        let mut fblock = self
            .get_file_block_exclusive(&*md, file.tail_pointer(), file)
            .await?;

        let file_ref = file.tail_ref();
        let si_snapshot = st
            .unref_cache
            .get(&file_ref)
            .cloned()
            .ok_or_else(|| NoSyncInfoSnafu { file_ref }.build())?;

        md.add_op(Op::Sync(si_snapshot.op.clone()));

        let mut sync_state = FileSyncState {
            saved_fblock: if fblock.is_indirect {
                Some(fblock.clone())
            } else {
                None
            },
            saved_si: Some(si_snapshot.deep_copy()),
            redirty_on_recoverable: HashMap::new(),
            old_file_block_ptrs: Vec::new(),
            new_indirect_file_block_ptrs: Vec::new(),
        };

        let mut bps_states: Vec<BlockState> = Vec::new();
        if let Some(prev) = &si_snapshot.bps {
            // A retry after a recoverable failure: keep the states that
            // already made it to the server and reinstate the byte
            // accounting from the previous attempt.
            bps_states = prev.block_states.clone();
            md.ref_bytes = si_snapshot.ref_bytes;
            md.disk_usage += si_snapshot.ref_bytes;
            md.unref_bytes = si_snapshot.unref_bytes;
            md.disk_usage = md.disk_usage.saturating_sub(si_snapshot.unref_bytes);
            sync_state
                .new_indirect_file_block_ptrs
                .extend(si_snapshot.op.common.refs.iter().copied());
        }

        let df = self.get_or_create_dirty_file_locked(st, file);
        // Outstanding deferred writes mean this is a retry and those
        // bytes now ride along with this sync.
        df.assimilate_deferred_new_bytes();

        if fblock.is_indirect {
            // Pass one: let the splitter reshape dirty children before
            // anything is readied.
            let mut i = 0;
            while i < fblock.iptrs.len() {
                let iptr = fblock.iptrs[i].clone();
                let is_dirty = self.config.dirty_bcache.is_dirty(iptr.info.ptr, branch);
                if iptr.info.encoded_size > 0 && is_dirty {
                    return InconsistentEncodedSizeSnafu { info: iptr.info }.fail();
                }
                if !is_dirty {
                    i += 1;
                    continue;
                }

                let at = self
                    .get_file_block_at_offset_exclusive(&*md, file, &fblock, iptr.off)
                    .await?;
                let mut block = at.block;
                let next_block_off = at.next_block_off;

                let split_at = self.config.splitter.check_split(&block);
                if split_at > 0 {
                    // Oversized: keep the head here, push the tail into
                    // the successor (creating one past the end).
                    let end_of_block = iptr.off + block.contents.len() as u64;
                    let extra_bytes = block.contents.split_off(split_at as usize);
                    if next_block_off.is_none() {
                        self.new_right_block_locked(st, &*md, file, &mut fblock, end_of_block)?;
                    }
                    let rat = self
                        .get_file_block_at_offset_exclusive(&*md, file, &fblock, end_of_block)
                        .await?;
                    let mut rblock = rat.block;
                    let mut contents = extra_bytes;
                    contents.extend_from_slice(&rblock.contents);
                    rblock.contents = contents;
                    self.cache_block_if_not_yet_dirty_locked(
                        st,
                        rat.ptr,
                        file,
                        Block::File(rblock),
                    )?;
                    fblock.iptrs[i + 1].off = iptr.off + block.contents.len() as u64;
                    md.add_unref_block(fblock.iptrs[i + 1].info);
                    fblock.iptrs[i + 1].info.encoded_size = 0;
                    self.config
                        .dirty_bcache
                        .put(iptr.info.ptr, branch, Block::File(block))?;
                } else if split_at < 0 {
                    if next_block_off.is_none() {
                        // Undersized but last: nothing to pull from.
                        i += 1;
                        continue;
                    }
                    let end_of_block = iptr.off + block.contents.len() as u64;
                    let rat = self
                        .get_file_block_at_offset_exclusive(&*md, file, &fblock, end_of_block)
                        .await?;
                    let mut rblock = rat.block;
                    let block_contents_len = block.contents.len() as u64;
                    let n_copied = self.config.splitter.copy_until_split(
                        &mut block,
                        false,
                        &rblock.contents,
                        block_contents_len,
                    );
                    rblock.contents.drain(..n_copied);
                    if !rblock.contents.is_empty() {
                        self.cache_block_if_not_yet_dirty_locked(
                            st,
                            rat.ptr,
                            file,
                            Block::File(rblock),
                        )?;
                        fblock.iptrs[i + 1].off = iptr.off + block.contents.len() as u64;
                        md.add_unref_block(fblock.iptrs[i + 1].info);
                        fblock.iptrs[i + 1].info.encoded_size = 0;
                    } else {
                        // The successor was drained dry; drop it.
                        md.add_unref_block(fblock.iptrs[i + 1].info);
                        fblock.iptrs.remove(i + 1);
                    }
                    self.config
                        .dirty_bcache
                        .put(iptr.info.ptr, branch, Block::File(block))?;
                }
                i += 1;
            }

            // Pass two: ready every dirty child under its permanent id.
            for i in 0..fblock.iptrs.len() {
                let iptr = fblock.iptrs[i].clone();
                let local_ptr = iptr.info.ptr;
                let is_dirty = self.config.dirty_bcache.is_dirty(local_ptr, branch);
                if iptr.info.encoded_size > 0 && is_dirty {
                    return InconsistentEncodedSizeSnafu { info: iptr.info }.fail();
                }
                if !is_dirty {
                    continue;
                }

                let at = self
                    .get_file_block_at_offset_exclusive(&*md, file, &fblock, iptr.off)
                    .await?;
                let block = Block::File(at.block);
                let (new_info, _plain, ready_data) = self.ready_block(&*md, &block).await?;

                sync_state.new_indirect_file_block_ptrs.push(new_info.ptr);
                self.config.bcache.put(
                    new_info.ptr,
                    self.folder.tlf,
                    block.clone(),
                    BlockCacheLifetime::Permanent,
                );
                df.set_block_orphaned(local_ptr, true);

                // The dirty-cache delete waits until the new path is
                // live, so concurrent readers of the dirty file keep
                // working.
                sync_state.old_file_block_ptrs.push(local_ptr);

                fblock.iptrs[i].info = new_info;
                md.add_ref_block(new_info);
                bps_states.push(BlockState {
                    block_ptr: new_info.ptr,
                    block,
                    ready_data,
                    on_put: Some(SyncedNotice::new(df.clone(), local_ptr)),
                });
                df.set_block_syncing(local_ptr)?;
                sync_state
                    .redirty_on_recoverable
                    .insert(new_info.ptr, local_ptr);
            }

            // Publish the reshaped top for readers of the dirty file.
            self.config
                .dirty_bcache
                .put(file.tail_pointer(), branch, Block::File(fblock.clone()))?;
        }

        df.set_block_syncing(file.tail_pointer())?;
        sync_state.old_file_block_ptrs.push(file.tail_pointer());

        let bps = Arc::new(BlockPutState {
            block_states: bps_states,
        });
        let si = self.sync_info_mut(st, file_ref)?;
        si.ref_bytes = md.ref_bytes;
        si.unref_bytes = md.unref_bytes;
        si.bps = Some(bps.clone());

        Ok((fblock, bps, sync_state))
    }

    /// The parent block carrying this file's updated entry, still
    /// keyed by the file's stable tail pointer, sized with the old
    /// encoded size until the top block is readied.
    async fn make_local_bcache(&self, md: &mut RootMetadata, file: &Path) -> Result<LocalBcache> {
        let guard = self.state.read().await;
        let parent = file.parent_path();
        let pptr = parent.tail_pointer();
        let (guard, block) = self.get_block_shared(guard, &*md, pptr, true).await?;
        let mut dblock = as_dir_block(pptr, &block)?.clone();

        let file_ref = file.tail_ref();
        // Fold the accumulated unrefs into the metadata; duplicates are
        // fine since re-dirtied infos carry a zero size.
        if let Some(si) = guard.unref_cache.get(&file_ref) {
            for info in &si.unrefs {
                md.add_unref_block(*info);
            }
        }

        let mut lbc = LocalBcache::new();
        if let Some(de) = guard.de_cache.get(&file_ref) {
            let mut de = de.clone();
            if let Some(si) = guard.unref_cache.get(&file_ref) {
                de.info.encoded_size = si.old_info.encoded_size;
            }
            dblock.children.insert(file.tail_name().to_string(), de);
            lbc.insert(pptr, dblock);
        }
        Ok(lbc)
    }

    /// Phase 1 entry point. Use with `cleanup_sync_state` on any error
    /// before `finish_sync`:
    ///
    /// ```ignore
    /// let (fblock, bps, lbc, sync_state) = ops.start_sync(&mut md, &file).await?;
    /// // upload bps; on error: ops.cleanup_sync_state(...)
    /// let still_dirty = ops.finish_sync(&md, &old, &new, sync_state).await?;
    /// ```
    pub async fn start_sync(
        &self,
        md: &mut RootMetadata,
        file: &Path,
    ) -> Result<(FileBlock, Arc<BlockPutState>, LocalBcache, FileSyncState)> {
        let (fblock, bps, sync_state) = self.start_sync_write_locked(md, file).await?;
        let lbc = self.make_local_bcache(md, file).await?;
        Ok((fblock, bps, lbc, sync_state))
    }

    fn revert_sync_info_after_recoverable_error_locked(
        &self,
        st: &mut FolderBlocks,
        file: &Path,
        blocks_to_remove: &[BlockPointer],
        saved: &SyncInfo,
    ) {
        let Some(si) = st.unref_cache.get_mut(&file.tail_ref()) else {
            return;
        };
        let mut reverted = saved.deep_copy();
        if let Some(saved_bps) = &saved.bps {
            // Only carry the states whose puts did not fail, so the
            // retry re-readies the bad ones from scratch.
            let remove: HashSet<BlockPointer> = blocks_to_remove.iter().copied().collect();
            let kept: Vec<BlockState> = saved_bps
                .block_states
                .iter()
                .filter(|bs| !remove.contains(&bs.block_ptr))
                .cloned()
                .collect();
            reverted.bps = Some(Arc::new(BlockPutState { block_states: kept }));
        }
        *si = reverted;
    }

    /// After a recoverable failure on a multi-leaf file: un-orphan the
    /// old pointers, and re-dirty any child that the still-cached top
    /// block references under a new id.
    fn fix_child_blocks_after_recoverable_error_locked(
        &self,
        st: &mut FolderBlocks,
        file: &Path,
        redirty: &HashMap<BlockPointer, BlockPointer>,
    ) {
        let branch = self.folder.branch;
        let df = st.dirty_files.get(&file.tail_pointer()).cloned();
        if let Some(df) = &df {
            // We are reverting to the previous state; the old blocks
            // are referenced again.
            for old_ptr in redirty.values() {
                debug!(%old_ptr, "un-orphaning block");
                df.set_block_orphaned(*old_ptr, false);
            }
        }
        let Some(df) = df else { return };
        if !df.is_block_dirty(file.tail_pointer()) || !df.is_block_syncing(file.tail_pointer()) {
            return;
        }

        let Some(top) = self.config.dirty_bcache.get(file.tail_pointer(), branch) else {
            warn!(tail = %file.tail_pointer(), "no dirtied top block to fix up");
            return;
        };
        let Block::File(top) = (*top).clone() else {
            warn!(tail = %file.tail_pointer(), "dirtied top block is not a file block");
            return;
        };
        let mut top = top;
        let mut top_changed = false;

        for (new_ptr, old_ptr) in redirty {
            let mut found = false;
            for iptr in top.iptrs.iter_mut() {
                if iptr.info.ptr == *new_ptr {
                    found = true;
                    iptr.info.encoded_size = 0;
                    top_changed = true;
                }
            }
            if !found {
                continue;
            }

            debug!(%new_ptr, %old_ptr, "re-dirtying block under its new id");
            // These blocks went into the permanent region, so they are
            // definitely still cached.
            let Some(block) = self.config.bcache.get(*new_ptr) else {
                warn!(%new_ptr, "couldn't re-dirty block");
                continue;
            };
            if let Err(e) =
                self.cache_block_if_not_yet_dirty_locked(st, *new_ptr, file, (*block).clone())
            {
                warn!(%new_ptr, error = %e, "couldn't re-dirty block");
            }
            self.config.dirty_bcache.delete(*old_ptr, branch);
        }

        if top_changed {
            if let Err(e) = self
                .config
                .dirty_bcache
                .put(file.tail_pointer(), branch, Block::File(top))
            {
                warn!(error = %e, "couldn't re-cache fixed top block");
            }
        }
    }

    /// Clean up after an error between `start_sync` and `finish_sync`.
    /// Recoverable errors revert in place so the retry resumes exactly;
    /// anything else is delivered to blocked writers.
    pub async fn cleanup_sync_state(
        &self,
        file: &Path,
        blocks_to_remove: &[BlockPointer],
        sync_state: Option<&FileSyncState>,
        err: &Error,
    ) {
        let recoverable = err.is_recoverable();
        if !recoverable {
            let st = self.state.read().await;
            if let Some(df) = st.dirty_files.get(&file.tail_pointer()) {
                df.notify_err_listeners(&err.to_string());
            }
        }

        let mut state_guard = self.state.write().await;
        let st = &mut *state_guard;

        // Back out anything filled into the sync op; it is reused by a
        // later sync of the same file.
        if let Some(si) = st.unref_cache.get_mut(&file.tail_ref()) {
            si.op.common = Default::default();
        }

        if recoverable {
            if let Some(ss) = sync_state {
                if let Some(saved) = &ss.saved_si {
                    self.revert_sync_info_after_recoverable_error_locked(
                        st,
                        file,
                        blocks_to_remove,
                        saved,
                    );
                }
                if let Some(saved_fblock) = &ss.saved_fblock {
                    if let Err(e) = self.config.dirty_bcache.put(
                        file.tail_pointer(),
                        self.folder.branch,
                        Block::File(saved_fblock.clone()),
                    ) {
                        warn!(error = %e, "couldn't restore the saved top block");
                    }
                    self.fix_child_blocks_after_recoverable_error_locked(
                        st,
                        file,
                        &ss.redirty_on_recoverable,
                    );
                }
            }
        }

        // The sync is over either way; mid-flight blocks are dirty
        // again so a retry re-uploads them, and later writes stop
        // deferring.
        if let Some(df) = st.dirty_files.get(&file.tail_pointer()) {
            df.reset_syncing_blocks_to_dirty();
        }
    }

    /// Phase 3: drop the old dirty entries, release the permanent
    /// cache pins, replay anything deferred during the sync on the new
    /// path, and clear the file's cached sync state. Returns whether
    /// the file is still dirty (a replay happened).
    pub async fn finish_sync(
        &self,
        md: &RootMetadata,
        old_path: &Path,
        new_path: &Path,
        sync_state: FileSyncState,
    ) -> Result<bool> {
        let mut state_guard = self.state.write().await;
        let st = &mut *state_guard;
        let branch = self.folder.branch;

        for ptr in &sync_state.old_file_block_ptrs {
            self.config.dirty_bcache.delete(*ptr, branch);
        }
        for ptr in &sync_state.new_indirect_file_block_ptrs {
            // Normal transient retention takes over from here.
            self.config.bcache.delete_permanent(ptr.id);
        }

        let deletes = std::mem::take(&mut st.deferred_dirty_deletes);
        let writes = std::mem::take(&mut st.deferred_writes);
        let still_dirty = !writes.is_empty();

        // Blocks dirtied by deferred operations are re-created by the
        // replay below; drop the stale copies first.
        for ptr in &deletes {
            self.config.dirty_bcache.delete(*ptr, branch);
        }

        for op in writes {
            // A replay error here surfaces immediately and leaves the
            // remaining replays unexecuted; the file is then visibly
            // inconsistent and needs caller intervention.
            match op {
                crate::DeferredOp::Write {
                    data,
                    off,
                    path,
                    newly_dirtied_child_bytes,
                } => {
                    // The bytes are about to be re-dirtied; they no
                    // longer sync through the old file.
                    let df = self.get_or_create_dirty_file_locked(st, &path);
                    df.update_not_yet_syncing_bytes(-newly_dirtied_child_bytes);
                    self.write_data_locked(st, md, new_path, &data, off).await?;
                }
                crate::DeferredOp::Truncate {
                    size,
                    path,
                    newly_dirtied_child_bytes,
                } => {
                    let df = self.get_or_create_dirty_file_locked(st, &path);
                    df.update_not_yet_syncing_bytes(-newly_dirtied_child_bytes);
                    self.truncate_locked(st, md, new_path, size).await?;
                }
            }
        }

        // Any concurrent write to this file was deferred (the top block
        // is always dirtied), so the old path's cached state is fully
        // replayed or obsolete by now.
        self.clear_cache_info_locked(st, old_path)?;

        Ok(still_dirty)
    }

    /// Run a complete sync of the file: ready and upload all dirty
    /// blocks, commit the new metadata revision, finalise, and retry
    /// recoverable failures. Returns whether deferred writes left the
    /// file dirty, plus the file's post-sync path.
    pub async fn sync(
        &self,
        md: &mut RootMetadata,
        file: &Path,
        fbm: Option<&FolderBlockManager>,
    ) -> Result<(bool, Path)> {
        if !self.is_dirty(file).await {
            return Ok((false, file.clone()));
        }

        // Each attempt works on a fresh copy, so a failed attempt's ops
        // and byte accounting never leak into the retry.
        let base = md.clone();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut attempt_md = base.clone();
            match self.sync_attempt(&mut attempt_md, file, fbm).await {
                Ok(outcome) => {
                    *md = attempt_md;
                    return Ok(outcome);
                }
                Err(e) if e.is_recoverable() && attempts < MAX_SYNC_RETRIES => {
                    debug!(error = %e, attempts, "sync failed recoverably; retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn sync_attempt(
        &self,
        md: &mut RootMetadata,
        file: &Path,
        fbm: Option<&FolderBlockManager>,
    ) -> Result<(bool, Path)> {
        let mut sync_state: Option<FileSyncState> = None;
        let mut blocks_to_remove: Vec<BlockPointer> = Vec::new();
        let res = self
            .sync_attempt_inner(md, file, fbm, &mut sync_state, &mut blocks_to_remove)
            .await;
        if let Err(err) = &res {
            self.cleanup_sync_state(file, &blocks_to_remove, sync_state.as_ref(), err)
                .await;
        }
        res
    }

    async fn sync_attempt_inner(
        &self,
        md: &mut RootMetadata,
        file: &Path,
        fbm: Option<&FolderBlockManager>,
        sync_state_slot: &mut Option<FileSyncState>,
        blocks_to_remove: &mut Vec<BlockPointer>,
    ) -> Result<(bool, Path)> {
        // Fix the revision up front so failed-put cleanup can tell
        // whether this revision ever reached the server.
        let head = self.config.mdserver.get_for_tlf(self.folder.tlf).await?;
        md.revision = head
            .as_ref()
            .map(|h| h.revision + 1)
            .unwrap_or(MetadataRevision::INITIAL);

        let (fblock, bps, mut lbc, sync_state) = self.start_sync(md, file).await?;
        *sync_state_slot = Some(sync_state);
        let ss = sync_state_slot.as_mut().expect("just stored");

        // Ready the top block under its permanent id.
        let top_block = Block::File(fblock.clone());
        let (top_info, _plain, top_ready) = self.ready_block(&*md, &top_block).await?;
        self.config.bcache.put(
            top_info.ptr,
            self.folder.tlf,
            top_block.clone(),
            BlockCacheLifetime::Permanent,
        );
        ss.new_indirect_file_block_ptrs.push(top_info.ptr);

        let mut all_states = bps.block_states.clone();
        let df = {
            let st = self.state.read().await;
            st.dirty_files.get(&file.tail_pointer()).cloned()
        };
        all_states.push(BlockState {
            block_ptr: top_info.ptr,
            block: top_block,
            ready_data: top_ready,
            on_put: df.map(|df| SyncedNotice::new(df, file.tail_pointer())),
        });

        // Walk the ancestors bottom-up, readying each directory block
        // with its child's new pointer. Each level records the update
        // from the entry's previous info to the new one.
        let mut new_nodes = file.nodes.clone();
        if let Some(last) = new_nodes.last_mut() {
            *last = PathNode {
                ptr: top_info.ptr,
                name: file.tail_name().to_string(),
            };
        }
        let mut child_info = top_info;
        for level in (0..file.nodes.len().saturating_sub(1)).rev() {
            let dir_path = Path {
                folder: self.folder,
                nodes: file.nodes[..=level].to_vec(),
            };
            let dptr = dir_path.tail_pointer();
            let mut dblock = match lbc.remove(&dptr) {
                Some(b) => b,
                None => {
                    let guard = self.state.read().await;
                    let (_g, block) = self.get_block_shared(guard, &*md, dptr, true).await?;
                    as_dir_block(dptr, &block)?.clone()
                }
            };
            let child_name = &file.nodes[level + 1].name;
            if let Some(entry) = dblock.children.get_mut(child_name) {
                md.add_update(entry.info, child_info);
                entry.info = child_info;
            }

            let dir_block = Block::Dir(dblock);
            let (dinfo, _p, dready) = self.ready_block(&*md, &dir_block).await?;
            self.config.bcache.put(
                dinfo.ptr,
                self.folder.tlf,
                dir_block.clone(),
                BlockCacheLifetime::Transient,
            );
            all_states.push(BlockState {
                block_ptr: dinfo.ptr,
                block: dir_block,
                ready_data: dready,
                on_put: None,
            });
            new_nodes[level].ptr = dinfo.ptr;
            child_info = dinfo;
        }
        if file.nodes.len() > 1 {
            // The last rewrite was the root block itself.
            md.add_update(md.root.info, child_info);
            md.root.info = child_info;
        }

        // Phase 2: upload everything.
        if let Err((failed, err)) =
            do_block_puts(&*self.config.block_ops, &md.key_meta(), &all_states).await
        {
            *blocks_to_remove = failed;
            if let Some(fbm) = fbm {
                // Some blocks may have landed; remember them in case
                // this revision never becomes visible.
                fbm.clean_up_block_state(md, &all_states);
            }
            return Err(err.into());
        }

        // Commit the new revision.
        let committed = self.config.mdserver.put(md.clone()).await?;
        self.config.mdcache.put(committed.clone());
        if let Some(fbm) = fbm {
            fbm.archive_unref_blocks(&committed).await;
        }

        let new_path = Path {
            folder: self.folder,
            nodes: new_nodes,
        };
        let ss = sync_state_slot.take().expect("stored above");
        let still_dirty = self.finish_sync(&committed, file, &new_path, ss).await?;
        Ok((still_dirty, new_path))
    }
}
