use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use scopeguard::guard;
use tansu_common::{READ_TIMEOUT_SMALLER_BY, TRUNCATE_EXTEND_CUTOFF};
use tansu_meta::{ops::WriteRange, RootMetadata};
use tansu_storage::dirty_cache::DirtyPermit;
use tansu_types::{
    block::{Block, BlockInfo, BlockPointer, FileBlock, IndirectFilePtr, ZERO_REF_NONCE},
    path::Path,
};
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    err::{
        BadSplitSnafu, DeferredSyncFailedSnafu, FileTooBigSnafu, InvalidPathSnafu, Result,
        TimeoutSnafu, WriteAccessSnafu,
    },
    fetch::FileBlockAtOffset,
    node::Node,
    DeferredOp, FolderBlockOps, FolderBlocks,
};

impl FolderBlockOps {
    pub(crate) fn path_for_write(&self, node: &Node) -> Result<Path> {
        let path = self.config.node_cache.path_from_node(node);
        if !path.is_valid() {
            return InvalidPathSnafu.fail();
        }
        Ok(path)
    }

    /// Block until the dirty budget admits this operation, watching for
    /// a fatal outcome of any sync already running on the file.
    async fn maybe_wait_on_deferred_writes(
        &self,
        node: &Node,
        mut permit: DirtyPermit,
    ) -> Result<()> {
        let mut err_rx = {
            let mut st = self.state.write().await;
            let file_path = self.path_for_write(node)?;
            let df = self.get_or_create_dirty_file_locked(&mut st, &file_path);
            let (tx, rx) = oneshot::channel();
            df.add_err_listener(tx);
            rx
        };

        let log_timer = tokio::time::sleep(Duration::from_millis(100));
        tokio::pin!(log_timer);
        let mut logged = false;
        let mut listener_gone = false;
        loop {
            tokio::select! {
                res = &mut permit => {
                    // A dropped grantor means the cache went away with
                    // the process; nothing left to throttle.
                    let _ = res;
                    if logged {
                        debug!("write unblocked");
                    }
                    if !listener_gone {
                        if let Ok(message) = err_rx.try_recv() {
                            return DeferredSyncFailedSnafu { message }.fail();
                        }
                    }
                    return Ok(());
                }
                message = &mut err_rx, if !listener_gone => {
                    match message {
                        Ok(message) => return DeferredSyncFailedSnafu { message }.fail(),
                        Err(_) => listener_gone = true,
                    }
                }
                _ = &mut log_timer, if !logged => {
                    debug!("blocking a write because of a full dirty buffer");
                    logged = true;
                }
            }
        }
    }

    /// Read `dest.len()` bytes from the file starting at `off`. Holes
    /// read as zeroes. With a timeout set, an expiry after some bytes
    /// were delivered returns a short read instead of an error, using
    /// an internal deadline shortened so this happens before upstream
    /// cancellation.
    pub async fn read(
        &self,
        md: &RootMetadata,
        file: &Path,
        dest: &mut [u8],
        off: u64,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        let deadline = timeout.map(|t| {
            let t = if t > READ_TIMEOUT_SMALLER_BY {
                t - READ_TIMEOUT_SMALLER_BY
            } else {
                t
            };
            tokio::time::Instant::now() + t
        });

        let guard = self.state.read().await;
        let tail = file.tail_pointer();
        let (mut guard, top_arc) = self.get_block_shared(guard, md, tail, true).await?;
        let top = crate::fetch::as_file_block(tail, &top_arc)?.clone();

        let n = dest.len() as u64;
        let mut n_read: u64 = 0;
        while n_read < n {
            let next_byte = n_read + off;
            let mut to_read = n - n_read;

            let fetch = self.get_file_block_at_offset_shared(guard, md, file, &top, next_byte);
            let fetched = match deadline {
                Some(d) => match tokio::time::timeout_at(d, fetch).await {
                    Ok(r) => r,
                    Err(_) if n_read > 0 => {
                        debug!(n_read, n, "read short: deadline hit mid-file");
                        return Ok(n_read);
                    }
                    Err(_) => return TimeoutSnafu.fail(),
                },
                None => fetch.await,
            };
            let (g, at) = fetched?;
            guard = g;

            let block_len = at.block.contents.len() as u64;
            let last_byte_in_block = at.start_off + block_len;

            if next_byte >= last_byte_in_block {
                let Some(next_block_off) = at.next_block_off else {
                    return Ok(n_read);
                };
                let mut fill = next_block_off.saturating_sub(next_byte);
                if fill > to_read {
                    fill = to_read;
                }
                if fill == 0 {
                    return BadSplitSnafu.fail();
                }
                debug!(next_byte, last_byte_in_block, fill, "read zeroes from a hole");
                dest[n_read as usize..(n_read + fill) as usize].fill(0);
                n_read += fill;
                continue;
            } else if to_read > last_byte_in_block - next_byte {
                to_read = last_byte_in_block - next_byte;
            }

            let first = (next_byte - at.start_off) as usize;
            dest[n_read as usize..(n_read + to_read) as usize]
                .copy_from_slice(&at.block.contents[first..first + to_read as usize]);
            n_read += to_read;
        }

        Ok(n)
    }

    fn maybe_force_sync(&self) {
        if self.config.dirty_bcache.should_force_sync() {
            // A full channel means a sync is already on its way.
            if self.force_sync_tx.try_send(()).is_ok() {
                debug!("forcing a sync due to a full dirty buffer");
            }
        }
    }

    fn new_file_block_ptr(&self, md: &RootMetadata) -> BlockPointer {
        BlockPointer {
            id: self.config.crypto.make_temporary_block_id(),
            key_gen: md.latest_key_generation(),
            data_ver: 1,
            creator: self.config.current_user,
            ref_nonce: ZERO_REF_NONCE,
        }
    }

    /// Turn a direct file into an indirect one: the existing bytes get
    /// a fresh temporary id as the first child, and the old tail
    /// pointer is reused by the new top block.
    pub(crate) fn create_indirect_block_locked(
        &self,
        st: &mut FolderBlocks,
        md: &RootMetadata,
        file: &Path,
    ) -> Result<FileBlock> {
        let fblock = FileBlock {
            is_indirect: true,
            contents: Vec::new(),
            iptrs: vec![IndirectFilePtr {
                info: BlockInfo {
                    ptr: self.new_file_block_ptr(md),
                    encoded_size: 0,
                },
                off: 0,
                holes: false,
            }],
        };
        let df = self.get_or_create_dirty_file_locked(st, file);
        // The old block id now names the new top block, so the next
        // cache put must treat it as newly dirtied.
        df.set_block_not_dirty(file.tail_pointer());
        self.cache_block_if_not_yet_dirty_locked(
            st,
            file.tail_pointer(),
            file,
            Block::File(fblock.clone()),
        )?;
        Ok(fblock)
    }

    /// Append an empty leaf starting at `off` and redirty the parent.
    pub(crate) fn new_right_block_locked(
        &self,
        st: &mut FolderBlocks,
        md: &RootMetadata,
        file: &Path,
        pblock: &mut FileBlock,
        off: u64,
    ) -> Result<()> {
        let new_ptr = self.new_file_block_ptr(md);
        pblock.iptrs.push(IndirectFilePtr {
            info: BlockInfo {
                ptr: new_ptr,
                encoded_size: 0,
            },
            off,
            holes: false,
        });
        self.cache_block_if_not_yet_dirty_locked(
            st,
            new_ptr,
            file,
            Block::File(FileBlock::new_direct()),
        )?;
        self.cache_block_if_not_yet_dirty_locked(
            st,
            file.tail_pointer(),
            file,
            Block::File(pblock.clone()),
        )?;
        Ok(())
    }

    /// The write itself, under the exclusive block-lock. Returns the
    /// recorded write range, the pointers dirtied (for deferred
    /// cleanup), and the newly dirtied byte count.
    pub(crate) async fn write_data_locked(
        &self,
        st: &mut FolderBlocks,
        md: &RootMetadata,
        file: &Path,
        data: &[u8],
        off: u64,
    ) -> Result<(WriteRange, Vec<BlockPointer>, i64)> {
        let mut newly_dirtied_child_bytes: i64 = 0;
        let res = self
            .write_data_inner(st, md, file, data, off, &mut newly_dirtied_child_bytes)
            .await;
        // Even a failed write leaves its dirtied bytes in the cache, so
        // the accounting always lands.
        let df = self.get_or_create_dirty_file_locked(st, file);
        df.update_not_yet_syncing_bytes(newly_dirtied_child_bytes);
        self.maybe_force_sync();
        res.map(|(range, ptrs)| (range, ptrs, newly_dirtied_child_bytes))
    }

    async fn write_data_inner(
        &self,
        st: &mut FolderBlocks,
        md: &RootMetadata,
        file: &Path,
        data: &[u8],
        off: u64,
        newly_dirtied_child_bytes: &mut i64,
    ) -> Result<(WriteRange, Vec<BlockPointer>)> {
        let n = data.len() as u64;
        if off + n > self.config.max_file_bytes {
            return FileTooBigSnafu {
                size: off + n,
                limit: self.config.max_file_bytes,
            }
            .fail();
        }
        if !md.is_writer(self.config.current_user) {
            return WriteAccessSnafu {
                user: self.config.current_user,
            }
            .fail();
        }

        let mut fblock = self
            .get_file_block_exclusive(md, file.tail_pointer(), file)
            .await?;
        let mut de = self.get_dirty_entry_exclusive(st, md, file).await?;
        let old_size = de.size;
        self.get_or_create_sync_info_locked(st, &de);

        let mut dirty_ptrs = Vec::new();
        let mut unrefs: Vec<BlockInfo> = Vec::new();
        let mut n_copied: u64 = 0;

        while n_copied < n {
            let at = self
                .get_file_block_at_offset_exclusive(md, file, &fblock, off + n_copied)
                .await?;
            let FileBlockAtOffset {
                mut ptr,
                index_in_parent,
                mut block,
                next_block_off,
                start_off,
            } = at;

            let old_len = block.contents.len();
            let was_dirty = self
                .config
                .dirty_bcache
                .is_dirty(ptr, self.folder.branch);

            // Never write past the start of the next leaf.
            let mut max = data.len();
            if let Some(nbo) = next_block_off {
                let room = nbo.saturating_sub(off) as usize;
                if room < max {
                    max = room;
                }
            }

            n_copied += self.config.splitter.copy_until_split(
                &mut block,
                next_block_off.is_none(),
                &data[n_copied as usize..max],
                off + n_copied - start_off,
            ) as u64;

            if n_copied < n && next_block_off.is_none() {
                // Ran off the end of the file: grow it rightwards.
                if ptr == file.tail_pointer() {
                    fblock = self.create_indirect_block_locked(st, md, file)?;
                    ptr = fblock.iptrs[0].info.ptr;
                }
                self.new_right_block_locked(
                    st,
                    md,
                    file,
                    &mut fblock,
                    start_off + block.contents.len() as u64,
                )?;
            } else if let Some(nbo) = next_block_off {
                if n_copied < n && off + n_copied < nbo {
                    // The write stops inside a hole: a new leaf goes in
                    // right after this one.
                    self.new_right_block_locked(
                        st,
                        md,
                        file,
                        &mut fblock,
                        start_off + block.contents.len() as u64,
                    )?;
                    let idx = index_in_parent.unwrap_or(0);
                    let newb = fblock.iptrs.pop().expect("right block was just appended");
                    fblock.iptrs.insert(idx + 1, newb);
                }
            }

            // Only the last leaf can grow the file size.
            if old_len != block.contents.len() && next_block_off.is_none() {
                de.info.encoded_size = 0;
                de.size += (block.contents.len() - old_len) as u64;
                st.de_cache.insert(file.tail_ref(), de.clone());
            }

            *newly_dirtied_child_bytes += block.contents.len() as i64;
            if was_dirty {
                *newly_dirtied_child_bytes -= old_len as i64;
            }

            if let Some(i) = index_in_parent {
                unrefs.push(fblock.iptrs[i].info);
                fblock.iptrs[i].info.encoded_size = 0;
            }

            // The block keeps its old id while dirty.
            self.cache_block_if_not_yet_dirty_locked(st, ptr, file, Block::File(block))?;
            dirty_ptrs.push(ptr);
        }

        if fblock.is_indirect {
            // Dirtying the top block last means a concurrent sync
            // always observes the new shape, and any write during a
            // sync gets deferred even when it lands on a leaf that is
            // not itself mid-upload.
            self.cache_block_if_not_yet_dirty_locked(
                st,
                file.tail_pointer(),
                file,
                Block::File(fblock.clone()),
            )?;
            dirty_ptrs.push(file.tail_pointer());

            if st.do_defer_write && de.size > old_size {
                let df = self.get_or_create_dirty_file_locked(st, file);
                df.add_deferred_new_bytes((de.size - old_size) as i64);
            }
        }

        let si = self.sync_info_mut(st, file.tail_ref())?;
        si.unrefs.append(&mut unrefs);
        let latest_write = si.op.add_write(off, n);
        Ok((latest_write, dirty_ptrs))
    }

    /// Write `data` at `off`. May wait on the dirty budget; a future
    /// sync unblocks it. A write that lands while its file is syncing
    /// is recorded for replay after that sync.
    pub async fn write(
        &self,
        md: &RootMetadata,
        node: &Arc<Node>,
        data: &[u8],
        off: u64,
    ) -> Result<()> {
        let permit = self
            .config
            .dirty_bcache
            .request_permission_to_dirty(data.len() as i64);
        let dirty_bcache = self.config.dirty_bcache.clone();
        let reservation = data.len() as i64;
        let _release = guard((), move |_| {
            dirty_bcache.update_unsynced_bytes(-reservation, true);
        });
        self.maybe_wait_on_deferred_writes(node, permit).await?;

        let mut st = self.state.write().await;
        let file_path = self.path_for_write(node)?;

        let res = self
            .write_data_locked(&mut st, md, &file_path, data, off)
            .await;
        let defer = st.do_defer_write;
        st.do_defer_write = false;
        let (_latest_write, dirty_ptrs, newly_dirtied_child_bytes) = res?;

        if defer {
            debug!(
                file = %file_path,
                off,
                len = data.len(),
                "deferring a write to a syncing file"
            );
            st.deferred_dirty_deletes.extend(dirty_ptrs);
            st.deferred_writes.push(DeferredOp::Write {
                data: Bytes::copy_from_slice(data),
                off,
                path: file_path,
                newly_dirtied_child_bytes,
            });
        }

        Ok(())
    }

    /// Grow the file to `size` without materialising the zero region.
    async fn truncate_extend_locked(
        &self,
        st: &mut FolderBlocks,
        md: &RootMetadata,
        file: &Path,
        size: u64,
    ) -> Result<(WriteRange, Vec<BlockPointer>)> {
        if size > self.config.max_file_bytes {
            return FileTooBigSnafu {
                size,
                limit: self.config.max_file_bytes,
            }
            .fail();
        }
        if !md.is_writer(self.config.current_user) {
            return WriteAccessSnafu {
                user: self.config.current_user,
            }
            .fail();
        }

        let mut fblock = self
            .get_file_block_exclusive(md, file.tail_pointer(), file)
            .await?;
        let mut dirty_ptrs = Vec::new();

        if !fblock.is_indirect {
            let old = fblock;
            fblock = self.create_indirect_block_locked(st, md, file)?;
            fblock.iptrs[0].holes = true;
            let child_ptr = fblock.iptrs[0].info.ptr;
            self.cache_block_if_not_yet_dirty_locked(st, child_ptr, file, Block::File(old))?;
            dirty_ptrs.push(child_ptr);
        }

        self.new_right_block_locked(st, md, file, &mut fblock, size)?;
        dirty_ptrs.push(
            fblock
                .iptrs
                .last()
                .expect("right block was just appended")
                .info
                .ptr,
        );

        let mut de = self.get_dirty_entry_exclusive(st, md, file).await?;
        self.get_or_create_sync_info_locked(st, &de);
        de.info.encoded_size = 0;
        de.size = size;
        st.de_cache.insert(file.tail_ref(), de);

        // One mark would do, but flagging every child is robust against
        // later splits.
        for iptr in fblock.iptrs.iter_mut() {
            iptr.holes = true;
        }
        self.cache_block_if_not_yet_dirty_locked(
            st,
            file.tail_pointer(),
            file,
            Block::File(fblock),
        )?;
        dirty_ptrs.push(file.tail_pointer());

        let si = self.sync_info_mut(st, file.tail_ref())?;
        let latest_write = si.op.add_truncate(size);
        self.maybe_force_sync();
        Ok((latest_write, dirty_ptrs))
    }

    pub(crate) async fn truncate_locked(
        &self,
        st: &mut FolderBlocks,
        md: &RootMetadata,
        file: &Path,
        size: u64,
    ) -> Result<(Option<WriteRange>, Vec<BlockPointer>, i64)> {
        let fblock = self
            .get_file_block_exclusive(md, file.tail_pointer(), file)
            .await?;
        if !md.is_writer(self.config.current_user) {
            return WriteAccessSnafu {
                user: self.config.current_user,
            }
            .fail();
        }

        // Find the leaf where the file should now end.
        let at = self
            .get_file_block_at_offset_exclusive(md, file, &fblock, size)
            .await?;
        let FileBlockAtOffset {
            ptr,
            index_in_parent,
            mut block,
            next_block_off,
            start_off,
        } = at;
        let mut fblock = fblock;

        let curr_len = start_off + block.contents.len() as u64;
        if curr_len + TRUNCATE_EXTEND_CUTOFF < size {
            let (range, ptrs) = self.truncate_extend_locked(st, md, file, size).await?;
            return Ok((Some(range), ptrs, 0));
        } else if curr_len < size {
            let more_needed = (size - curr_len) as usize;
            let (range, ptrs, newly) = self
                .write_data_locked(st, md, file, &vec![0u8; more_needed], curr_len)
                .await?;
            return Ok((Some(range), ptrs, newly));
        } else if curr_len == size && next_block_off.is_none() {
            // Same size: nothing to do.
            return Ok((None, Vec::new(), 0));
        }

        let mut de = self.get_dirty_entry_exclusive(st, md, file).await?;

        let old_len = block.contents.len();
        let was_dirty = self.config.dirty_bcache.is_dirty(ptr, self.folder.branch);
        block.contents.truncate((size - start_off) as usize);

        let mut newly_dirtied_child_bytes = block.contents.len() as i64;
        if was_dirty {
            newly_dirtied_child_bytes -= old_len as i64;
        }
        let df = self.get_or_create_dirty_file_locked(st, file);
        df.update_not_yet_syncing_bytes(newly_dirtied_child_bytes);

        self.get_or_create_sync_info_locked(st, &de);
        let mut unrefs: Vec<BlockInfo> = Vec::new();

        if next_block_off.is_some() {
            if let Some(i) = index_in_parent {
                // Every leaf past the new end is dropped and unref'd.
                for iptr in &fblock.iptrs[i + 1..] {
                    unrefs.push(iptr.info);
                }
                fblock.iptrs.truncate(i + 1);
            }
        }

        if let Some(i) = index_in_parent {
            unrefs.push(fblock.iptrs[i].info);
            fblock.iptrs[i].info.encoded_size = 0;
        }

        if fblock.is_indirect {
            self.cache_block_if_not_yet_dirty_locked(
                st,
                file.tail_pointer(),
                file,
                Block::File(fblock.clone()),
            )?;
        }

        de.info.encoded_size = 0;
        de.size = size;
        st.de_cache.insert(file.tail_ref(), de);

        // The truncated leaf keeps its old id while dirty.
        self.cache_block_if_not_yet_dirty_locked(st, ptr, file, Block::File(block))?;

        let si = self.sync_info_mut(st, file.tail_ref())?;
        si.unrefs.append(&mut unrefs);
        let latest_write = si.op.add_truncate(size);
        Ok((Some(latest_write), Vec::new(), newly_dirtied_child_bytes))
    }

    /// Truncate or extend the file to `size`. Shares the write path's
    /// admission control and deferral discipline.
    pub async fn truncate(&self, md: &RootMetadata, node: &Arc<Node>, size: u64) -> Result<()> {
        // Assume the whole remaining file may end up dirty.
        let permit = self
            .config
            .dirty_bcache
            .request_permission_to_dirty(size as i64);
        let dirty_bcache = self.config.dirty_bcache.clone();
        let reservation = size as i64;
        let _release = guard((), move |_| {
            dirty_bcache.update_unsynced_bytes(-reservation, true);
        });
        self.maybe_wait_on_deferred_writes(node, permit).await?;

        let mut st = self.state.write().await;
        let file_path = self.path_for_write(node)?;

        let res = self.truncate_locked(&mut st, md, &file_path, size).await;
        let defer = st.do_defer_write;
        st.do_defer_write = false;
        let (_latest_write, dirty_ptrs, newly_dirtied_child_bytes) = res?;

        if defer {
            debug!(file = %file_path, size, "deferring a truncate to a syncing file");
            st.deferred_dirty_deletes.extend(dirty_ptrs);
            st.deferred_writes.push(DeferredOp::Truncate {
                size,
                path: file_path,
                newly_dirtied_child_bytes,
            });
        }

        Ok(())
    }
}
