use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use tansu_common::DEFAULT_ON_DEMAND_REQUEST_PRIORITY;
use tansu_meta::{
    ops::{AttrChange, Op, RenameOp, SetAttrOp},
    RootMetadata,
};
use tansu_storage::block_cache::BlockCacheLifetime;
use tansu_types::{
    block::{Block, BlockInfo, BlockPointer, BlockRef, DirBlock, FileBlock},
    entry::{DirEntry, EntryType},
    path::Path,
    KeyMeta,
};
use tansu_utils::clock::unix_nanos;
use tracing::debug;

use crate::{
    err::{
        BlockFetchSnafu, InvalidParentSnafu, InvalidPathSnafu, NoSuchNameSnafu, NotDirBlockSnafu,
        NotFileBlockSnafu, Result,
    },
    node::{Node, NodeCache},
    BlocksGuard, FolderBlockOps, FolderBlocks,
};

/// Parent blocks modified as a side effect of an operation, to be fed
/// into one atomic metadata update.
pub type LocalBcache = HashMap<BlockPointer, DirBlock>;

/// The outcome of descending an indirect file to a byte offset.
#[derive(Debug, Clone)]
pub(crate) struct FileBlockAtOffset {
    pub ptr: BlockPointer,
    /// Index of `ptr` in the top block's pointer list; `None` when the
    /// file is direct. Deeper indirection levels extend this to a path
    /// of indices.
    pub index_in_parent: Option<usize>,
    pub block: FileBlock,
    /// Start offset of the next leaf, or `None` past the last leaf.
    pub next_block_off: Option<u64>,
    /// Start offset of the returned leaf.
    pub start_off: u64,
}

pub(crate) fn as_file_block(ptr: BlockPointer, block: &Block) -> Result<&FileBlock> {
    block.as_file().ok_or_else(|| NotFileBlockSnafu { ptr }.build())
}

pub(crate) fn as_dir_block(ptr: BlockPointer, block: &Block) -> Result<&DirBlock> {
    block.as_dir().ok_or_else(|| NotDirBlockSnafu { ptr }.build())
}

impl FolderBlockOps {
    fn block_from_caches(&self, ptr: BlockPointer) -> Option<Arc<Block>> {
        if let Some(block) = self.config.dirty_bcache.get(ptr, self.folder.branch) {
            return Some(block);
        }
        self.config.bcache.get(ptr)
    }

    /// Fetch a block through the retrieval queue, then give it to the
    /// clean cache as a transient entry unless caching is off.
    async fn fetch_block(&self, kmd: KeyMeta, ptr: BlockPointer, do_cache: bool) -> Result<Block> {
        let rx = self
            .config
            .block_queue
            .request(DEFAULT_ON_DEMAND_REQUEST_PRIORITY, kmd, ptr);
        let block = match rx.await {
            Ok(Ok(block)) => block,
            Ok(Err(shared)) => {
                return BlockFetchSnafu {
                    message: shared.to_string(),
                    recoverable: shared.is_recoverable(),
                }
                .fail();
            }
            Err(_) => {
                return BlockFetchSnafu {
                    message: "retrieval worker went away".to_string(),
                    recoverable: false,
                }
                .fail();
            }
        };
        if do_cache {
            self.config
                .bcache
                .put(ptr, self.folder.tlf, block.clone(), BlockCacheLifetime::Transient);
        }
        Ok(block)
    }

    /// Fetch under the shared block-lock. The guard is handed back so
    /// it can be dropped around the network wait and reacquired after,
    /// keeping readers from serialising behind slow fetches.
    pub(crate) async fn get_block_shared<'a>(
        &'a self,
        guard: BlocksGuard<'a>,
        md: &RootMetadata,
        ptr: BlockPointer,
        do_cache: bool,
    ) -> Result<(BlocksGuard<'a>, Arc<Block>)> {
        if !ptr.is_valid() {
            return InvalidPathSnafu.fail();
        }
        if let Some(block) = self.block_from_caches(ptr) {
            return Ok((guard, block));
        }
        drop(guard);
        let block = self.fetch_block(md.key_meta(), ptr, do_cache).await?;
        let guard = self.state.read().await;
        Ok((guard, Arc::new(block)))
    }

    /// Fetch while the caller holds the block-lock exclusively. The
    /// lock is never released mid-operation here; atomicity of the
    /// surrounding write wins over fetch concurrency.
    pub(crate) async fn get_block_exclusive(
        &self,
        md: &RootMetadata,
        ptr: BlockPointer,
        do_cache: bool,
    ) -> Result<Arc<Block>> {
        if !ptr.is_valid() {
            return InvalidPathSnafu.fail();
        }
        if let Some(block) = self.block_from_caches(ptr) {
            return Ok(block);
        }
        let block = self.fetch_block(md.key_meta(), ptr, do_cache).await?;
        Ok(Arc::new(block))
    }

    /// A mutable copy of the file block at `ptr`, for a write-mode
    /// operation. Blocks are always copied before mutation; the dirty
    /// cache hands out shared references only.
    pub(crate) async fn get_file_block_exclusive(
        &self,
        md: &RootMetadata,
        ptr: BlockPointer,
        file: &Path,
    ) -> Result<FileBlock> {
        if !file.is_valid() {
            return InvalidPathSnafu.fail();
        }
        let block = self.get_block_exclusive(md, ptr, true).await?;
        Ok(as_file_block(ptr, &block)?.clone())
    }

    pub(crate) async fn get_dir_block_exclusive(
        &self,
        md: &RootMetadata,
        dir: &Path,
    ) -> Result<DirBlock> {
        if !dir.is_valid() {
            return InvalidPathSnafu.fail();
        }
        let ptr = dir.tail_pointer();
        let block = self.get_block_exclusive(md, ptr, true).await?;
        Ok(as_dir_block(ptr, &block)?.clone())
    }

    /// Uncached fetch for internal consumers (state checks, conflict
    /// inspection) that may not know the block's kind.
    pub async fn get_block_for_reading(
        &self,
        md: &RootMetadata,
        ptr: BlockPointer,
    ) -> Result<Arc<Block>> {
        let guard = self.state.read().await;
        let (_guard, block) = self.get_block_shared(guard, md, ptr, false).await?;
        Ok(block)
    }

    pub async fn get_file_block_for_reading(
        &self,
        md: &RootMetadata,
        ptr: BlockPointer,
    ) -> Result<FileBlock> {
        let block = self.get_block_for_reading(md, ptr).await?;
        Ok(as_file_block(ptr, &block)?.clone())
    }

    pub async fn get_dir_block_for_reading(
        &self,
        md: &RootMetadata,
        ptr: BlockPointer,
    ) -> Result<DirBlock> {
        let block = self.get_block_for_reading(md, ptr).await?;
        Ok(as_dir_block(ptr, &block)?.clone())
    }

    /// Walk the indirect tree to the leaf covering `off`, in shared
    /// mode. Only one level of indirection exists today; the walk is a
    /// loop so deeper trees slot in without restructuring.
    pub(crate) async fn get_file_block_at_offset_shared<'a>(
        &'a self,
        mut guard: BlocksGuard<'a>,
        md: &RootMetadata,
        file: &Path,
        top: &FileBlock,
        off: u64,
    ) -> Result<(BlocksGuard<'a>, FileBlockAtOffset)> {
        let mut ptr = file.tail_pointer();
        let mut block = top.clone();
        let mut index_in_parent = None;
        let mut next_block_off = None;
        let mut start_off = 0;

        while block.is_indirect {
            let next_index = pick_child_index(&block, off);
            let next_ptr = &block.iptrs[next_index];
            index_in_parent = Some(next_index);
            start_off = next_ptr.off;
            next_block_off = block.iptrs.get(next_index + 1).map(|p| p.off);
            ptr = next_ptr.info.ptr;
            let (g, child) = self.get_block_shared(guard, md, ptr, true).await?;
            guard = g;
            block = as_file_block(ptr, &child)?.clone();
        }

        Ok((
            guard,
            FileBlockAtOffset {
                ptr,
                index_in_parent,
                block,
                next_block_off,
                start_off,
            },
        ))
    }

    /// Exclusive-mode variant of the offset descent.
    pub(crate) async fn get_file_block_at_offset_exclusive(
        &self,
        md: &RootMetadata,
        file: &Path,
        top: &FileBlock,
        off: u64,
    ) -> Result<FileBlockAtOffset> {
        let mut ptr = file.tail_pointer();
        let mut block = top.clone();
        let mut index_in_parent = None;
        let mut next_block_off = None;
        let mut start_off = 0;

        while block.is_indirect {
            let next_index = pick_child_index(&block, off);
            let next_ptr = &block.iptrs[next_index];
            index_in_parent = Some(next_index);
            start_off = next_ptr.off;
            next_block_off = block.iptrs.get(next_index + 1).map(|p| p.off);
            ptr = next_ptr.info.ptr;
            block = self.get_file_block_exclusive(md, ptr, file).await?;
        }

        Ok(FileBlockAtOffset {
            ptr,
            index_in_parent,
            block,
            next_block_off,
            start_off,
        })
    }

    /// Overlay uncommitted directory entries onto a fetched dir block.
    pub(crate) fn update_with_dirty_entries(
        &self,
        st: &FolderBlocks,
        block: &DirBlock,
    ) -> DirBlock {
        if st.de_cache.is_empty() {
            return block.clone();
        }
        let mut copy = block.clone();
        for (name, de) in &block.children {
            if let Some(dirty) = st.de_cache.get(&de.block_ref()) {
                copy.children.insert(name.clone(), dirty.clone());
            }
        }
        copy
    }

    /// The children of `dir`, with dirty entries substituted in.
    pub async fn get_dirty_dir_children(
        &self,
        md: &RootMetadata,
        dir: &Path,
    ) -> Result<HashMap<String, DirEntry>> {
        if !dir.is_valid() {
            return InvalidPathSnafu.fail();
        }
        let guard = self.state.read().await;
        let ptr = dir.tail_pointer();
        let (guard, block) = self.get_block_shared(guard, md, ptr, true).await?;
        let dblock = as_dir_block(ptr, &block)?;
        let dblock = self.update_with_dirty_entries(&guard, dblock);
        Ok(dblock.children)
    }

    pub(crate) async fn get_dirty_parent_and_entry_shared<'a>(
        &'a self,
        guard: BlocksGuard<'a>,
        md: &RootMetadata,
        file: &Path,
    ) -> Result<(BlocksGuard<'a>, DirBlock, DirEntry)> {
        if !file.has_valid_parent() {
            return InvalidParentSnafu.fail();
        }
        let parent = file.parent_path();
        let ptr = parent.tail_pointer();
        let (guard, block) = self.get_block_shared(guard, md, ptr, true).await?;
        let dblock = as_dir_block(ptr, &block)?;
        let dblock = self.update_with_dirty_entries(&guard, dblock);
        let name = file.tail_name();
        let de = dblock
            .children
            .get(name)
            .cloned()
            .ok_or_else(|| NoSuchNameSnafu { name }.build())?;
        Ok((guard, dblock, de))
    }

    /// A modifiable copy of the file's parent block (dirty entries
    /// substituted) and the file's own possibly-dirty entry.
    pub async fn get_dirty_parent_and_entry(
        &self,
        md: &RootMetadata,
        file: &Path,
    ) -> Result<(DirBlock, DirEntry)> {
        let guard = self.state.read().await;
        let (_guard, dblock, de) = self
            .get_dirty_parent_and_entry_shared(guard, md, file)
            .await?;
        Ok((dblock, de))
    }

    pub async fn get_dirty_entry(&self, md: &RootMetadata, file: &Path) -> Result<DirEntry> {
        let (_, de) = self.get_dirty_parent_and_entry(md, file).await?;
        Ok(de)
    }

    /// Exclusive-mode lookup of the file's possibly-dirty entry.
    pub(crate) async fn get_dirty_entry_exclusive(
        &self,
        st: &FolderBlocks,
        md: &RootMetadata,
        file: &Path,
    ) -> Result<DirEntry> {
        if !file.has_valid_parent() {
            return InvalidParentSnafu.fail();
        }
        let parent = file.parent_path();
        let dblock = self.get_dir_block_exclusive(md, &parent).await?;
        let dblock = self.update_with_dirty_entries(st, &dblock);
        let name = file.tail_name();
        dblock
            .children
            .get(name)
            .cloned()
            .ok_or_else(|| NoSuchNameSnafu { name }.build())
    }

    /// BlockInfos of every child of an indirect file. Handles one
    /// level of indirection, like the rest of the tree walks.
    pub async fn get_indirect_file_block_infos(
        &self,
        md: &RootMetadata,
        file: &Path,
    ) -> Result<Vec<BlockInfo>> {
        let guard = self.state.read().await;
        let ptr = file.tail_pointer();
        let (_guard, block) = self.get_block_shared(guard, md, ptr, true).await?;
        let fblock = as_file_block(ptr, &block)?;
        if !fblock.is_indirect {
            return Ok(Vec::new());
        }
        Ok(fblock.iptrs.iter().map(|p| p.info).collect())
    }

    /// Prepare a rename: copies of the two parent blocks (the same
    /// block if the parents share an id), the moved entry, and a local
    /// cache of any grandparent whose times were bumped. Appends the
    /// rename op to `md`, which must be the caller's working copy.
    pub async fn prep_rename(
        &self,
        md: &mut RootMetadata,
        old_parent: &Path,
        old_name: &str,
        new_parent: &Path,
        new_name: &str,
    ) -> Result<(DirBlock, DirBlock, DirEntry, LocalBcache)> {
        let _guard = self.state.read().await;

        let old_pblock = self.get_dir_block_exclusive(md, old_parent).await?;
        let new_de = old_pblock
            .children
            .get(old_name)
            .cloned()
            .ok_or_else(|| NoSuchNameSnafu { name: old_name }.build())?;

        md.add_op(Op::Rename(RenameOp {
            common: Default::default(),
            old_name: old_name.to_string(),
            old_dir: old_parent.tail_pointer(),
            new_name: new_name.to_string(),
            new_dir: new_parent.tail_pointer(),
            renamed: new_de.ptr(),
            renamed_type: new_de.entry_type,
        }));

        let mut lbc = LocalBcache::new();
        let new_pblock = if old_parent.tail_pointer().id == new_parent.tail_pointer().id {
            old_pblock.clone()
        } else {
            let new_pblock = self.get_dir_block_exclusive(md, new_parent).await?;
            let now = unix_nanos(self.config.clock.now());

            let old_grandparent = old_parent.parent_path();
            if !old_grandparent.nodes.is_empty() {
                // Bump the old parent's times, unless the new parent is
                // that same block and will be rewritten anyway.
                if old_grandparent.tail_pointer().id != new_parent.tail_pointer().id {
                    let mut b = self.get_dir_block_exclusive(md, &old_grandparent).await?;
                    if let Some(de) = b.children.get_mut(old_parent.tail_name()) {
                        de.ctime = now;
                        de.mtime = now;
                        lbc.insert(old_grandparent.tail_pointer(), b);
                    }
                }
            } else {
                md.root.ctime = now;
                md.root.mtime = now;
            }
            new_pblock
        };

        Ok((old_pblock, new_pblock, new_de, lbc))
    }

    /// Resolve target pointers to nodes by walking directories, but
    /// only descending into subdirectories named in `new_ptrs` (the
    /// pointers an operation updated). Unfound targets stay `None`.
    pub async fn search_for_nodes(
        &self,
        cache: &Arc<dyn NodeCache>,
        ptrs: &[BlockPointer],
        new_ptrs: &HashSet<BlockPointer>,
        md: &RootMetadata,
        root_name: &str,
    ) -> Result<HashMap<BlockPointer, Option<Arc<Node>>>> {
        let mut node_map: HashMap<BlockPointer, Option<Arc<Node>>> =
            ptrs.iter().map(|p| (*p, None)).collect();
        if ptrs.is_empty() {
            return Ok(node_map);
        }

        let mut guard = self.state.read().await;

        let root_ptr = md.root.ptr();
        let root_node = cache.get_or_create(root_ptr, root_name, None);
        let mut num_found = 0;
        if let Some(slot) = node_map.get_mut(&root_ptr) {
            *slot = Some(root_node.clone());
            num_found += 1;
            if num_found >= node_map.len() {
                return Ok(node_map);
            }
        }

        let root_path = Path {
            folder: self.folder,
            nodes: vec![tansu_types::path::PathNode {
                ptr: root_ptr,
                name: root_name.to_string(),
            }],
        };

        let mut queue = VecDeque::new();
        queue.push_back(root_path);
        while let Some(dir) = queue.pop_front() {
            let ptr = dir.tail_pointer();
            let (g, block) = self.get_block_shared(guard, md, ptr, true).await?;
            guard = g;
            let dblock = as_dir_block(ptr, &block)?.clone();

            for (name, de) in &dblock.children {
                if let Some(slot) = node_map.get_mut(&de.ptr()) {
                    if slot.is_none() {
                        let child_path = dir.child_path(name, de.ptr());
                        // Materialise a node for every path element.
                        let mut node: Option<Arc<Node>> = None;
                        for pn in &child_path.nodes {
                            node = Some(cache.get_or_create(pn.ptr, &pn.name, node));
                        }
                        *slot = node;
                        num_found += 1;
                        if num_found >= node_map.len() {
                            return Ok(node_map);
                        }
                    }
                }

                if de.entry_type == EntryType::Dir && new_ptrs.contains(&de.ptr()) {
                    queue.push_back(dir.child_path(name, de.ptr()));
                }
            }
        }

        debug!(
            found = num_found,
            wanted = node_map.len(),
            "node search finished without finding every target"
        );
        Ok(node_map)
    }

    /// The clean (undirtied) entry for a file whose entry sits in the
    /// dirty overlay, if both exist.
    pub(crate) async fn get_undirtied_entry(
        &self,
        md: &RootMetadata,
        file: &Path,
    ) -> Result<Option<DirEntry>> {
        let guard = self.state.read().await;
        if !guard.de_cache.contains_key(&file.tail_ref()) {
            return Ok(None);
        }
        let parent = file.parent_path();
        let ptr = parent.tail_pointer();
        let (_guard, block) = self.get_block_shared(guard, md, ptr, true).await?;
        let dblock = as_dir_block(ptr, &block)?;
        Ok(dblock.children.get(file.tail_name()).cloned())
    }

    pub(crate) async fn set_cached_attr(
        &self,
        entry_ref: BlockRef,
        attr: AttrChange,
        real_entry: &DirEntry,
    ) {
        let mut st = self.state.write().await;
        let Some(cached) = st.de_cache.get_mut(&entry_ref) else {
            return;
        };
        match attr {
            AttrChange::Exec => cached.entry_type = real_entry.entry_type,
            AttrChange::Mtime => cached.mtime = real_entry.mtime,
        }
    }

    /// Apply a setattr to any cached dirty entry for the named child.
    /// Returns the node for the change, if one is cached.
    pub async fn update_cached_entry_attributes(
        &self,
        md: &RootMetadata,
        dir: &Path,
        op: &SetAttrOp,
    ) -> Result<Option<Arc<Node>>> {
        let child_path = dir.child_path(&op.name, Default::default());
        let de = self.get_dirty_entry(md, &child_path).await?;

        let Some(child_node) = self.config.node_cache.get(de.block_ref()) else {
            // Nothing to update; the entry is not reachable from any
            // live node.
            return Ok(None);
        };

        let child_path = dir.child_path(&op.name, de.ptr());
        if let Some(clean_entry) = self.get_undirtied_entry(md, &child_path).await? {
            self.set_cached_attr(de.block_ref(), op.attr, &clean_entry)
                .await;
        }
        Ok(Some(child_node))
    }
}

/// Index of the child whose range covers `off`: the greatest entry
/// whose start does not exceed it.
fn pick_child_index(block: &FileBlock, off: u64) -> usize {
    let mut next_index = block.iptrs.len() - 1;
    for (i, ptr) in block.iptrs.iter().enumerate() {
        if ptr.off == off {
            next_index = i;
            break;
        } else if ptr.off > off {
            // Never zero: the first pointer starts the range at 0.
            next_index = i - 1;
            break;
        }
    }
    next_index
}
