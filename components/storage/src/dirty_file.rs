use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use tansu_types::{block::BlockPointer, BranchId};
use tokio::sync::oneshot;
use tracing::warn;

use crate::{
    dirty_cache::DirtyBlockCache,
    err::{BlocksStillSyncingSnafu, InvalidBlockStateSnafu, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockDirtyState {
    Dirty,
    Syncing,
    Synced,
}

impl BlockDirtyState {
    fn name(self) -> &'static str {
        match self {
            BlockDirtyState::Dirty => "dirty",
            BlockDirtyState::Syncing => "syncing",
            BlockDirtyState::Synced => "synced",
        }
    }
}

#[derive(Default)]
struct Inner {
    states: HashMap<BlockPointer, BlockDirtyState>,
    /// Old pointers whose permanent successor has already been written
    /// into the parent indirect block.
    orphaned: HashSet<BlockPointer>,
    /// Size of each block at the moment it started syncing.
    sync_sizes: HashMap<BlockPointer, i64>,
    /// Pointers whose completed upload already drained their size from
    /// the unsynced counter.
    settled: HashSet<BlockPointer>,
    syncing_count: usize,
    total_sync_bytes: i64,
    not_yet_syncing_bytes: i64,
    deferred_new_bytes: i64,
    err_listeners: Vec<oneshot::Sender<String>>,
}

/// Per-file dirty-state machine. Created lazily on the first write to a
/// file and dropped when a sync of that file completes. Shared with the
/// uploader, whose per-block completion callbacks run concurrently with
/// folder operations, so all state sits behind one mutex.
///
/// Every transition settles exactly one delta against the process-wide
/// dirty-byte counters, so that after a clean shutdown both reach zero.
pub struct DirtyFile {
    branch: BranchId,
    dirty_cache: Arc<DirtyBlockCache>,
    inner: Mutex<Inner>,
}

impl DirtyFile {
    pub fn new(branch: BranchId, dirty_cache: Arc<DirtyBlockCache>) -> Arc<Self> {
        Arc::new(Self {
            branch,
            dirty_cache,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Mark `ptr` dirty. Returns whether the pointer is new to this
    /// tracker (and so needs a cache put for accounting), and whether
    /// any block of this file is currently syncing (in which case the
    /// caller must defer its write).
    pub fn set_block_dirty(&self, ptr: BlockPointer) -> (bool, bool) {
        let mut inner = self.inner.lock().unwrap();
        let needs_caching = !inner.states.contains_key(&ptr);
        // A syncing or synced pointer keeps its state: the in-flight
        // sync owns that transition, and the re-dirtied copy is cleaned
        // up through the deferred-delete list instead.
        match inner.states.get(&ptr) {
            Some(BlockDirtyState::Syncing) | Some(BlockDirtyState::Synced) => {}
            _ => {
                inner.states.insert(ptr, BlockDirtyState::Dirty);
            }
        }
        let is_syncing = inner.syncing_count > 0;
        (needs_caching, is_syncing)
    }

    /// Forget a pointer so a later write counts it as newly dirtied.
    pub fn set_block_not_dirty(&self, ptr: BlockPointer) {
        let mut inner = self.inner.lock().unwrap();
        inner.states.remove(&ptr);
    }

    /// The uploader holds the only reference to the bytes as uploaded,
    /// so a write to a syncing block must copy first.
    pub fn block_needs_copy(&self, ptr: BlockPointer) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.states.get(&ptr) == Some(&BlockDirtyState::Syncing)
    }

    /// Whether this tracker knows the pointer at all (any state).
    pub fn is_block_dirty(&self, ptr: BlockPointer) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.states.contains_key(&ptr)
    }

    pub fn is_block_syncing(&self, ptr: BlockPointer) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.states.get(&ptr) == Some(&BlockDirtyState::Syncing)
    }

    pub fn is_block_orphaned(&self, ptr: BlockPointer) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.orphaned.contains(&ptr)
    }

    /// Move a dirty block into the syncing state, remembering its
    /// current size so the per-block completion can settle it.
    pub fn set_block_syncing(&self, ptr: BlockPointer) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.states.get(&ptr) {
            Some(BlockDirtyState::Dirty) => {}
            other => {
                return InvalidBlockStateSnafu {
                    ptr,
                    from: other.map(|s| s.name()).unwrap_or("untracked"),
                    to: "syncing",
                }
                .fail();
            }
        }
        let size = self
            .dirty_cache
            .get(ptr, self.branch)
            .map(|b| b.plain_size() as i64)
            .unwrap_or(0);
        inner.states.insert(ptr, BlockDirtyState::Syncing);
        inner.sync_sizes.insert(ptr, size);
        inner.syncing_count += 1;
        inner.total_sync_bytes += size;
        inner.not_yet_syncing_bytes -= size;
        Ok(())
    }

    /// Called from the uploader once this block's put succeeded.
    pub fn set_block_synced(&self, ptr: BlockPointer) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.states.get(&ptr) {
            Some(BlockDirtyState::Syncing) => {
                inner.states.insert(ptr, BlockDirtyState::Synced);
                inner.syncing_count -= 1;
                inner.settled.insert(ptr);
                let size = inner.sync_sizes.get(&ptr).copied().unwrap_or(0);
                self.dirty_cache.update_unsynced_bytes(-size, false);
                Ok(())
            }
            // A failed sync may already have reset this block, or a
            // deferred conversion may have rewritten it; the completion
            // then settles during finish_sync instead.
            _ => Ok(()),
        }
    }

    pub fn set_block_orphaned(&self, ptr: BlockPointer, orphaned: bool) {
        let mut inner = self.inner.lock().unwrap();
        if orphaned {
            inner.orphaned.insert(ptr);
        } else {
            inner.orphaned.remove(&ptr);
        }
    }

    /// After any sync failure, everything mid-flight reverts to dirty
    /// so a retry re-uploads it. Blocks that already finished their put
    /// count as unsynced again.
    pub fn reset_syncing_blocks_to_dirty(&self) {
        let mut inner = self.inner.lock().unwrap();
        let ptrs: Vec<BlockPointer> = inner.states.keys().copied().collect();
        for ptr in ptrs {
            let state = inner.states[&ptr];
            match state {
                BlockDirtyState::Syncing | BlockDirtyState::Synced => {
                    let size = inner.sync_sizes.remove(&ptr).unwrap_or(0);
                    if state == BlockDirtyState::Syncing {
                        inner.syncing_count -= 1;
                    }
                    if inner.settled.remove(&ptr) {
                        // The put landed, but the block counts as
                        // unsynced again until the retry.
                        self.dirty_cache.update_unsynced_bytes(size, false);
                    }
                    inner.total_sync_bytes -= size;
                    inner.not_yet_syncing_bytes += size;
                    inner.states.insert(ptr, BlockDirtyState::Dirty);
                }
                BlockDirtyState::Dirty => {}
            }
        }
    }

    /// Account bytes dirtied by a write or truncate that have not yet
    /// entered a sync. Negative deltas refund deferred bytes about to
    /// be replayed.
    pub fn update_not_yet_syncing_bytes(&self, delta: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.not_yet_syncing_bytes += delta;
        self.dirty_cache.update_unsynced_bytes(delta, false);
        self.dirty_cache.update_total_bytes(delta);
    }

    /// Track file growth that happened while a sync was in flight.
    pub fn add_deferred_new_bytes(&self, bytes: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.deferred_new_bytes += bytes;
    }

    /// A retrying sync takes over any bytes deferred during the failed
    /// attempt.
    pub fn assimilate_deferred_new_bytes(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.deferred_new_bytes == 0 {
            return;
        }
        inner.total_sync_bytes += inner.deferred_new_bytes;
        inner.deferred_new_bytes = 0;
    }

    /// Settle the ledger after a fully successful sync. Every tracked
    /// block must have finished its upload or been orphaned; sizes
    /// whose completion callback found the state already rewritten (a
    /// deferred conversion) are drained here instead.
    pub fn finish_sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let still_syncing = inner
            .states
            .values()
            .filter(|s| **s == BlockDirtyState::Syncing)
            .count();
        if still_syncing > 0 {
            return BlocksStillSyncingSnafu {
                count: still_syncing,
            }
            .fail();
        }
        let unsettled: i64 = inner
            .sync_sizes
            .iter()
            .filter(|(ptr, _)| !inner.settled.contains(*ptr))
            .map(|(_, size)| *size)
            .sum();
        if unsettled != 0 {
            self.dirty_cache.update_unsynced_bytes(-unsettled, false);
        }
        self.dirty_cache.update_total_bytes(-inner.total_sync_bytes);
        inner.total_sync_bytes = 0;
        inner.states.clear();
        inner.sync_sizes.clear();
        inner.settled.clear();
        inner.orphaned.clear();
        Ok(())
    }

    pub fn add_err_listener(&self, tx: oneshot::Sender<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.err_listeners.push(tx);
    }

    /// Deliver a non-recoverable sync outcome to every blocked writer.
    pub fn notify_err_listeners(&self, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        for tx in inner.err_listeners.drain(..) {
            if tx.send(message.to_string()).is_err() {
                warn!("sync error listener went away before notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tansu_types::{
        block::{Block, BlockId, FileBlock},
        MASTER_BRANCH,
    };

    use super::*;

    fn ptr(b: u8) -> BlockPointer {
        let mut id = [0u8; 32];
        id[0] = b;
        BlockPointer {
            id: BlockId(id),
            ..Default::default()
        }
    }

    fn file_block(len: usize) -> Block {
        Block::File(FileBlock {
            is_indirect: false,
            contents: vec![0u8; len],
            iptrs: vec![],
        })
    }

    fn setup() -> (Arc<DirtyBlockCache>, Arc<DirtyFile>) {
        let cache = DirtyBlockCache::new(1 << 20);
        let df = DirtyFile::new(MASTER_BRANCH, cache.clone());
        (cache, df)
    }

    #[tokio::test]
    async fn dirty_then_sync_then_clear() {
        let (cache, df) = setup();
        let p = ptr(1);
        cache.put(p, MASTER_BRANCH, file_block(100)).unwrap();

        let (needs_caching, is_syncing) = df.set_block_dirty(p);
        assert!(needs_caching);
        assert!(!is_syncing);
        df.update_not_yet_syncing_bytes(100);
        assert_eq!(cache.unsynced_bytes(), 100);
        assert_eq!(cache.total_bytes(), 100);

        df.set_block_syncing(p).unwrap();
        assert!(df.block_needs_copy(p));

        // A write to another block of the same file must defer now.
        let (_, is_syncing) = df.set_block_dirty(ptr(2));
        assert!(is_syncing);
        df.set_block_not_dirty(ptr(2));

        df.set_block_synced(p).unwrap();
        assert_eq!(cache.unsynced_bytes(), 0);

        df.finish_sync().unwrap();
        assert_eq!(cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn reset_after_failed_sync_re_dirties() {
        let (cache, df) = setup();
        let (a, b) = (ptr(1), ptr(2));
        cache.put(a, MASTER_BRANCH, file_block(10)).unwrap();
        cache.put(b, MASTER_BRANCH, file_block(20)).unwrap();
        df.set_block_dirty(a);
        df.set_block_dirty(b);
        df.update_not_yet_syncing_bytes(30);

        df.set_block_syncing(a).unwrap();
        df.set_block_syncing(b).unwrap();
        // One put succeeded before the sync failed.
        df.set_block_synced(a).unwrap();
        assert_eq!(cache.unsynced_bytes(), 20);

        df.reset_syncing_blocks_to_dirty();
        // The synced block counts as unsynced again.
        assert_eq!(cache.unsynced_bytes(), 30);
        assert!(!df.block_needs_copy(a));
        assert!(!df.block_needs_copy(b));

        // The retry can march both through the states again.
        df.set_block_syncing(a).unwrap();
        df.set_block_syncing(b).unwrap();
        df.set_block_synced(a).unwrap();
        df.set_block_synced(b).unwrap();
        df.finish_sync().unwrap();
        assert_eq!(cache.unsynced_bytes(), 0);
        assert_eq!(cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn finish_sync_rejects_inflight_blocks() {
        let (cache, df) = setup();
        let p = ptr(1);
        cache.put(p, MASTER_BRANCH, file_block(10)).unwrap();
        df.set_block_dirty(p);
        df.set_block_syncing(p).unwrap();
        assert!(df.finish_sync().is_err());
    }

    #[tokio::test]
    async fn orphan_mark_is_orthogonal() {
        let (cache, df) = setup();
        let p = ptr(1);
        cache.put(p, MASTER_BRANCH, file_block(10)).unwrap();
        df.set_block_dirty(p);
        df.set_block_orphaned(p, true);
        assert!(df.is_block_orphaned(p));
        df.set_block_syncing(p).unwrap();
        df.set_block_orphaned(p, false);
        assert!(!df.is_block_orphaned(p));
        assert!(df.is_block_syncing(p));
    }

    #[tokio::test]
    async fn err_listeners_fire_once() {
        let (_cache, df) = setup();
        let (tx, rx) = oneshot::channel();
        df.add_err_listener(tx);
        df.notify_err_listeners("upload rejected");
        assert_eq!(rx.await.unwrap(), "upload rejected");
    }
}
