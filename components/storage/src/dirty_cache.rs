use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use tansu_types::{
    block::{Block, BlockPointer},
    BranchId,
};
use tokio::sync::oneshot;
use tracing::debug;

use crate::err::{CacheFullSnafu, Result};

/// A write's admission permit. The receiver resolves once the dirty
/// budget has room for the reservation.
pub type DirtyPermit = oneshot::Receiver<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DirtyKey {
    ptr: BlockPointer,
    branch: BranchId,
}

struct Waiter {
    bytes: i64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<DirtyKey, Arc<Block>>,
    /// Dirtied bytes not yet confirmed uploaded.
    unsynced_bytes: i64,
    /// All dirty bytes outstanding, including those mid-sync.
    total_bytes: i64,
    /// Reservations of writes that were admitted but have not finished
    /// their own accounting yet.
    waiting_bytes: i64,
    waiters: VecDeque<Waiter>,
}

/// Process-wide cache of dirty blocks, shared by every folder. It is
/// also the admission controller: writes reserve their byte count here
/// before taking any folder lock, and block until a sync frees room.
pub struct DirtyBlockCache {
    inner: Mutex<Inner>,
    limit: i64,
    force_sync_threshold: i64,
}

impl DirtyBlockCache {
    pub fn new(limit: i64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            limit,
            force_sync_threshold: limit / 2,
        })
    }

    pub fn get(&self, ptr: BlockPointer, branch: BranchId) -> Option<Arc<Block>> {
        let inner = self.inner.lock().unwrap();
        inner.blocks.get(&DirtyKey { ptr, branch }).cloned()
    }

    pub fn put(&self, ptr: BlockPointer, branch: BranchId, block: Block) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        // Admission control should have throttled us long before this.
        if inner.total_bytes > self.limit * 2 {
            return CacheFullSnafu.fail();
        }
        inner.blocks.insert(DirtyKey { ptr, branch }, Arc::new(block));
        Ok(())
    }

    pub fn delete(&self, ptr: BlockPointer, branch: BranchId) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.remove(&DirtyKey { ptr, branch });
    }

    pub fn is_dirty(&self, ptr: BlockPointer, branch: BranchId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.blocks.contains_key(&DirtyKey { ptr, branch })
    }

    /// Reserve `bytes` against the dirty budget. The permit resolves
    /// immediately when there is room, otherwise once enough unsynced
    /// bytes have drained. Permits are granted in request order.
    pub fn request_permission_to_dirty(&self, bytes: i64) -> DirtyPermit {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        if inner.waiters.is_empty() && Self::fits(&inner, self.limit, bytes) {
            inner.waiting_bytes += bytes;
            let _ = tx.send(());
        } else {
            debug!(bytes, "write blocked on a full dirty buffer");
            inner.waiters.push_back(Waiter { bytes, tx });
        }
        rx
    }

    fn fits(inner: &Inner, limit: i64, bytes: i64) -> bool {
        // An over-budget request is still let through on an empty
        // buffer, otherwise it could never run at all.
        inner.unsynced_bytes + inner.waiting_bytes + bytes <= limit
            || (inner.unsynced_bytes == 0 && inner.waiting_bytes == 0)
    }

    fn grant_waiters(&self, inner: &mut Inner) {
        while let Some(front) = inner.waiters.front() {
            if !Self::fits(inner, self.limit, front.bytes) {
                break;
            }
            let w = inner.waiters.pop_front().unwrap();
            inner.waiting_bytes += w.bytes;
            // A dropped receiver just wastes the grant until release.
            let _ = w.tx.send(());
        }
    }

    /// Adjust the unsynced counter, or release a reservation when
    /// `was_reservation` is set. Either may unblock queued writes.
    pub fn update_unsynced_bytes(&self, delta: i64, was_reservation: bool) {
        let mut inner = self.inner.lock().unwrap();
        if was_reservation {
            inner.waiting_bytes += delta;
        } else {
            inner.unsynced_bytes += delta;
        }
        self.grant_waiters(&mut inner);
    }

    pub fn update_total_bytes(&self, delta: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_bytes += delta;
    }

    /// True once dirty bytes pass the high-water mark and the owning
    /// folder should kick off a sync without waiting for the caller.
    pub fn should_force_sync(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.unsynced_bytes > self.force_sync_threshold
    }

    pub fn unsynced_bytes(&self) -> i64 {
        self.inner.lock().unwrap().unsynced_bytes
    }

    pub fn total_bytes(&self) -> i64 {
        self.inner.lock().unwrap().total_bytes
    }
}
