use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tansu_types::{
    block::{Block, BlockId, BlockPointer, FileBlock},
    TlfId,
};

/// How long a clean-cache entry should survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCacheLifetime {
    /// Subject to eviction under memory pressure.
    Transient,
    /// Pinned until explicitly deleted; used for just-readied blocks
    /// between a sync's upload and its finalisation.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct KnownPtrKey {
    tlf: TlfId,
    content_hash: [u8; 32],
}

/// Cache of clean (uploaded, immutable) blocks, keyed by id. The
/// transient region is weight-bounded; the permanent region holds
/// blocks a sync has readied but not yet finalised. A content-hash
/// index supports de-duplicating writes of bytes this folder has
/// already uploaded.
pub struct BlockCache {
    transient: moka::sync::Cache<BlockId, Arc<Block>>,
    permanent: DashMap<BlockId, Arc<Block>>,
    known_ptrs: DashMap<KnownPtrKey, BlockPointer>,
}

fn content_hash(fblock: &FileBlock) -> [u8; 32] {
    let digest = Sha256::digest(&fblock.contents);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    hash
}

impl BlockCache {
    pub fn new(capacity_bytes: u64) -> Arc<Self> {
        let transient = moka::sync::Cache::builder()
            .weigher(|_, block: &Arc<Block>| -> u32 {
                block.plain_size().try_into().unwrap_or(u32::MAX)
            })
            .max_capacity(capacity_bytes)
            .build();
        Arc::new(Self {
            transient,
            permanent: DashMap::new(),
            known_ptrs: DashMap::new(),
        })
    }

    pub fn get(&self, ptr: BlockPointer) -> Option<Arc<Block>> {
        if let Some(b) = self.permanent.get(&ptr.id) {
            return Some(b.clone());
        }
        self.transient.get(&ptr.id)
    }

    pub fn put(&self, ptr: BlockPointer, tlf: TlfId, block: Block, lifetime: BlockCacheLifetime) {
        if let Block::File(fblock) = &block {
            if !fblock.is_indirect && !fblock.contents.is_empty() {
                self.known_ptrs.insert(
                    KnownPtrKey {
                        tlf,
                        content_hash: content_hash(fblock),
                    },
                    ptr,
                );
            }
        }
        let block = Arc::new(block);
        match lifetime {
            BlockCacheLifetime::Transient => self.transient.insert(ptr.id, block),
            BlockCacheLifetime::Permanent => {
                self.permanent.insert(ptr.id, block);
            }
        }
    }

    /// A pointer previously cached for identical direct-file contents
    /// in this folder, if any. Lets a sync reference existing bytes
    /// instead of uploading duplicates.
    pub fn check_for_known_ptr(&self, tlf: TlfId, fblock: &FileBlock) -> Option<BlockPointer> {
        if fblock.is_indirect || fblock.contents.is_empty() {
            return None;
        }
        self.known_ptrs
            .get(&KnownPtrKey {
                tlf,
                content_hash: content_hash(fblock),
            })
            .map(|p| *p)
    }

    /// Drop a block from the permanent region. It may keep living in
    /// the transient region under normal retention.
    pub fn delete_permanent(&self, id: BlockId) {
        self.permanent.remove(&id);
    }

    pub fn delete_transient(&self, id: BlockId) {
        self.transient.invalidate(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(b: u8) -> BlockPointer {
        let mut id = [0u8; 32];
        id[0] = b;
        BlockPointer {
            id: BlockId(id),
            ..Default::default()
        }
    }

    fn file_block(data: &[u8]) -> Block {
        Block::File(FileBlock {
            is_indirect: false,
            contents: data.to_vec(),
            iptrs: vec![],
        })
    }

    #[test]
    fn permanent_survives_delete_transient() {
        let cache = BlockCache::new(1 << 20);
        let p = ptr(1);
        cache.put(p, TlfId::default(), file_block(b"data"), BlockCacheLifetime::Permanent);
        cache.delete_transient(p.id);
        assert!(cache.get(p).is_some());
        cache.delete_permanent(p.id);
        assert!(cache.get(p).is_none());
    }

    #[test]
    fn known_ptr_matches_identical_contents() {
        let cache = BlockCache::new(1 << 20);
        let tlf = TlfId([7u8; 16]);
        let p = ptr(1);
        cache.put(p, tlf, file_block(b"dedup me"), BlockCacheLifetime::Transient);

        let same = FileBlock {
            is_indirect: false,
            contents: b"dedup me".to_vec(),
            iptrs: vec![],
        };
        assert_eq!(cache.check_for_known_ptr(tlf, &same), Some(p));

        let different = FileBlock {
            is_indirect: false,
            contents: b"not the same".to_vec(),
            iptrs: vec![],
        };
        assert_eq!(cache.check_for_known_ptr(tlf, &different), None);
        // Other folders never share pointers.
        assert_eq!(cache.check_for_known_ptr(TlfId::default(), &same), None);
    }
}
