use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use lru::LruCache;
use tansu_types::{MetadataRevision, TlfId};

use crate::{
    err::{NoSuchMetadataSnafu, Result},
    md::RootMetadata,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MdCacheKey {
    tlf: TlfId,
    revision: MetadataRevision,
    merged: bool,
}

/// Bounded LRU of recently seen metadata revisions. Insertion past
/// capacity evicts the least-recently-used entry.
pub struct MdCache {
    inner: Mutex<LruCache<MdCacheKey, Arc<RootMetadata>>>,
}

impl MdCache {
    pub const DEFAULT_CAPACITY: usize = 5000;

    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Arc::new(Self {
            inner: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn get(
        &self,
        tlf: TlfId,
        revision: MetadataRevision,
        merged: bool,
    ) -> Result<Arc<RootMetadata>> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .get(&MdCacheKey {
                tlf,
                revision,
                merged,
            })
            .cloned()
            .ok_or_else(|| {
                NoSuchMetadataSnafu {
                    tlf,
                    revision,
                    merged,
                }
                .build()
            })
    }

    pub fn put(&self, md: Arc<RootMetadata>) {
        let key = MdCacheKey {
            tlf: md.tlf,
            revision: md.revision,
            merged: md.merged,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.put(key, md);
    }
}

#[cfg(test)]
mod tests {
    use tansu_types::UserId;

    use super::*;

    fn md_for(tlf_byte: u8, rev: i64, merged: bool) -> Arc<RootMetadata> {
        let mut id = [0u8; 16];
        id[0] = tlf_byte;
        let mut md = RootMetadata::new(TlfId(id), vec![UserId(1)]);
        md.revision = MetadataRevision(rev);
        md.merged = merged;
        Arc::new(md)
    }

    #[test]
    fn put_then_get() {
        let cache = MdCache::new(100);
        let md = md_for(1, 1, true);
        cache.put(md.clone());
        let got = cache.get(md.tlf, md.revision, true).unwrap();
        assert!(Arc::ptr_eq(&got, &md));
        // The unmerged flavour is a distinct key.
        assert!(cache.get(md.tlf, md.revision, false).is_err());
    }

    #[test]
    fn put_past_capacity_evicts_lru() {
        let cache = MdCache::new(2);
        let md0 = md_for(1, 0, true);
        let md1 = md_for(2, 0, false);
        let md2 = md_for(3, 1, true);
        cache.put(md0.clone());
        cache.put(md1.clone());
        cache.put(md2.clone());

        // The first entry fell out; the newer two survive.
        assert!(cache.get(md0.tlf, md0.revision, true).is_err());
        assert!(cache.get(md1.tlf, md1.revision, false).is_ok());
        assert!(cache.get(md2.tlf, md2.revision, true).is_ok());
    }
}
