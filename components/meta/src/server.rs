use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tansu_types::{MetadataRevision, TlfId};
use tracing::debug;

use crate::{
    err::{InvalidRevisionSnafu, Result, RevisionConflictSnafu},
    md::RootMetadata,
};

/// The metadata server surface the core consumes: append-only revision
/// history per folder, plus the remote per-folder truncate-lock that
/// serialises quota reclamation across writers.
#[async_trait]
pub trait MdServer: Send + Sync {
    /// The folder's current head, if it has any history.
    async fn get_for_tlf(&self, tlf: TlfId) -> Result<Option<Arc<RootMetadata>>>;

    /// Revisions `start..=stop`, ascending, clamped to the history.
    async fn get_range(
        &self,
        tlf: TlfId,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<Vec<Arc<RootMetadata>>>;

    /// Append a new head. The revision must directly follow the
    /// current head.
    async fn put(&self, md: RootMetadata) -> Result<Arc<RootMetadata>>;

    /// Try to take the folder's truncate-lock. False means another
    /// holder has it; callers treat that as a skip, never a block.
    async fn truncate_lock(&self, tlf: TlfId) -> Result<bool>;

    async fn truncate_unlock(&self, tlf: TlfId) -> Result<bool>;
}

/// In-memory metadata server, one revision log per folder.
#[derive(Default)]
pub struct MemoryMdServer {
    histories: DashMap<TlfId, Vec<Arc<RootMetadata>>>,
    truncate_locks: DashMap<TlfId, ()>,
}

impl MemoryMdServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MdServer for MemoryMdServer {
    async fn get_for_tlf(&self, tlf: TlfId) -> Result<Option<Arc<RootMetadata>>> {
        Ok(self
            .histories
            .get(&tlf)
            .and_then(|h| h.last().cloned()))
    }

    async fn get_range(
        &self,
        tlf: TlfId,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> Result<Vec<Arc<RootMetadata>>> {
        let Some(history) = self.histories.get(&tlf) else {
            return Ok(Vec::new());
        };
        Ok(history
            .iter()
            .filter(|md| md.revision >= start && md.revision <= stop)
            .cloned()
            .collect())
    }

    async fn put(&self, md: RootMetadata) -> Result<Arc<RootMetadata>> {
        if !md.revision.is_initialized() {
            return InvalidRevisionSnafu {
                revision: md.revision,
            }
            .fail();
        }
        let mut history = self.histories.entry(md.tlf).or_default();
        let head = history
            .last()
            .map(|h| h.revision)
            .unwrap_or(MetadataRevision::UNINITIALIZED);
        let expected = if head.is_initialized() {
            head + 1
        } else {
            MetadataRevision::INITIAL
        };
        if md.revision != expected {
            return RevisionConflictSnafu {
                revision: md.revision,
                head,
            }
            .fail();
        }
        debug!(tlf = %md.tlf, revision = %md.revision, "new metadata head");
        let md = Arc::new(md);
        history.push(md.clone());
        Ok(md)
    }

    async fn truncate_lock(&self, tlf: TlfId) -> Result<bool> {
        match self.truncate_locks.entry(tlf) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(());
                Ok(true)
            }
        }
    }

    async fn truncate_unlock(&self, tlf: TlfId) -> Result<bool> {
        Ok(self.truncate_locks.remove(&tlf).is_some())
    }
}

#[cfg(test)]
mod tests {
    use tansu_types::UserId;

    use super::*;

    fn tlf(b: u8) -> TlfId {
        let mut id = [0u8; 16];
        id[0] = b;
        TlfId(id)
    }

    fn md_at(tlf_id: TlfId, rev: i64) -> RootMetadata {
        let mut md = RootMetadata::new(tlf_id, vec![UserId(1)]);
        md.revision = MetadataRevision(rev);
        md
    }

    #[tokio::test]
    async fn put_enforces_sequential_revisions() {
        let server = MemoryMdServer::new();
        let id = tlf(1);
        assert!(server.get_for_tlf(id).await.unwrap().is_none());

        server.put(md_at(id, 1)).await.unwrap();
        server.put(md_at(id, 2)).await.unwrap();
        assert!(server.put(md_at(id, 2)).await.is_err());
        assert!(server.put(md_at(id, 5)).await.is_err());

        let head = server.get_for_tlf(id).await.unwrap().unwrap();
        assert_eq!(head.revision, MetadataRevision(2));
    }

    #[tokio::test]
    async fn range_is_clamped() {
        let server = MemoryMdServer::new();
        let id = tlf(1);
        for rev in 1..=5 {
            server.put(md_at(id, rev)).await.unwrap();
        }
        let range = server
            .get_range(id, MetadataRevision(3), MetadataRevision(100))
            .await
            .unwrap();
        let revs: Vec<i64> = range.iter().map(|md| md.revision.number()).collect();
        assert_eq!(revs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn truncate_lock_is_exclusive_per_folder() {
        let server = MemoryMdServer::new();
        let (a, b) = (tlf(1), tlf(2));
        assert!(server.truncate_lock(a).await.unwrap());
        assert!(!server.truncate_lock(a).await.unwrap());
        // Other folders are unaffected.
        assert!(server.truncate_lock(b).await.unwrap());

        assert!(server.truncate_unlock(a).await.unwrap());
        assert!(!server.truncate_unlock(a).await.unwrap());
        assert!(server.truncate_lock(a).await.unwrap());
    }
}
