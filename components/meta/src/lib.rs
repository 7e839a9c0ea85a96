use std::sync::Arc;

use tansu_types::{MetadataRevision, TlfId};

pub mod err;
pub mod md;
pub mod mdcache;
pub mod ops;
pub mod server;

pub use err::{Error, Result};
pub use md::RootMetadata;
pub use mdcache::MdCache;
pub use server::{MdServer, MemoryMdServer};

/// Fetch merged revisions `start..=stop` through the cache, populating
/// it from the server on miss. Used by the background loops when they
/// walk folder history.
pub async fn get_md_range(
    cache: &MdCache,
    server: &dyn MdServer,
    tlf: TlfId,
    start: MetadataRevision,
    stop: MetadataRevision,
) -> Result<Vec<Arc<RootMetadata>>> {
    if stop < start || !start.is_initialized() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let mut missing = false;
    for rev in start.number()..=stop.number() {
        match cache.get(tlf, MetadataRevision(rev), true) {
            Ok(md) => out.push(md),
            Err(_) => {
                missing = true;
                break;
            }
        }
    }
    if !missing {
        return Ok(out);
    }

    let fetched = server.get_range(tlf, start, stop).await?;
    for md in &fetched {
        cache.put(md.clone());
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use tansu_types::UserId;

    use super::*;

    #[tokio::test]
    async fn range_fetch_fills_the_cache() {
        let server = MemoryMdServer::new();
        let cache = MdCache::new(100);
        let tlf = TlfId([9u8; 16]);
        for rev in 1..=4 {
            let mut md = RootMetadata::new(tlf, vec![UserId(1)]);
            md.revision = MetadataRevision(rev);
            server.put(md).await.unwrap();
        }

        let got = get_md_range(
            &cache,
            &*server,
            tlf,
            MetadataRevision(2),
            MetadataRevision(4),
        )
        .await
        .unwrap();
        assert_eq!(got.len(), 3);

        // Second call is served from the cache.
        let again = get_md_range(
            &cache,
            &*server,
            tlf,
            MetadataRevision(2),
            MetadataRevision(4),
        )
        .await
        .unwrap();
        assert_eq!(again.len(), 3);
        assert!(cache.get(tlf, MetadataRevision(3), true).is_ok());
    }
}
