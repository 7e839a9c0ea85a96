use std::{sync::Arc, time::Duration};

use tansu_common::{DEFAULT_DIRTY_BYTES_LIMIT, DEFAULT_MAX_FILE_BYTES};
use tansu_meta::{MdCache, MdServer};
use tansu_storage::{
    block_cache::BlockCache,
    crypto::Crypto,
    dirty_cache::DirtyBlockCache,
    retrieval::BlockRetrievalQueue,
    server::BlockOps,
    splitter::BlockSplitter,
};
use tansu_types::UserId;
use tansu_utils::clock::Clock;

use crate::node::NodeCache;

/// Everything a folder's block machinery talks to, bundled into one
/// explicitly passed handle. There is no ambient global state; tests
/// assemble this from the in-memory implementations.
pub struct FolderConfig {
    pub dirty_bcache: Arc<DirtyBlockCache>,
    pub bcache: Arc<BlockCache>,
    pub block_ops: Arc<dyn BlockOps>,
    pub block_queue: Arc<BlockRetrievalQueue>,
    pub crypto: Arc<dyn Crypto>,
    pub splitter: Arc<dyn BlockSplitter>,
    pub clock: Arc<dyn Clock>,
    pub mdserver: Arc<dyn MdServer>,
    pub mdcache: Arc<MdCache>,
    pub node_cache: Arc<dyn NodeCache>,

    pub current_user: UserId,
    pub max_file_bytes: u64,
    /// Zero disables the reclamation loop.
    pub quota_reclamation_period: Duration,
    /// How long an unreferenced block must stay unreferenced before
    /// reclamation may delete it.
    pub quota_reclamation_min_unref_age: Duration,
}

impl FolderConfig {
    pub fn dirty_bytes_limit() -> i64 {
        DEFAULT_DIRTY_BYTES_LIMIT
    }

    pub fn default_max_file_bytes() -> u64 {
        DEFAULT_MAX_FILE_BYTES
    }
}
