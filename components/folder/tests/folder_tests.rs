//! End-to-end scenarios for the folder block machinery, driven against
//! the in-memory block and metadata servers.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, UNIX_EPOCH},
};

use async_trait::async_trait;
use tansu_folder::{
    config::FolderConfig,
    node::{Node, NodeCache, SimpleNodeCache},
    sync::do_block_puts,
    Error, FolderBlockManager, FolderBlockOps, OverallBlockState,
};
use tansu_meta::{
    ops::{GcOp, Op, SyncOp},
    MdCache, MdServer, MemoryMdServer, RootMetadata,
};
use tansu_storage::{
    block_cache::BlockCache,
    crypto::{Crypto, StdCrypto},
    dirty_cache::DirtyBlockCache,
    retrieval::{spawn_workers, BlockRetrievalQueue},
    server::{BlockOps, BlockServer, PutFailure, ReadyBlockData},
    splitter::FixedBlockSplitter,
};
use tansu_types::{
    block::{
        Block, BlockId, BlockInfo, BlockPointer, DirBlock, FileBlock, RefNonce, ZERO_REF_NONCE,
    },
    entry::{DirEntry, EntryType},
    path::{FolderBranch, Path},
    KeyMeta, MetadataRevision, UserId, MASTER_BRANCH,
};
use tansu_utils::clock::{unix_nanos, Clock, ManualClock};
use tokio::{
    sync::{mpsc, Notify, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

struct TestEnv {
    ops: Arc<FolderBlockOps>,
    config: Arc<FolderConfig>,
    server: Arc<BlockServer>,
    mdserver: Arc<MemoryMdServer>,
    clock: Arc<ManualClock>,
    folder: FolderBranch,
    node_cache: Arc<SimpleNodeCache>,
    /// Initial path of "f" under the root, as of revision 1.
    file_path: Path,
    /// Initial path of "g" under the root.
    other_path: Path,
    token: CancellationToken,
    _workers: Vec<JoinHandle<()>>,
    _force_rx: mpsc::Receiver<()>,
}

impl TestEnv {
    async fn head(&self) -> Arc<RootMetadata> {
        self.mdserver
            .get_for_tlf(self.folder.tlf)
            .await
            .unwrap()
            .expect("folder has a head")
    }

    fn node_for(&self, path: &Path) -> Arc<Node> {
        let mut node: Option<Arc<Node>> = None;
        for pn in &path.nodes {
            node = Some(self.node_cache.get_or_create(pn.ptr, &pn.name, node));
        }
        node.expect("path is non-empty")
    }

    async fn read_all(&self, path: &Path, len: usize, off: u64) -> Vec<u8> {
        let head = self.head().await;
        let mut buf = vec![0u8; len];
        let n = self
            .ops
            .read(&head, path, &mut buf, off, None)
            .await
            .unwrap();
        buf.truncate(n as usize);
        buf
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn put_new_block(
    block_ops: &dyn BlockOps,
    kmd: &KeyMeta,
    user: UserId,
    block: &Block,
    nonce: u8,
) -> (BlockPointer, ReadyBlockData) {
    let (id, _plain, ready) = block_ops.ready(kmd, block).await.unwrap();
    let ptr = BlockPointer {
        id,
        key_gen: 1,
        data_ver: 1,
        creator: user,
        ref_nonce: if nonce == 0 {
            ZERO_REF_NONCE
        } else {
            RefNonce([nonce, 0, 0, 0, 0, 0, 0, 0])
        },
    };
    block_ops.put(kmd, ptr, &ready).await.unwrap();
    (ptr, ready)
}

async fn setup_with(
    dirty_limit: i64,
    block_size: usize,
    wrap: impl FnOnce(Arc<BlockServer>) -> Arc<dyn BlockOps>,
) -> TestEnv {
    let crypto = Arc::new(StdCrypto);
    let tlf = crypto.make_random_tlf_id();
    let folder = FolderBranch {
        tlf,
        branch: MASTER_BRANCH,
    };
    let user = UserId(1);

    let server = BlockServer::new_in_memory();
    let block_ops = wrap(server.clone());
    let queue = BlockRetrievalQueue::new(2);
    let token = CancellationToken::new();
    let workers = spawn_workers(&queue, block_ops.clone(), 2, &token);

    let mdserver = MemoryMdServer::new();
    let mdcache = MdCache::new(1000);
    let clock = Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_000_000)));
    let node_cache = SimpleNodeCache::new(folder);

    let config = Arc::new(FolderConfig {
        dirty_bcache: DirtyBlockCache::new(dirty_limit),
        bcache: BlockCache::new(64 << 20),
        block_ops: block_ops.clone(),
        block_queue: queue,
        crypto: crypto.clone(),
        splitter: Arc::new(FixedBlockSplitter::new(block_size)),
        clock: clock.clone(),
        mdserver: mdserver.clone(),
        mdcache,
        node_cache: node_cache.clone(),
        current_user: user,
        max_file_bytes: 1 << 40,
        quota_reclamation_period: Duration::ZERO,
        quota_reclamation_min_unref_age: Duration::from_secs(3600),
    });

    let (force_tx, force_rx) = mpsc::channel(1);
    let ops = Arc::new(FolderBlockOps::new(config.clone(), folder, force_tx));

    // Seed the folder: two empty files under the root.
    let kmd = KeyMeta { tlf, key_gen: 1 };
    let now = unix_nanos(clock.now());
    let empty = Block::File(FileBlock::new_direct());
    let (f_ptr, f_ready) = put_new_block(&*block_ops, &kmd, user, &empty, 0).await;
    let (g_ptr, _g_ready) = put_new_block(&*block_ops, &kmd, user, &empty, 2).await;

    let entry = |ptr: BlockPointer, ready: &ReadyBlockData| DirEntry {
        info: BlockInfo {
            ptr,
            encoded_size: ready.encoded_size() as u32,
        },
        entry_type: EntryType::File,
        size: 0,
        mtime: now,
        ctime: now,
        sym_path: String::new(),
    };
    let mut children = HashMap::new();
    children.insert("f".to_string(), entry(f_ptr, &f_ready));
    children.insert("g".to_string(), entry(g_ptr, &f_ready));
    let root_block = Block::Dir(DirBlock { children });
    let (root_ptr, root_ready) = put_new_block(&*block_ops, &kmd, user, &root_block, 0).await;

    let mut md = RootMetadata::new(tlf, vec![user]);
    md.revision = MetadataRevision::INITIAL;
    md.root = DirEntry {
        info: BlockInfo {
            ptr: root_ptr,
            encoded_size: root_ready.encoded_size() as u32,
        },
        entry_type: EntryType::Dir,
        size: 0,
        mtime: now,
        ctime: now,
        sym_path: String::new(),
    };
    mdserver.put(md).await.unwrap();

    let root_path = Path {
        folder,
        nodes: vec![],
    }
    .child_path("tlf", root_ptr);
    let file_path = root_path.child_path("f", f_ptr);
    let other_path = root_path.child_path("g", g_ptr);

    TestEnv {
        ops,
        config,
        server,
        mdserver,
        clock,
        folder,
        node_cache,
        file_path,
        other_path,
        token,
        _workers: workers,
        _force_rx: force_rx,
    }
}

async fn setup(dirty_limit: i64, block_size: usize) -> TestEnv {
    setup_with(dirty_limit, block_size, |server| server).await
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_sync_read_round_trip() {
    let env = setup(256 << 20, 4096).await;
    let head = env.head().await;
    let node = env.node_for(&env.file_path);

    let data = patterned(10_000, 7);
    env.ops.write(&head, &node, &data, 0).await.unwrap();
    assert!(env.ops.is_dirty(&env.file_path).await);
    assert_eq!(env.ops.get_state().await, OverallBlockState::Dirty);

    // Unsynced reads come straight from the dirty blocks.
    assert_eq!(env.read_all(&env.file_path, 10_000, 0).await, data);

    let mut md = head.successor();
    let (still_dirty, new_path) = env
        .ops
        .sync(&mut md, &env.file_path, None)
        .await
        .unwrap();
    assert!(!still_dirty);

    // Post-sync: nothing dirty, the budget fully settled, and the new
    // path serves the same bytes from clean blocks.
    assert!(!env.ops.is_dirty(&new_path).await);
    assert_eq!(env.ops.get_state().await, OverallBlockState::Clean);
    assert!(env.ops.get_dirty_refs().await.is_empty());
    assert_eq!(env.config.dirty_bcache.unsynced_bytes(), 0);
    assert_eq!(env.config.dirty_bcache.total_bytes(), 0);
    assert_eq!(env.read_all(&new_path, 10_000, 0).await, data);

    // Partial reads line up with the original buffer.
    assert_eq!(env.read_all(&new_path, 100, 4090).await, &data[4090..4190]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hole_fill_read_after_truncate_extend() {
    let env = setup(256 << 20, 4096).await;
    let head = env.head().await;
    let node = env.node_for(&env.file_path);

    env.ops.write(&head, &node, b"A", 0).await.unwrap();
    // Far past the cutoff: the zero region must not be materialised.
    env.ops.truncate(&head, &node, 256 << 10).await.unwrap();

    let de = env
        .ops
        .get_dirty_entry(&head, &env.file_path)
        .await
        .unwrap();
    assert_eq!(de.size, 256 << 10);

    let got = env.read_all(&env.file_path, 16, 100).await;
    assert_eq!(got, vec![0u8; 16]);

    // Offset 0 still reads the written byte.
    let got = env.read_all(&env.file_path, 1, 0).await;
    assert_eq!(got, b"A");

    // The tail of the hole reads zeroes as well.
    let got = env.read_all(&env.file_path, 16, (256 << 10) - 16).await;
    assert_eq!(got, vec![0u8; 16]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_truncate_extend_zero_fills() {
    let env = setup(256 << 20, 128 << 10).await;
    let head = env.head().await;
    let node = env.node_for(&env.file_path);

    env.ops.write(&head, &node, b"A", 0).await.unwrap();
    // Below the cutoff: zeroes are written out for real.
    env.ops.truncate(&head, &node, 65_664).await.unwrap();

    let got = env.read_all(&env.file_path, 16, 100).await;
    assert_eq!(got, vec![0u8; 16]);
    let de = env
        .ops
        .get_dirty_entry(&head, &env.file_path)
        .await
        .unwrap();
    assert_eq!(de.size, 65_664);
}

/// Block-ops wrapper that parks every put behind a semaphore once the
/// gate closes, so a test can hold a sync in its upload phase.
struct GateState {
    gated: AtomicBool,
    entered: Notify,
    release: Semaphore,
}

struct GatedBlockOps {
    inner: Arc<BlockServer>,
    state: Arc<GateState>,
}

#[async_trait]
impl BlockOps for GatedBlockOps {
    async fn get(&self, kmd: &KeyMeta, ptr: BlockPointer) -> tansu_storage::Result<Block> {
        self.inner.get(kmd, ptr).await
    }

    async fn ready(
        &self,
        kmd: &KeyMeta,
        block: &Block,
    ) -> tansu_storage::Result<(BlockId, usize, ReadyBlockData)> {
        self.inner.ready(kmd, block).await
    }

    async fn put(
        &self,
        kmd: &KeyMeta,
        ptr: BlockPointer,
        data: &ReadyBlockData,
    ) -> tansu_storage::Result<()> {
        if self.state.gated.load(Ordering::SeqCst) {
            self.state.entered.notify_one();
            let permit = self.state.release.acquire().await.expect("gate closed");
            permit.forget();
        }
        self.inner.put(kmd, ptr, data).await
    }

    async fn archive(&self, kmd: &KeyMeta, ptrs: &[BlockPointer]) -> tansu_storage::Result<()> {
        self.inner.archive(kmd, ptrs).await
    }

    async fn delete(
        &self,
        kmd: &KeyMeta,
        ptrs: &[BlockPointer],
    ) -> tansu_storage::Result<HashMap<BlockId, usize>> {
        self.inner.delete(kmd, ptrs).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_during_sync_defers_and_replays() {
    tansu_utils::logger::install_fmt_log();
    let gate = Arc::new(GateState {
        gated: AtomicBool::new(false),
        entered: Notify::new(),
        release: Semaphore::new(0),
    });
    let gate_for_setup = gate.clone();
    let env = setup_with(256 << 20, 4096, move |server| {
        Arc::new(GatedBlockOps {
            inner: server,
            state: gate_for_setup,
        })
    })
    .await;

    let head = env.head().await;
    let node = env.node_for(&env.file_path);
    let first = patterned(4096, 1);
    let second = patterned(4096, 2);

    env.ops.write(&head, &node, &first, 0).await.unwrap();

    // Park the sync in its upload phase.
    gate.gated.store(true, Ordering::SeqCst);
    let sync_ops = env.ops.clone();
    let sync_path = env.file_path.clone();
    let sync_head = head.clone();
    let sync_task = tokio::spawn(async move {
        let mut md = sync_head.successor();
        sync_ops.sync(&mut md, &sync_path, None).await
    });
    gate.entered.notified().await;

    // This write lands while the file is mid-sync: it must defer.
    env.ops.write(&head, &node, &second, 4096).await.unwrap();
    assert_eq!(env.ops.deferred_write_count().await, 1);
    assert!(env.ops.deferred_delete_count().await >= 1);

    // Release the uploads and let the sync finish and replay.
    gate.gated.store(false, Ordering::SeqCst);
    gate.release.add_permits(1024);
    let (still_dirty, new_path) = sync_task.await.unwrap().unwrap();
    assert!(still_dirty);

    // Both writes are visible, in order, through the new path.
    let got = env.read_all(&new_path, 8192, 0).await;
    assert_eq!(&got[..4096], &first[..]);
    assert_eq!(&got[4096..], &second[..]);

    // A second sync flushes the replayed write; everything settles.
    let mut md = env.head().await.successor();
    let (still_dirty, final_path) = env.ops.sync(&mut md, &new_path, None).await.unwrap();
    assert!(!still_dirty);
    let got = env.read_all(&final_path, 8192, 0).await;
    assert_eq!(&got[..4096], &first[..]);
    assert_eq!(&got[4096..], &second[..]);
    assert_eq!(env.config.dirty_bcache.unsynced_bytes(), 0);
    assert_eq!(env.config.dirty_bcache.total_bytes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recoverable_sync_error_rolls_back_and_retries() {
    let env = setup(256 << 20, 4096).await;
    let head = env.head().await;
    let node = env.node_for(&env.file_path);

    // Three full leaves.
    let data = patterned(12_288, 5);
    env.ops.write(&head, &node, &data, 0).await.unwrap();
    let top_before = env
        .config
        .dirty_bcache
        .get(env.file_path.tail_pointer(), MASTER_BRANCH)
        .unwrap();
    let unsynced_before = env.config.dirty_bcache.unsynced_bytes();

    // Drive phase 1 by hand and fail one leaf's upload recoverably.
    let mut md = head.successor();
    let (_fblock, bps, _lbc, sync_state) =
        env.ops.start_sync(&mut md, &env.file_path).await.unwrap();
    assert_eq!(bps.block_states.len(), 3);
    let victim = bps.block_states[1].block_ptr;
    env.server.fail_next_put(victim, PutFailure::Temporary);

    let (failed, err) = do_block_puts(
        &*env.config.block_ops,
        &md.key_meta(),
        &bps.block_states,
    )
    .await
    .unwrap_err();
    assert_eq!(failed, vec![victim]);
    let err = Error::from(err);
    assert!(err.is_recoverable());

    env.ops
        .cleanup_sync_state(&env.file_path, &failed, Some(&sync_state), &err)
        .await;

    // The top block reverted to its pre-sync shape, and every leaf is
    // plain dirty again: a fresh write must not defer.
    let top_after = env
        .config
        .dirty_bcache
        .get(env.file_path.tail_pointer(), MASTER_BRANCH)
        .unwrap();
    assert_eq!(*top_before, *top_after);
    assert_eq!(env.config.dirty_bcache.unsynced_bytes(), unsynced_before);
    env.ops.write(&head, &node, b"zz", 100).await.unwrap();
    assert_eq!(env.ops.deferred_write_count().await, 0);

    // The retry syncs everything with no data loss.
    let mut expected = data.clone();
    expected[100..102].copy_from_slice(b"zz");
    let mut md = env.head().await.successor();
    let (still_dirty, new_path) = env
        .ops
        .sync(&mut md, &env.file_path, None)
        .await
        .unwrap();
    assert!(!still_dirty);
    assert_eq!(env.read_all(&new_path, 12_288, 0).await, expected);
    assert_eq!(env.config.dirty_bcache.unsynced_bytes(), 0);
    assert_eq!(env.config.dirty_bcache.total_bytes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_sync_retries_transient_put_failures() {
    let env = setup(256 << 20, 4096).await;
    let head = env.head().await;
    let node = env.node_for(&env.file_path);

    let data = patterned(8192, 9);
    env.ops.write(&head, &node, &data, 0).await.unwrap();

    // Whichever put goes out first fails once; the retry loop inside
    // sync() must absorb it.
    env.server.fail_next_puts(1, PutFailure::Temporary);
    let mut md = head.successor();
    let (still_dirty, new_path) = env.ops.sync(&mut md, &env.file_path, None).await.unwrap();
    assert!(!still_dirty);
    assert_eq!(env.read_all(&new_path, 8192, 0).await, data);
    assert_eq!(env.config.dirty_bcache.unsynced_bytes(), 0);
    assert_eq!(env.config.dirty_bcache.total_bytes(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_shrink_is_idempotent() {
    let env = setup(256 << 20, 4096).await;
    let head = env.head().await;
    let node = env.node_for(&env.file_path);

    let data = patterned(10_240, 3);
    env.ops.write(&head, &node, &data, 0).await.unwrap();

    env.ops.truncate(&head, &node, 5000).await.unwrap();
    let top_once = env
        .config
        .dirty_bcache
        .get(env.file_path.tail_pointer(), MASTER_BRANCH)
        .unwrap();
    let de_once = env
        .ops
        .get_dirty_entry(&head, &env.file_path)
        .await
        .unwrap();

    env.ops.truncate(&head, &node, 5000).await.unwrap();
    let top_twice = env
        .config
        .dirty_bcache
        .get(env.file_path.tail_pointer(), MASTER_BRANCH)
        .unwrap();
    let de_twice = env
        .ops
        .get_dirty_entry(&head, &env.file_path)
        .await
        .unwrap();

    assert_eq!(*top_once, *top_twice);
    assert_eq!(de_once.size, 5000);
    assert_eq!(de_twice.size, 5000);

    assert_eq!(env.read_all(&env.file_path, 5000, 0).await, &data[..5000]);
    // Reads past the new end stop at it.
    assert_eq!(env.read_all(&env.file_path, 1000, 5000).await, Vec::<u8>::new());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_control_blocks_until_sync_drains() {
    let env = setup(8 << 10, 16 << 10).await;
    let head = env.head().await;
    let f_node = env.node_for(&env.file_path);
    let g_node = env.node_for(&env.other_path);

    let first = patterned(5 << 10, 11);
    let second = patterned(5 << 10, 13);

    env.ops.write(&head, &f_node, &first, 0).await.unwrap();

    // The second file's write does not fit in the budget.
    let blocked_ops = env.ops.clone();
    let blocked_head = head.clone();
    let blocked_data = second.clone();
    let mut blocked = tokio::spawn(async move {
        blocked_ops
            .write(&blocked_head, &g_node, &blocked_data, 0)
            .await
    });
    let wait = tokio::time::timeout(Duration::from_millis(200), &mut blocked).await;
    assert!(wait.is_err(), "second write should be stuck on admission");

    // Syncing the first file drains unsynced bytes and unblocks it.
    let mut md = head.successor();
    env.ops.sync(&mut md, &env.file_path, None).await.unwrap();
    blocked
        .await
        .expect("blocked writer finished")
        .expect("blocked write succeeded");

    assert_eq!(env.read_all(&env.other_path, 5 << 10, 0).await, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quota_reclamation_respects_pointer_threshold() {
    tansu_utils::logger::install_fmt_log();
    let env = setup(256 << 20, 4096).await;
    let old_mtime = unix_nanos(UNIX_EPOCH + Duration::from_secs(1000));
    let crypto = StdCrypto;

    // A prior gc op marks revision 1 as already scrubbed.
    let mut md = env.head().await.successor();
    md.root.mtime = old_mtime;
    md.add_op(Op::Gc(GcOp::new(MetadataRevision(1))));
    env.mdserver.put(md).await.unwrap();

    // One hundred old revisions, each unreferencing two blocks.
    for _ in 0..100 {
        let mut md = env.head().await.successor();
        md.root.mtime = old_mtime;
        let mut op = SyncOp::new(BlockPointer::default());
        op.common.unrefs.push(BlockPointer {
            id: crypto.make_temporary_block_id(),
            ..Default::default()
        });
        op.common.unrefs.push(BlockPointer {
            id: crypto.make_temporary_block_id(),
            ..Default::default()
        });
        md.add_op(Op::Sync(op));
        env.mdserver.put(md).await.unwrap();
    }
    assert_eq!(env.head().await.revision, MetadataRevision(102));

    // Everything is well past the minimum unref age.
    env.clock.set(UNIX_EPOCH + Duration::from_secs(10_000_000));

    let fbm = FolderBlockManager::new(env.config.clone(), env.folder);

    // First run: capped at 100 revisions, then shortened further by the
    // pointer threshold, so it reports incomplete.
    fbm.force_quota_reclamation();
    fbm.wait_for_quota_reclamations().await;
    let head = env.head().await;
    assert_eq!(head.revision, MetadataRevision(103));
    let Op::Gc(gco) = &head.ops[0] else {
        panic!("expected a gc op, got {:?}", head.ops[0]);
    };
    assert_eq!(gco.latest_rev, MetadataRevision(53));
    assert!(gco.common.unrefs.len() >= 100);

    // Second run finishes the tail.
    fbm.force_quota_reclamation();
    fbm.wait_for_quota_reclamations().await;
    let head = env.head().await;
    assert_eq!(head.revision, MetadataRevision(104));
    let Op::Gc(gco) = &head.ops[0] else {
        panic!("expected a gc op, got {:?}", head.ops[0]);
    };
    assert_eq!(gco.latest_rev, MetadataRevision(103));
    assert_eq!(gco.common.unrefs.len(), 98);

    // Third run finds only the trailing gc op: no new revision.
    fbm.force_quota_reclamation();
    fbm.wait_for_quota_reclamations().await;
    assert_eq!(env.head().await.revision, MetadataRevision(104));

    // And once memoised, another run is a no-op too.
    fbm.force_quota_reclamation();
    fbm.wait_for_quota_reclamations().await;
    assert_eq!(env.head().await.revision, MetadataRevision(104));

    fbm.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn archive_loop_downgrades_committed_unrefs() {
    let env = setup(256 << 20, 4096).await;
    let head = env.head().await;
    let node = env.node_for(&env.file_path);
    let fbm = FolderBlockManager::new(env.config.clone(), env.folder);

    // The initial (clean) version of "f" becomes unreferenced by the
    // sync and must end up archived.
    let old_f_ptr = env.file_path.tail_pointer();

    let data = patterned(4096, 21);
    env.ops.write(&head, &node, &data, 0).await.unwrap();
    let mut md = head.successor();
    env.ops
        .sync(&mut md, &env.file_path, Some(&*fbm))
        .await
        .unwrap();
    fbm.wait_for_archives().await;

    assert!(env.server.is_archived(old_f_ptr));
    fbm.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_prep_returns_copies_and_local_cache() {
    let env = setup(256 << 20, 4096).await;
    let head = env.head().await;
    let root_path = env.file_path.parent_path();

    let mut md = (*head).clone();
    let (old_pblock, new_pblock, moved, lbc) = env
        .ops
        .prep_rename(&mut md, &root_path, "f", &root_path, "renamed")
        .await
        .unwrap();

    // Same parent: one block, no grandparent times to bump.
    assert_eq!(old_pblock, new_pblock);
    assert!(lbc.is_empty());
    assert_eq!(moved.ptr(), env.file_path.tail_pointer());
    assert!(matches!(md.ops.last(), Some(Op::Rename(_))));

    // Renaming a missing entry fails cleanly.
    let err = env
        .ops
        .prep_rename(&mut md, &root_path, "missing", &root_path, "x")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoSuchName { .. }));
}
