use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use tansu_types::{
    block::{Block, BlockPointer},
    KeyMeta,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    err::{Error, QueueShutdownSnafu, Result},
    server::BlockOps,
};

/// What a waiting requester finally receives. The error is shared
/// because one fetch may answer many coalesced requests.
pub type BlockResult = std::result::Result<Block, Arc<Error>>;

/// One consumer's request for a block.
struct BlockRetrievalRequest {
    tx: oneshot::Sender<BlockResult>,
}

/// The shared fetch for one block pointer. May represent many
/// requests, all answered at once.
pub struct BlockRetrieval {
    pub block_ptr: BlockPointer,
    pub kmd: KeyMeta,
    requests: Vec<BlockRetrievalRequest>,
    priority: i32,
    insertion_order: u64,
    /// Cleared once a worker takes the retrieval; late requests then
    /// just append and are answered by that worker.
    in_queue: bool,
}

pub type RetrievalRef = Arc<Mutex<BlockRetrieval>>;

#[derive(Default)]
struct Inner {
    /// Queued or in-progress retrievals, by pointer.
    ptrs: HashMap<BlockPointer, RetrievalRef>,
    /// Max priority first, FIFO within a priority.
    queue: BTreeMap<(std::cmp::Reverse<i32>, u64), RetrievalRef>,
    insertion_count: u64,
}

type WorkerSlot = oneshot::Sender<RetrievalRef>;

/// Coalescing, prioritised queue between block consumers and the fetch
/// workers. Requests for the same pointer share one fetch; a retrieval
/// only leaves the queue once a worker is actually ready for it, so a
/// higher-priority request can still bump it until the last moment.
pub struct BlockRetrievalQueue {
    inner: Mutex<Inner>,
    worker_tx: mpsc::Sender<WorkerSlot>,
    worker_rx: tokio::sync::Mutex<mpsc::Receiver<WorkerSlot>>,
}

impl BlockRetrievalQueue {
    pub fn new(num_workers: usize) -> Arc<Self> {
        let (worker_tx, worker_rx) = mpsc::channel(num_workers.max(1));
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            worker_tx,
            worker_rx: tokio::sync::Mutex::new(worker_rx),
        })
    }

    /// Submit a request. If a retrieval for this pointer already
    /// exists, the request is appended to it, raising its priority if
    /// needed; otherwise a new retrieval enters the queue.
    pub fn request(
        self: &Arc<Self>,
        priority: i32,
        kmd: KeyMeta,
        ptr: BlockPointer,
    ) -> oneshot::Receiver<BlockResult> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.ptrs.get(&ptr).cloned() {
            let mut r = r.lock().unwrap();
            r.requests.push(BlockRetrievalRequest { tx });
            if r.in_queue && priority > r.priority {
                let old_key = (std::cmp::Reverse(r.priority), r.insertion_order);
                r.priority = priority;
                let new_key = (std::cmp::Reverse(priority), r.insertion_order);
                drop(r);
                let moved = inner.queue.remove(&old_key).expect("queued retrieval has a key");
                inner.queue.insert(new_key, moved);
            }
            return rx;
        }

        let insertion_order = inner.insertion_count;
        inner.insertion_count += 1;
        let r = Arc::new(Mutex::new(BlockRetrieval {
            block_ptr: ptr,
            kmd,
            requests: vec![BlockRetrievalRequest { tx }],
            priority,
            insertion_order,
            in_queue: true,
        }));
        inner.ptrs.insert(ptr, r.clone());
        inner
            .queue
            .insert((std::cmp::Reverse(priority), insertion_order), r);
        drop(inner);
        self.notify_worker();
        rx
    }

    /// Hand the next retrieval to the next ready worker. Spawned so the
    /// requester never blocks on worker availability.
    fn notify_worker(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let slot = {
                let mut rx = this.worker_rx.lock().await;
                rx.recv().await
            };
            let Some(slot) = slot else { return };
            let retrieval = {
                let mut inner = this.inner.lock().unwrap();
                match inner.queue.pop_first() {
                    Some((_, r)) => {
                        r.lock().unwrap().in_queue = false;
                        r
                    }
                    None => return,
                }
            };
            // A worker that gave up (shutdown) just loses the slot; the
            // retrieval stays findable through the pointer index.
            let _ = slot.send(retrieval);
        });
    }

    /// Park this worker until a retrieval is dispatched to it.
    pub async fn work_on_request(&self) -> Result<RetrievalRef> {
        let (tx, rx) = oneshot::channel();
        self.worker_tx
            .send(tx)
            .await
            .ok()
            .ok_or_else(|| QueueShutdownSnafu.build())?;
        rx.await.ok().ok_or_else(|| QueueShutdownSnafu.build())
    }

    /// Stop routing new requests for this pointer to the current
    /// worker. Must be called before the worker answers the requests it
    /// already holds.
    pub fn finalize_request(&self, ptr: BlockPointer) {
        let mut inner = self.inner.lock().unwrap();
        inner.ptrs.remove(&ptr);
    }

    #[cfg(test)]
    fn queued_priority(&self, ptr: BlockPointer) -> Option<i32> {
        let inner = self.inner.lock().unwrap();
        inner.ptrs.get(&ptr).map(|r| r.lock().unwrap().priority)
    }
}

/// Drains one retrieval's requests with the shared fetch outcome.
fn deliver(r: &RetrievalRef, result: std::result::Result<Block, Error>) {
    let requests = {
        let mut r = r.lock().unwrap();
        std::mem::take(&mut r.requests)
    };
    match result {
        Ok(block) => {
            for req in requests {
                // Abandoned requesters are fine; their receiver is gone.
                let _ = req.tx.send(Ok(block.clone()));
            }
        }
        Err(e) => {
            let shared = Arc::new(e);
            for req in requests {
                let _ = req.tx.send(Err(shared.clone()));
            }
        }
    }
}

/// One fetch worker. A pool of these drains the queue; each parks in
/// `work_on_request` and never holds the queue lock while fetching.
pub struct BlockRetrievalWorker {
    queue: Arc<BlockRetrievalQueue>,
    block_ops: Arc<dyn BlockOps>,
    token: CancellationToken,
}

impl BlockRetrievalWorker {
    pub fn spawn(
        queue: Arc<BlockRetrievalQueue>,
        block_ops: Arc<dyn BlockOps>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let worker = Self {
            queue,
            block_ops,
            token,
        };
        tokio::spawn(worker.run())
    }

    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("block retrieval worker cancelled");
                    return;
                }
                got = self.queue.work_on_request() => {
                    match got {
                        Ok(retrieval) => self.process(retrieval).await,
                        Err(_) => return,
                    }
                }
            }
        }
    }

    async fn process(&self, retrieval: RetrievalRef) {
        let (ptr, kmd) = {
            let r = retrieval.lock().unwrap();
            (r.block_ptr, r.kmd)
        };
        let result = self.block_ops.get(&kmd, ptr).await;
        // Later requesters for this pointer start a fresh retrieval;
        // everyone already attached gets this result.
        self.queue.finalize_request(ptr);
        deliver(&retrieval, result);
    }
}

pub fn spawn_workers(
    queue: &Arc<BlockRetrievalQueue>,
    block_ops: Arc<dyn BlockOps>,
    num_workers: usize,
    token: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..num_workers)
        .map(|_| BlockRetrievalWorker::spawn(queue.clone(), block_ops.clone(), token.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tansu_types::block::{BlockId, FileBlock};

    use super::*;
    use crate::{
        err::ServerTemporarySnafu,
        server::{BlockOps, ReadyBlockData},
    };

    fn ptr(b: u8) -> BlockPointer {
        let mut id = [0u8; 32];
        id[0] = b;
        BlockPointer {
            id: BlockId(id),
            ..Default::default()
        }
    }

    /// Serves every pointer with a one-byte block and counts fetches.
    struct CountingServer {
        fetches: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BlockOps for CountingServer {
        async fn get(&self, _kmd: &KeyMeta, ptr: BlockPointer) -> Result<Block> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return ServerTemporarySnafu { message: "throttled" }.fail();
            }
            Ok(Block::File(FileBlock {
                is_indirect: false,
                contents: vec![ptr.id.0[0]],
                iptrs: vec![],
            }))
        }

        async fn ready(
            &self,
            _kmd: &KeyMeta,
            _block: &Block,
        ) -> Result<(BlockId, usize, ReadyBlockData)> {
            unimplemented!("not used by retrieval tests")
        }

        async fn put(
            &self,
            _kmd: &KeyMeta,
            _ptr: BlockPointer,
            _data: &ReadyBlockData,
        ) -> Result<()> {
            unimplemented!("not used by retrieval tests")
        }

        async fn archive(&self, _kmd: &KeyMeta, _ptrs: &[BlockPointer]) -> Result<()> {
            unimplemented!("not used by retrieval tests")
        }

        async fn delete(
            &self,
            _kmd: &KeyMeta,
            _ptrs: &[BlockPointer],
        ) -> Result<HashMap<BlockId, usize>> {
            unimplemented!("not used by retrieval tests")
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requests_coalesce_into_one_fetch() {
        let queue = BlockRetrievalQueue::new(2);
        let server = Arc::new(CountingServer {
            fetches: AtomicUsize::new(0),
            fail: false,
        });

        // Queue everything before any worker exists, so the eleventh,
        // higher-priority request must still find the retrieval queued.
        let p = ptr(7);
        let mut receivers = Vec::new();
        for _ in 0..10 {
            receivers.push(queue.request(1, KeyMeta::default(), p));
        }
        receivers.push(queue.request(5, KeyMeta::default(), p));
        assert_eq!(queue.queued_priority(p), Some(5));

        let token = CancellationToken::new();
        let _workers = spawn_workers(&queue, server.clone(), 2, &token);
        for rx in receivers {
            let block = rx.await.unwrap().unwrap();
            assert_eq!(block.as_file().unwrap().contents, vec![7]);
        }
        assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
        token.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn errors_reach_every_requester() {
        let queue = BlockRetrievalQueue::new(1);
        let server = Arc::new(CountingServer {
            fetches: AtomicUsize::new(0),
            fail: true,
        });
        let token = CancellationToken::new();
        let _workers = spawn_workers(&queue, server, 1, &token);

        let p = ptr(3);
        let a = queue.request(1, KeyMeta::default(), p);
        let b = queue.request(1, KeyMeta::default(), p);
        let ea = a.await.unwrap().unwrap_err();
        let eb = b.await.unwrap().unwrap_err();
        assert!(ea.is_recoverable());
        assert!(Arc::ptr_eq(&ea, &eb) || eb.is_recoverable());
        token.cancel();
    }

    #[tokio::test]
    async fn workers_observe_priority_then_fifo_order() {
        // No workers running: everything queues first.
        let queue = BlockRetrievalQueue::new(4);
        let _rx1 = queue.request(1, KeyMeta::default(), ptr(1));
        let _rx2 = queue.request(5, KeyMeta::default(), ptr(2));
        let _rx3 = queue.request(5, KeyMeta::default(), ptr(3));
        let _rx4 = queue.request(2, KeyMeta::default(), ptr(4));

        let mut order = Vec::new();
        for _ in 0..4 {
            let r = queue.work_on_request().await.unwrap();
            let got = r.lock().unwrap().block_ptr;
            queue.finalize_request(got);
            order.push(got.id.0[0]);
        }
        // Lexicographic on (-priority, insertion order).
        assert_eq!(order, vec![2, 3, 4, 1]);
    }

    #[tokio::test]
    async fn reprioritisation_bumps_a_queued_retrieval() {
        let queue = BlockRetrievalQueue::new(4);
        let _rx1 = queue.request(1, KeyMeta::default(), ptr(1));
        let _rx2 = queue.request(3, KeyMeta::default(), ptr(2));
        assert_eq!(queue.queued_priority(ptr(1)), Some(1));

        let _rx3 = queue.request(9, KeyMeta::default(), ptr(1));
        assert_eq!(queue.queued_priority(ptr(1)), Some(9));

        let first = queue.work_on_request().await.unwrap();
        let got = {
            let r = first.lock().unwrap();
            assert_eq!(r.priority, 9);
            r.block_ptr
        };
        assert_eq!(got, ptr(1));
    }

    #[tokio::test]
    async fn lower_priority_does_not_demote() {
        let queue = BlockRetrievalQueue::new(4);
        let _rx1 = queue.request(5, KeyMeta::default(), ptr(1));
        let _rx2 = queue.request(1, KeyMeta::default(), ptr(1));
        assert_eq!(queue.queued_priority(ptr(1)), Some(5));
    }
}
