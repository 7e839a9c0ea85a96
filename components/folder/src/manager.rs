use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use futures::StreamExt;
use tansu_common::{
    BACKGROUND_TASK_TIMEOUT, MAX_MDS_AT_A_TIME, MAX_PARALLEL_BLOCK_PUTS,
    NUM_MAX_REVISIONS_PER_QR, NUM_POINTERS_PER_GC_THRESHOLD, NUM_POINTERS_TO_DOWNGRADE_PER_CHUNK,
};
use tansu_meta::{get_md_range, ops::GcOp, ops::Op, RootMetadata};
use tansu_types::{
    block::{BlockId, BlockPointer},
    path::FolderBranch,
    MetadataRevision, TlfId,
};
use tansu_utils::clock::from_unix_nanos;
use tokio::{
    sync::{mpsc, oneshot, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::FolderConfig,
    err::{Error, Result, TruncateLockHeldSnafu, UnmergedHeadSnafu, WriteAccessSnafu},
    sync::BlockState,
};

/// Counts outstanding background passes so tests and shutdown can wait
/// for them.
#[derive(Default)]
struct PendingWork {
    count: Mutex<i64>,
    zero: Notify,
}

impl PendingWork {
    fn add(&self, n: i64) {
        *self.count.lock().unwrap() += n;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count <= 0 {
            self.zero.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.zero.notified();
            if *self.count.lock().unwrap() <= 0 {
                return;
            }
            notified.await;
        }
    }
}

enum ArchiveMsg {
    Archive(Arc<RootMetadata>),
    /// Pause until the carried channel resolves (send or drop).
    Pause(oneshot::Receiver<()>),
}

/// Blocks that may have reached the server as part of a metadata write
/// that then failed. They are deleted once the revision is known to be
/// invisible, or archived if it turned out to land after all.
struct BlocksToDelete {
    md: Arc<RootMetadata>,
    ptrs: Vec<BlockPointer>,
}

/// What the previous reclamation run saw, to skip no-op runs.
#[derive(Default)]
struct QrMemo {
    last_qr_head_rev: MetadataRevision,
    last_qr_old_enough_rev: MetadataRevision,
    was_last_qr_complete: bool,
}

/// Background block maintenance for one folder: archival of
/// unreferenced blocks, delayed delete of probably-failed puts, and
/// age-gated quota reclamation.
pub struct FolderBlockManager {
    config: Arc<FolderConfig>,
    folder: FolderBranch,
    shutdown: CancellationToken,

    archive_tx: mpsc::Sender<ArchiveMsg>,
    archive_group: Arc<PendingWork>,

    blocks_to_delete: Mutex<Vec<BlocksToDelete>>,

    force_reclamation_tx: mpsc::Sender<()>,
    reclamation_group: Arc<PendingWork>,

    last_reclamation_time: Mutex<Option<SystemTime>>,

    _tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Pointers a revision stopped referencing: its explicit unrefs plus
/// the old side of every update that actually changed pointers.
fn collect_unref_ptrs(md: &RootMetadata, skip_gc_ops: bool) -> Vec<BlockPointer> {
    let mut ptrs = Vec::new();
    for op in &md.ops {
        if skip_gc_ops && matches!(op, Op::Gc(_)) {
            continue;
        }
        ptrs.extend(op.unrefs().iter().copied());
        for update in op.all_updates() {
            // Conflict resolution can legally record an update between
            // identical pointers; those never get downgraded.
            if update.old != update.new {
                ptrs.push(update.old);
            }
        }
    }
    ptrs
}

impl FolderBlockManager {
    pub fn new(config: Arc<FolderConfig>, folder: FolderBranch) -> Arc<Self> {
        let (archive_tx, archive_rx) = mpsc::channel(25);
        let (force_reclamation_tx, force_rx) = mpsc::channel(1);
        let fbm = Arc::new(Self {
            config,
            folder,
            shutdown: CancellationToken::new(),
            archive_tx,
            archive_group: Arc::new(PendingWork::default()),
            blocks_to_delete: Mutex::new(Vec::new()),
            force_reclamation_tx,
            reclamation_group: Arc::new(PendingWork::default()),
            last_reclamation_time: Mutex::new(None),
            _tasks: Mutex::new(Vec::new()),
        });

        let archive_fbm = fbm.clone();
        let mut tasks = vec![tokio::spawn(async move {
            archive_fbm.archive_in_background(archive_rx).await
        })];
        if folder.branch.is_master() {
            let reclaim_fbm = fbm.clone();
            tasks.push(tokio::spawn(async move {
                reclaim_fbm.reclaim_quota_in_background(force_rx).await
            }));
        }
        *fbm._tasks.lock().unwrap() = tasks;
        fbm
    }

    fn tlf(&self) -> TlfId {
        self.folder.tlf
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Remember blocks put for `md` so they can be deleted if the
    /// revision never becomes visible. Called right after a failed
    /// upload batch.
    pub fn clean_up_block_state(&self, md: &RootMetadata, states: &[BlockState]) {
        debug!(revision = %md.revision, count = states.len(), "remembering blocks from a failed put");
        let mut pending = self.blocks_to_delete.lock().unwrap();
        pending.push(BlocksToDelete {
            md: Arc::new(md.clone()),
            ptrs: states.iter().map(|bs| bs.block_ptr).collect(),
        });
    }

    /// Queue a committed revision's unreferenced blocks for archival.
    /// Unmerged revisions are skipped: conflict resolution could still
    /// restore their references.
    pub async fn archive_unref_blocks(&self, md: &Arc<RootMetadata>) {
        if !md.merged {
            return;
        }
        self.archive_group.add(1);
        if self
            .archive_tx
            .send(ArchiveMsg::Archive(md.clone()))
            .await
            .is_err()
        {
            self.archive_group.done();
        }
    }

    /// Like `archive_unref_blocks` but never blocks on a full queue;
    /// used from inside the archive loop itself.
    pub fn archive_unref_blocks_no_wait(&self, md: Arc<RootMetadata>) {
        if !md.merged {
            return;
        }
        self.archive_group.add(1);
        if let Err(mpsc::error::TrySendError::Full(msg)) =
            self.archive_tx.try_send(ArchiveMsg::Archive(md))
        {
            let tx = self.archive_tx.clone();
            let group = self.archive_group.clone();
            tokio::spawn(async move {
                if tx.send(msg).await.is_err() {
                    group.done();
                }
            });
        }
    }

    pub async fn wait_for_archives(&self) {
        self.archive_group.wait().await;
    }

    pub async fn wait_for_quota_reclamations(&self) {
        self.reclamation_group.wait().await;
    }

    /// Pause the archive loop; the returned sender resumes it (sending
    /// or dropping both work).
    pub async fn pause_archives(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.archive_tx.send(ArchiveMsg::Pause(rx)).await;
        tx
    }

    pub fn force_quota_reclamation(&self) {
        self.reclamation_group.add(1);
        if self.force_reclamation_tx.try_send(()).is_err() {
            // One is already queued.
            self.reclamation_group.done();
        }
    }

    pub fn last_reclamation_time(&self) -> Option<SystemTime> {
        *self.last_reclamation_time.lock().unwrap()
    }

    /// Send batched archive or delete calls for the pointers, chunked
    /// and fanned out over a bounded worker pool. Deletes report the
    /// ids whose last reference went away.
    async fn do_chunked_downgrades(
        &self,
        md: &RootMetadata,
        ptrs: &[BlockPointer],
        archive: bool,
    ) -> Result<Vec<BlockId>> {
        debug!(count = ptrs.len(), archive, "downgrading block pointers");
        let kmd = md.key_meta();
        let results = futures::stream::iter(ptrs.chunks(NUM_POINTERS_TO_DOWNGRADE_PER_CHUNK).map(
            |chunk| {
                let block_ops = self.config.block_ops.clone();
                let kmd = kmd;
                async move {
                    debug!(len = chunk.len(), "downgrading chunk");
                    if archive {
                        block_ops.archive(&kmd, chunk).await.map(|_| Vec::new())
                    } else {
                        block_ops.delete(&kmd, chunk).await.map(|counts| {
                            counts
                                .into_iter()
                                .filter(|(_, count)| *count == 0)
                                .map(|(id, _)| id)
                                .collect()
                        })
                    }
                }
            },
        ))
        .buffer_unordered(MAX_PARALLEL_BLOCK_PUTS)
        .collect::<Vec<_>>()
        .await;

        let mut zero_ref_counts = Vec::new();
        for r in results {
            zero_ref_counts.extend(r?);
        }
        Ok(zero_ref_counts)
    }

    async fn archive_block_refs(&self, md: &RootMetadata, ptrs: &[BlockPointer]) -> Result<()> {
        self.do_chunked_downgrades(md, ptrs, true).await.map(|_| ())
    }

    async fn delete_block_refs(
        &self,
        md: &RootMetadata,
        ptrs: &[BlockPointer],
    ) -> Result<Vec<BlockId>> {
        self.do_chunked_downgrades(md, ptrs, false).await
    }

    fn is_permanent_downgrade_error(err: &Error) -> bool {
        match err {
            Error::StorageError { source } => !source.is_recoverable(),
            _ => false,
        }
    }

    /// Revisit blocks registered by `clean_up_block_state`: archive
    /// them if their revision made it into the history after all,
    /// delete them otherwise. Transient failures requeue.
    async fn process_blocks_to_delete(&self) -> Result<()> {
        let to_delete = {
            let mut pending = self.blocks_to_delete.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if to_delete.is_empty() {
            return Ok(());
        }

        let mut to_delete_again = Vec::new();
        for entry in to_delete {
            let md = entry.md.clone();
            debug!(revision = %md.revision, "checking deleted blocks for revision");
            let rmds = get_md_range(
                &self.config.mdcache,
                &*self.config.mdserver,
                self.tlf(),
                md.revision,
                md.revision,
            )
            .await;
            let rmds = match rmds {
                Ok(rmds) if !rmds.is_empty() => rmds,
                // Nothing known about the revision yet; check again
                // next pass. The metadata put may still be in flight.
                _ => {
                    to_delete_again.push(entry);
                    continue;
                }
            };

            if rmds[0].root == md.root {
                // The revision is part of the folder history, so its
                // blocks live on; archive it instead.
                debug!(revision = %rmds[0].revision, "archiving revision that landed after all");
                self.archive_unref_blocks_no_wait(rmds[0].clone());
                continue;
            }

            debug!(revision = %md.revision, "cleaning up blocks for failed revision");
            if let Err(e) = self.delete_block_refs(&md, &entry.ptrs).await {
                warn!(error = %e, "couldn't delete some refs in batch");
                if !Self::is_permanent_downgrade_error(&e) {
                    to_delete_again.push(entry);
                }
            }
        }

        if !to_delete_again.is_empty() {
            let mut pending = self.blocks_to_delete.lock().unwrap();
            pending.extend(to_delete_again);
        }
        Ok(())
    }

    fn archive_in_background(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ArchiveMsg>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        loop {
            let shutdown_fut = self.shutdown.clone().cancelled_owned();
            tokio::select! {
                _ = shutdown_fut => return,
                msg = rx.recv() => {
                    let Some(msg) = msg else { return };
                    match msg {
                        ArchiveMsg::Archive(md) => {
                            let ptrs = collect_unref_ptrs(&md, true);
                            debug!(
                                count = ptrs.len(),
                                revision = %md.revision,
                                "archiving block pointers from revision"
                            );
                            let pass = tokio::time::timeout(BACKGROUND_TASK_TIMEOUT, async {
                                self.archive_block_refs(&md, &ptrs).await?;
                                // Also see if any failed-put blocks can go.
                                self.process_blocks_to_delete().await
                            })
                            .await;
                            match pass {
                                Err(_) => warn!("archive pass timed out"),
                                Ok(Err(e)) => warn!(error = %e, "couldn't archive blocks"),
                                Ok(Ok(())) => {}
                            }
                            self.archive_group.done();
                        }
                        ArchiveMsg::Pause(resume) => {
                            info!("archives paused");
                            tokio::select! {
                                _ = resume => info!("archives unpaused"),
                                _ = self.shutdown.clone().cancelled_owned() => return,
                            }
                        }
                    }
                }
            }
        }
        })
    }

    fn is_old_enough(&self, md: &RootMetadata) -> bool {
        // Trust the writer-provided timestamp. A writer with a bad
        // clock can reclaim early; nothing here can prevent that.
        let mtime = from_unix_nanos(md.root.mtime);
        mtime + self.config.quota_reclamation_min_unref_age < self.config.clock.now()
    }

    fn is_qr_necessary(&self, head: &RootMetadata, memo: &QrMemo) -> bool {
        // Run if the head moved, or the previous run left work behind.
        if head.revision != memo.last_qr_head_rev || !memo.was_last_qr_complete {
            return true;
        }
        // Or if the head was too young last time but has aged since.
        memo.last_qr_head_rev > memo.last_qr_old_enough_rev && self.is_old_enough(head)
    }

    /// The newest revision old enough to reclaim, and the newest
    /// revision a previous gc op already scrubbed, found by walking
    /// the history backward in range-sized batches.
    async fn get_most_recent_old_enough_and_gc_revisions(
        &self,
        head: &RootMetadata,
    ) -> Result<(MetadataRevision, MetadataRevision)> {
        let mut curr_head = head.revision;
        let mut most_recent_old_enough = MetadataRevision::UNINITIALIZED;
        let mut last_gc_rev = MetadataRevision::UNINITIALIZED;

        loop {
            let start = MetadataRevision(
                (curr_head.number() - MAX_MDS_AT_A_TIME + 1)
                    .max(MetadataRevision::INITIAL.number()),
            );
            let rmds = get_md_range(
                &self.config.mdcache,
                &*self.config.mdserver,
                self.tlf(),
                start,
                curr_head,
            )
            .await?;
            let num_new = rmds.len();

            for rmd in rmds.iter().rev() {
                if !most_recent_old_enough.is_initialized() && self.is_old_enough(rmd) {
                    debug!(revision = %rmd.revision, "revision is older than the unref age");
                    most_recent_old_enough = rmd.revision;
                }

                if !last_gc_rev.is_initialized() {
                    for op in rmd.ops.iter().rev() {
                        if let Op::Gc(gco) = op {
                            debug!(latest_rev = %gco.latest_rev, "found last gc op");
                            last_gc_rev = gco.latest_rev;
                            break;
                        }
                    }
                }

                if most_recent_old_enough.is_initialized() && last_gc_rev.is_initialized() {
                    return Ok((most_recent_old_enough, last_gc_rev));
                }
            }

            if num_new > 0 {
                curr_head = rmds[0].revision - 1;
            }
            if (num_new as i64) < MAX_MDS_AT_A_TIME || curr_head < MetadataRevision::INITIAL {
                break;
            }
        }

        Ok((most_recent_old_enough, last_gc_rev))
    }

    /// All pointers unreferenced in `(earliest_rev, latest_rev]`. When
    /// the batch overruns the per-run pointer threshold, the range is
    /// shortened from the newer end and the run reports incomplete.
    async fn get_unreferenced_blocks(
        &self,
        latest_rev: MetadataRevision,
        earliest_rev: MetadataRevision,
    ) -> Result<(Vec<BlockPointer>, MetadataRevision, bool)> {
        debug!(%latest_rev, %earliest_rev, "gathering unreferenced blocks");
        if latest_rev <= earliest_rev {
            return Ok((Vec::new(), MetadataRevision::UNINITIALIZED, true));
        }

        let mut ptrs: Vec<BlockPointer> = Vec::new();
        let mut rev_start_positions: HashMap<MetadataRevision, usize> = HashMap::new();
        let mut curr_head = latest_rev;
        'outer: loop {
            let start = MetadataRevision(
                (curr_head.number() - MAX_MDS_AT_A_TIME + 1)
                    .max(MetadataRevision::INITIAL.number()),
            );
            let rmds = get_md_range(
                &self.config.mdcache,
                &*self.config.mdserver,
                self.tlf(),
                start,
                curr_head,
            )
            .await?;
            let num_new = rmds.len();

            for rmd in rmds.iter().rev() {
                if rmd.revision <= earliest_rev {
                    break 'outer;
                }
                rev_start_positions.insert(rmd.revision, ptrs.len());
                // A gc op's unrefs were already deleted; skip them.
                ptrs.extend(collect_unref_ptrs(rmd, true));
            }

            if num_new > 0 {
                curr_head = rmds[0].revision - 1;
            }
            if (num_new as i64) < MAX_MDS_AT_A_TIME || curr_head < MetadataRevision::INITIAL {
                break;
            }
        }

        let mut latest_rev = latest_rev;
        let mut complete = true;
        if ptrs.len() > NUM_POINTERS_PER_GC_THRESHOLD {
            // Reclaim only the oldest revisions this run, keeping at
            // least the threshold's worth of pointers.
            let thresh_start = ptrs.len() - NUM_POINTERS_PER_GC_THRESHOLD;
            let orig_latest_rev = latest_rev;
            let orig_len = ptrs.len();
            for (rev, i) in &rev_start_positions {
                if *i < thresh_start && *rev < latest_rev {
                    latest_rev = *rev;
                }
            }
            if latest_rev < orig_latest_rev {
                ptrs = ptrs.split_off(rev_start_positions[&latest_rev]);
                debug!(
                    %orig_latest_rev,
                    %latest_rev,
                    orig_len,
                    len = ptrs.len(),
                    "shortened the reclamation range"
                );
                complete = false;
            }
        }

        debug!(count = ptrs.len(), "found pointers to clean");
        Ok((ptrs, latest_rev, complete))
    }

    /// Commit a gc op recording this run, carrying the ids whose last
    /// reference disappeared.
    async fn finalize_reclamation(
        &self,
        ptrs: &[BlockPointer],
        zero_ref_counts: Vec<BlockId>,
        latest_rev: MetadataRevision,
    ) -> Result<()> {
        let mut gco = GcOp::new(latest_rev);
        for id in zero_ref_counts {
            gco.common.unrefs.push(BlockPointer {
                id,
                ..Default::default()
            });
        }
        debug!(%latest_rev, count = ptrs.len(), "finalizing reclamation");

        let head = self
            .config
            .mdserver
            .get_for_tlf(self.tlf())
            .await?
            .ok_or_else(|| {
                Error::from(tansu_meta::err::UnknownFolderSnafu { tlf: self.tlf() }.build())
            })?;
        let mut next = head.successor();
        next.add_op(Op::Gc(gco));
        let committed = self.config.mdserver.put(next).await?;
        self.config.mdcache.put(committed);
        Ok(())
    }

    async fn do_reclamation(&self, memo: &mut QrMemo) -> Result<()> {
        let Some(head) = self.config.mdserver.get_for_tlf(self.tlf()).await? else {
            return Ok(());
        };
        if !head.merged {
            return UnmergedHeadSnafu.fail();
        }
        if !head.is_writer(self.config.current_user) {
            return WriteAccessSnafu {
                user: self.config.current_user,
            }
            .fail();
        }
        if !self.is_qr_necessary(&head, memo) {
            return Ok(());
        }

        // Take the remote per-folder lock so only one writer reclaims
        // at a time. Failure to get it is a skip, not a wait.
        if !self.config.mdserver.truncate_lock(self.tlf()).await? {
            debug!("couldn't get the truncate lock");
            return TruncateLockHeldSnafu.fail();
        }
        let res = self.do_reclamation_locked(&head, memo).await;
        match self.config.mdserver.truncate_unlock(self.tlf()).await {
            Ok(false) => debug!("truncate lock was already released"),
            Ok(true) => {}
            Err(e) => debug!(error = %e, "couldn't release the truncate lock"),
        }
        res
    }

    async fn do_reclamation_locked(
        &self,
        head: &Arc<RootMetadata>,
        memo: &mut QrMemo,
    ) -> Result<()> {
        let (mut most_recent_old_enough_rev, last_gc_rev) = self
            .get_most_recent_old_enough_and_gc_revisions(head)
            .await?;
        if !most_recent_old_enough_rev.is_initialized()
            || most_recent_old_enough_rev <= last_gc_rev
        {
            // Nothing new to reclaim since last time.
            memo.last_qr_head_rev = head.revision;
            memo.last_qr_old_enough_rev = most_recent_old_enough_rev;
            memo.was_last_qr_complete = true;
            return Ok(());
        }

        // Don't try too many revisions in one run.
        let mut shortened = false;
        if most_recent_old_enough_rev.number() - last_gc_rev.number() > NUM_MAX_REVISIONS_PER_QR {
            most_recent_old_enough_rev = MetadataRevision(last_gc_rev.number() + NUM_MAX_REVISIONS_PER_QR);
            shortened = true;
        }

        debug!("starting quota reclamation process");
        let result: Result<bool> = async {
            let (ptrs, latest_rev, complete) = self
                .get_unreferenced_blocks(most_recent_old_enough_rev, last_gc_rev)
                .await?;
            if ptrs.is_empty() && !shortened {
                return Ok(true);
            }
            let zero_ref_counts = self.delete_block_refs(head, &ptrs).await?;
            self.finalize_reclamation(&ptrs, zero_ref_counts, latest_rev)
                .await?;
            Ok(complete)
        }
        .await;

        *self.last_reclamation_time.lock().unwrap() = Some(self.config.clock.now());
        match result {
            Ok(complete) => {
                memo.last_qr_head_rev = head.revision;
                memo.last_qr_old_enough_rev = most_recent_old_enough_rev;
                memo.was_last_qr_complete = complete;
                debug!(complete, "ending quota reclamation process");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "ending quota reclamation process");
                Err(e)
            }
        }
    }

    fn reclaim_quota_in_background(
        self: Arc<Self>,
        mut force_rx: mpsc::Receiver<()>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        let mut memo = QrMemo::default();
        let mut timer_disabled = false;
        loop {
            let period = self.config.quota_reclamation_period;
            let timer = async {
                if timer_disabled || period.is_zero() {
                    futures::future::pending::<()>().await
                } else {
                    tokio::time::sleep(period).await
                }
            };
            let shutdown_fut = self.shutdown.clone().cancelled_owned();
            tokio::select! {
                _ = shutdown_fut => return,
                _ = timer => {
                    self.reclamation_group.add(1);
                }
                msg = force_rx.recv() => {
                    if msg.is_none() {
                        return;
                    }
                }
            }

            let res = self.do_reclamation(&mut memo).await;
            if let Err(e) = &res {
                if matches!(e, Error::WriteAccess { .. }) {
                    // Not a writer anymore: stop the periodic runs, but
                    // keep serving forced ones so they don't hang.
                    timer_disabled = true;
                }
                debug!(error = %e, "quota reclamation pass failed");
            }
            self.reclamation_group.done();
        }
        })
    }
}
