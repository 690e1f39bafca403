//! Chain synchronization engine.
//!
//! Heights are fetched and filtered in parallel by a [`WorkQueue`] and
//! committed to the ledger strictly in height order by a single consumer,
//! one storage transaction per batch. Live sync advances the ledger's sync
//! tip one block at a time and unwinds it when the chain reorganizes;
//! rescans replay a height range against the watch-list without touching
//! the tip and can be stopped and resumed between batches.

use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use sluice_core::error::ChainError;
use sluice_core::script::Address;
use sluice_core::traits::{ChainSource, FilterBlocksResponse};
use sluice_core::types::{BlockMeta, Hash256};
use sluice_ledger::keys::{decode, encode};
use sluice_ledger::{Database, DbTx, Ledger, TxRecord};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::watchlist::WatchList;
use crate::workqueue::WorkQueue;

/// Meta key under which an unfinished rescan is persisted.
const META_RESCAN_PROGRESS: &[u8] = b"rescan_progress";
/// Attempts per chain call before a transient failure is surfaced.
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What the engine is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    /// Committing `height`; `rescan` is false during live sync.
    Scanning { height: u32, rescan: bool },
}

/// Snapshot returned by [`SyncEngine::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    /// The rescan in progress or waiting to be resumed.
    pub rescan: Option<RescanProgress>,
}

/// A requested rescan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescanJob {
    pub from: u32,
    /// Inclusive; clamped to the chain's best height.
    pub to: u32,
    pub addresses: Vec<Address>,
    /// Clear all transaction history and restart live sync from `from`.
    pub drop_existing: bool,
}

/// Persisted state of a rescan, written with every committed batch.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct RescanProgress {
    pub from: u32,
    pub to: u32,
    /// First height not yet committed.
    pub next: u32,
    pub addresses: Vec<Address>,
}

/// How a scan over a height range ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    /// Stopped between batches on request.
    Stopped,
    /// Live sync found a block whose parent is not the ledger tip.
    Reorg { height: u32 },
}

/// One fetched and filtered height.
struct Step {
    meta: BlockMeta,
    prev_hash: Hash256,
    filtered: Option<FilterBlocksResponse>,
    /// Watch-list generation `filtered` was computed against.
    generation: u64,
    /// The ledger holds a different block at this height.
    wrong_block: bool,
}

impl Step {
    fn header_only(&self) -> bool {
        self.filtered.is_none() && !self.wrong_block
    }
}

#[derive(Clone, Copy)]
enum Mode {
    Live,
    Rescan,
}

/// The parts of the engine a fetch worker needs.
#[derive(Clone)]
struct Fetcher {
    chain: Arc<dyn ChainSource>,
    db: Database,
    ledger: Ledger,
    watch: Arc<WatchList>,
}

impl Fetcher {
    fn step(&self, height: u32) -> Result<Step, SyncError> {
        let hash = retry(|| self.chain.block_hash(height))?;
        let header = retry(|| self.chain.block_header(&hash))?;
        let meta = BlockMeta::new(height, hash, header.timestamp);

        let wrong_block = self
            .db
            .view(|r| self.ledger.block_at(r, height))?
            .is_some_and(|recorded| recorded.hash() != hash);

        let (filtered, generation) = self.filter(&meta)?;
        Ok(Step {
            meta,
            prev_hash: header.prev_hash,
            filtered,
            generation,
            wrong_block,
        })
    }

    fn filter(&self, meta: &BlockMeta) -> Result<(Option<FilterBlocksResponse>, u64), SyncError> {
        let snapshot = self.watch.snapshot();
        let request = snapshot.request(vec![*meta]);
        let filtered = retry(|| self.chain.filter_blocks(&request))?;
        Ok((filtered, snapshot.generation))
    }

    /// Main-chain block at `height`.
    fn meta_at(&self, height: u32) -> Result<BlockMeta, SyncError> {
        let hash = retry(|| self.chain.block_hash(height))?;
        let header = retry(|| self.chain.block_header(&hash))?;
        Ok(BlockMeta::new(height, hash, header.timestamp))
    }
}

fn retry<T>(mut call: impl FnMut() -> Result<T, ChainError>) -> Result<T, ChainError> {
    let mut attempt = 1;
    loop {
        match call() {
            Err(e) if e.is_transient() && attempt < FETCH_ATTEMPTS => {
                warn!(attempt, error = %e, "chain call failed, retrying");
                std::thread::sleep(FETCH_RETRY_DELAY * attempt);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Drives the ledger from a [`ChainSource`].
pub struct SyncEngine {
    fetcher: Fetcher,
    config: SyncConfig,
    quit: AtomicBool,
    stop_rescan: AtomicBool,
    status: RwLock<SyncStatus>,
    jobs: Mutex<VecDeque<RescanJob>>,
    job_ready: Condvar,
}

impl SyncEngine {
    /// Engine committing blocks from `chain` into `ledger` for the addresses in `watch`.
    pub fn new(
        chain: Arc<dyn ChainSource>,
        db: Database,
        ledger: Ledger,
        watch: Arc<WatchList>,
        config: SyncConfig,
    ) -> Self {
        Self {
            fetcher: Fetcher { chain, db, ledger, watch },
            config,
            quit: AtomicBool::new(false),
            stop_rescan: AtomicBool::new(false),
            status: RwLock::new(SyncStatus { state: SyncState::Idle, rescan: None }),
            jobs: Mutex::new(VecDeque::new()),
            job_ready: Condvar::new(),
        }
    }

    /// Addresses and outpoints being followed.
    pub fn watch(&self) -> &Arc<WatchList> {
        &self.fetcher.watch
    }

    /// Configuration the engine was created with.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current state and any rescan in progress.
    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    // --- Control ---

    /// Queue a rescan for the [`run`](Self::run) loop.
    pub fn start_rescan(&self, job: RescanJob) {
        info!(from = job.from, to = job.to, drop = job.drop_existing, "rescan queued");
        self.stop_rescan.store(false, Ordering::SeqCst);
        self.jobs.lock().push_back(job);
        self.job_ready.notify_all();
    }

    /// Stop the running rescan after its current batch and drop queued ones.
    ///
    /// The persisted progress is kept; [`resume_rescan`](Self::resume_rescan)
    /// continues from the last committed height. Live sync ignores the
    /// request, and a request made while no rescan runs is cleared when the
    /// next one starts.
    pub fn stop_rescan(&self) {
        self.jobs.lock().clear();
        self.stop_rescan.store(true, Ordering::SeqCst);
    }

    /// Ask the engine to exit at the next batch boundary.
    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.job_ready.notify_all();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutting_down(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Service loop: resumes an unfinished rescan, then alternates between
    /// queued rescans and live sync until [`shutdown`](Self::shutdown).
    ///
    /// A failed cycle is logged and retried from the last committed height.
    /// Only a reorg deeper than the configured limit ends the loop with an error.
    pub fn run(&self) -> Result<(), SyncError> {
        info!(workers = self.config.workers, batch = self.config.batch_size, "sync engine started");
        if let Err(e) = self.resume_rescan() {
            warn!(error = %e, "could not resume rescan");
        }

        while !self.is_shutting_down() {
            let result = match self.next_job() {
                Some(job) => self.rescan(job).map(|_| ()),
                None if self.fetcher.chain.is_current() => self.sync_to_tip(),
                None => Ok(()),
            };
            match result {
                Ok(()) | Err(SyncError::ShuttingDown) | Err(SyncError::Stopped) => {}
                Err(e @ SyncError::ReorgTooDeep { .. }) => return Err(e),
                Err(e) => warn!(error = %e, "sync cycle failed"),
            }
        }
        info!("sync engine stopped");
        Ok(())
    }

    fn next_job(&self) -> Option<RescanJob> {
        let mut jobs = self.jobs.lock();
        if jobs.is_empty() && !self.is_shutting_down() {
            self.job_ready.wait_for(&mut jobs, self.config.poll_interval());
        }
        jobs.pop_front()
    }

    // --- Live sync ---

    /// Connect every block between the ledger tip and the chain's best block.
    pub fn sync_to_tip(&self) -> Result<(), SyncError> {
        let f = &self.fetcher;
        loop {
            if self.is_shutting_down() {
                return Err(SyncError::ShuttingDown);
            }
            let best = f.chain.best_block()?;
            let tip = f.db.view(|r| f.ledger.sync_tip(r))?;
            if let Some(tip) = tip {
                if !f.chain.is_main_chain(&tip.stamp)? {
                    self.handle_reorg()?;
                    continue;
                }
            }

            let from = tip.map_or(self.config.start_height, |t| t.height() + 1);
            if from > best.height {
                return Ok(());
            }
            match self.scan(from, best.height, Mode::Live, None)? {
                ScanOutcome::Completed => return Ok(()),
                ScanOutcome::Stopped => return Err(SyncError::Stopped),
                ScanOutcome::Reorg { height } => {
                    warn!(height, "parent hash mismatch, unwinding");
                    self.handle_reorg()?;
                }
            }
        }
    }

    /// Roll the ledger back until its tip is on the main chain again.
    /// Returns the number of blocks unwound.
    pub fn handle_reorg(&self) -> Result<u32, SyncError> {
        let f = &self.fetcher;
        let max = self.config.max_reorg_depth;
        let depth = f.db.update(|tx| {
            let mut depth = 0;
            while let Some(tip) = f.ledger.sync_tip(tx)? {
                if f.chain.is_main_chain(&tip.stamp)? {
                    break;
                }
                if depth >= max {
                    return Err(SyncError::ReorgTooDeep { depth: max });
                }
                let delta = f.ledger.rollback_one_block(tx, tip.height())?;
                debug!(height = tip.height(), delta, "rolled back block");
                depth += 1;
                if f.ledger.rewind_sync_tip(tx)?.is_none() && tip.height() > 0 {
                    // History exhausted: anchor on the main-chain parent.
                    let parent = f.meta_at(tip.height() - 1)?;
                    f.ledger.reset_sync_tip(tx, &parent)?;
                }
            }
            Ok(depth)
        })?;
        if depth > 0 {
            info!(depth, "reorg unwound");
        }
        Ok(depth)
    }

    // --- Rescan ---

    /// Run a rescan to completion, or until stopped.
    pub fn rescan(&self, job: RescanJob) -> Result<ScanOutcome, SyncError> {
        let f = &self.fetcher;
        self.stop_rescan.store(false, Ordering::SeqCst);
        f.watch.add_addresses(job.addresses.iter().cloned());

        if job.drop_existing {
            return self.drop_and_restart(job.from);
        }

        let best = f.chain.best_block()?;
        let to = job.to.min(best.height);
        if job.from > to {
            debug!(from = job.from, to, "empty rescan range");
            return Ok(ScanOutcome::Completed);
        }
        let progress = RescanProgress {
            from: job.from,
            to,
            next: job.from,
            addresses: job.addresses,
        };
        self.run_rescan(progress)
    }

    /// Continue a persisted rescan. Returns `None` when there is nothing to resume.
    pub fn resume_rescan(&self) -> Result<Option<ScanOutcome>, SyncError> {
        let Some(progress) = self.rescan_progress()? else {
            return Ok(None);
        };
        info!(next = progress.next, to = progress.to, "resuming rescan");
        self.stop_rescan.store(false, Ordering::SeqCst);
        self.fetcher.watch.add_addresses(progress.addresses.iter().cloned());
        self.run_rescan(progress).map(Some)
    }

    /// Persisted progress of an unfinished rescan.
    pub fn rescan_progress(&self) -> Result<Option<RescanProgress>, SyncError> {
        let f = &self.fetcher;
        let raw = f.db.view(|r| f.ledger.get_meta(r, META_RESCAN_PROGRESS))?;
        Ok(raw.map(|b| decode(&b)).transpose()?)
    }

    fn run_rescan(&self, progress: RescanProgress) -> Result<ScanOutcome, SyncError> {
        let f = &self.fetcher;
        info!(from = progress.from, to = progress.to, next = progress.next, "rescan started");
        if progress.next > progress.to {
            f.db.update(|tx| {
                f.ledger.delete_meta(tx, META_RESCAN_PROGRESS);
                Ok::<_, SyncError>(())
            })?;
            return Ok(ScanOutcome::Completed);
        }
        f.db.update(|tx| {
            f.ledger.put_meta(tx, META_RESCAN_PROGRESS, encode(&progress)?);
            Ok::<_, SyncError>(())
        })?;
        self.status.write().rescan = Some(progress.clone());

        let outcome = self.scan(progress.next, progress.to, Mode::Rescan, Some(progress.clone()));
        if matches!(outcome, Ok(ScanOutcome::Completed)) {
            f.db.update(|tx| {
                f.ledger.delete_meta(tx, META_RESCAN_PROGRESS);
                Ok::<_, SyncError>(())
            })?;
            self.status.write().rescan = None;
            info!(from = progress.from, to = progress.to, "rescan finished");
        } else if matches!(outcome, Ok(ScanOutcome::Stopped)) {
            info!("rescan stopped");
        }
        outcome
    }

    /// Clear transaction history and sync the tip forward again from `from`.
    fn drop_and_restart(&self, from: u32) -> Result<ScanOutcome, SyncError> {
        let f = &self.fetcher;
        let anchor = match from.checked_sub(1) {
            Some(h) => Some(f.meta_at(h)?),
            None => None,
        };
        f.db.update(|tx| {
            f.ledger.drop_transaction_history(tx)?;
            f.ledger.delete_meta(tx, META_RESCAN_PROGRESS);
            match &anchor {
                Some(meta) => f.ledger.reset_sync_tip(tx, meta)?,
                None => f.ledger.clear_sync_tip(tx)?,
            }
            Ok::<_, SyncError>(())
        })?;
        self.status.write().rescan = None;
        info!(from, "transaction history dropped, restarting sync");
        match self.sync_to_tip() {
            Ok(()) => Ok(ScanOutcome::Completed),
            Err(SyncError::Stopped) => Ok(ScanOutcome::Stopped),
            Err(e) => Err(e),
        }
    }

    // --- Scanning ---

    /// Fetch `[from, to]` in parallel and commit it in batches.
    fn scan(
        &self,
        from: u32,
        to: u32,
        mode: Mode,
        progress: Option<RescanProgress>,
    ) -> Result<ScanOutcome, SyncError> {
        let fetcher = self.fetcher.clone();
        let queue = WorkQueue::new(
            self.config.workers,
            self.config.backlog,
            u64::from(from),
            u64::from(to) + 1,
            move |seq| fetcher.step(seq as u32),
        );
        let result = self.consume(&queue, from, to, mode, progress);
        queue.stop();
        self.status.write().state = SyncState::Idle;
        result
    }

    /// Drain `queue` in height order, committing one batch at a time.
    fn consume(
        &self,
        queue: &WorkQueue<Result<Step, SyncError>>,
        from: u32,
        to: u32,
        mode: Mode,
        mut progress: Option<RescanProgress>,
    ) -> Result<ScanOutcome, SyncError> {
        let f = &self.fetcher;
        let rescan = matches!(mode, Mode::Rescan);
        let mut expected_prev = match mode {
            Mode::Live => f.db.view(|r| f.ledger.sync_tip(r))?.map(|t| t.hash()),
            Mode::Rescan => None,
        };
        let batch_size = self.config.batch_size.max(1);
        let mut height = from;
        while height <= to {
            if self.is_shutting_down() {
                return Err(SyncError::ShuttingDown);
            }
            if rescan && self.stop_rescan.swap(false, Ordering::SeqCst) {
                return Ok(ScanOutcome::Stopped);
            }

            let end = height.saturating_add(batch_size - 1).min(to);
            let mut steps = Vec::with_capacity((end - height + 1) as usize);
            let mut reorg_at = None;
            for h in height..=end {
                let step = queue.get(u64::from(h)).ok_or(SyncError::ShuttingDown)??;
                if let (Mode::Live, Some(prev)) = (mode, expected_prev) {
                    if step.prev_hash != prev {
                        reorg_at = Some(h);
                        break;
                    }
                }
                expected_prev = Some(step.meta.hash());
                steps.push(step);
            }

            if let Some(last) = steps.last().map(|s| s.meta.height()) {
                self.status.write().state = SyncState::Scanning { height: last, rescan };
                if let Some(p) = progress.as_mut() {
                    p.next = last + 1;
                }
                self.commit_batch(steps, mode, progress.as_ref())?;
                if let Some(p) = &progress {
                    self.status.write().rescan = Some(p.clone());
                }
                height = last + 1;
            }
            if let Some(h) = reorg_at {
                return Ok(ScanOutcome::Reorg { height: h });
            }
        }
        Ok(ScanOutcome::Completed)
    }

    fn commit_batch(
        &self,
        steps: Vec<Step>,
        mode: Mode,
        progress: Option<&RescanProgress>,
    ) -> Result<(), SyncError> {
        let f = &self.fetcher;
        let (first, last) = match (steps.first(), steps.last()) {
            (Some(a), Some(b)) => (a.meta.height(), b.meta.height()),
            _ => return Ok(()),
        };
        let mut relevant = 0usize;
        f.db.update(|tx| {
            for step in steps {
                if self.apply_step(tx, step, mode)? {
                    relevant += 1;
                }
            }
            if let Some(p) = progress {
                f.ledger.put_meta(tx, META_RESCAN_PROGRESS, encode(p)?);
            }
            Ok::<_, SyncError>(())
        })?;
        info!(first, last, relevant, "committed batch");
        Ok(())
    }

    /// Apply one height inside the batch transaction. Returns whether any
    /// wallet transaction was recorded.
    fn apply_step(&self, tx: &mut DbTx<'_>, step: Step, mode: Mode) -> Result<bool, SyncError> {
        let f = &self.fetcher;
        let meta = step.meta;
        let height = meta.height();

        if let Some(recorded) = f.ledger.block_at(tx, height)? {
            if recorded.hash() != meta.hash() {
                let delta = f.ledger.rollback_one_block(tx, height)?;
                info!(height, old = %recorded.hash(), new = %meta.hash(), delta, "replaced wrong block");
            }
        }

        let filtered = if step.generation != f.watch.generation() {
            warn!(height, "watch-list changed since filtering, refiltering");
            f.filter(&meta)?.0
        } else if step.header_only() && matches!(mode, Mode::Rescan) {
            return Ok(false);
        } else {
            step.filtered
        };

        let relevant = match filtered {
            Some(found) => {
                self.record_matches(tx, &meta, &found)?;
                true
            }
            None => false,
        };

        if matches!(mode, Mode::Live) {
            f.ledger.set_sync_tip(tx, &meta)?;
            f.ledger.prune_sync_history(tx, self.config.max_reorg_depth)?;
        }
        debug!(height, hash = %meta.hash(), relevant, "applied height");
        Ok(relevant)
    }

    fn record_matches(
        &self,
        tx: &mut DbTx<'_>,
        meta: &BlockMeta,
        found: &FilterBlocksResponse,
    ) -> Result<(), SyncError> {
        let f = &self.fetcher;
        let mut credited = HashSet::new();
        for related in &found.related {
            let rec = TxRecord::new(related.clone());
            f.ledger.insert_transaction(tx, &rec, Some(meta))?;
            for outpoint in found.found_outpoints.keys().filter(|op| op.txid == rec.txid) {
                if f.ledger.add_credit(tx, &rec, Some(meta), outpoint.index, false)? {
                    debug!(%outpoint, "new credit");
                }
                credited.insert(*outpoint);
            }
        }
        let added = f.watch.add_outpoints(
            found
                .found_outpoints
                .iter()
                .filter(|(op, _)| credited.contains(op))
                .map(|(op, addr)| (*op, addr.clone())),
        );
        if added > 0 {
            debug!(height = meta.height(), added, "watching new outpoints");
        }
        Ok(())
    }
}
