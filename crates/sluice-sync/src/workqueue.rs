//! Bounded parallel executor with in-order result delivery.
//!
//! Workers claim sequence numbers from `[start, end)` in ascending order and
//! run the job for each. Results are cached by sequence number until the
//! consumer takes them with [`WorkQueue::get`], which blocks until the
//! requested result exists. Workers stop claiming while cached plus
//! in-flight results would exceed the backlog limit, so memory stays bounded
//! however far the consumer lags.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// How long an idle worker sleeps before re-checking for space.
const WORKER_POLL: Duration = Duration::from_millis(50);
/// How long `get` waits between checks for its result.
const GET_POLL: Duration = Duration::from_millis(100);

struct State<T> {
    next: u64,
    end: u64,
    in_flight: usize,
    results: HashMap<u64, T>,
    stopped: bool,
    /// Highest number of results ever cached at once.
    high_water: usize,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Signalled when a result is stored.
    produced: Condvar,
    /// Signalled when a result is taken or the queue stops.
    consumed: Condvar,
    backlog: usize,
}

/// Parallel job runner over a range of sequence numbers.
pub struct WorkQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
    start: u64,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Spawn `workers` threads running `job` for every sequence number in `[start, end)`.
    ///
    /// `backlog` bounds results that are cached or being computed; it is
    /// raised to 1 if zero.
    pub fn new<F>(workers: usize, backlog: usize, start: u64, end: u64, job: F) -> Self
    where
        F: Fn(u64) -> T + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                next: start,
                end,
                in_flight: 0,
                results: HashMap::new(),
                stopped: false,
                high_water: 0,
            }),
            produced: Condvar::new(),
            consumed: Condvar::new(),
            backlog: backlog.max(1),
        });
        let job = Arc::new(job);

        let handles = (0..workers.max(1))
            .filter_map(|i| {
                let shared = shared.clone();
                let job = job.clone();
                std::thread::Builder::new()
                    .name(format!("sluice-worker-{i}"))
                    .spawn(move || worker_loop(&shared, job.as_ref()))
                    .map_err(|e| warn!(error = %e, "failed to spawn sync worker"))
                    .ok()
            })
            .collect();

        Self { shared, workers: handles, start }
    }

    /// Block until the result for `seq` is available, then remove and return it.
    ///
    /// Returns `None` for sequence numbers outside the range, for results
    /// already taken, or once the queue has been stopped.
    pub fn get(&self, seq: u64) -> Option<T> {
        let mut state = self.shared.state.lock();
        if seq < self.start || seq >= state.end {
            return None;
        }
        loop {
            if let Some(result) = state.results.remove(&seq) {
                self.shared.consumed.notify_all();
                return Some(result);
            }
            // Claimed, not cached and nothing computing: already taken.
            if seq < state.next && state.in_flight == 0 {
                return None;
            }
            if state.stopped || self.workers.is_empty() {
                return None;
            }
            self.shared.produced.wait_for(&mut state, GET_POLL);
        }
    }

    /// Stop workers from claiming further work and wake all waiters.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        self.shared.produced.notify_all();
        self.shared.consumed.notify_all();
    }

    /// Highest number of results that were cached at the same time.
    pub fn high_water(&self) -> usize {
        self.shared.state.lock().high_water
    }
}

impl<T: Send + 'static> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.stop();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T, F>(shared: &Shared<T>, job: &F)
where
    F: Fn(u64) -> T,
{
    loop {
        let seq = {
            let mut state = shared.state.lock();
            loop {
                if state.stopped || state.next >= state.end {
                    return;
                }
                if state.results.len() + state.in_flight < shared.backlog {
                    break;
                }
                shared.consumed.wait_for(&mut state, WORKER_POLL);
            }
            let seq = state.next;
            state.next += 1;
            state.in_flight += 1;
            seq
        };

        let result = job(seq);

        let mut state = shared.state.lock();
        state.in_flight -= 1;
        if state.stopped {
            return;
        }
        state.results.insert(seq, result);
        state.high_water = state.high_water.max(state.results.len());
        debug!(seq, cached = state.results.len(), "work item done");
        shared.produced.notify_all();
    }
}
