use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::error::{Result, TerrainError};
use crate::worker::{Job, Worker, WorkerSlot, lock};

// How many times sync() yields before it starts sleeping
const SPIN_ROUNDS: u32 = 64;
// Upper bound on one sleep inside sync()
const SLEEP_SLICE: Duration = Duration::from_millis(1);

// State shared between the pool handle and its worker threads
pub(crate) struct PoolShared<J> {
    slots: Vec<WorkerSlot<J>>,
    queue: Mutex<VecDeque<J>>, // FIFO of jobs waiting for an idle worker
    active: AtomicUsize,       // workers holding a job
    faulted: AtomicUsize,      // jobs that panicked
    cancelled: AtomicBool,
    done_lock: Mutex<()>,
    done: Condvar,
}

impl<J: Job> PoolShared<J> {
    fn new(worker_count: usize) -> Self {
        Self {
            slots: (0..worker_count).map(|_| WorkerSlot::new()).collect(),
            queue: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            faulted: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            done_lock: Mutex::new(()),
            done: Condvar::new(),
        }
    }

    pub(crate) fn slot(&self, index: usize) -> &WorkerSlot<J> {
        &self.slots[index]
    }

    // Linear scan for an idle worker. The counter goes up before the hand-off
    // so a fast completion can never drive it below zero.
    fn try_dispatch(&self, mut job: J) -> std::result::Result<(), J> {
        for slot in &self.slots {
            self.active.fetch_add(1, Ordering::AcqRel);
            match slot.set_job(job) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    self.active.fetch_sub(1, Ordering::AcqRel);
                    job = back;
                }
            }
        }
        Err(job)
    }

    // Move queue heads onto idle workers until one of them runs out
    pub(crate) fn pump(&self) {
        let mut queue = lock(&self.queue);
        if self.cancelled.load(Ordering::Acquire) {
            queue.clear();
            return;
        }
        while let Some(job) = queue.pop_front() {
            if let Err(job) = self.try_dispatch(job) {
                queue.push_front(job);
                break;
            }
        }
    }

    pub(crate) fn job_finished(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        let _guard = lock(&self.done_lock);
        self.done.notify_all();
    }

    pub(crate) fn record_fault(&self) {
        self.faulted.fetch_add(1, Ordering::Relaxed);
    }

    // Dispatch happens under the queue lock, so holding it here gives a
    // consistent view of "nothing queued and nothing running".
    fn is_drained(&self) -> bool {
        let queue = lock(&self.queue);
        queue.is_empty() && self.active.load(Ordering::Acquire) == 0
    }

    fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let dropped = {
            let mut queue = lock(&self.queue);
            let n = queue.len();
            queue.clear();
            n
        };
        for slot in &self.slots {
            slot.cancel();
        }
        log::debug!("worker pool cancelled, {dropped} queued jobs dropped");
        let _guard = lock(&self.done_lock);
        self.done.notify_all();
        true
    }
}

// Fixed set of background workers fed from a FIFO job queue
pub struct WorkerPool<J: Job> {
    shared: Arc<PoolShared<J>>,
    workers: Vec<Worker>,
}

impl<J: Job> WorkerPool<J> {
    // Spawn `worker_count` idle workers
    pub fn build(worker_count: usize) -> Result<Self> {
        if worker_count == 0 {
            return Err(TerrainError::InvalidParameter {
                name: "worker_count",
                reason: "a pool needs at least one worker".into(),
            });
        }

        let shared = Arc::new(PoolShared::new(worker_count));
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            match Worker::spawn(index, Arc::clone(&shared)) {
                Ok(worker) => workers.push(worker),
                Err(source) => {
                    // Tear down whatever already started
                    shared.cancel();
                    workers.into_iter().for_each(Worker::join);
                    return Err(TerrainError::WorkerSpawn { index, source });
                }
            }
        }

        log::debug!("worker pool started with {worker_count} workers");
        Ok(Self { shared, workers })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::build(config.worker_count)
    }

    // Give `job` to the first idle worker; hands it back if all are busy
    pub fn try_run_on_idle_worker(&self, job: J) -> std::result::Result<(), J> {
        if self.is_cancelled() {
            return Err(job);
        }
        self.shared.try_dispatch(job)
    }

    // Queue a job and try to start the queue head right away
    pub fn enqueue(&self, job: J) -> Result<()> {
        if self.is_cancelled() {
            log::warn!("job rejected: worker pool is cancelled");
            return Err(TerrainError::PoolCancelled);
        }
        lock(&self.shared.queue).push_back(job);
        self.shared.pump();
        Ok(())
    }

    // Barrier: block until the queue is empty and no worker is busy.
    // Returns false if `timeout` ran out first; work left over stays queued
    // or in flight.
    pub fn sync(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut spins = 0;
        loop {
            self.shared.pump();
            if self.shared.is_drained() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "sync timed out after {timeout:?} ({} queued, {} active)",
                    self.queued(),
                    self.active()
                );
                return false;
            }
            if spins < SPIN_ROUNDS {
                spins += 1;
                thread::yield_now();
                continue;
            }
            let guard = lock(&self.shared.done_lock);
            // Completions notify under done_lock, so re-checking here
            // cannot miss one that raced with the check above.
            if self.shared.is_drained() {
                return true;
            }
            let slice = (deadline - now).min(SLEEP_SLICE);
            let _ = self.shared.done.wait_timeout(guard, slice);
        }
    }

    // Stop accepting work, drop queued jobs and let workers exit after
    // their current job. Partial results are not rolled back.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn queued(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn busy_workers(&self) -> usize {
        self.shared.slots.iter().filter(|s| s.is_busy()).count()
    }

    // Number of jobs that panicked since the pool started
    pub fn faulted_jobs(&self) -> usize {
        self.shared.faulted.load(Ordering::Relaxed)
    }
}

impl<J: Job> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shared.cancel();
        self.workers.drain(..).for_each(Worker::join);
    }
}
