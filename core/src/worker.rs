use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::worker_pool::PoolShared;

// A unit of work a pool worker can run exactly once
pub trait Job: Send + 'static {
    fn execute(self);
}

// Lets tests and callers push plain closures through a pool
pub type BoxedJob = Box<dyn FnOnce() + Send + 'static>;

impl<F> Job for F
where
    F: FnOnce() + Send + 'static,
{
    fn execute(self) {
        self()
    }
}

// A poisoned lock only means a job panicked while a guard was alive;
// the protected state is still consistent for our purposes.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SlotState<J> {
    job: Option<J>,
    busy: bool,
    cancelled: bool,
}

// Per-worker mailbox: the pool drops a job in, the worker wakes up
pub(crate) struct WorkerSlot<J> {
    state: Mutex<SlotState<J>>,
    signal: Condvar,
}

impl<J: Job> WorkerSlot<J> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                job: None,
                busy: false,
                cancelled: false,
            }),
            signal: Condvar::new(),
        }
    }

    // Hand a job to this worker; fails if it is still busy or shutting down
    pub(crate) fn set_job(&self, job: J) -> Result<(), J> {
        let mut state = lock(&self.state);
        if state.busy || state.cancelled {
            return Err(job);
        }
        state.busy = true;
        state.job = Some(job);
        self.signal.notify_one();
        Ok(())
    }

    pub(crate) fn is_busy(&self) -> bool {
        lock(&self.state).busy
    }

    pub(crate) fn cancel(&self) {
        lock(&self.state).cancelled = true;
        self.signal.notify_all();
    }
}

// One long-lived background thread
pub(crate) struct Worker {
    index: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn<J: Job>(index: usize, shared: Arc<PoolShared<J>>) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("ds-worker-{index}"))
            .spawn(move || run_loop(index, &shared))?;
        Ok(Self {
            index,
            handle: Some(handle),
        })
    }

    pub(crate) fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("worker {} terminated abnormally", self.index);
            }
        }
    }
}

fn run_loop<J: Job>(index: usize, shared: &PoolShared<J>) {
    let slot = shared.slot(index);
    loop {
        let job = {
            let mut state = lock(&slot.state);
            // The check and the wait happen under the same guard, so a
            // notify between them cannot be lost.
            while state.job.is_none() && !state.cancelled {
                state = slot
                    .signal
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if state.cancelled {
                // Abandon anything assigned but not started
                if state.job.take().is_some() {
                    state.busy = false;
                    drop(state);
                    shared.job_finished();
                }
                break;
            }
            state.job.take()
        };

        if let Some(job) = job {
            if !run_guarded(job) {
                shared.record_fault();
            }
        }

        lock(&slot.state).busy = false;
        shared.job_finished();
        // Opportunistically pick up whatever queued up meanwhile
        shared.pump();
    }
    log::trace!("worker {index} exiting");
}

// Run one job, containing any panic it raises. Returns false if it faulted;
// whatever the job wrote before the fault stays written.
pub(crate) fn run_guarded<J: Job>(job: J) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| job.execute())) {
        Ok(()) => true,
        Err(payload) => {
            let current = thread::current();
            log::error!(
                "{}: job panicked: {}",
                current.name().unwrap_or("unnamed thread"),
                panic_message(payload.as_ref())
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
