//! Persistent worker threads with a startup/join barrier.
//!
//! Each worker sleeps on its own condition variable between activations.
//! A single arrival counter is used both to wait for every worker to finish
//! its init hook and to join every worker after a run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error};
use weir_core::{CoreError, CoreResult};

/// Work handed to every worker; receives the thread id
pub type Job = Arc<dyn Fn(usize) + Send + Sync>;

enum SlotState {
    Idle,
    Run(Job),
    Shutdown,
}

struct Slot {
    state: Mutex<SlotState>,
    wake: Condvar,
}

#[derive(Default)]
struct Barrier {
    state: Mutex<BarrierState>,
    done: Condvar,
}

#[derive(Default)]
struct BarrierState {
    arrivals: usize,
    panics: Vec<String>,
}

impl Barrier {
    fn arrive(&self, panic: Option<String>) {
        let mut state = lock(&self.state);
        state.arrivals += 1;
        if let Some(message) = panic {
            state.panics.push(message);
        }
        self.done.notify_all();
    }

    /// Wait for `n` arrivals, then rearm
    fn wait(&self, n: usize) -> Vec<String> {
        let mut state = lock(&self.state);
        while state.arrivals < n {
            state = self
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.arrivals = 0;
        std::mem::take(&mut state.panics)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Fixed-size pool of named worker threads
pub struct ThreadPool {
    name: String,
    slots: Vec<Arc<Slot>>,
    barrier: Arc<Barrier>,
    handles: Vec<JoinHandle<()>>,
    running: bool,
}

impl ThreadPool {
    /// Spawn `n_threads` workers and wait until each has run `init`
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty pool, and an invariant
    /// error if a thread cannot be spawned or its init hook panics.
    pub fn new(
        name: impl Into<String>,
        n_threads: usize,
        init: Option<Job>,
    ) -> CoreResult<Self> {
        let name = name.into();
        if n_threads == 0 {
            return Err(CoreError::config("n_threads", "a pool needs at least one thread"));
        }
        let barrier = Arc::new(Barrier::default());
        let mut slots = Vec::with_capacity(n_threads);
        let mut handles = Vec::with_capacity(n_threads);

        for tid in 0..n_threads {
            let slot = Arc::new(Slot {
                state: Mutex::new(SlotState::Idle),
                wake: Condvar::new(),
            });
            let worker_slot = slot.clone();
            let worker_barrier = barrier.clone();
            let worker_init = init.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{tid}"))
                .spawn(move || worker(tid, &worker_slot, &worker_barrier, worker_init))
                .map_err(|e| CoreError::invariant(format!("cannot spawn worker {tid}: {e}")))?;
            slots.push(slot);
            handles.push(handle);
        }

        let pool = Self {
            name,
            slots,
            barrier,
            handles,
            running: false,
        };
        let panics = pool.barrier.wait(n_threads);
        if let Some(message) = panics.first() {
            return Err(CoreError::invariant(format!(
                "init hook of pool {} panicked: {message}",
                pool.name
            )));
        }
        debug!(pool = %pool.name, n_threads, "thread pool ready");
        Ok(pool)
    }

    /// Number of workers
    #[must_use]
    pub fn n_threads(&self) -> usize {
        self.slots.len()
    }

    /// Whether a job was launched and not yet waited for
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Start `job` on every worker without waiting
    pub fn launch(&mut self, job: Job) -> CoreResult<()> {
        if self.running {
            return Err(CoreError::invariant(format!("pool {} is already running", self.name)));
        }
        for slot in &self.slots {
            *lock(&slot.state) = SlotState::Run(job.clone());
            slot.wake.notify_one();
        }
        self.running = true;
        Ok(())
    }

    /// Wait until every worker has finished the launched job
    ///
    /// # Errors
    ///
    /// A panic inside the job is reported as an invariant error.
    pub fn wait(&mut self) -> CoreResult<()> {
        if !self.running {
            return Ok(());
        }
        let panics = self.barrier.wait(self.slots.len());
        self.running = false;
        match panics.first() {
            Some(message) => {
                error!(pool = %self.name, %message, "worker panicked");
                Err(CoreError::invariant(format!(
                    "worker of pool {} panicked: {message}",
                    self.name
                )))
            }
            None => Ok(()),
        }
    }

    /// Launch then wait
    pub fn run(&mut self, job: Job) -> CoreResult<()> {
        self.launch(job)?;
        self.wait()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.running {
            let _ = self.barrier.wait(self.slots.len());
        }
        for slot in &self.slots {
            *lock(&slot.state) = SlotState::Shutdown;
            slot.wake.notify_one();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("n_threads", &self.slots.len())
            .field("running", &self.running)
            .finish()
    }
}

fn worker(tid: usize, slot: &Slot, barrier: &Barrier, init: Option<Job>) {
    let panic = init.and_then(|hook| {
        catch_unwind(AssertUnwindSafe(|| hook(tid)))
            .err()
            .map(|p| panic_message(p.as_ref()))
    });
    barrier.arrive(panic);

    loop {
        let job = {
            let mut state = lock(&slot.state);
            loop {
                match std::mem::replace(&mut *state, SlotState::Idle) {
                    SlotState::Idle => {
                        state = slot.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
                    }
                    SlotState::Run(job) => break job,
                    SlotState::Shutdown => return,
                }
            }
        };
        let panic = catch_unwind(AssertUnwindSafe(|| job(tid)))
            .err()
            .map(|p| panic_message(p.as_ref()));
        // release whatever the job captured before the joiner resumes
        drop(job);
        barrier.arrive(panic);
    }
}
