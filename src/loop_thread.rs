//! A pool of event-loop threads, each running its own [`EventLoop`], with
//! round-robin/hash/random/predicate dispatch and graceful dynamic resize.
//!
//! Growing the pool just spawns more threads. Shrinking marks the tail
//! loops "draining": they stop receiving new dispatches but keep running
//! until a caller-supplied exit-check predicate says it is safe to join
//! them, at which point a small reaper thread joins and splices them out.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, EventLoopHandle};

/// `(index-among-current-workers, loop) -> should this drained loop exit now?`
pub type ExitCheck = Arc<dyn Fn(usize, &EventLoopHandle) -> bool + Send + Sync>;

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

struct Worker {
    id: u64,
    handle: EventLoopHandle,
    join: Option<JoinHandle<()>>,
    draining: Arc<AtomicBool>,
}

struct Inner {
    name: String,
    workers: Mutex<Vec<Worker>>,
    rr_counter: AtomicUsize,
    rand_state: AtomicU64,
    next_id: AtomicU64,
    retired_tx: Sender<u64>,
}

/// `N` event-loop threads, load-balanced and independently resizable.
pub struct EventLoopThreadPool {
    inner: Arc<Inner>,
}

impl EventLoopThreadPool {
    /// Spawn `n` threads, each running a fresh [`EventLoop`]; blocks until
    /// every loop has reported ready.
    pub fn start(n: usize, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if n == 0 {
            return Err(Error::config("event loop thread pool requires at least one thread"));
        }
        let (retired_tx, retired_rx) = mpsc::channel();
        let inner = Arc::new(Inner {
            name: name.clone(),
            workers: Mutex::new(Vec::with_capacity(n)),
            rr_counter: AtomicUsize::new(0),
            rand_state: AtomicU64::new(seed()),
            next_id: AtomicU64::new(0),
            retired_tx,
        });

        spawn_reaper(inner.clone(), retired_rx);

        let mut workers = Vec::with_capacity(n);
        for i in 0..n {
            workers.push(spawn_worker(&inner, format!("{name}-{i}"))?);
        }
        *inner.workers.lock().unwrap() = workers;

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Total threads, including ones currently draining.
    pub fn io_thread_num(&self) -> usize {
        self.inner.workers.lock().unwrap().len()
    }

    /// Threads eligible to receive new dispatches (excludes draining ones).
    pub fn available_io_thread_num(&self) -> usize {
        self.inner.workers.lock().unwrap().iter().filter(|w| !w.draining.load(Ordering::Acquire)).count()
    }

    fn serviceable(&self) -> Vec<EventLoopHandle> {
        self.inner
            .workers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| !w.draining.load(Ordering::Acquire))
            .map(|w| w.handle.clone())
            .collect()
    }

    /// All loops, including draining ones, with their current index.
    pub fn all_loops(&self) -> Vec<EventLoopHandle> {
        self.inner.workers.lock().unwrap().iter().map(|w| w.handle.clone()).collect()
    }

    pub fn get_loop(&self, idx: usize) -> Option<EventLoopHandle> {
        self.inner.workers.lock().unwrap().get(idx).map(|w| w.handle.clone())
    }

    /// Dispatch `task` to the next serviceable loop, round-robin.
    pub fn run_in_next_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        let loops = self.serviceable();
        if loops.is_empty() {
            tracing::warn!(pool = %self.name(), "no serviceable loop to dispatch to");
            return;
        }
        let idx = self.inner.rr_counter.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[idx].queue_in_loop(task);
    }

    /// Dispatch by `hash % serviceable_count`, e.g. for per-connection fd affinity.
    pub fn run_in_loop_by_hash(&self, hash: u64, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        let loops = self.serviceable();
        if loops.is_empty() {
            tracing::warn!(pool = %self.name(), "no serviceable loop to dispatch to");
            return;
        }
        let idx = (hash as usize) % loops.len();
        loops[idx].queue_in_loop(task);
    }

    pub fn run_in_random_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        let loops = self.serviceable();
        if loops.is_empty() {
            tracing::warn!(pool = %self.name(), "no serviceable loop to dispatch to");
            return;
        }
        let idx = (self.next_rand() as usize) % loops.len();
        loops[idx].queue_in_loop(task);
    }

    /// Dispatch to the first serviceable loop for which `pred` returns true.
    /// Returns `false` if no loop matched.
    pub fn run_in_chosen_loop(
        &self,
        pred: impl Fn(usize, &EventLoopHandle) -> bool,
        task: impl FnOnce(&mut EventLoop) + Send + 'static,
    ) -> bool {
        let loops = self.serviceable();
        for (idx, handle) in loops.iter().enumerate() {
            if pred(idx, handle) {
                handle.queue_in_loop(task);
                return true;
            }
        }
        false
    }

    /// Broadcast `cb` to every loop, including draining ones.
    pub fn run_with_all_loops(&self, cb: impl Fn(&mut EventLoop) + Send + Sync + 'static) {
        let cb = Arc::new(cb);
        for handle in self.all_loops() {
            let cb = cb.clone();
            handle.queue_in_loop(move |ev| cb(ev));
        }
    }

    fn next_rand(&self) -> u64 {
        // xorshift64*, seeded once at pool construction — good enough for
        // load-spreading, not for anything security sensitive.
        let mut x = self.inner.rand_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.inner.rand_state.store(x, Ordering::Relaxed);
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Raise the pool's thread count, spawning `n - io_thread_num()` new workers.
    pub fn grow_to(&self, n: usize) -> Result<()> {
        let current = self.io_thread_num();
        if n <= current {
            return Ok(());
        }
        let mut fresh = Vec::with_capacity(n - current);
        for _ in current..n {
            fresh.push(spawn_worker(&self.inner, format!("{}-{}", self.name(), self.inner.next_id.load(Ordering::Relaxed)))?);
        }
        self.inner.workers.lock().unwrap().extend(fresh);
        Ok(())
    }

    /// Stop every loop in the pool, including any still draining, and block
    /// until all of their threads have been joined by the pool's reaper.
    pub fn stop(&self) {
        let handles: Vec<EventLoopHandle> = self.inner.workers.lock().unwrap().iter().map(|w| w.handle.clone()).collect();
        for handle in &handles {
            EventLoop::stop(handle);
        }
        while self.io_thread_num() > 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Lower the pool's thread count to `n`, marking the tail workers
    /// draining. Each drained loop polls `exit_check(idx, loop)` every
    /// [`DRAIN_CHECK_INTERVAL`]; once it returns `true` the loop stops and a
    /// background reaper joins its thread and removes it from the pool.
    pub fn shrink_to(&self, n: usize, exit_check: ExitCheck) {
        let mut workers = self.inner.workers.lock().unwrap();
        let current = workers.len();
        if n >= current {
            return;
        }
        for (idx, worker) in workers.iter_mut().enumerate().skip(n) {
            if worker.draining.swap(true, Ordering::AcqRel) {
                continue; // already draining from a previous shrink call
            }
            let handle = worker.handle.clone();
            let draining_idx = idx;
            let check = exit_check.clone();
            arm_drain_check(&handle, draining_idx, check);
        }
    }
}

fn arm_drain_check(handle: &EventLoopHandle, idx: usize, exit_check: ExitCheck) {
    let timer_cell: Arc<Mutex<Option<crate::timer::TimerId>>> = Arc::new(Mutex::new(None));
    let cell_for_cb = timer_cell.clone();
    let handle_for_cb = handle.clone();
    let id = handle.run_every_timer(DRAIN_CHECK_INTERVAL, move || {
        if exit_check(idx, &handle_for_cb) {
            if let Some(tid) = cell_for_cb.lock().unwrap().take() {
                handle_for_cb.cancel_timer(tid);
            }
            EventLoop::stop(&handle_for_cb);
        }
    });
    *timer_cell.lock().unwrap() = Some(id);
}

fn spawn_worker(inner: &Arc<Inner>, name: String) -> Result<Worker> {
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    let (ready_tx, ready_rx) = mpsc::channel();
    let retired_tx = inner.retired_tx.clone();
    let thread_name = name.clone();
    let join = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let mut ev = match EventLoop::new(name.clone()) {
                Ok(ev) => ev,
                Err(e) => {
                    tracing::error!(error = %e, loop_name = %name, "failed to create event loop");
                    return;
                }
            };
            let _ = ready_tx.send(ev.handle());
            ev.run();
            let _ = retired_tx.send(id);
        })
        .map_err(|e| Error::concurrency(format!("failed to spawn event loop thread: {e}")))?;

    let handle = ready_rx
        .recv()
        .map_err(|_| Error::concurrency("event loop thread exited before reporting ready"))?;

    Ok(Worker { id, handle, join: Some(join), draining: Arc::new(AtomicBool::new(false)) })
}

fn spawn_reaper(inner: Arc<Inner>, retired_rx: mpsc::Receiver<u64>) {
    std::thread::Builder::new()
        .name(format!("{}-reaper", inner.name))
        .spawn(move || {
            while let Ok(id) = retired_rx.recv() {
                let mut workers = inner.workers.lock().unwrap();
                if let Some(pos) = workers.iter().position(|w| w.id == id) {
                    let mut worker = workers.remove(pos);
                    drop(workers);
                    if let Some(join) = worker.join.take() {
                        let _ = join.join();
                    }
                }
            }
        })
        .expect("failed to spawn pool reaper thread");
}

fn seed() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0x9E3779B97F4A7C15) | 1
}
