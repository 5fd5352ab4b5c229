//! A dedicated thread that runs submitted tasks as stackful coroutines
//! (`corosensei`), so task code can call [`yield_now`] to cooperatively
//! suspend back to the driver without blocking the thread.
//!
//! The driver pulls work from a bounded FIFO queue and round-robins among
//! every live coroutine, resuming each once per pass. A per-worker ordered
//! index of coroutine start times supports "what's the oldest still-running
//! coroutine" liveness probes without scanning every live coroutine.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use corosensei::{Coroutine, CoroutineResult, Yielder};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use crate::error::{Error, Result};

pub type CoroutineId = u64;
pub type Task = Box<dyn FnOnce() + Send>;
pub type IdleHook = Box<dyn FnMut() + Send>;

/// How stacks are allocated across concurrently-live coroutines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackMode {
    /// Each coroutine gets its own stack; the driver round-robins freely
    /// among every live coroutine, interleaving their execution.
    Private,
    /// All tasks share a single stack. Since a stack can only back one
    /// live (started-but-not-returned) coroutine at a time, the driver
    /// runs tasks to completion one at a time in this mode rather than
    /// interleaving them — matching `corosensei`'s single-active-coroutine-
    /// per-stack model.
    Shared,
}

#[derive(Debug, Clone)]
pub struct CoroutineWorkerConfig {
    pub name: String,
    /// Capacity of the task submission queue.
    pub queue_capacity: usize,
    /// How long the driver sleeps between ticks when no coroutine is live.
    pub idle_sleep: Duration,
    /// Soft cap on simultaneously live coroutines (`Private` mode only —
    /// `Shared` mode is implicitly capped at 1). See module docs and
    /// `DESIGN.md` for why this is a soft limit, not preemptive.
    pub max_coroutines: Option<usize>,
    pub stack_mode: StackMode,
}

impl Default for CoroutineWorkerConfig {
    fn default() -> Self {
        Self {
            name: "netreactor-coroutine".to_string(),
            queue_capacity: 1024,
            idle_sleep: Duration::from_millis(10),
            max_coroutines: None,
            stack_mode: StackMode::Private,
        }
    }
}

thread_local! {
    static CURRENT_YIELDER: Cell<*const Yielder<(), ()>> = Cell::new(std::ptr::null());
}

/// Suspend the currently running coroutine back to the worker's driver,
/// which will resume it on a later pass. Panics if called from anywhere
/// other than inside a task running on a [`CoroutineWorker`]'s thread.
///
/// Implementation note: the thread-local yielder pointer is restored
/// immediately after waking, undoing whatever a different, interleaved
/// coroutine's own `yield_now` left behind — this is what lets a single
/// OS thread host many independently-suspendable coroutines.
pub fn yield_now() {
    let ptr = CURRENT_YIELDER.with(|cell| cell.get());
    assert!(!ptr.is_null(), "yield_now() called outside a coroutine worker's stack");
    // SAFETY: ptr was set from a live `&Yielder` at the top of this
    // coroutine's entry closure, and remains valid for the coroutine's
    // entire execution (including across suspend/resume) per corosensei's
    // contract; it only dangles once the coroutine has returned, at which
    // point its entry closure — the only place that could call us — has
    // already exited.
    unsafe { (*ptr).suspend(()) };
    CURRENT_YIELDER.with(|cell| cell.set(ptr));
}

#[derive(Default)]
struct StartTimeIndex {
    by_time: BTreeMap<Instant, HashSet<CoroutineId>>,
    by_id: HashMap<CoroutineId, Instant>,
}

impl StartTimeIndex {
    fn insert(&mut self, id: CoroutineId, at: Instant) {
        self.by_time.entry(at).or_default().insert(id);
        self.by_id.insert(id, at);
    }

    fn remove(&mut self, id: CoroutineId) {
        if let Some(at) = self.by_id.remove(&id) {
            if let Some(set) = self.by_time.get_mut(&at) {
                set.remove(&id);
                if set.is_empty() {
                    self.by_time.remove(&at);
                }
            }
        }
    }

    fn oldest(&self) -> Option<Instant> {
        self.by_time.keys().next().copied()
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

struct Shared {
    live_count: AtomicUsize,
    completed: AtomicU64,
    accepting: AtomicBool,
    tracker: Mutex<StartTimeIndex>,
}

/// A dedicated thread running a bounded task queue, each task inside its
/// own stackful coroutine.
pub struct CoroutineWorker {
    task_tx: Sender<Task>,
    shared: Arc<Shared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl CoroutineWorker {
    pub fn start(config: CoroutineWorkerConfig) -> Self {
        Self::start_with_idle_hook(config, None)
    }

    pub fn start_with_idle_hook(config: CoroutineWorkerConfig, idle_hook: Option<IdleHook>) -> Self {
        let (task_tx, task_rx) = channel::bounded(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            live_count: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            tracker: Mutex::new(StartTimeIndex::default()),
        });
        let driver_shared = shared.clone();
        let driver_config = config.clone();
        let join = std::thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || drive(task_rx, driver_shared, driver_config, idle_hook))
            .expect("failed to spawn coroutine worker thread");

        Self { task_tx, shared, join: Mutex::new(Some(join)) }
    }

    /// Enqueue `task`. Blocks if the queue is at capacity. Fails once
    /// [`CoroutineWorker::stop`] has been called.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(Error::concurrency("coroutine worker is no longer accepting tasks"));
        }
        self.task_tx
            .send(Box::new(task))
            .map_err(|_| Error::concurrency("coroutine worker's driver thread has exited"))
    }

    pub fn queue_len(&self) -> usize {
        self.task_tx.len()
    }

    pub fn live_coroutine_count(&self) -> usize {
        self.shared.live_count.load(Ordering::Acquire)
    }

    pub fn completed_count(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Start time of the oldest still-running coroutine, if any — the
    /// common "is anything stuck" liveness probe.
    pub fn oldest_start_time(&self) -> Option<Instant> {
        self.shared.tracker.lock().unwrap().oldest()
    }

    /// Phase one of shutdown: stop accepting new tasks. Does not wait for
    /// in-flight coroutines to finish; see [`CoroutineWorker::stop`].
    pub fn stop_accepting(&self) {
        self.shared.accepting.store(false, Ordering::Release);
    }

    /// Phase two of shutdown: stop accepting new tasks, then block until
    /// the driver has drained its queue and every live coroutine has
    /// returned.
    pub fn stop(self) {
        self.stop_accepting();
        if let Some(join) = self.join.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

fn drive(task_rx: Receiver<Task>, shared: Arc<Shared>, config: CoroutineWorkerConfig, mut idle_hook: Option<IdleHook>) {
    let mut coros: HashMap<CoroutineId, Coroutine<(), (), ()>> = HashMap::new();
    let mut order: VecDeque<CoroutineId> = VecDeque::new();
    let mut next_id: CoroutineId = 1;

    loop {
        let accepting = shared.accepting.load(Ordering::Acquire);
        let at_capacity = match config.stack_mode {
            StackMode::Shared => !coros.is_empty(),
            StackMode::Private => config.max_coroutines.map(|cap| coros.len() >= cap).unwrap_or(false),
        };

        if accepting && !at_capacity {
            match task_rx.try_recv() {
                Ok(task) => spawn_coroutine(&mut coros, &mut order, &mut next_id, &shared, task),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    // All `CoroutineWorker` handles (and their `Sender`s)
                    // are gone; nothing left to submit, proceed to drain.
                }
            }
        }

        if coros.is_empty() {
            if !accepting && task_rx.is_empty() {
                break;
            }
            if let Some(hook) = idle_hook.as_mut() {
                hook();
            }
            std::thread::sleep(config.idle_sleep);
            continue;
        }

        // One round-robin pass: resume every currently-live coroutine
        // once. `Shared` mode only ever has one live coroutine, so this
        // degenerates to "run it until it yields or returns".
        let pass: Vec<CoroutineId> = order.iter().copied().collect();
        for id in pass {
            let Some(co) = coros.get_mut(&id) else { continue };
            match co.resume(()) {
                CoroutineResult::Yield(()) => {
                    // Stays live; its position in `order` already reflects
                    // "runs again next pass".
                }
                CoroutineResult::Return(()) => {
                    coros.remove(&id);
                    order.retain(|&x| x != id);
                    shared.tracker.lock().unwrap().remove(id);
                    shared.live_count.fetch_sub(1, Ordering::AcqRel);
                    shared.completed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

fn spawn_coroutine(
    coros: &mut HashMap<CoroutineId, Coroutine<(), (), ()>>,
    order: &mut VecDeque<CoroutineId>,
    next_id: &mut CoroutineId,
    shared: &Arc<Shared>,
    task: Task,
) {
    let id = *next_id;
    *next_id += 1;

    let co = Coroutine::new(move |yielder: &Yielder<(), ()>, ()| {
        CURRENT_YIELDER.with(|cell| cell.set(yielder as *const _));
        task();
    });

    coros.insert(id, co);
    order.push_back(id);
    shared.tracker.lock().unwrap().insert(id, Instant::now());
    shared.live_count.fetch_add(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[test]
    fn runs_a_simple_task_to_completion() {
        let worker = CoroutineWorker::start(CoroutineWorkerConfig::default());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        worker.submit(move || ran2.store(true, Ordering::SeqCst)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !ran.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ran.load(Ordering::SeqCst));
        worker.stop();
    }

    #[test]
    fn three_yielding_tasks_each_run_to_completion() {
        let worker = CoroutineWorker::start(CoroutineWorkerConfig::default());
        let total = Arc::new(AtomicI64::new(0));

        for count in [10, 20, 30] {
            let total = total.clone();
            worker
                .submit(move || {
                    for _ in 0..count {
                        total.fetch_add(1, Ordering::SeqCst);
                        yield_now();
                    }
                })
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while total.load(Ordering::SeqCst) < 60 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(total.load(Ordering::SeqCst), 60);

        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.live_coroutine_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(worker.live_coroutine_count(), 0);
        assert_eq!(worker.queue_len(), 0);
        assert_eq!(worker.completed_count(), 3);
        worker.stop();
    }

    #[test]
    fn shared_stack_mode_runs_tasks_one_at_a_time() {
        let config = CoroutineWorkerConfig { stack_mode: StackMode::Shared, ..CoroutineWorkerConfig::default() };
        let worker = CoroutineWorker::start(config);
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = order.clone();
            worker
                .submit(move || {
                    order.lock().unwrap().push(n);
                    yield_now();
                    order.lock().unwrap().push(n + 100);
                })
                .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.completed_count() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        let observed = order.lock().unwrap().clone();
        // Each task's two pushes are adjacent: no interleaving between tasks.
        assert_eq!(observed, vec![0, 100, 1, 101, 2, 102]);
        worker.stop();
    }

    #[test]
    fn oldest_start_time_tracks_liveness() {
        let worker = CoroutineWorker::start(CoroutineWorkerConfig::default());
        assert!(worker.oldest_start_time().is_none());

        let unblock = Arc::new(AtomicBool::new(false));
        let unblock2 = unblock.clone();
        worker
            .submit(move || {
                while !unblock2.load(Ordering::SeqCst) {
                    yield_now();
                }
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.oldest_start_time().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.oldest_start_time().is_some());

        unblock.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.live_coroutine_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(worker.oldest_start_time().is_none());
        worker.stop();
    }

    #[test]
    fn stop_drains_remaining_work_before_exiting() {
        let worker = CoroutineWorker::start(CoroutineWorkerConfig::default());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        worker.submit(move || ran2.store(true, Ordering::SeqCst)).unwrap();
        worker.stop();
        assert!(ran.load(Ordering::SeqCst));
    }
}
