//! The single-threaded reactor. One [`EventLoop`] runs on exactly one OS
//! thread; other threads interact with it only through its cloneable
//! [`EventLoopHandle`], which marshals work onto the loop thread via a
//! pending-task queue and a pair of `mio::Waker`s.

use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Registry, Token, Waker};

use crate::channel::{dispatch_read, dispatch_write, HandlerRef};
use crate::error::{Error, Result};
use crate::observability::LoopStats;
use crate::timer::{TimerCallback, TimerId, TimerRegistry};

const WAKE_TOKEN: Token = Token(0);
const PENDING_TOKEN: Token = Token(1);
const FIRST_DYNAMIC_TOKEN: usize = 2;

/// Default `Poll::poll` timeout when no timer is scheduled, so the loop
/// still wakes periodically to notice e.g. a `stop()` race with no other
/// pending I/O.
const IDLE_POLL_TIMEOUT: Duration = Duration::from_secs(1);

pub type ExpectedLoop = Box<dyn Fn() -> Option<EventLoopHandle> + Send + Sync>;
pub type LoopTask = Box<dyn FnOnce(&mut EventLoop) + Send>;

struct PendingEntry {
    expected: Option<ExpectedLoop>,
    task: LoopTask,
}

/// Thread-safe handle to a loop's shared state. Cheap to clone (`Arc`
/// inside); this is what connections, acceptors, and foreign threads hold
/// on to.
#[derive(Clone)]
pub struct EventLoopHandle(pub(crate) Arc<Shared>);

pub(crate) struct Shared {
    name: String,
    registry: Registry,
    wake_waker: Waker,
    pending_waker: Waker,
    wake_notified: AtomicBool,
    pending_notified: AtomicBool,
    pending: Mutex<VecDeque<PendingEntry>>,
    next_timer_id: AtomicU64,
    timer_ops: Mutex<VecDeque<TimerOp>>,
    next_token: AtomicUsize,
    handlers: Mutex<std::collections::HashMap<Token, HandlerRef>>,
    thread_id: Mutex<Option<ThreadId>>,
    stopped: AtomicBool,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    stats: LoopStats,
}

enum TimerOp {
    Schedule { id: TimerId, deadline: Instant, period: Option<Duration>, callback: TimerCallback },
    Cancel(TimerId),
}

impl EventLoopHandle {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.0.registry
    }

    pub fn is_in_loop_thread(&self) -> bool {
        match *self.0.thread_id.lock().unwrap() {
            Some(tid) => tid == std::thread::current().id(),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.0.stopped.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &LoopStats {
        &self.0.stats
    }

    pub(crate) fn alloc_token(&self) -> Token {
        Token(self.0.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register_handler(&self, token: Token, handler: HandlerRef) {
        self.0.handlers.lock().unwrap().insert(token, handler);
    }

    pub(crate) fn unregister_handler(&self, token: Token) {
        self.0.handlers.lock().unwrap().remove(&token);
    }

    /// Run `task` immediately if called from the loop thread, otherwise
    /// enqueue it for the next drain.
    pub fn run_in_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.run_in_loop_maybe_redir(None, Box::new(task));
    }

    pub fn queue_in_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.queue_in_loop_maybe_redir(None, Box::new(task));
    }

    pub(crate) fn run_in_loop_maybe_redir(&self, expected: Option<ExpectedLoop>, task: LoopTask) {
        if self.is_in_loop_thread() {
            CURRENT_LOOP.with(|cell| {
                let ptr = cell.get();
                debug_assert!(!ptr.is_null());
                // SAFETY: ptr is only ever set while this thread is inside
                // EventLoop::run, which is the only caller of run_in_loop
                // from the loop thread itself.
                let loop_ref = unsafe { &mut *ptr };
                task(loop_ref);
            });
        } else {
            self.queue_in_loop_maybe_redir(expected, task);
        }
    }

    pub(crate) fn queue_in_loop_maybe_redir(&self, expected: Option<ExpectedLoop>, task: LoopTask) {
        {
            let mut pending = self.0.pending.lock().unwrap();
            pending.push_back(PendingEntry { expected, task });
        }
        self.notify_pending();
    }

    fn notify_pending(&self) {
        if self
            .0
            .pending_notified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.0.pending_waker.wake();
        }
    }

    pub fn wake_up(&self) {
        if self
            .0
            .wake_notified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.0.wake_waker.wake();
        }
    }

    /// Schedule a one-shot timer. Safe to call from any thread: the id is
    /// allocated immediately; the actual heap insertion is marshaled onto
    /// the loop thread.
    pub fn run_after_timer(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule_timer(delay, None, Box::new(callback))
    }

    pub fn run_every_timer(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule_timer(interval, Some(interval), Box::new(callback))
    }

    fn schedule_timer(&self, delay: Duration, period: Option<Duration>, callback: TimerCallback) -> TimerId {
        let id = self.0.next_timer_id.fetch_add(1, Ordering::Relaxed).max(1);
        let deadline = Instant::now() + delay;
        self.0.timer_ops.lock().unwrap().push_back(TimerOp::Schedule { id, deadline, period, callback });
        self.wake_up();
        id
    }

    /// Idempotent; a stale or unknown id is a no-op.
    pub fn cancel_timer(&self, id: TimerId) {
        if id == 0 {
            return;
        }
        self.0.timer_ops.lock().unwrap().push_back(TimerOp::Cancel(id));
        self.wake_up();
    }

    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.0.context.lock().unwrap() = Some(Box::new(value));
    }

    pub fn with_context<T: Any + Send, R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let guard = self.0.context.lock().unwrap();
        f(guard.as_ref().and_then(|b| b.downcast_ref::<T>()))
    }
}

impl PartialEq for EventLoopHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for EventLoopHandle {}

thread_local! {
    static CURRENT_LOOP: Cell<*mut EventLoop> = Cell::new(std::ptr::null_mut());
}

/// The reactor itself. Only [`EventLoop::run`] may execute on the owning
/// thread; everything else goes through [`EventLoopHandle`].
pub struct EventLoop {
    handle: EventLoopHandle,
    poll: Poll,
    events: Events,
    timers: TimerRegistry,
    before_sleep: Option<Box<dyn FnMut() + Send>>,
    after_sleep: Option<Box<dyn FnMut() + Send>>,
}

impl EventLoop {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let poll = Poll::new()?;
        let wake_waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let pending_waker = Waker::new(poll.registry(), PENDING_TOKEN)?;
        let registry = poll.registry().try_clone()?;

        let shared = Arc::new(Shared {
            name: name.into(),
            registry,
            wake_waker,
            pending_waker,
            wake_notified: AtomicBool::new(false),
            pending_notified: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            next_timer_id: AtomicU64::new(1),
            timer_ops: Mutex::new(VecDeque::new()),
            next_token: AtomicUsize::new(FIRST_DYNAMIC_TOKEN),
            handlers: Mutex::new(std::collections::HashMap::new()),
            thread_id: Mutex::new(None),
            stopped: AtomicBool::new(false),
            context: Mutex::new(None),
            stats: LoopStats::new(),
        });

        Ok(Self {
            handle: EventLoopHandle(shared),
            poll,
            events: Events::with_capacity(1024),
            timers: TimerRegistry::new(),
            before_sleep: None,
            after_sleep: None,
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    pub fn set_before_sleep(&mut self, f: impl FnMut() + Send + 'static) {
        self.before_sleep = Some(Box::new(f));
    }

    pub fn set_after_sleep(&mut self, f: impl FnMut() + Send + 'static) {
        self.after_sleep = Some(Box::new(f));
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Blocks the calling thread, running the reactor until [`EventLoopHandle::is_running`]
    /// becomes false (via [`EventLoop::stop`] or an external `stop()` call
    /// that reaches this loop's `stopped` flag).
    pub fn run(&mut self) {
        *self.handle.0.thread_id.lock().unwrap() = Some(std::thread::current().id());
        CURRENT_LOOP.with(|cell| cell.set(self as *mut EventLoop));

        while !self.handle.0.stopped.load(Ordering::Acquire) {
            let now = Instant::now();
            let timeout = self.timers.next_timeout(now).unwrap_or(IDLE_POLL_TIMEOUT).min(IDLE_POLL_TIMEOUT);

            if let Some(cb) = self.before_sleep.as_mut() {
                cb();
            }
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    tracing::error!(error = %e, loop_name = %self.handle.name(), "poll failed");
                }
            }
            if let Some(cb) = self.after_sleep.as_mut() {
                cb();
            }

            self.handle.0.stats.iterations.fetch_add(1, Ordering::Relaxed);

            let mut ready_tokens: Vec<(Token, bool, bool)> = Vec::new();
            for event in self.events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    self.handle.0.wake_notified.store(false, Ordering::Release);
                    continue;
                }
                if token == PENDING_TOKEN {
                    self.handle.0.pending_notified.store(false, Ordering::Release);
                    continue;
                }
                ready_tokens.push((token, event.is_readable(), event.is_writable()));
            }

            for (token, readable, writable) in ready_tokens {
                let handler = self.handle.0.handlers.lock().unwrap().get(&token).cloned();
                if let Some(handler) = handler {
                    self.handle.0.stats.events_dispatched.fetch_add(1, Ordering::Relaxed);
                    if readable {
                        dispatch_read(&handler, &self.handle);
                    }
                    if writable {
                        dispatch_write(&handler, &self.handle);
                    }
                }
            }

            self.apply_timer_ops();
            self.timers.fire_expired(Instant::now());

            self.do_pending_functors();
        }

        CURRENT_LOOP.with(|cell| cell.set(std::ptr::null_mut()));
    }

    fn apply_timer_ops(&mut self) {
        let ops: Vec<TimerOp> = {
            let mut guard = self.handle.0.timer_ops.lock().unwrap();
            guard.drain(..).collect()
        };
        for op in ops {
            match op {
                TimerOp::Schedule { id, deadline, period, callback } => {
                    self.timers.schedule(id, deadline, period, callback);
                }
                TimerOp::Cancel(id) => self.timers.cancel(id),
            }
        }
    }

    fn do_pending_functors(&mut self) {
        let batch: VecDeque<PendingEntry> = {
            let mut pending = self.handle.0.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };

        let mut requeue_needed = false;
        for entry in batch {
            match entry.expected {
                None => {
                    self.handle.0.stats.pending_tasks_run.fetch_add(1, Ordering::Relaxed);
                    (entry.task)(self);
                }
                Some(predicate) => match predicate() {
                    None => {
                        // Target loop not yet known (e.g. mid-migration) — try again later.
                        self.handle.0.pending.lock().unwrap().push_back(PendingEntry {
                            expected: Some(predicate),
                            task: entry.task,
                        });
                        requeue_needed = true;
                    }
                    Some(target) if target == self.handle => {
                        self.handle.0.stats.pending_tasks_run.fetch_add(1, Ordering::Relaxed);
                        (entry.task)(self);
                    }
                    Some(target) => {
                        target.queue_in_loop_maybe_redir(None, entry.task);
                    }
                },
            }
        }
        if requeue_needed {
            self.handle.notify_pending();
        }
    }

    /// Request that the loop exit after completing its current iteration.
    /// Thread-safe.
    pub fn stop(handle: &EventLoopHandle) {
        handle.0.stopped.store(true, Ordering::Release);
        handle.wake_up();
    }
}

pub type ExpectedLoopFn = ExpectedLoop;
