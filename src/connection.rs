//! Per-socket full-duplex connection: buffered I/O, high-water-mark
//! backpressure, send-from-any-thread, and cross-loop migration.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::buffer::Buffer;
use crate::channel::{Channel, EventHandler};
use crate::error::is_transient_io;
use crate::event_loop::EventLoopHandle;
use crate::sockets;

/// Input buffers above this size, once fully drained, are freed rather
/// than kept around, to avoid holding onto an oversized allocation for an
/// idle connection.
const INPUT_BUFFER_SHRINK_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Global counter of connections currently mid-[`Connection::move_to_new_loop`],
/// exposed for tests and diagnostics.
pub static IN_FLIGHT_MOVES: AtomicI64 = AtomicI64::new(0);

pub type ConnectionCallback = Box<dyn Fn(&Connection) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(&Connection, &mut Buffer) + Send + Sync>;
pub type WriteCompleteCallback = Box<dyn Fn(&Connection) + Send + Sync>;
pub type HighWaterMarkCallback = Box<dyn Fn(&Connection, usize) + Send + Sync>;
pub type CloseCallback = Box<dyn Fn(&Connection) + Send + Sync>;

struct Callbacks {
    connection: Mutex<Option<ConnectionCallback>>,
    message: Mutex<Option<MessageCallback>>,
    write_complete: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark: Mutex<Option<HighWaterMarkCallback>>,
    close: Mutex<Option<CloseCallback>>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            connection: Mutex::new(None),
            message: Mutex::new(None),
            write_complete: Mutex::new(None),
            high_water_mark: Mutex::new(None),
            close: Mutex::new(None),
        }
    }
}

struct Io {
    fd: RawFd,
    channel: Mutex<Channel>,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
}

/// A live, full-duplex TCP connection. Cheap to clone (`Arc` inside);
/// clones all refer to the same underlying socket and state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state: Mutex<ConnState>,
    /// The connection's current owning loop. `None` while mid
    /// cross-loop migration — this is the "expected loop" truth that
    /// `queue_in_loop_maybe_redir` predicates consult.
    loop_handle: RwLock<Option<EventLoopHandle>>,
    /// The loop to submit cross-thread work to *right now*. Unlike
    /// `loop_handle`, this is never cleared during a migration: it still
    /// points at the old loop, which is guaranteed alive and draining its
    /// own pending queue, so redirected sends/closes always have somewhere
    /// to land even while `loop_handle` is `None`.
    submit_loop: Mutex<Option<EventLoopHandle>>,
    io: Io,
    callbacks: Callbacks,
    high_water_mark: AtomicUsize,
    above_high_water_mark: AtomicBool,
    context: Mutex<Option<Box<dyn std::any::Any + Send + Sync>>>,
    self_weak: std::sync::OnceLock<Weak<Inner>>,
}

impl Connection {
    /// Build a connection over an already-accepted or already-connected fd.
    /// The connection starts in `Connecting` state; call
    /// [`Connection::attached_to_loop`] once to finish construction and
    /// fire the first `connection_callback`.
    pub fn new(fd: RawFd, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let inner = Arc::new(Inner {
            local_addr,
            remote_addr,
            state: Mutex::new(ConnState::Connecting),
            loop_handle: RwLock::new(None),
            submit_loop: Mutex::new(None),
            io: Io {
                fd,
                channel: Mutex::new(Channel::detached(fd)),
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
            },
            callbacks: Callbacks::default(),
            high_water_mark: AtomicUsize::new(64 * 1024 * 1024),
            above_high_water_mark: AtomicBool::new(false),
            context: Mutex::new(None),
            self_weak: std::sync::OnceLock::new(),
        });
        let _ = inner.self_weak.set(Arc::downgrade(&inner));
        Self { inner }
    }

    /// A connection that never actually connected: already `Disconnected`,
    /// with no real fd behind it. `TcpClient` uses this to deliver a
    /// connector failure through the ordinary `connection_callback` path,
    /// via [`Connection::notify_failed`], so user code only has to handle
    /// one notification shape regardless of whether the attempt succeeded.
    pub(crate) fn failed(remote_addr: SocketAddr) -> Self {
        let inner = Arc::new(Inner {
            local_addr: remote_addr,
            remote_addr,
            state: Mutex::new(ConnState::Disconnected),
            loop_handle: RwLock::new(None),
            submit_loop: Mutex::new(None),
            io: Io {
                fd: -1,
                channel: Mutex::new(Channel::detached(-1)),
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
            },
            callbacks: Callbacks::default(),
            high_water_mark: AtomicUsize::new(64 * 1024 * 1024),
            above_high_water_mark: AtomicBool::new(false),
            context: Mutex::new(None),
            self_weak: std::sync::OnceLock::new(),
        });
        let _ = inner.self_weak.set(Arc::downgrade(&inner));
        Self { inner }
    }

    /// Fire the connection_callback once. Only meaningful on a
    /// [`Connection::failed`] placeholder that was never attached to a loop.
    pub(crate) fn notify_failed(&self) {
        self.fire_connection_callback();
    }

    pub fn fd(&self) -> RawFd {
        self.inner.io.fd
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// The loop currently owning this connection, or `None` mid-migration.
    pub fn loop_handle(&self) -> Option<EventLoopHandle> {
        self.inner.loop_handle.read().unwrap().clone()
    }

    /// Where to enqueue cross-thread work right now: the current owning
    /// loop if there is one, otherwise the last loop known to be draining
    /// this connection's pending queue. Only `None` before the connection
    /// has ever been attached to a loop.
    fn submission_target(&self) -> Option<EventLoopHandle> {
        self.loop_handle().or_else(|| self.inner.submit_loop.lock().unwrap().clone())
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.inner.callbacks.connection.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.inner.callbacks.message.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.inner.callbacks.write_complete.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.inner.high_water_mark.store(mark, Ordering::Relaxed);
        *self.inner.callbacks.high_water_mark.lock().unwrap() = Some(cb);
    }

    pub fn set_close_callback(&self, cb: CloseCallback) {
        *self.inner.callbacks.close.lock().unwrap() = Some(cb);
    }

    pub fn set_context<T: std::any::Any + Send + Sync>(&self, value: T) {
        *self.inner.context.lock().unwrap() = Some(Box::new(value));
    }

    pub fn with_context<T: std::any::Any + Send + Sync, R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let guard = self.inner.context.lock().unwrap();
        f(guard.as_ref().and_then(|b| b.downcast_ref::<T>()))
    }

    pub fn output_buffer_len(&self) -> usize {
        self.inner.io.output.lock().unwrap().len()
    }

    /// Attach the connection's channel to `loop_handle`, enable the read
    /// interest, move to `Connected`, and fire the first (of exactly two,
    /// the second on close) `connection_callback` invocation. Must run on
    /// `loop_handle`'s thread.
    pub fn attached_to_loop(&self, loop_handle: EventLoopHandle) {
        debug_assert!(loop_handle.is_in_loop_thread());
        let weak: Weak<dyn EventHandler + Send + Sync> = self.inner.self_weak.get().unwrap().clone();
        {
            let mut channel = self.inner.io.channel.lock().unwrap();
            channel.attach_to_new_loop(loop_handle.clone(), weak).expect("attach to fresh loop cannot fail");
            channel.enable_read().expect("enable_read on freshly attached channel cannot fail");
        }
        *self.inner.loop_handle.write().unwrap() = Some(loop_handle.clone());
        *self.inner.submit_loop.lock().unwrap() = Some(loop_handle);
        *self.inner.state.lock().unwrap() = ConnState::Connected;
        self.fire_connection_callback();
    }

    fn fire_connection_callback(&self) {
        if let Some(cb) = self.inner.callbacks.connection.lock().unwrap().as_ref() {
            cb(self);
        }
    }

    /// Queue `data` for sending. Safe to call from any thread. If called
    /// from a thread other than the owning loop's, the write is redirected
    /// through the pending-task queue with an "expected loop" predicate so
    /// it is never lost across a concurrent [`Connection::move_to_new_loop`].
    pub fn send(&self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        let on_loop_thread = self.loop_handle().map(|h| h.is_in_loop_thread()).unwrap_or(false);
        if on_loop_thread {
            self.send_in_loop(&data);
            return;
        }
        let this = self.clone();
        let expected_this = self.clone();
        let expected: crate::event_loop::ExpectedLoop = Box::new(move || expected_this.loop_handle());
        let task: crate::event_loop::LoopTask = Box::new(move |_ev| this.send_in_loop(&data));

        // Route through whichever loop currently claims ownership; if the
        // connection has no loop right now (migration in flight), fall
        // back to the loop that last owned it, which is guaranteed to
        // still be draining this connection's pending queue and will
        // re-evaluate `expected` once the migration lands. If there has
        // never been an owning loop at all, the send is simply dropped.
        if let Some(target) = self.submission_target() {
            target.queue_in_loop_maybe_redir(Some(expected), task);
        } else {
            tracing::warn!(fd = self.fd(), "send() on a connection with no current loop; dropping");
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        let mut channel = self.inner.io.channel.lock().unwrap();
        let mut output = self.inner.io.output.lock().unwrap();

        let mut remaining: &[u8] = data;
        if !channel.has_writable_event() && output.is_empty() {
            match sockets::write_to_fd(self.fd(), data) {
                Ok(n) if n == data.len() => {
                    drop(output);
                    drop(channel);
                    self.fire_write_complete_if_idle();
                    return;
                }
                Ok(n) => remaining = &data[n..],
                Err(e) if is_transient_io(&e) => {}
                Err(e) => {
                    drop(output);
                    drop(channel);
                    tracing::debug!(fd = self.fd(), error = %e, "send() failed with a hard I/O error");
                    self.force_close();
                    return;
                }
            }
        }

        output.append(remaining);
        let total = output.len();
        if !channel.has_writable_event() {
            let _ = channel.enable_write();
        }
        drop(output);
        drop(channel);
        self.maybe_fire_high_water_mark(total);
    }

    fn maybe_fire_high_water_mark(&self, total_after_write: usize) {
        let mark = self.inner.high_water_mark.load(Ordering::Relaxed);
        if total_after_write >= mark {
            if !self.inner.above_high_water_mark.swap(true, Ordering::AcqRel) {
                if let Some(cb) = self.inner.callbacks.high_water_mark.lock().unwrap().as_ref() {
                    cb(self, total_after_write);
                }
            }
        } else {
            self.inner.above_high_water_mark.store(false, Ordering::Release);
        }
    }

    fn fire_write_complete_if_idle(&self) {
        if self.inner.io.output.lock().unwrap().is_empty() {
            if let Some(cb) = self.inner.callbacks.write_complete.lock().unwrap().as_ref() {
                cb(self);
            }
        }
    }

    fn handle_read_ready(&self) {
        {
            let mut input = self.inner.io.input.lock().unwrap();
            if input.is_empty() && input.capacity() > INPUT_BUFFER_SHRINK_THRESHOLD {
                input.reinit();
            }
        }
        let result = {
            let mut input = self.inner.io.input.lock().unwrap();
            input.read_from_fd(self.fd())
        };
        match result {
            Ok(0) => {
                self.force_close();
            }
            Ok(_n) => {
                let mut input = self.inner.io.input.lock().unwrap();
                if let Some(cb) = self.inner.callbacks.message.lock().unwrap().as_ref() {
                    cb(self, &mut input);
                }
            }
            Err(e) if is_transient_io(&e) => {}
            Err(e) => {
                tracing::debug!(fd = self.fd(), error = %e, "read() failed with a hard I/O error");
                self.force_close();
            }
        }
    }

    fn handle_write_ready(&self) {
        let (result, output_len) = {
            let mut output = self.inner.io.output.lock().unwrap();
            if output.is_empty() {
                return;
            }
            let n = sockets::write_to_fd(self.fd(), output.as_slice());
            if let Ok(n) = n {
                output.skip(n);
            }
            (n, output.len())
        };

        match result {
            Ok(_) if output_len == 0 => {
                {
                    let mut channel = self.inner.io.channel.lock().unwrap();
                    let _ = channel.disable_write();
                }
                self.fire_write_complete_if_idle();
                if self.state() == ConnState::Disconnecting {
                    self.finish_close();
                }
            }
            Ok(_) => {}
            Err(e) if is_transient_io(&e) => {}
            Err(e) => {
                tracing::debug!(fd = self.fd(), error = %e, "write() failed with a hard I/O error");
                self.force_close();
            }
        }
    }

    fn force_close(&self) {
        self.close();
    }

    /// Begin closing the connection. Idempotent: a no-op if already
    /// Disconnecting or Disconnected. Marshals onto the owning loop thread
    /// if necessary via the same redirection machinery as `send`.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if matches!(*state, ConnState::Disconnecting | ConnState::Disconnected) {
                return;
            }
            *state = ConnState::Disconnecting;
        }

        if self.loop_handle().map(|h| h.is_in_loop_thread()).unwrap_or(false) {
            self.finish_close();
            return;
        }

        let this = self.clone();
        let expected_this = self.clone();
        let expected: crate::event_loop::ExpectedLoop = Box::new(move || expected_this.loop_handle());
        let task: crate::event_loop::LoopTask = Box::new(move |_ev| this.finish_close());
        if let Some(target) = self.submission_target() {
            target.queue_in_loop_maybe_redir(Some(expected), task);
        } else {
            // Never attached to any loop at all; nothing is draining a
            // pending queue for this connection, so there is no thread
            // confinement to honor yet.
            self.finish_close();
        }
    }

    fn finish_close(&self) {
        {
            let mut channel = self.inner.io.channel.lock().unwrap();
            channel.close_event();
        }
        sockets::close_socket(self.fd());
        *self.inner.state.lock().unwrap() = ConnState::Disconnected;
        self.fire_connection_callback();
        if let Some(cb) = self.inner.callbacks.close.lock().unwrap().as_ref() {
            cb(self);
        }
    }

    /// Detach this connection's channel from its current loop and
    /// re-attach it to `new_loop`, preserving delivery order for any
    /// in-flight `send()`s. Only valid while `Connected`.
    pub fn move_to_new_loop(
        &self,
        new_loop: EventLoopHandle,
        success_cb: impl FnOnce(&Connection) + Send + 'static,
        fail_cb: impl FnOnce(&Connection) + Send + 'static,
    ) {
        if self.state() != ConnState::Connected {
            fail_cb(self);
            return;
        }
        debug_assert!(self.loop_handle().map(|h| h.is_in_loop_thread()).unwrap_or(false));

        {
            let mut channel = self.inner.io.channel.lock().unwrap();
            channel.detach_from_loop_and_reset();
        }
        // `loop_handle` goes to `None` for the duration of the migration,
        // but `submit_loop` still points at the old loop so `send`/`close`
        // called in this window still have somewhere to land.
        *self.inner.loop_handle.write().unwrap() = None;
        IN_FLIGHT_MOVES.fetch_add(1, Ordering::SeqCst);

        let this = self.clone();
        let target = new_loop.clone();
        new_loop.queue_in_loop(move |_ev| {
            if this.state() != ConnState::Connected {
                IN_FLIGHT_MOVES.fetch_sub(1, Ordering::SeqCst);
                fail_cb(&this);
                return;
            }
            let weak: Weak<dyn EventHandler + Send + Sync> = this.inner.self_weak.get().unwrap().clone();
            let attached = {
                let mut channel = this.inner.io.channel.lock().unwrap();
                channel.attach_to_new_loop(target.clone(), weak).and_then(|_| channel.enable_read())
            };
            if attached.is_err() {
                IN_FLIGHT_MOVES.fetch_sub(1, Ordering::SeqCst);
                fail_cb(&this);
                return;
            }
            *this.inner.loop_handle.write().unwrap() = Some(target.clone());
            *this.inner.submit_loop.lock().unwrap() = Some(target.clone());
            IN_FLIGHT_MOVES.fetch_sub(1, Ordering::SeqCst);
            success_cb(&this);
        });
    }
}

impl EventHandler for Inner {
    fn handle_read(&self, _loop_handle: &EventLoopHandle) {
        if let Some(strong) = self.self_weak.get().and_then(Weak::upgrade) {
            Connection { inner: strong }.handle_read_ready();
        }
    }

    fn handle_write(&self, _loop_handle: &EventLoopHandle) {
        if let Some(strong) = self.self_weak.get().and_then(Weak::upgrade) {
            Connection { inner: strong }.handle_write_ready();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn connected_pair() -> (RawFd, std::net::TcpStream, SocketAddr, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let local = server.local_addr().unwrap();
        (sockets::into_raw_fd(socket2::Socket::from(server)), client, local, peer)
    }

    #[test]
    fn echoes_data_back_to_peer() {
        let mut ev = EventLoop::new("connection-test").unwrap();
        let handle = ev.handle();
        let stop_handle = handle.clone();

        let (fd, mut client, local, peer) = connected_pair();
        let conn = Connection::new(fd, local, peer);
        let echo_conn = conn.clone();
        conn.set_message_callback(Box::new(move |c, buf| {
            let data = buf.as_slice().to_vec();
            buf.skip(data.len());
            c.send(data);
        }));
        conn.set_write_complete_callback(Box::new(move |_c| {
            EventLoop::stop(&stop_handle);
        }));

        let attach_conn = conn.clone();
        let handle_for_attach = handle.clone();
        handle.run_in_loop(move |_| attach_conn.attached_to_loop(handle_for_attach));

        client.write_all(b"ping").unwrap();

        let client_thread = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            client.read_exact(&mut buf).unwrap();
            buf
        });

        ev.run();
        let received = client_thread.join().unwrap();
        assert_eq!(&received, b"ping");
        let _ = echo_conn;
    }

    #[test]
    fn move_to_new_loop_preserves_delivery() {
        let mut old_ev = EventLoop::new("connection-move-old").unwrap();
        let old_handle = old_ev.handle();
        let mut new_ev = EventLoop::new("connection-move-new").unwrap();
        let new_handle = new_ev.handle();

        let (fd, mut client, local, peer) = connected_pair();
        let conn = Connection::new(fd, local, peer);
        let moved = Arc::new(AtomicBool::new(false));
        let moved2 = moved.clone();

        let attach_conn = conn.clone();
        let old_handle_for_attach = old_handle.clone();
        old_handle.run_in_loop(move |_| attach_conn.attached_to_loop(old_handle_for_attach));

        // Drive the old loop briefly so the attach completes, then migrate
        // the connection and drive the new loop to pick it up.
        let conn_for_move = conn.clone();
        let new_handle_for_move = new_handle.clone();
        let stop_old = old_handle.clone();
        old_handle.run_after_timer(Duration::from_millis(20), move || {
            conn_for_move.move_to_new_loop(
                new_handle_for_move.clone(),
                move |_c| moved2.store(true, Ordering::SeqCst),
                |_c| panic!("migration should not fail"),
            );
            EventLoop::stop(&stop_old);
        });
        old_ev.run();

        let stop_new = new_handle.clone();
        new_handle.run_after_timer(Duration::from_millis(100), move || EventLoop::stop(&stop_new));
        new_ev.run();

        assert!(moved.load(Ordering::SeqCst));
        assert_eq!(conn.loop_handle().map(|h| h.name().to_string()), Some("connection-move-new".to_string()));

        conn.close();
        drop(client);
    }
}
