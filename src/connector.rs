//! Non-blocking outbound connect with a timeout timer and exponential
//! backoff retries, bounded by a maximum delay.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use socket2::Socket;

use crate::channel::{Channel, EventHandler};
use crate::error::{Error, Result};
use crate::event_loop::EventLoopHandle;
use crate::sockets;
use crate::timer::TimerId;

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// `fd < 0` (specifically `-1`) is the sentinel for "connect failed and
/// retries are exhausted or disabled", matching the C original's contract.
pub const FAILURE_FD: RawFd = -1;

pub type NewConnectionCallback = Box<dyn Fn(RawFd, SocketAddr, SocketAddr, bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

struct Attempt {
    socket: Socket,
    channel: Channel,
    timeout_timer: TimerId,
}

struct Shared {
    loop_handle: EventLoopHandle,
    remote_addr: SocketAddr,
    connecting_timeout: Duration,
    is_tls: bool,
    state: Mutex<ConnectorState>,
    attempt: Mutex<Option<Attempt>>,
    retry_delay: Mutex<Duration>,
    retry_enabled: std::sync::atomic::AtomicBool,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
    /// Set once, right after construction, so event callbacks (which only
    /// receive `&self`) can recover a strong `Arc` to pass to the free
    /// functions that schedule further timers/retries.
    self_weak: std::sync::OnceLock<Weak<Shared>>,
}

/// Reusable outbound connector. One [`Connector`] drives one logical
/// destination; `start` may be called again after a terminal failure to
/// retry manually, and retries are also scheduled automatically when
/// `retry` is enabled.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Shared>,
}

impl Connector {
    pub fn new(loop_handle: EventLoopHandle, remote_addr: SocketAddr, connecting_timeout: Duration, retry: bool) -> Result<Self> {
        Self::with_scheme(loop_handle, remote_addr, connecting_timeout, retry, false)
    }

    pub fn with_scheme(
        loop_handle: EventLoopHandle,
        remote_addr: SocketAddr,
        connecting_timeout: Duration,
        retry: bool,
        is_tls: bool,
    ) -> Result<Self> {
        let inner = Arc::new(Shared {
            loop_handle,
            remote_addr,
            connecting_timeout,
            is_tls,
            state: Mutex::new(ConnectorState::Disconnected),
            attempt: Mutex::new(None),
            retry_delay: Mutex::new(INITIAL_RETRY_DELAY),
            retry_enabled: std::sync::atomic::AtomicBool::new(retry),
            new_connection_callback: Mutex::new(None),
            self_weak: std::sync::OnceLock::new(),
        });
        let _ = inner.self_weak.set(Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.inner.new_connection_callback.lock().unwrap() = Some(cb);
    }

    pub fn state(&self) -> ConnectorState {
        *self.inner.state.lock().unwrap()
    }

    pub fn set_retry(&self, retry: bool) {
        self.inner.retry_enabled.store(retry, std::sync::atomic::Ordering::Relaxed);
    }

    /// Begin (or re-begin) connecting. Thread-safe: marshals onto the loop
    /// thread if called from elsewhere. Fails synchronously for a
    /// zero-address destination.
    pub fn start(&self) -> Result<()> {
        if sockets::is_zero_address(&self.inner.remote_addr) {
            return Err(Error::config(format!("connector target '{}' is the zero address", self.inner.remote_addr)));
        }
        *self.inner.retry_delay.lock().unwrap() = INITIAL_RETRY_DELAY;
        let inner = self.inner.clone();
        self.inner.loop_handle.run_in_loop(move |_ev| start_in_loop(&inner));
        Ok(())
    }

    /// Tear down any in-flight attempt and stop retrying.
    pub fn cancel(&self) {
        self.inner.retry_enabled.store(false, std::sync::atomic::Ordering::Relaxed);
        let inner = self.inner.clone();
        self.inner.loop_handle.run_in_loop(move |_ev| {
            teardown_attempt(&inner);
            *inner.state.lock().unwrap() = ConnectorState::Disconnected;
        });
    }
}

fn start_in_loop(inner: &Arc<Shared>) {
    debug_assert!(inner.loop_handle.is_in_loop_thread());
    *inner.state.lock().unwrap() = ConnectorState::Connecting;

    let socket = match sockets::create_nonblocking_socket(&inner.remote_addr) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, remote = %inner.remote_addr, "failed to create outbound socket");
            fail(inner, e.into());
            return;
        }
    };

    if let Err(e) = sockets::connect_socket(&socket, &inner.remote_addr) {
        tracing::warn!(error = %e, remote = %inner.remote_addr, "connect() failed synchronously");
        fail(inner, e.into());
        return;
    }

    let fd = sockets::as_raw_fd(&socket);
    let weak: Weak<dyn EventHandler + Send + Sync> = Arc::downgrade(inner);
    let mut channel = Channel::new(inner.loop_handle.clone(), fd, weak);
    if let Err(e) = channel.enable_write() {
        fail(inner, e);
        return;
    }

    let timeout_inner = inner.clone();
    let timeout_timer = inner.loop_handle.run_after_timer(inner.connecting_timeout, move || {
        on_timeout(&timeout_inner);
    });

    *inner.attempt.lock().unwrap() = Some(Attempt { socket, channel, timeout_timer });
}

fn on_writable(inner: &Arc<Shared>) {
    let fd = {
        let attempt = inner.attempt.lock().unwrap();
        match attempt.as_ref() {
            Some(a) => sockets::as_raw_fd(&a.socket),
            None => return, // attempt already torn down (race with timeout)
        }
    };

    let errno = match sockets::socket_error_code(fd) {
        Ok(e) => e,
        Err(e) => {
            teardown_attempt(inner);
            fail(inner, e.into());
            return;
        }
    };

    if errno == 0 {
        let local = sockets::local_addr(fd).unwrap_or(inner.remote_addr);
        let socket = {
            let mut a = inner.attempt.lock().unwrap().take().expect("attempt present on success path");
            inner.loop_handle.cancel_timer(a.timeout_timer);
            a.channel.close_event();
            a.socket
        };
        let fd = sockets::into_raw_fd(socket);
        *inner.state.lock().unwrap() = ConnectorState::Disconnected;
        if let Some(cb) = inner.new_connection_callback.lock().unwrap().as_ref() {
            cb(fd, local, inner.remote_addr, inner.is_tls);
        } else {
            sockets::close_socket(fd);
        }
    } else {
        let err = std::io::Error::from_raw_os_error(errno);
        teardown_attempt(inner);
        tracing::debug!(error = %err, remote = %inner.remote_addr, "outbound connect failed");
        fail(inner, Error::network(err.to_string()));
    }
}

fn on_timeout(inner: &Arc<Shared>) {
    if inner.attempt.lock().unwrap().is_none() {
        return; // already resolved
    }
    teardown_attempt(inner);
    tracing::debug!(remote = %inner.remote_addr, "outbound connect timed out");
    fail(inner, Error::network("connect timed out (ETIMEDOUT)"));
}

fn fail(inner: &Arc<Shared>, err: Error) {
    *inner.state.lock().unwrap() = ConnectorState::Disconnected;
    let refused = matches!(&err, Error::Network { message } if message.contains("Connection refused"));
    if refused || !inner.retry_enabled.load(std::sync::atomic::Ordering::Relaxed) {
        if let Some(cb) = inner.new_connection_callback.lock().unwrap().as_ref() {
            cb(FAILURE_FD, inner.remote_addr, inner.remote_addr, inner.is_tls);
        }
        return;
    }

    let delay = {
        let mut d = inner.retry_delay.lock().unwrap();
        let current = *d;
        *d = (current * 2).min(MAX_RETRY_DELAY);
        current
    };
    tracing::debug!(remote = %inner.remote_addr, delay_ms = delay.as_millis(), "scheduling connect retry");
    let retry_inner = inner.clone();
    inner.loop_handle.run_after_timer(delay, move || {
        if retry_inner.retry_enabled.load(std::sync::atomic::Ordering::Relaxed) {
            start_in_loop(&retry_inner);
        }
    });
}

fn teardown_attempt(inner: &Arc<Shared>) {
    if let Some(mut attempt) = inner.attempt.lock().unwrap().take() {
        inner.loop_handle.cancel_timer(attempt.timeout_timer);
        attempt.channel.close_event();
        // `attempt.socket`'s `Drop` impl closes the underlying fd.
    }
}

impl EventHandler for Shared {
    fn handle_read(&self, _loop_handle: &EventLoopHandle) {
        debug_assert!(false, "connector channel never enables the read interest");
    }

    fn handle_write(&self, _loop_handle: &EventLoopHandle) {
        if let Some(strong) = self.self_weak.get().and_then(Weak::upgrade) {
            on_writable(&strong);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::time::Duration;

    #[test]
    fn zero_address_fails_synchronously() {
        let mut ev = EventLoop::new("connector-test").unwrap();
        let handle = ev.handle();
        let zero: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let connector = Connector::new(handle, zero, Duration::from_secs(1), false).unwrap();
        assert!(connector.start().is_err());
        let _ = ev;
    }

    #[test]
    fn connects_to_a_listening_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = listener.accept();
            std::thread::sleep(Duration::from_millis(200));
        });

        let mut ev = EventLoop::new("connector-test2").unwrap();
        let handle = ev.handle();
        let stop_handle = handle.clone();
        let connector = Connector::new(handle, addr, Duration::from_secs(2), false).unwrap();
        let result_fd = Arc::new(AtomicI32::new(i32::MIN));
        let result_fd2 = result_fd.clone();
        connector.set_new_connection_callback(Box::new(move |fd, _local, _remote, _tls| {
            result_fd2.store(fd, Ordering::SeqCst);
            if fd >= 0 {
                crate::sockets::close_socket(fd);
            }
            EventLoop::stop(&stop_handle);
        }));
        connector.start().unwrap();
        ev.run();
        assert!(result_fd.load(Ordering::SeqCst) >= 0);
    }
}
