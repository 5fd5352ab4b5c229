//! Non-blocking listener for one endpoint. Converts `accept()` results into
//! `(fd, local_addr, remote_addr, is_tls)` callbacks; never does anything
//! about the accepted fd's ownership beyond handing it to the callback.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use socket2::Socket;

use crate::channel::{Channel, EventHandler};
use crate::error::{Error, Result};
use crate::event_loop::EventLoopHandle;
use crate::sockets::{self, Scheme};

pub type NewConnectionCallback = Box<dyn Fn(RawFd, SocketAddr, SocketAddr, bool) + Send + Sync>;

struct Inner {
    loop_handle: EventLoopHandle,
    listen_socket: Socket,
    local_addr: SocketAddr,
    is_tls: bool,
    channel: Mutex<Option<Channel>>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
}

/// Listens on a single `tcp://` or `tls://` endpoint and dispatches accepted
/// sockets to a user callback. Does not itself choose which worker loop the
/// accepted connection ends up on — that is [`crate::server::TcpServer`]'s job.
#[derive(Clone)]
pub struct Acceptor {
    inner: Arc<Inner>,
}

impl Acceptor {
    /// Bind and listen on `endpoint` (`tcp://host:port`, `tls://host:port`,
    /// a bare `host:port` defaulting to plain, or bracketed-IPv6 variants).
    /// Port `0` binds to an ephemeral port; retrieve the real one via
    /// [`Acceptor::local_addr`]. Callers that must require an explicit
    /// scheme (e.g. [`crate::server::TcpServer`]) validate that themselves
    /// before calling in.
    pub fn listen(loop_handle: EventLoopHandle, endpoint: &str) -> Result<Self> {
        let parsed = sockets::parse_endpoint(endpoint)?;
        let is_tls = parsed.scheme == Scheme::Tls;

        let socket = sockets::create_nonblocking_socket(&parsed.addr)?;
        sockets::set_reuse_addr(&socket)?;
        sockets::bind_socket(&socket, &parsed.addr)?;
        sockets::listen_socket(&socket, libc::SOMAXCONN)?;
        let local_addr = socket.local_addr()?.as_socket().ok_or_else(|| Error::other("listener bound to non-IP address"))?;

        Ok(Self {
            inner: Arc::new(Inner {
                loop_handle,
                listen_socket: socket,
                local_addr,
                is_tls,
                channel: Mutex::new(None),
                new_connection_callback: Mutex::new(None),
                listening: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.inner.is_tls
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.inner.new_connection_callback.lock().unwrap() = Some(cb);
    }

    /// Attach a read-readiness channel and begin accepting. Must be called
    /// on `loop_handle`'s thread.
    pub fn start_accept(&self) -> Result<()> {
        debug_assert!(self.inner.loop_handle.is_in_loop_thread());
        let fd = sockets::as_raw_fd(&self.inner.listen_socket);
        let weak: std::sync::Weak<dyn EventHandler + Send + Sync> = Arc::downgrade(&self.inner);
        let mut channel = Channel::new(self.inner.loop_handle.clone(), fd, weak);
        channel.enable_read()?;
        *self.inner.channel.lock().unwrap() = Some(channel);
        self.inner.listening.store(true, Ordering::Release);
        Ok(())
    }

    /// Schedule the listening channel's close on the owning loop thread.
    /// Idempotent.
    pub fn stop(&self) {
        let inner = self.inner.clone();
        self.inner.loop_handle.run_in_loop(move |_ev| {
            inner.listening.store(false, Ordering::Release);
            if let Some(mut channel) = inner.channel.lock().unwrap().take() {
                channel.close_event();
            }
        });
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }
}

impl Inner {
    fn accept_loop(&self) {
        loop {
            match sockets::accept_socket(&self.listen_socket) {
                Ok((socket, peer_addr)) => {
                    let fd = sockets::into_raw_fd(socket);
                    if let Err(e) = sockets::set_tcp_nodelay(fd, true) {
                        tracing::debug!(error = %e, "failed to set TCP_NODELAY on accepted socket");
                    }
                    let local_addr = sockets::local_addr(fd).unwrap_or(self.local_addr);
                    let cb = self.new_connection_callback.lock().unwrap();
                    if let Some(cb) = cb.as_ref() {
                        cb(fd, local_addr, peer_addr, self.is_tls);
                    } else {
                        tracing::warn!("acceptor has no new-connection callback installed; closing accepted fd");
                        sockets::close_socket(fd);
                    }
                }
                Err(e) if crate::error::is_transient_io(&e) => break,
                Err(e) => {
                    tracing::warn!(error = %e, local_addr = %self.local_addr, "accept() failed");
                    break;
                }
            }
        }
    }
}

impl EventHandler for Inner {
    fn handle_read(&self, _loop_handle: &EventLoopHandle) {
        self.accept_loop();
    }

    fn handle_write(&self, _loop_handle: &EventLoopHandle) {
        debug_assert!(false, "acceptor channel never enables the write interest");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn listen_on_port_zero_yields_real_port() {
        let mut ev = EventLoop::new("acceptor-test").unwrap();
        let handle = ev.handle();
        let acceptor = Acceptor::listen(handle.clone(), "tcp://127.0.0.1:0").unwrap();
        assert_ne!(acceptor.local_addr().port(), 0);
        assert!(!acceptor.is_tls());
        let _ = ev; // loop never run in this test; just exercising construction
    }

    #[test]
    fn scheme_less_endpoint_defaults_to_plain() {
        let mut ev = EventLoop::new("acceptor-test2").unwrap();
        let handle = ev.handle();
        let acceptor = Acceptor::listen(handle, "127.0.0.1:0").unwrap();
        assert!(!acceptor.is_tls());
        let _ = ev;
    }

    #[test]
    fn accepts_a_connection_and_invokes_callback() {
        let mut ev = EventLoop::new("acceptor-test3").unwrap();
        let handle = ev.handle();
        let stop_handle = handle.clone();
        let acceptor = Acceptor::listen(handle.clone(), "tcp://127.0.0.1:0").unwrap();
        let addr = acceptor.local_addr();
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted2 = accepted.clone();
        acceptor.set_new_connection_callback(Box::new(move |fd, _local, _peer, is_tls| {
            assert!(!is_tls);
            accepted2.fetch_add(1, Ordering::SeqCst);
            crate::sockets::close_socket(fd);
        }));
        handle.run_in_loop(move |_| {
            acceptor.start_accept().unwrap();
        });

        let connector_thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = std::net::TcpStream::connect(addr);
            std::thread::sleep(Duration::from_millis(100));
            EventLoop::stop(&stop_handle);
        });

        ev.run();
        connector_thread.join().unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }
}
