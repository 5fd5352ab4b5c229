//! Multi-threaded TCP (and, with the `tls` feature, TLS) server.
//!
//! A [`TcpServer`] owns one [`Acceptor`] per listen endpoint, running on its
//! own dedicated accept loop, and spreads every accepted connection across a
//! caller-supplied [`EventLoopThreadPool`] according to the configured
//! [`DispatchPolicy`]. Connections are tracked in an fd-keyed registry so
//! shutdown can close every one of them before the server itself stops.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::config::{DispatchPolicy, ServerConfig};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::loop_thread::EventLoopThreadPool;
use crate::observability::{ServerStats, ServerStatsSnapshot};
use crate::sockets;

#[cfg(feature = "tls")]
use crate::tls::TlsConnection;

/// A reference to whichever connection kind delivered a callback, so one
/// callback closure can handle both plain and TLS peers.
pub enum PeerConnection<'a> {
    Plain(&'a Connection),
    #[cfg(feature = "tls")]
    Tls(&'a TlsConnection),
}

impl<'a> PeerConnection<'a> {
    pub fn fd(&self) -> RawFd {
        match self {
            PeerConnection::Plain(c) => c.fd(),
            #[cfg(feature = "tls")]
            PeerConnection::Tls(c) => c.fd(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            PeerConnection::Plain(c) => c.local_addr(),
            #[cfg(feature = "tls")]
            PeerConnection::Tls(c) => c.local_addr(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            PeerConnection::Plain(c) => c.remote_addr(),
            #[cfg(feature = "tls")]
            PeerConnection::Tls(c) => c.remote_addr(),
        }
    }

    pub fn is_tls(&self) -> bool {
        match self {
            PeerConnection::Plain(_) => false,
            #[cfg(feature = "tls")]
            PeerConnection::Tls(_) => true,
        }
    }

    pub fn close(&self) {
        match self {
            PeerConnection::Plain(c) => c.close(),
            #[cfg(feature = "tls")]
            PeerConnection::Tls(c) => c.close(),
        }
    }
}

pub type ServerConnectionCallback = dyn Fn(PeerConnection<'_>) + Send + Sync;
pub type ServerMessageCallback = dyn Fn(PeerConnection<'_>, &mut Buffer) + Send + Sync;
pub type ServerWriteCompleteCallback = dyn Fn(PeerConnection<'_>) + Send + Sync;
pub type ServerHighWaterMarkCallback = dyn Fn(PeerConnection<'_>, usize) + Send + Sync;
pub type ServerCloseCallback = dyn Fn(PeerConnection<'_>) + Send + Sync;

#[derive(Default)]
struct Callbacks {
    connection: Option<Arc<ServerConnectionCallback>>,
    message: Option<Arc<ServerMessageCallback>>,
    write_complete: Option<Arc<ServerWriteCompleteCallback>>,
    high_water_mark: Option<(Arc<ServerHighWaterMarkCallback>, usize)>,
    close: Option<Arc<ServerCloseCallback>>,
    closed: Option<Arc<dyn Fn() + Send + Sync>>,
}

enum AnyConnection {
    Plain(Connection),
    #[cfg(feature = "tls")]
    Tls(TlsConnection),
}

impl AnyConnection {
    fn close(&self) {
        match self {
            AnyConnection::Plain(c) => c.close(),
            #[cfg(feature = "tls")]
            AnyConnection::Tls(c) => c.close(),
        }
    }
}

struct Inner {
    pool: EventLoopThreadPool,
    accept_loop: EventLoopHandle,
    accept_join: Mutex<Option<std::thread::JoinHandle<()>>>,
    acceptors: Mutex<Vec<Acceptor>>,
    connections: DashMap<RawFd, AnyConnection>,
    dispatch_policy: DispatchPolicy,
    keepalive_idle_seconds: Option<u32>,
    stats: ServerStats,
    stopping: AtomicBool,
    callbacks: Mutex<Callbacks>,
    self_weak: OnceLock<Weak<Inner>>,
}

/// A running TCP/TLS server. Cheap to clone; every clone refers to the same
/// underlying server.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<Inner>,
}

impl TcpServer {
    /// Start a server using `pool` for connection I/O and `config` for its
    /// listen endpoints and dispatch policy. The server takes ownership of
    /// `pool`: graceful shutdown ends with stopping it, so a pool handed to
    /// a server should not also be shared with another server or client
    /// that expects to keep using it afterward.
    pub fn start(pool: EventLoopThreadPool, config: ServerConfig) -> Result<Self> {
        let accept = spawn_accept_loop(format!("{}-accept", pool.name()))?;
        let inner = Arc::new(Inner {
            pool,
            accept_loop: accept.handle,
            accept_join: Mutex::new(Some(accept.join)),
            acceptors: Mutex::new(Vec::new()),
            connections: DashMap::new(),
            dispatch_policy: config.dispatch_policy,
            keepalive_idle_seconds: config.keepalive_idle_seconds,
            stats: ServerStats::new(),
            stopping: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
            self_weak: OnceLock::new(),
        });
        let _ = inner.self_weak.set(Arc::downgrade(&inner));

        let server = TcpServer { inner };
        for endpoint in config.listen_endpoints.iter() {
            server.add_listener(endpoint)?;
        }
        Ok(server)
    }

    /// Bind and start accepting on an additional endpoint after startup.
    /// Returns the endpoint's resolved local address. Unlike
    /// [`Acceptor::listen`], a server endpoint must carry an explicit
    /// `tcp://` or `tls://` scheme.
    pub fn add_listener(&self, endpoint: &str) -> Result<SocketAddr> {
        if sockets::parse_endpoint(endpoint)?.scheme == sockets::Scheme::Plain {
            return Err(Error::config(format!(
                "server endpoints require an explicit scheme ('{endpoint}' has none)"
            )));
        }
        let acceptor = Acceptor::listen(self.inner.accept_loop.clone(), endpoint)?;
        let local = acceptor.local_addr();

        let weak = self.inner.self_weak.get().expect("self_weak set in start()").clone();
        acceptor.set_new_connection_callback(Box::new(move |fd, local, remote, is_tls| {
            if let Some(inner) = weak.upgrade() {
                handle_new_connection(&inner, fd, local, remote, is_tls);
            } else {
                sockets::close_socket(fd);
            }
        }));

        let acceptor_for_start = acceptor.clone();
        self.inner.accept_loop.run_in_loop(move |_ev| {
            if let Err(err) = acceptor_for_start.start_accept() {
                tracing::error!(error = %err, "failed to start accepting connections");
            }
        });

        self.inner.acceptors.lock().unwrap().push(acceptor);
        Ok(local)
    }

    pub fn set_connection_callback(&self, cb: impl Fn(PeerConnection<'_>) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl Fn(PeerConnection<'_>, &mut Buffer) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl Fn(PeerConnection<'_>) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().write_complete = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(PeerConnection<'_>, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.inner.callbacks.lock().unwrap().high_water_mark = Some((Arc::new(cb), mark));
    }

    pub fn set_close_callback(&self, cb: impl Fn(PeerConnection<'_>) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().close = Some(Arc::new(cb));
    }

    /// Fired once, after [`TcpServer::stop`] has closed every connection and
    /// stopped the pool — the "registry empty, pool stopped" signal.
    pub fn set_closed_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().closed = Some(Arc::new(cb));
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn stats(&self) -> ServerStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Graceful multi-phase shutdown: stop every acceptor first
    /// (no new connections admitted), close every currently registered
    /// connection and wait for the registry to drain, then stop the
    /// connection-I/O pool and join the accept loop's thread. Fires the
    /// closed callback exactly once, after both have happened. A second
    /// call is a no-op.
    pub fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        for acceptor in self.inner.acceptors.lock().unwrap().iter() {
            acceptor.stop();
        }

        let fds: Vec<RawFd> = self.inner.connections.iter().map(|entry| *entry.key()).collect();
        for fd in fds {
            if let Some((_, conn)) = self.inner.connections.remove(&fd) {
                conn.close();
            }
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while self.inner.connections.len() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        self.inner.pool.stop();

        if let Some(join) = self.inner.accept_join.lock().unwrap().take() {
            EventLoop::stop(&self.inner.accept_loop);
            let _ = join.join();
        }

        if let Some(cb) = self.inner.callbacks.lock().unwrap().closed.clone() {
            cb();
        }
    }
}

impl Inner {
    fn dispatch(self: &Arc<Self>, fd: RawFd, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        match self.dispatch_policy {
            DispatchPolicy::RoundRobin => self.pool.run_in_next_loop(task),
            DispatchPolicy::FdHashing => self.pool.run_in_loop_by_hash(fd as u64, task),
        }
    }
}

fn handle_new_connection(inner: &Arc<Inner>, fd: RawFd, local: SocketAddr, remote: SocketAddr, is_tls: bool) {
    if inner.stopping.load(Ordering::Acquire) {
        sockets::close_socket(fd);
        return;
    }
    if let Some(idle) = inner.keepalive_idle_seconds {
        let _ = sockets::set_keepalive(fd, true, idle);
    }

    if is_tls {
        accept_tls(inner, fd, local, remote);
    } else {
        let conn = Connection::new(fd, local, remote);
        apply_plain_callbacks(inner, &conn);
        inner.connections.insert(fd, AnyConnection::Plain(conn.clone()));
        inner.stats.on_accept();
        inner.dispatch(fd, move |ev: &mut EventLoop| {
            conn.attached_to_loop(ev.handle());
        });
    }
}

fn apply_plain_callbacks(inner: &Arc<Inner>, conn: &Connection) {
    let cbs = inner.callbacks.lock().unwrap();
    if let Some(cb) = cbs.connection.clone() {
        conn.set_connection_callback(Box::new(move |c| cb(PeerConnection::Plain(c))));
    }
    if let Some(cb) = cbs.message.clone() {
        conn.set_message_callback(Box::new(move |c, buf| cb(PeerConnection::Plain(c), buf)));
    }
    if let Some(cb) = cbs.write_complete.clone() {
        conn.set_write_complete_callback(Box::new(move |c| cb(PeerConnection::Plain(c))));
    }
    if let Some((cb, mark)) = cbs.high_water_mark.clone() {
        conn.set_high_water_mark_callback(Box::new(move |c, len| cb(PeerConnection::Plain(c), len)), mark);
    }
    drop(cbs);

    let weak = inner.self_weak.get().expect("self_weak set in start()").clone();
    conn.set_close_callback(Box::new(move |c| {
        let Some(inner) = weak.upgrade() else { return };
        inner.connections.remove(&c.fd());
        inner.stats.on_close();
        if let Some(cb) = inner.callbacks.lock().unwrap().close.clone() {
            cb(PeerConnection::Plain(c));
        }
    }));
}

#[cfg(feature = "tls")]
fn accept_tls(inner: &Arc<Inner>, fd: RawFd, local: SocketAddr, remote: SocketAddr) {
    match TlsConnection::accept(fd, local, remote) {
        Ok(conn) => {
            apply_tls_callbacks(inner, &conn);
            inner.connections.insert(fd, AnyConnection::Tls(conn.clone()));
            inner.stats.on_accept();
            inner.dispatch(fd, move |ev: &mut EventLoop| {
                conn.attached_to_loop(ev.handle());
            });
        }
        Err(err) => {
            tracing::warn!(error = %err, "tls setup failed for accepted connection");
            sockets::close_socket(fd);
        }
    }
}

#[cfg(not(feature = "tls"))]
fn accept_tls(_inner: &Arc<Inner>, fd: RawFd, _local: SocketAddr, _remote: SocketAddr) {
    tracing::warn!("rejecting tls connection: server built without the tls feature");
    sockets::close_socket(fd);
}

#[cfg(feature = "tls")]
fn apply_tls_callbacks(inner: &Arc<Inner>, conn: &TlsConnection) {
    let cbs = inner.callbacks.lock().unwrap();
    if let Some(cb) = cbs.connection.clone() {
        conn.set_connection_callback(Box::new(move |c| cb(PeerConnection::Tls(c))));
    }
    if let Some(cb) = cbs.message.clone() {
        conn.set_message_callback(Box::new(move |c, buf| cb(PeerConnection::Tls(c), buf)));
    }
    if let Some(cb) = cbs.write_complete.clone() {
        conn.set_write_complete_callback(Box::new(move |c| cb(PeerConnection::Tls(c))));
    }
    if let Some((cb, mark)) = cbs.high_water_mark.clone() {
        conn.set_high_water_mark_callback(Box::new(move |c, len| cb(PeerConnection::Tls(c), len)), mark);
    }
    drop(cbs);

    let weak = inner.self_weak.get().expect("self_weak set in start()").clone();
    conn.set_close_callback(Box::new(move |c| {
        let Some(inner) = weak.upgrade() else { return };
        inner.connections.remove(&c.fd());
        inner.stats.on_close();
        if let Some(cb) = inner.callbacks.lock().unwrap().close.clone() {
            cb(PeerConnection::Tls(c));
        }
    }));
}

struct AcceptLoop {
    handle: EventLoopHandle,
    join: std::thread::JoinHandle<()>,
}

fn spawn_accept_loop(name: String) -> Result<AcceptLoop> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let thread_name = name.clone();
    let join = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || match EventLoop::new(&name) {
            Ok(mut ev) => {
                let handle = ev.handle();
                let _ = ready_tx.send(Ok(handle));
                ev.run();
            }
            Err(err) => {
                let _ = ready_tx.send(Err(err));
            }
        })
        .map_err(|err| Error::reactor(format!("failed to spawn accept loop thread: {err}")))?;

    let handle = ready_rx
        .recv()
        .map_err(|_| Error::reactor("accept loop thread exited before becoming ready"))??;
    Ok(AcceptLoop { handle, join })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[test]
    fn add_listener_rejects_scheme_less_endpoint() {
        let pool = EventLoopThreadPool::start(1, "server-scheme-test").unwrap();
        let config = ServerConfig {
            listen_endpoints: Vec::new(),
            keepalive_idle_seconds: None,
            dispatch_policy: DispatchPolicy::RoundRobin,
        };
        let server = TcpServer::start(pool, config).unwrap();
        assert!(server.add_listener("127.0.0.1:0").is_err());
        server.stop();
    }

    #[test]
    fn accepts_connections_and_echoes_data() {
        let pool = EventLoopThreadPool::start(2, "server-test").unwrap();
        let config = ServerConfig {
            listen_endpoints: Vec::new(),
            keepalive_idle_seconds: None,
            dispatch_policy: DispatchPolicy::RoundRobin,
        };
        let server = TcpServer::start(pool, config).unwrap();
        server.set_message_callback(|peer, buf| {
            let data = buf.as_slice().to_vec();
            buf.skip(data.len());
            if let PeerConnection::Plain(c) = peer {
                c.send(data);
            }
        });

        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted2 = accepted.clone();
        server.set_connection_callback(move |peer| {
            if peer.is_tls() {
                return;
            }
            accepted2.fetch_add(1, Ordering::SeqCst);
        });

        let local_addr = server.add_listener("tcp://127.0.0.1:0").unwrap();

        let mut stream = TcpStream::connect(local_addr).unwrap();
        stream.write_all(b"ping").unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        let deadline = Instant::now() + Duration::from_secs(2);
        while accepted.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(accepted.load(Ordering::SeqCst) >= 1);

        server.stop();
    }

    #[test]
    fn stop_drains_connections_stops_pool_and_fires_closed_once() {
        let pool = EventLoopThreadPool::start(2, "server-stop-test").unwrap();
        let config = ServerConfig {
            listen_endpoints: Vec::new(),
            keepalive_idle_seconds: None,
            dispatch_policy: DispatchPolicy::RoundRobin,
        };
        let server = TcpServer::start(pool, config).unwrap();
        let local_addr = server.add_listener("tcp://127.0.0.1:0").unwrap();

        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted2 = accepted.clone();
        server.set_connection_callback(move |_peer| {
            accepted2.fetch_add(1, Ordering::SeqCst);
        });

        let stream = TcpStream::connect(local_addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while accepted.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(accepted.load(Ordering::SeqCst) >= 1);

        let closed_count = Arc::new(AtomicUsize::new(0));
        let closed2 = closed_count.clone();
        server.set_closed_callback(move || {
            closed2.fetch_add(1, Ordering::SeqCst);
        });

        server.stop();
        assert_eq!(server.connection_count(), 0);
        assert_eq!(closed_count.load(Ordering::SeqCst), 1);

        // Idempotent: a second stop() does not re-fire the closed callback.
        server.stop();
        assert_eq!(closed_count.load(Ordering::SeqCst), 1);
        drop(stream);
    }
}
