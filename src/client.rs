//! A single outbound connection with reconnection policy: one [`Connector`]
//! plus one mutex-guarded "current connection".
//!
//! On a successful connect the client builds a plain or TLS [`Connection`],
//! installs the user's callbacks, and attaches it to the client's loop. On
//! a failed connect it fabricates a `Disconnected` [`Connection`] and fires
//! the connection callback once, so user code only has to understand one
//! notification shape regardless of outcome. When `auto_reconnect` is set,
//! the user-visible close of a connection reinitiates `connect`.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use crate::config::ConnectorConfig;
use crate::connection::Connection;
use crate::connector::{Connector, FAILURE_FD};
use crate::error::Result;
use crate::event_loop::EventLoopHandle;
use crate::server::PeerConnection;
use crate::sockets::{self, Scheme};

#[cfg(feature = "tls")]
use crate::tls::TlsConnection;

pub type ClientConnectionCallback = dyn Fn(PeerConnection<'_>) + Send + Sync;
pub type ClientMessageCallback = dyn Fn(PeerConnection<'_>, &mut crate::buffer::Buffer) + Send + Sync;
pub type ClientWriteCompleteCallback = dyn Fn(PeerConnection<'_>) + Send + Sync;
pub type ClientHighWaterMarkCallback = dyn Fn(PeerConnection<'_>, usize) + Send + Sync;
pub type ClientCloseCallback = dyn Fn(PeerConnection<'_>) + Send + Sync;

#[derive(Default)]
struct Callbacks {
    connection: Option<Arc<ClientConnectionCallback>>,
    message: Option<Arc<ClientMessageCallback>>,
    write_complete: Option<Arc<ClientWriteCompleteCallback>>,
    high_water_mark: Option<(Arc<ClientHighWaterMarkCallback>, usize)>,
    close: Option<Arc<ClientCloseCallback>>,
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
    loop_handle: EventLoopHandle,
    connector: Connector,
    is_tls: bool,
    sni_name: String,
    auto_reconnect: AtomicBool,
    stopping: AtomicBool,
    current: Mutex<Option<AnyConnection>>,
    callbacks: Mutex<Callbacks>,
    self_weak: OnceLock<Weak<Inner>>,
}

/// A reconnecting outbound client. Cheap to clone; every clone refers to
/// the same underlying connector and current connection.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<Inner>,
}

impl TcpClient {
    /// Build a client targeting `endpoint` (`tcp://host:port`,
    /// `tls://host:port`, or a bare `host:port`). Does not connect yet;
    /// call [`TcpClient::start`].
    pub fn new(loop_handle: EventLoopHandle, endpoint: &str, config: ConnectorConfig) -> Result<Self> {
        let parsed = sockets::parse_endpoint(endpoint)?;
        let is_tls = matches!(parsed.scheme, Scheme::Tls);
        let connector = Connector::with_scheme(
            loop_handle.clone(),
            parsed.addr,
            config.connecting_timeout(),
            config.need_retry,
            is_tls,
        )?;

        let inner = Arc::new(Inner {
            loop_handle,
            connector,
            is_tls,
            sni_name: extract_host(endpoint),
            auto_reconnect: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            current: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
            self_weak: OnceLock::new(),
        });
        let _ = inner.self_weak.set(Arc::downgrade(&inner));

        let weak = inner.self_weak.get().unwrap().clone();
        inner.connector.set_new_connection_callback(Box::new(move |fd, local, remote, tls| {
            if let Some(inner) = weak.upgrade() {
                handle_connect_result(&inner, fd, local, remote, tls);
            } else if fd >= 0 {
                sockets::close_socket(fd);
            }
        }));

        Ok(Self { inner })
    }

    /// Whether a closed connection should be automatically redialed.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::Relaxed);
    }

    pub fn set_retry(&self, retry: bool) {
        self.inner.connector.set_retry(retry);
    }

    pub fn set_connection_callback(&self, cb: impl Fn(PeerConnection<'_>) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl Fn(PeerConnection<'_>, &mut crate::buffer::Buffer) + Send + Sync + 'static) {
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

    /// Begin connecting. Safe to call again after a failure or an
    /// auto-reconnect-disabled close to retry manually.
    pub fn start(&self) -> Result<()> {
        self.inner.connector.start()
    }

    pub fn is_connected(&self) -> bool {
        match self.inner.current.lock().unwrap().as_ref() {
            Some(AnyConnection::Plain(c)) => c.is_connected(),
            #[cfg(feature = "tls")]
            Some(AnyConnection::Tls(c)) => c.is_connected(),
            None => false,
        }
    }

    /// Stop reconnecting and close the current connection, if any. Safe to
    /// call from any thread; the close itself is marshaled onto the
    /// client's loop.
    pub fn disconnect(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.connector.cancel();
        if let Some(conn) = self.inner.current.lock().unwrap().as_ref() {
            conn.close();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // `Connector::cancel` and `Connection::close`/`TlsConnection::close`
        // already marshal themselves onto the owning loop thread when
        // called off it, so no extra `run_in_loop` hop is needed here.
        self.connector.cancel();
        if let Some(conn) = self.current.lock().unwrap().take() {
            conn.close();
        }
    }
}

fn handle_connect_result(inner: &Arc<Inner>, fd: RawFd, local: SocketAddr, remote: SocketAddr, is_tls: bool) {
    if fd == FAILURE_FD {
        notify_connect_failed(inner, remote);
        return;
    }

    if is_tls {
        install_tls(inner, fd, local, remote);
    } else {
        let conn = Connection::new(fd, local, remote);
        apply_plain_callbacks(inner, &conn);
        *inner.current.lock().unwrap() = Some(AnyConnection::Plain(conn.clone()));
        let loop_handle = inner.loop_handle.clone();
        loop_handle.run_in_loop(move |ev| conn.attached_to_loop(ev.handle()));
    }
}

fn notify_connect_failed(inner: &Arc<Inner>, remote: SocketAddr) {
    let has_callback = inner.callbacks.lock().unwrap().connection.is_some();
    if !has_callback {
        return;
    }
    let placeholder = Connection::failed(remote);
    apply_plain_callbacks(inner, &placeholder);
    placeholder.notify_failed();
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

    let weak = inner.self_weak.get().unwrap().clone();
    conn.set_close_callback(Box::new(move |c| {
        let Some(inner) = weak.upgrade() else { return };
        on_connection_closed(&inner);
        if let Some(cb) = inner.callbacks.lock().unwrap().close.clone() {
            cb(PeerConnection::Plain(c));
        }
    }));
}

#[cfg(feature = "tls")]
fn install_tls(inner: &Arc<Inner>, fd: RawFd, local: SocketAddr, remote: SocketAddr) {
    match TlsConnection::connect(fd, local, remote, &inner.sni_name) {
        Ok(conn) => {
            apply_tls_callbacks(inner, &conn);
            *inner.current.lock().unwrap() = Some(AnyConnection::Tls(conn.clone()));
            let loop_handle = inner.loop_handle.clone();
            loop_handle.run_in_loop(move |ev| conn.attached_to_loop(ev.handle()));
        }
        Err(err) => {
            tracing::warn!(error = %err, remote = %remote, "tls setup failed for outbound connection");
            sockets::close_socket(fd);
            notify_connect_failed(inner, remote);
        }
    }
}

#[cfg(not(feature = "tls"))]
fn install_tls(inner: &Arc<Inner>, fd: RawFd, _local: SocketAddr, remote: SocketAddr) {
    tracing::warn!("rejecting tls connect result: client built without the tls feature");
    sockets::close_socket(fd);
    notify_connect_failed(inner, remote);
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

    let weak = inner.self_weak.get().unwrap().clone();
    conn.set_close_callback(Box::new(move |c| {
        let Some(inner) = weak.upgrade() else { return };
        on_connection_closed(&inner);
        if let Some(cb) = inner.callbacks.lock().unwrap().close.clone() {
            cb(PeerConnection::Tls(c));
        }
    }));
}

fn on_connection_closed(inner: &Arc<Inner>) {
    inner.current.lock().unwrap().take();
    if !inner.stopping.load(Ordering::Acquire) && inner.auto_reconnect.load(Ordering::Relaxed) {
        if let Err(err) = inner.connector.start() {
            tracing::warn!(error = %err, "auto-reconnect failed to restart the connector");
        }
    }
}

/// Extract the bare hostname from an endpoint string, for TLS SNI. Mirrors
/// the endpoint grammar's scheme/bracket/port stripping without resolving
/// the address, since SNI wants the name the caller typed, not its `SocketAddr`.
fn extract_host(endpoint: &str) -> String {
    let without_scheme = endpoint.strip_prefix("tcp://").or_else(|| endpoint.strip_prefix("tls://")).unwrap_or(endpoint);
    if let Some(rest) = without_scheme.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    match without_scheme.rfind(':') {
        Some(idx) => without_scheme[..idx].to_string(),
        None => without_scheme.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn connects_and_notifies_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let mut buf = [0u8; 16];
                let mut stream = stream;
                let _ = stream.read(&mut buf);
            }
        });

        let mut ev = EventLoop::new("client-test").unwrap();
        let handle = ev.handle();
        let stop_handle = handle.clone();
        let client = TcpClient::new(handle, &format!("tcp://{addr}"), ConnectorConfig { connecting_timeout_ms: 2000, need_retry: false }).unwrap();
        let connected = Arc::new(AtomicBool::new(false));
        let connected2 = connected.clone();
        client.set_connection_callback(move |peer| {
            if peer.fd() >= 0 {
                connected2.store(true, Ordering::SeqCst);
            }
            EventLoop::stop(&stop_handle);
        });
        client.start().unwrap();
        ev.run();
        assert!(connected.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_connect_reports_disconnected_placeholder() {
        let mut ev = EventLoop::new("client-fail-test").unwrap();
        let handle = ev.handle();
        let stop_handle = handle.clone();
        // Nothing listens here; the connect should fail (refused) quickly.
        let unused = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);

        let client = TcpClient::new(handle, &format!("tcp://{addr}"), ConnectorConfig { connecting_timeout_ms: 2000, need_retry: false }).unwrap();
        let saw_failure = Arc::new(AtomicBool::new(false));
        let saw_failure2 = saw_failure.clone();
        client.set_connection_callback(move |peer| {
            assert!(!peer.is_tls());
            assert_eq!(peer.fd(), -1);
            saw_failure2.store(true, Ordering::SeqCst);
            EventLoop::stop(&stop_handle);
        });
        client.start().unwrap();
        ev.run();
        assert!(saw_failure.load(Ordering::SeqCst));
    }
}
