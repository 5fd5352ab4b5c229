//! TLS connection: the same full-duplex connection model as
//! [`crate::connection::Connection`], specialized for a `rustls` session
//! in place of bare byte pumping. The record layer is non-blocking: every
//! read or write attempt can legitimately want the *other* direction of
//! I/O first. Unlike an OpenSSL-style session, `rustls` never reports this
//! as a one-shot `WANT_READ`/`WANT_WRITE` error code to latch and clear —
//! `Session::wants_read`/`wants_write` are live predicates, true for as
//! long as the condition holds. `drive_io` polls them after every
//! operation and toggles channel interest to match, which is the same
//! WANT_READ/WANT_WRITE-driven interest toggling, just sourced from a
//! query instead of an error code.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use rustls::{ClientConfig, ClientConnection, OwnedTrustAnchor, RootCertStore, ServerConfig, ServerConnection};

use crate::buffer::Buffer;
use crate::channel::{Channel, EventHandler};
use crate::config::TlsOptions;
use crate::error::{is_transient_io, Error, Result};
use crate::event_loop::EventLoopHandle;
use crate::sockets;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    None,
    Accepting,
    Connecting,
    Connected,
    Disconnected,
}

pub type ConnectionCallback = Box<dyn Fn(&TlsConnection) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(&TlsConnection, &mut Buffer) + Send + Sync>;
pub type WriteCompleteCallback = Box<dyn Fn(&TlsConnection) + Send + Sync>;
pub type HighWaterMarkCallback = Box<dyn Fn(&TlsConnection, usize) + Send + Sync>;
pub type CloseCallback = Box<dyn Fn(&TlsConnection) + Send + Sync>;

/// Either side of a handshake. `rustls` gives server and client sessions
/// distinct types with mostly-identical surfaces; this enum dispatches
/// the handful of methods the pump needs rather than pulling in a trait
/// object for a two-variant set.
enum Session {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Session {
    fn read_tls(&mut self, rd: &mut dyn Read) -> std::io::Result<usize> {
        match self {
            Session::Server(c) => c.read_tls(rd),
            Session::Client(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> std::io::Result<usize> {
        match self {
            Session::Server(c) => c.write_tls(wr),
            Session::Client(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> std::result::Result<rustls::IoState, rustls::Error> {
        match self {
            Session::Server(c) => c.process_new_packets(),
            Session::Client(c) => c.process_new_packets(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Session::Server(c) => c.wants_read(),
            Session::Client(c) => c.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Session::Server(c) => c.wants_write(),
            Session::Client(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Session::Server(c) => c.is_handshaking(),
            Session::Client(c) => c.is_handshaking(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Session::Server(c) => c.writer(),
            Session::Client(c) => c.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Session::Server(c) => c.reader(),
            Session::Client(c) => c.reader(),
        }
    }
}

/// Borrows a raw fd as a `Read`/`Write` sink for `rustls` without taking
/// ownership — the fd's lifecycle is still managed by [`TlsConnection`].
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        sockets::read_from_fd(self.0, buf)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        sockets::write_to_fd(self.0, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn load_certs(path: &str) -> Result<Vec<rustls::Certificate>> {
    let file = std::fs::File::open(path).map_err(|e| Error::config(format!("cannot open cert file '{path}': {e}")))?;
    let mut reader = std::io::BufReader::new(file);
    let raw = rustls_pemfile::certs(&mut reader).map_err(|e| Error::config(format!("invalid cert file '{path}': {e}")))?;
    if raw.is_empty() {
        return Err(Error::config(format!("cert file '{path}' contains no certificates")));
    }
    Ok(raw.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &str) -> Result<rustls::PrivateKey> {
    let file = std::fs::File::open(path).map_err(|e| Error::config(format!("cannot open key file '{path}': {e}")))?;
    let mut reader = std::io::BufReader::new(file);
    let pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut reader).map_err(|e| Error::config(format!("invalid key file '{path}': {e}")))?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(rustls::PrivateKey(key));
    }
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path).map_err(|e| Error::config(format!("cannot reopen key file '{path}': {e}")))?,
    );
    let rsa = rustls_pemfile::rsa_private_keys(&mut reader).map_err(|e| Error::config(format!("invalid key file '{path}': {e}")))?;
    rsa.into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| Error::config(format!("key file '{path}' contains no supported private key")))
}

fn build_server_config(opts: &TlsOptions) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(&opts.tls_cert_file)?;
    let key = load_private_key(&opts.tls_key_file)?;

    let builder = ServerConfig::builder().with_safe_defaults();
    let config = if opts.tls_auth_clients {
        let ca_file = opts
            .tls_ca_file
            .as_ref()
            .ok_or_else(|| Error::config("tls_auth_clients requires tls_ca_file"))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots
                .add(&cert)
                .map_err(|e| Error::config(format!("invalid CA certificate in '{ca_file}': {e}")))?;
        }
        let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);
        builder
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(certs, key)
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)
    }
    .map_err(|e| Error::config(format!("invalid server certificate/key pair: {e}")))?;

    Ok(Arc::new(config))
}

fn build_client_config(opts: Option<&TlsOptions>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    let ca_file = opts.and_then(|o| o.tls_ca_file.as_deref());
    if let Some(ca_file) = ca_file {
        for cert in load_certs(ca_file)? {
            roots
                .add(&cert)
                .map_err(|e| Error::config(format!("invalid CA certificate in '{ca_file}': {e}")))?;
        }
    } else {
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
        }));
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Process-wide client config cache: the root store and cipher setup are
/// identical for every outbound TLS connection that doesn't override
/// `tls_ca_file`, so building it once per process is worth the
/// `OnceLock` over building it per connection.
static DEFAULT_CLIENT_CONFIG: OnceLock<Result<Arc<ClientConfig>>> = OnceLock::new();

fn default_client_config() -> Result<Arc<ClientConfig>> {
    DEFAULT_CLIENT_CONFIG
        .get_or_init(|| build_client_config(crate::config::tls_options()))
        .clone()
}

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
    session: Mutex<Session>,
    input: Mutex<Buffer>,
    /// Approximates the outstanding encrypted backlog: bytes accepted by
    /// `send()` since the session last drained (`!wants_write()`).
    /// `rustls` does not expose an exact queued-byte count at the record
    /// layer, so this is the same accept-until-idle approximation used
    /// for `output_buffer_len()` and high-water-mark tracking.
    pending_plaintext: Mutex<Vec<u8>>,
}

/// A live TLS connection, mirroring [`crate::connection::Connection`]'s
/// public shape: buffered message delivery, high-water-mark backpressure,
/// send-from-any-thread.
#[derive(Clone)]
pub struct TlsConnection {
    inner: Arc<Inner>,
}

struct Inner {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state: Mutex<TlsState>,
    loop_handle: RwLock<Option<EventLoopHandle>>,
    io: Io,
    callbacks: Callbacks,
    high_water_mark: AtomicUsize,
    above_high_water_mark: AtomicBool,
    self_weak: OnceLock<Weak<Inner>>,
}

impl TlsConnection {
    /// Build the server side of a TLS connection over an already-accepted
    /// fd, using the process-wide [`TlsOptions`] singleton for the
    /// certificate chain and key.
    pub fn accept(fd: RawFd, local_addr: SocketAddr, remote_addr: SocketAddr) -> Result<Self> {
        let opts = crate::config::tls_options().ok_or_else(|| Error::config("no TLS options installed; call install_tls_options first"))?;
        let config = build_server_config(opts)?;
        let session = ServerConnection::new(config).map_err(|e| Error::tls(e.to_string()))?;
        Ok(Self::new(fd, local_addr, remote_addr, Session::Server(session), TlsState::Accepting))
    }

    /// Build the client side of a TLS connection over an already-connected
    /// fd, driving the handshake with `server_name` as SNI.
    pub fn connect(fd: RawFd, local_addr: SocketAddr, remote_addr: SocketAddr, server_name: &str) -> Result<Self> {
        let config = default_client_config()?;
        let name = server_name
            .try_into()
            .map_err(|_| Error::config(format!("'{server_name}' is not a valid TLS server name")))?;
        let session = ClientConnection::new(config, name).map_err(|e| Error::tls(e.to_string()))?;
        Ok(Self::new(fd, local_addr, remote_addr, Session::Client(session), TlsState::Connecting))
    }

    fn new(fd: RawFd, local_addr: SocketAddr, remote_addr: SocketAddr, session: Session, state: TlsState) -> Self {
        let inner = Arc::new(Inner {
            local_addr,
            remote_addr,
            state: Mutex::new(state),
            loop_handle: RwLock::new(None),
            io: Io {
                fd,
                channel: Mutex::new(Channel::detached(fd)),
                session: Mutex::new(session),
                input: Mutex::new(Buffer::new()),
                pending_plaintext: Mutex::new(Vec::new()),
            },
            callbacks: Callbacks::default(),
            high_water_mark: AtomicUsize::new(64 * 1024 * 1024),
            above_high_water_mark: AtomicBool::new(false),
            self_weak: OnceLock::new(),
        });
        let _ = inner.self_weak.set(Arc::downgrade(&inner));
        Self { inner }
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

    pub fn state(&self) -> TlsState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TlsState::Connected
    }

    pub fn loop_handle(&self) -> Option<EventLoopHandle> {
        self.inner.loop_handle.read().unwrap().clone()
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

    /// Attach to `loop_handle` and enable the read interest; the
    /// handshake itself runs opportunistically off the first readiness
    /// event rather than synchronously here.
    pub fn attached_to_loop(&self, loop_handle: EventLoopHandle) {
        debug_assert!(loop_handle.is_in_loop_thread());
        let weak: Weak<dyn EventHandler + Send + Sync> = self.inner.self_weak.get().unwrap().clone();
        {
            let mut channel = self.inner.io.channel.lock().unwrap();
            channel.attach_to_new_loop(loop_handle.clone(), weak).expect("attach to fresh loop cannot fail");
            channel.enable_read().expect("enable_read on freshly attached channel cannot fail");
        }
        *self.inner.loop_handle.write().unwrap() = Some(loop_handle);
        self.drive_io();
    }

    fn fire_connection_callback(&self) {
        if let Some(cb) = self.inner.callbacks.connection.lock().unwrap().as_ref() {
            cb(self);
        }
    }

    /// Queue plaintext for sending. Rejects zero-length writes, which
    /// would be a no-op at the record layer anyway.
    pub fn send(&self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        let on_loop_thread = self.loop_handle().map(|h| h.is_in_loop_thread()).unwrap_or(false);
        if on_loop_thread {
            self.send_in_loop(data);
            return;
        }
        let this = self.clone();
        if let Some(target) = self.loop_handle() {
            target.run_in_loop(move |_ev| this.send_in_loop(data));
        } else {
            tracing::warn!(fd = self.fd(), "send() on a TLS connection with no current loop; dropping");
        }
    }

    fn send_in_loop(&self, data: Vec<u8>) {
        if self.state() == TlsState::Disconnected {
            return;
        }
        {
            let mut session = self.inner.io.session.lock().unwrap();
            if let Err(e) = session.writer().write_all(&data) {
                drop(session);
                tracing::debug!(fd = self.fd(), error = %e, "failed queuing plaintext into TLS session");
                self.force_close();
                return;
            }
        }
        let total = {
            let mut pending = self.inner.io.pending_plaintext.lock().unwrap();
            pending.extend_from_slice(&data);
            pending.len()
        };
        self.maybe_fire_high_water_mark(total);
        self.drive_io();
    }

    pub fn output_buffer_len(&self) -> usize {
        self.inner.io.pending_plaintext.lock().unwrap().len()
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

    /// Drives the handshake and/or the plaintext pumps, reacting to
    /// whatever the session currently wants. Safe to call repeatedly;
    /// idempotent when there is nothing to do.
    fn drive_io(&self) {
        let wants_write = {
            let session = self.inner.io.session.lock().unwrap();
            session.wants_write()
        };
        let mut channel = self.inner.io.channel.lock().unwrap();
        if wants_write && !channel.has_writable_event() {
            let _ = channel.enable_write();
        } else if !wants_write && channel.has_writable_event() {
            let _ = channel.disable_write();
        }
    }

    fn handle_read_ready(&self) {
        let read_result = {
            let mut session = self.inner.io.session.lock().unwrap();
            let mut io = FdIo(self.fd());
            session.read_tls(&mut io)
        };
        match read_result {
            Ok(0) => {
                self.force_close();
                return;
            }
            Ok(_) => {}
            Err(e) if is_transient_io(&e) => return,
            Err(e) => {
                tracing::debug!(fd = self.fd(), error = %e, "TLS read_tls failed");
                self.force_close();
                return;
            }
        }

        let io_state = {
            let mut session = self.inner.io.session.lock().unwrap();
            match session.process_new_packets() {
                Ok(state) => state,
                Err(e) => {
                    drop(session);
                    tracing::debug!(fd = self.fd(), error = %e, "TLS session error");
                    self.force_close();
                    return;
                }
            }
        };

        self.promote_if_handshake_complete();

        if io_state.plaintext_bytes_to_read() > 0 {
            let mut plaintext = vec![0u8; io_state.plaintext_bytes_to_read()];
            {
                let mut session = self.inner.io.session.lock().unwrap();
                if let Err(e) = session.reader().read_exact(&mut plaintext) {
                    drop(session);
                    tracing::debug!(fd = self.fd(), error = %e, "failed draining TLS plaintext");
                    self.force_close();
                    return;
                }
            }
            let mut input = self.inner.io.input.lock().unwrap();
            input.append(&plaintext);
            if let Some(cb) = self.inner.callbacks.message.lock().unwrap().as_ref() {
                cb(self, &mut input);
            }
        }

        if io_state.peer_has_closed() {
            self.close();
        }

        self.drive_io();
    }

    fn handle_write_ready(&self) {
        let write_result = {
            let mut session = self.inner.io.session.lock().unwrap();
            let mut io = FdIo(self.fd());
            session.write_tls(&mut io)
        };
        match write_result {
            Ok(_) => {}
            Err(e) if is_transient_io(&e) => {}
            Err(e) => {
                tracing::debug!(fd = self.fd(), error = %e, "TLS write_tls failed");
                self.force_close();
                return;
            }
        }
        self.promote_if_handshake_complete();
        self.maybe_fire_write_complete();
        self.drive_io();
    }

    fn promote_if_handshake_complete(&self) {
        let still_handshaking = self.inner.io.session.lock().unwrap().is_handshaking();
        let mut state = self.inner.state.lock().unwrap();
        if !still_handshaking && matches!(*state, TlsState::Accepting | TlsState::Connecting) {
            *state = TlsState::Connected;
            drop(state);
            self.fire_connection_callback();
        }
    }

    fn maybe_fire_write_complete(&self) {
        let idle = {
            let mut session = self.inner.io.session.lock().unwrap();
            !session.wants_write()
        };
        if idle {
            self.inner.io.pending_plaintext.lock().unwrap().clear();
            self.maybe_fire_high_water_mark(0);
            if let Some(cb) = self.inner.callbacks.write_complete.lock().unwrap().as_ref() {
                cb(self);
            }
        }
    }

    fn force_close(&self) {
        self.close();
    }

    /// Tear down the `rustls` session, then the underlying socket. Like
    /// the plain connection, idempotent and safe from any thread.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == TlsState::Disconnected {
                return;
            }
            *state = TlsState::Disconnected;
        }
        if self.loop_handle().map(|h| h.is_in_loop_thread()).unwrap_or(false) {
            self.finish_close();
            return;
        }
        let this = self.clone();
        if let Some(target) = self.loop_handle() {
            target.run_in_loop(move |_ev| this.finish_close());
        } else {
            self.finish_close();
        }
    }

    fn finish_close(&self) {
        {
            let mut channel = self.inner.io.channel.lock().unwrap();
            channel.close_event();
        }
        sockets::close_socket(self.fd());
        self.fire_connection_callback();
        if let Some(cb) = self.inner.callbacks.close.lock().unwrap().as_ref() {
            cb(self);
        }
    }
}

impl EventHandler for Inner {
    fn handle_read(&self, _loop_handle: &EventLoopHandle) {
        if let Some(strong) = self.self_weak.get().and_then(Weak::upgrade) {
            TlsConnection { inner: strong }.handle_read_ready();
        }
    }

    fn handle_write(&self, _loop_handle: &EventLoopHandle) {
        if let Some(strong) = self.self_weak.get().and_then(Weak::upgrade) {
            TlsConnection { inner: strong }.handle_write_ready();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsOptions;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_certs() -> (tempfile_cert::CertPaths, TlsOptions) {
        let paths = tempfile_cert::generate_self_signed();
        let opts = TlsOptions {
            tls_cert_file: paths.cert.clone(),
            tls_key_file: paths.key.clone(),
            ..TlsOptions::default()
        };
        (paths, opts)
    }

    /// Minimal self-signed certificate generation for tests only; real
    /// deployments always bring their own certificate/key files.
    mod tempfile_cert {
        pub struct CertPaths {
            pub cert: String,
            pub key: String,
            _dir: tempdir::TempDir,
        }

        pub fn generate_self_signed() -> CertPaths {
            let dir = tempdir::TempDir::new("netreactor-tls-test").unwrap();
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
            let cert_path = dir.path().join("cert.pem");
            let key_path = dir.path().join("key.pem");
            std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
            std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
            CertPaths {
                cert: cert_path.to_string_lossy().into_owned(),
                key: key_path.to_string_lossy().into_owned(),
                _dir: dir,
            }
        }
    }

    #[test]
    fn handshake_completes_and_echoes() {
        let (_paths, opts) = test_certs();
        let _ = crate::config::install_tls_options(opts);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_stream = std::net::TcpStream::connect(addr).unwrap();
        let (server_stream, peer) = listener.accept().unwrap();
        server_stream.set_nonblocking(true).unwrap();
        client_stream.set_nonblocking(true).unwrap();

        let mut ev = EventLoop::new("tls-test").unwrap();
        let handle = ev.handle();
        let stop_handle = handle.clone();

        let server_fd = sockets::into_raw_fd(socket2::Socket::from(server_stream));
        let server_local = server_stream_local(server_fd);
        let server_conn = TlsConnection::accept(server_fd, server_local, peer).unwrap();
        let connected = Arc::new(AtomicUsize::new(0));
        let connected2 = connected.clone();
        server_conn.set_connection_callback(Box::new(move |c| {
            if c.is_connected() {
                connected2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let attach_conn = server_conn.clone();
        let handle_for_attach = handle.clone();
        handle.run_in_loop(move |_| attach_conn.attached_to_loop(handle_for_attach));

        let client_fd = sockets::into_raw_fd(socket2::Socket::from(client_stream));
        let client_local = server_stream_local(client_fd);
        let client_conn = TlsConnection::connect(client_fd, client_local, addr, "localhost").unwrap();
        let mut client_ev = EventLoop::new("tls-test-client").unwrap();
        let client_handle = client_ev.handle();
        let attach_client = client_conn.clone();
        let client_handle2 = client_handle.clone();
        client_handle.run_in_loop(move |_| attach_client.attached_to_loop(client_handle2));

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            EventLoop::stop(&stop_handle);
        });
        let stop_client = client_handle.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            EventLoop::stop(&stop_client);
        });

        let client_thread = std::thread::spawn(move || client_ev.run());
        ev.run();
        client_thread.join().unwrap();

        assert!(connected.load(Ordering::SeqCst) >= 1);
    }

    fn server_stream_local(fd: RawFd) -> SocketAddr {
        sockets::local_addr(fd).unwrap()
    }
}
