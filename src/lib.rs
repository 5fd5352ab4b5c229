//! # netreactor
//!
//! A reactor-based, multi-threaded networking core for TCP and TLS: one
//! cooperative event loop per OS thread, connections dispatched across a
//! pool of those loops, and cross-loop migration, reconnection, and
//! coroutine-based task execution built on top.
//!
//! ## Layout
//!
//! - [`buffer`] — the growable byte buffer used for both socket I/O directions.
//! - [`sockets`] — portable BSD socket wrappers and the endpoint address grammar.
//! - [`channel`] — binds one fd's readiness interest to one loop.
//! - [`timer`] — per-loop timer registry (one-shot and periodic).
//! - [`event_loop`] — the reactor itself: poll, dispatch, pending-task queue.
//! - [`loop_thread`] — a pool of event loops, each on its own OS thread.
//! - [`acceptor`] — non-blocking listen/accept.
//! - [`connector`] — non-blocking outbound connect with retry.
//! - [`connection`] — a full-duplex plain TCP connection.
//! - [`tls`] — the TLS equivalent of [`connection`], backed by `rustls`.
//! - [`server`] — composes acceptors, a loop pool, and a connection registry.
//! - [`client`] — composes a connector and a single reconnecting connection.
//! - [`dns`] — one-shot asynchronous name resolution with timeout.
//! - [`coroutine`] — a dedicated thread running tasks as stackful coroutines.
//! - [`config`] — process and per-component configuration.
//! - [`error`] — the crate's error taxonomy.
//! - [`observability`] — tracing setup and atomic stat counters.

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod connector;
pub mod coroutine;
pub mod dns;
pub mod error;
pub mod event_loop;
pub mod loop_thread;
pub mod observability;
pub mod server;
pub mod sockets;
#[cfg(feature = "tls")]
pub mod tls;
pub mod timer;

pub use client::TcpClient;
pub use connection::Connection;
pub use connector::Connector;
pub use coroutine::CoroutineWorker;
pub use error::{Error, Result};
pub use event_loop::{EventLoop, EventLoopHandle};
pub use loop_thread::EventLoopThreadPool;
pub use server::TcpServer;

#[cfg(feature = "tls")]
pub use tls::TlsConnection;
