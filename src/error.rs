//! Error types shared across the reactor, connections, and configuration layer.

use std::io;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error taxonomy. Variants map to the error kinds a caller needs to
/// branch on: configuration failures are synchronous and returned directly;
/// network/TLS failures close the affected connection; timer/reactor failures
/// are internal invariant violations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O operation errors (sockets, pipes).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Timer registry errors (unknown id, loop not running, ...).
    #[error("timer error: {message}")]
    Timer { message: String },

    /// Event-loop invariant errors (wrong thread, loop already stopped, ...).
    #[error("reactor error: {message}")]
    Reactor { message: String },

    /// Configuration / endpoint parsing errors.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Connection-level errors surfaced as a Disconnected callback.
    #[error("network error: {message}")]
    Network { message: String },

    /// Resource exhaustion (fd limits, coroutine cap, pool capacity).
    #[error("resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    /// Cross-thread coordination errors (poisoned lock, channel closed).
    #[error("concurrency error: {message}")]
    Concurrency { message: String },

    /// TLS session errors.
    #[cfg(feature = "tls")]
    #[error("tls error: {message}")]
    Tls { message: String },

    /// DNS resolution errors.
    #[error("resolve error: {message}")]
    Resolve { message: String },

    /// Anything else.
    #[error("error: {message}")]
    Other { message: String },
}

impl Error {
    pub fn timer<S: Into<String>>(message: S) -> Self {
        Self::Timer { message: message.into() }
    }

    pub fn reactor<S: Into<String>>(message: S) -> Self {
        Self::Reactor { message: message.into() }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network { message: message.into() }
    }

    pub fn resource_exhausted<S: Into<String>>(resource: S) -> Self {
        Self::ResourceExhausted { resource: resource.into() }
    }

    pub fn concurrency<S: Into<String>>(message: S) -> Self {
        Self::Concurrency { message: message.into() }
    }

    #[cfg(feature = "tls")]
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls { message: message.into() }
    }

    pub fn resolve<S: Into<String>>(message: S) -> Self {
        Self::Resolve { message: message.into() }
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other { message: message.into() }
    }

    /// Whether the failed operation is worth retrying (connector backoff,
    /// resolver retry) as opposed to a terminal condition.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { source } => is_transient_io(source),
            Self::Timer { .. } => true,
            Self::Reactor { .. } => false,
            Self::Config { .. } => false,
            Self::Network { .. } => true,
            Self::ResourceExhausted { .. } => true,
            Self::Concurrency { .. } => true,
            #[cfg(feature = "tls")]
            Self::Tls { .. } => false,
            Self::Resolve { .. } => true,
            Self::Other { .. } => false,
        }
    }

    /// Coarse category for logging fields and metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Timer { .. } => "timer",
            Self::Reactor { .. } => "reactor",
            Self::Config { .. } => "config",
            Self::Network { .. } => "network",
            Self::ResourceExhausted { .. } => "resource",
            Self::Concurrency { .. } => "concurrency",
            #[cfg(feature = "tls")]
            Self::Tls { .. } => "tls",
            Self::Resolve { .. } => "resolve",
            Self::Other { .. } => "other",
        }
    }
}

/// `WouldBlock`/`Interrupted` are expected on non-blocking fds and never
/// surface to application code; everything else is a hard failure.
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
