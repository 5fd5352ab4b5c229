//! Structured logging init and runtime statistics snapshots.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber from `NETREACTOR_LOG`
/// (falling back to `info`). Safe to call more than once; later calls are
/// no-ops once a global subscriber is installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("NETREACTOR_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Point-in-time counters for a single event loop.
#[derive(Debug, Default)]
pub struct LoopStats {
    pub events_dispatched: AtomicU64,
    pub timers_fired: AtomicU64,
    pub pending_tasks_run: AtomicU64,
    pub iterations: AtomicU64,
}

impl LoopStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            pending_tasks_run: self.pending_tasks_run.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStatsSnapshot {
    pub events_dispatched: u64,
    pub timers_fired: u64,
    pub pending_tasks_run: u64,
    pub iterations: u64,
}

/// Aggregate counters for a server's connection registry.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub connections_closed: AtomicU64,
    pub active_connections: AtomicUsize,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_close(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub active_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_stats_track_active_count() {
        let stats = ServerStats::new();
        stats.on_accept();
        stats.on_accept();
        stats.on_close();
        let snap = stats.snapshot();
        assert_eq!(snap.connections_accepted, 2);
        assert_eq!(snap.connections_closed, 1);
        assert_eq!(snap.active_connections, 1);
    }
}
