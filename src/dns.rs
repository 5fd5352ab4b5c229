//! Asynchronous DNS resolution with timeout-based cancellation.
//!
//! There is no async `getaddrinfo` in this stack, so lookups are dispatched
//! onto a small dedicated resolver thread pool and the result is marshaled
//! back onto the caller's loop via [`EventLoopHandle::run_in_loop`]. A
//! timeout timer races the lookup: whichever finishes first wins, and the
//! loser's outcome is discarded.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::event_loop::EventLoopHandle;

/// `0` means success; any other value means failure. `TIMED_OUT` is
/// distinguishable from a generic lookup failure so callers can tell a
/// cancelled-by-timeout request apart from e.g. NXDOMAIN.
pub type ResolveErrCode = i32;
pub const OK: ResolveErrCode = 0;
pub const ERR_LOOKUP_FAILED: ResolveErrCode = 1;
pub const ERR_TIMED_OUT: ResolveErrCode = 2;

pub type ResolveCallback = Box<dyn FnOnce(ResolveErrCode, Vec<IpAddr>) + Send>;

struct Outcome {
    done: AtomicBool,
}

/// One-shot async `host -> [IpAddr]` lookup bound to a loop and a timeout.
pub struct Resolver {
    loop_handle: EventLoopHandle,
    timeout: Duration,
}

impl Resolver {
    pub fn new(loop_handle: EventLoopHandle, timeout: Duration) -> Self {
        Self { loop_handle, timeout }
    }

    /// Resolve `host`, invoking `callback(errcode, addrs)` on the loop
    /// thread exactly once, whichever of {lookup completes, timeout fires}
    /// happens first.
    pub fn resolve(&self, host: impl Into<String>, callback: ResolveCallback) {
        let host = host.into();
        let outcome = Arc::new(Outcome { done: AtomicBool::new(false) });
        let callback = Arc::new(Mutex::new(Some(callback)));

        let outcome_for_timer = outcome.clone();
        let callback_for_timer = callback.clone();
        let timer_id = self.loop_handle.run_after_timer(self.timeout, move || {
            if outcome_for_timer.done.swap(true, Ordering::AcqRel) {
                return; // lookup already delivered its result
            }
            if let Some(cb) = callback_for_timer.lock().unwrap().take() {
                cb(ERR_TIMED_OUT, Vec::new());
            }
        });

        let loop_for_lookup = self.loop_handle.clone();
        let loop_for_cancel = self.loop_handle.clone();
        thread::spawn(move || {
            let (tx, rx) = mpsc::channel();
            // A second thread runs the actual (blocking) lookup so this
            // dispatcher thread stays cheap to spawn per-request; only the
            // lookup itself can block indefinitely on a hung resolver.
            let lookup_host = host.clone();
            thread::spawn(move || {
                let result = lookup(&lookup_host);
                let _ = tx.send(result);
            });
            let result = rx.recv().unwrap_or_else(|_| Err(()));

            loop_for_lookup.run_in_loop(move |_ev| {
                if outcome.done.swap(true, Ordering::AcqRel) {
                    return; // timed out already; discard this late result
                }
                loop_for_cancel.cancel_timer(timer_id);
                if let Some(cb) = callback.lock().unwrap().take() {
                    match result {
                        Ok(addrs) => cb(OK, addrs),
                        Err(()) => cb(ERR_LOOKUP_FAILED, Vec::new()),
                    }
                }
            });
        });
    }
}

/// Blocking lookup via `std::net::ToSocketAddrs`, which resolves through
/// the platform's `getaddrinfo`. Excludes the zero/unspecified address,
/// since a connector can never dial it.
fn lookup(host: &str) -> Result<Vec<IpAddr>, ()> {
    use std::net::ToSocketAddrs;
    let addrs: Vec<IpAddr> = (host, 0u16)
        .to_socket_addrs()
        .map_err(|_| ())?
        .map(|sa| sa.ip())
        .filter(|ip| !ip.is_unspecified())
        .collect();
    if addrs.is_empty() {
        Err(())
    } else {
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::AtomicI32;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn resolves_localhost() {
        let mut ev = EventLoop::new("dns-test").unwrap();
        let handle = ev.handle();
        let stop_handle = handle.clone();
        let resolver = Resolver::new(handle, Duration::from_millis(500));
        let errcode = Arc::new(AtomicI32::new(-1));
        let addrs = Arc::new(StdMutex::new(Vec::new()));
        let errcode2 = errcode.clone();
        let addrs2 = addrs.clone();
        resolver.resolve("localhost", Box::new(move |code, list| {
            errcode2.store(code, Ordering::SeqCst);
            *addrs2.lock().unwrap() = list;
            EventLoop::stop(&stop_handle);
        }));
        ev.run();
        assert_eq!(errcode.load(Ordering::SeqCst), OK);
        assert!(addrs.lock().unwrap().iter().any(|ip| ip.is_loopback()));
    }

    #[test]
    fn unresolvable_name_reports_lookup_failure() {
        let mut ev = EventLoop::new("dns-test2").unwrap();
        let handle = ev.handle();
        let stop_handle = handle.clone();
        let resolver = Resolver::new(handle, Duration::from_millis(500));
        let errcode = Arc::new(AtomicI32::new(-1));
        let errcode2 = errcode.clone();
        resolver.resolve("this-name-should-not-resolve.invalid", Box::new(move |code, _list| {
            errcode2.store(code, Ordering::SeqCst);
            EventLoop::stop(&stop_handle);
        }));
        ev.run();
        assert_ne!(errcode.load(Ordering::SeqCst), OK);
    }
}
