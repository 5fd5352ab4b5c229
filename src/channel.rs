//! Binds one file descriptor to one event loop's readiness registration.
//!
//! A [`Channel`] owns the event-mask transitions (enable/disable read and
//! write) for its fd, but never the fd value itself — that is owned by
//! whatever higher-level object (connection, acceptor, connector) created
//! the channel. Channels also support detaching from their current loop and
//! attaching to a new one, which is the low-level primitive behind
//! cross-loop connection migration.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use mio::unix::SourceFd;
use mio::{Interest, Token};

use crate::error::{Error, Result};
use crate::event_loop::EventLoopHandle;

/// Implemented by anything a [`Channel`] can deliver readiness events to.
/// Invoked with a strong reference: the dispatcher upgrades the registered
/// `Weak` handle for the duration of the callback so the handler cannot be
/// dropped mid-dispatch even if the event triggers its own destruction.
pub trait EventHandler: Send + Sync {
    fn handle_read(&self, loop_handle: &EventLoopHandle);
    fn handle_write(&self, loop_handle: &EventLoopHandle);
}

pub type HandlerRef = Weak<dyn EventHandler + Send + Sync>;

/// Per-fd event registration. Not `Clone`: exactly one channel exists per
/// registered fd at a time.
pub struct Channel {
    fd: RawFd,
    token: Token,
    interest: Option<Interest>,
    loop_handle: Option<EventLoopHandle>,
}

impl Channel {
    /// Register `fd` with `loop_handle`, routing its events to `owner`.
    /// `owner` is stored as a `Weak` reference so the channel never keeps
    /// its handler alive by itself.
    pub fn new(loop_handle: EventLoopHandle, fd: RawFd, owner: HandlerRef) -> Self {
        let token = loop_handle.alloc_token();
        loop_handle.register_handler(token, owner);
        Channel { fd, token, interest: None, loop_handle: Some(loop_handle) }
    }

    /// A channel for `fd` with no loop attached yet. Used when a
    /// connection is constructed before it is dispatched to a worker loop;
    /// [`Channel::attach_to_new_loop`] completes the binding.
    pub fn detached(fd: RawFd) -> Self {
        Channel { fd, token: Token(usize::MAX), interest: None, loop_handle: None }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_attached(&self) -> bool {
        self.loop_handle.is_some()
    }

    pub fn has_readable_event(&self) -> bool {
        self.interest.map(|i| i.is_readable()).unwrap_or(false)
    }

    pub fn has_writable_event(&self) -> bool {
        self.interest.map(|i| i.is_writable()).unwrap_or(false)
    }

    pub fn is_none_event(&self) -> bool {
        self.interest.is_none()
    }

    pub fn enable_read(&mut self) -> Result<()> {
        self.update(|i| Some(combine(i, Interest::READABLE)))
    }

    pub fn enable_write(&mut self) -> Result<()> {
        self.update(|i| Some(combine(i, Interest::WRITABLE)))
    }

    pub fn disable_read(&mut self) -> Result<()> {
        self.update(|i| remove(i, Interest::READABLE))
    }

    pub fn disable_write(&mut self) -> Result<()> {
        self.update(|i| remove(i, Interest::WRITABLE))
    }

    pub fn disable_all(&mut self) -> Result<()> {
        self.update(|_| None)
    }

    fn update(&mut self, f: impl FnOnce(Option<Interest>) -> Option<Interest>) -> Result<()> {
        let loop_handle = self
            .loop_handle
            .as_ref()
            .ok_or_else(|| Error::reactor("channel is not attached to a loop"))?;
        let next = f(self.interest);
        match (self.interest, next) {
            (None, Some(i)) => loop_handle.registry().register(&mut SourceFd(&self.fd), self.token, i)?,
            (Some(_), Some(i)) => loop_handle.registry().reregister(&mut SourceFd(&self.fd), self.token, i)?,
            (Some(_), None) => loop_handle.registry().deregister(&mut SourceFd(&self.fd))?,
            (None, None) => {}
        }
        self.interest = next;
        Ok(())
    }

    /// Idempotent. Deregisters and drops the handler mapping, but leaves the
    /// fd itself open — the owner is responsible for closing it.
    pub fn close_event(&mut self) {
        if let Some(loop_handle) = self.loop_handle.take() {
            if self.interest.is_some() {
                let _ = loop_handle.registry().deregister(&mut SourceFd(&self.fd));
            }
            loop_handle.unregister_handler(self.token);
            self.interest = None;
        }
    }

    /// Part one of a cross-loop migration: deregister from the current loop
    /// and forget it. Must be called on the current loop's thread.
    pub fn detach_from_loop_and_reset(&mut self) {
        if let Some(loop_handle) = self.loop_handle.take() {
            if self.interest.is_some() {
                let _ = loop_handle.registry().deregister(&mut SourceFd(&self.fd));
            }
            loop_handle.unregister_handler(self.token);
        }
    }

    /// Part two of a cross-loop migration: attach to `new_loop`, restoring
    /// whatever interest mask was active before detaching. Must be called
    /// on `new_loop`'s thread.
    pub fn attach_to_new_loop(&mut self, new_loop: EventLoopHandle, owner: HandlerRef) -> Result<()> {
        debug_assert!(self.loop_handle.is_none());
        let token = new_loop.alloc_token();
        new_loop.register_handler(token, owner);
        self.token = token;
        let interest = self.interest.take();
        self.loop_handle = Some(new_loop);
        if let Some(i) = interest {
            self.interest = None;
            self.update(|_| Some(i))?;
        }
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close_event();
    }
}


fn combine(current: Option<Interest>, add: Interest) -> Interest {
    match current {
        Some(i) => i.add(add),
        None => add,
    }
}

fn remove(current: Option<Interest>, sub: Interest) -> Option<Interest> {
    let current = current?;
    if sub == Interest::READABLE {
        if current.is_writable() {
            Some(Interest::WRITABLE)
        } else {
            None
        }
    } else if current.is_readable() {
        Some(Interest::READABLE)
    } else {
        None
    }
}

/// Upgrade `handler` and dispatch; no-op if the owner has already been
/// dropped (channel outlived its connection briefly during teardown).
pub fn dispatch_read(handler: &HandlerRef, loop_handle: &EventLoopHandle) {
    if let Some(strong) = handler.upgrade() {
        strong.handle_read(loop_handle);
    }
}

pub fn dispatch_write(handler: &HandlerRef, loop_handle: &EventLoopHandle) {
    if let Some(strong) = handler.upgrade() {
        strong.handle_write(loop_handle);
    }
}
