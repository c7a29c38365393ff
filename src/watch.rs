//! Registry of extra descriptors polled alongside the server's own sockets.
//!
//! A watch is a descriptor, an interest mode and a callback. Any state the
//! callback needs travels in its closure. Watches can be added and removed
//! from inside any hook or callback; removals made while the event loop is
//! dispatching are applied after the pass, and a removed watch does not
//! fire again even if its descriptor is ready later in the same pass.

use std::fmt;
use std::os::fd::RawFd;

use crate::pool::{Pool, WatchId};
use crate::server::{Handler, ServerState};

/// Readiness a watch is interested in, or that was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Readable.
    Read,
    /// Writable.
    Write,
    /// Readable and writable.
    ReadWrite,
}

impl Interest {
    /// Includes readability.
    pub fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Includes writability.
    pub fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    pub(crate) fn from_flags(readable: bool, writable: bool) -> Option<Self> {
        match (readable, writable) {
            (true, true) => Some(Self::ReadWrite),
            (true, false) => Some(Self::Read),
            (false, true) => Some(Self::Write),
            (false, false) => None,
        }
    }

    pub(crate) fn poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.readable() {
            events |= libc::POLLIN;
        }
        if self.writable() {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// Callback run when a watched descriptor becomes ready.
pub type WatchCallback<H> = Box<dyn FnMut(&mut H, &mut ServerState<H>, WatchId, Interest)>;

struct Watch<H: Handler> {
    fd: RawFd,
    interest: Interest,
    callback: Option<WatchCallback<H>>,
    removed: bool,
}

/// All registered watches.
pub struct WatchRegistry<H: Handler> {
    watches: Pool<Watch<H>>,
    dispatching: bool,
    pending_removals: Vec<WatchId>,
}

impl<H: Handler> fmt::Debug for WatchRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("watches", &self.watches.len())
            .field("dispatching", &self.dispatching)
            .field("pending_removals", &self.pending_removals.len())
            .finish()
    }
}

impl<H: Handler> Default for WatchRegistry<H> {
    fn default() -> Self {
        Self {
            watches: Pool::new(),
            dispatching: false,
            pending_removals: Vec::new(),
        }
    }
}

impl<H: Handler> WatchRegistry<H> {
    /// Register `fd`. The descriptor stays owned by the caller and must
    /// outlive the watch.
    pub fn add(&mut self, fd: RawFd, interest: Interest, callback: WatchCallback<H>) -> WatchId {
        let handle = self.watches.insert(Watch {
            fd,
            interest,
            callback: Some(callback),
            removed: false,
        });
        log::debug!("[watch] added fd {} ({:?})", fd, interest);
        WatchId(handle)
    }

    /// Unregister a watch. Returns `false` for unknown or already removed ids.
    pub fn remove(&mut self, id: WatchId) -> bool {
        let Some(watch) = self.watches.get_mut(id.0) else {
            return false;
        };
        if watch.removed {
            return false;
        }
        if self.dispatching {
            watch.removed = true;
            self.pending_removals.push(id);
        } else {
            self.watches.remove(id.0);
        }
        true
    }

    /// Whether `id` is registered and not pending removal.
    pub fn is_active(&self, id: WatchId) -> bool {
        self.watches.get(id.0).is_some_and(|w| !w.removed)
    }

    /// Number of active watches.
    pub fn len(&self) -> usize {
        self.watches.len() - self.pending_removals.len()
    }

    /// Whether no watch is active.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn poll_entries(&self) -> Vec<(WatchId, RawFd, Interest)> {
        self.watches
            .iter()
            .filter(|(_, w)| !w.removed)
            .map(|(h, w)| (WatchId(h), w.fd, w.interest))
            .collect()
    }

    pub(crate) fn begin_dispatch(&mut self) {
        self.dispatching = true;
    }

    pub(crate) fn end_dispatch(&mut self) {
        self.dispatching = false;
        for id in self.pending_removals.drain(..) {
            self.watches.remove(id.0);
        }
    }

    /// Borrow the callback out of its slot so it can run with the server
    /// state mutably borrowed.
    pub(crate) fn take_callback(&mut self, id: WatchId) -> Option<WatchCallback<H>> {
        let watch = self.watches.get_mut(id.0)?;
        if watch.removed {
            return None;
        }
        watch.callback.take()
    }

    pub(crate) fn restore_callback(&mut self, id: WatchId, callback: WatchCallback<H>) {
        if let Some(watch) = self.watches.get_mut(id.0) {
            if !watch.removed && watch.callback.is_none() {
                watch.callback = Some(callback);
            }
        }
    }
}
