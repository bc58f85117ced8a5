//! Table of monitored sockets.
//!
//! The table only does bookkeeping: which handle is watched, for what, and
//! what readiness has been observed for it. Owners of the actual sockets pair
//! every change here with the matching `mio` registration call.
//!
//! Removal swaps the last entry into the freed slot. Listener sockets are added
//! first and never removed, so the first [`SocketRegistry::interface_count`]
//! entries are always listeners.

use std::fmt;

use mio::event::Event;
use mio::{Interest, Token};

/// Identity of a registered socket. Doubles as its `mio` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub usize);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<Handle> for Token {
    fn from(handle: Handle) -> Self {
        Token(handle.0)
    }
}

impl From<Token> for Handle {
    fn from(token: Token) -> Self {
        Handle(token.0)
    }
}

/// Hands out handles that are never reused while the process runs.
#[derive(Debug)]
pub struct HandleAllocator {
    next: usize,
}

impl HandleAllocator {
    /// Start allocating after `reserved`, which stays free for the caller.
    pub fn after(reserved: Token) -> Self {
        Self { next: reserved.0 + 1 }
    }

    pub fn next(&mut self) -> Handle {
        let handle = Handle(self.next);
        self.next += 1;
        handle
    }
}

/// Readiness observed for a socket since the last time an I/O call on it
/// reported `WouldBlock`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

impl Readiness {
    pub const NONE: Readiness = Readiness {
        readable: false,
        writable: false,
        hangup: false,
    };

    pub fn merge_event(&mut self, event: &Event) {
        self.readable |= event.is_readable() || event.is_read_closed();
        self.writable |= event.is_writable();
        // A FIN alone is not a hang-up: queued data still has to be read.
        self.hangup |= event.is_error() || (event.is_read_closed() && event.is_write_closed());
    }

    /// Whether anything observed is relevant to `interest`.
    pub fn matches(&self, interest: Interest) -> bool {
        self.hangup
            || (self.readable && interest.is_readable())
            || (self.writable && interest.is_writable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEntry {
    pub handle: Handle,
    pub interest: Interest,
    pub readiness: Readiness,
}

#[derive(Debug, Default)]
pub struct SocketRegistry {
    entries: Vec<SocketEntry>,
    interface_count: usize,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handle: Handle, interest: Interest) {
        self.entries.push(SocketEntry {
            handle,
            interest,
            readiness: Readiness::NONE,
        });
    }

    /// Mark every entry added so far as a listener.
    pub fn seal_interfaces(&mut self) {
        self.interface_count = self.entries.len();
    }

    pub fn interface_count(&self) -> usize {
        self.interface_count
    }

    pub fn is_interface(&self, index: usize) -> bool {
        index < self.interface_count
    }

    /// Drop the entry for `handle`, moving the last entry into its slot.
    ///
    /// Returns `None` if the handle is not registered.
    pub fn remove(&mut self, handle: Handle) -> Option<SocketEntry> {
        let index = self.index_of(handle)?;
        debug_assert!(
            !self.is_interface(index),
            "listener {handle} removed from socket table"
        );
        Some(self.entries.swap_remove(index))
    }

    pub fn index_of(&self, handle: Handle) -> Option<usize> {
        self.entries.iter().position(|entry| entry.handle == handle)
    }

    /// Point the entry currently tracking `old` at `new` with a fresh interest.
    ///
    /// Observed readiness is discarded; the new registration reports its own.
    pub fn change(&mut self, old: Handle, new: Handle, interest: Interest) -> Option<usize> {
        let index = self.index_of(old)?;
        let entry = &mut self.entries[index];
        entry.handle = new;
        entry.interest = interest;
        entry.readiness = Readiness::NONE;
        Some(index)
    }

    pub fn change_interest(&mut self, handle: Handle, interest: Interest) -> Option<usize> {
        self.change(handle, handle, interest)
    }

    pub fn get(&self, index: usize) -> Option<&SocketEntry> {
        self.entries.get(index)
    }

    pub fn readiness_mut(&mut self, handle: Handle) -> Option<&mut Readiness> {
        let index = self.index_of(handle)?;
        Some(&mut self.entries[index].readiness)
    }

    /// Forget readiness for `handle` after an I/O call reported `WouldBlock`.
    pub fn clear_readiness(&mut self, handle: Handle) {
        if let Some(readiness) = self.readiness_mut(handle) {
            *readiness = Readiness::NONE;
        }
    }

    /// Whether any entry still has unconsumed readiness.
    pub fn has_pending(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.readiness.matches(entry.interest))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketEntry> {
        self.entries.iter()
    }
}
