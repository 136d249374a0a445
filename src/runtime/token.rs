//! Readiness token tracking for a worker's multiplexer.
//!
//! Every source a worker registers (client sockets and reply timers) gets a
//! `mio::Token` that maps back to what the event is about. Freed tokens are
//! retired rather than recycled immediately: a batch of events returned by
//! one `poll` may still mention a token whose source was torn down earlier
//! in the same batch, and that stale event must not land on a brand-new
//! client or timer that happened to get the same slot.

use mio::Token;
use slab::Slab;

/// What a readiness event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A client socket.
    Client {
        /// Client identifier in the worker's client slab.
        client_id: usize,
    },
    /// A reply-deadline timer.
    Timer {
        /// Timer identifier in the worker's timer slab.
        timer_id: usize,
    },
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Live(Source),
    Retired,
}

/// Allocator for multiplexer tokens with deferred reuse.
pub struct TokenAllocator {
    slots: Slab<Slot>,
    retired: Vec<usize>,
}

impl TokenAllocator {
    /// Create a new token allocator with specified capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            retired: Vec::new(),
        }
    }

    /// Allocate a token for `source`.
    pub fn alloc(&mut self, source: Source) -> Token {
        Token(self.slots.insert(Slot::Live(source)))
    }

    /// Look up the source behind a token.
    ///
    /// Returns `None` for unknown and retired tokens.
    pub fn get(&self, token: Token) -> Option<Source> {
        match self.slots.get(token.0) {
            Some(Slot::Live(source)) => Some(*source),
            _ => None,
        }
    }

    /// Stop resolving `token`; its slot is reclaimed by `release_retired`.
    ///
    /// Returns the source that was associated with the token.
    pub fn retire(&mut self, token: Token) -> Option<Source> {
        let slot = self.slots.get_mut(token.0)?;
        match std::mem::replace(slot, Slot::Retired) {
            Slot::Live(source) => {
                self.retired.push(token.0);
                Some(source)
            }
            Slot::Retired => None,
        }
    }

    /// Recycle every retired slot. Call once the current event batch is done.
    pub fn release_retired(&mut self) -> usize {
        let count = self.retired.len();
        for idx in self.retired.drain(..) {
            self.slots.remove(idx);
        }
        count
    }

    /// Number of tokens that still resolve to a source.
    pub fn live(&self) -> usize {
        self.slots.len() - self.retired.len()
    }

    /// Number of slots held, retired ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if no slot is held at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
