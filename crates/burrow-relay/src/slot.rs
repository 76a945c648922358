//! The relay's single active-session slot
//!
//! Every transition is one locked step, and every clear is keyed by the
//! generation that filled the slot, so a stale registration handler can
//! never evict a newer session.

use burrow_transport::Session;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identifies one occupancy of the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

enum State {
    Empty,
    /// A registration is being upgraded
    Reserved(Generation),
    Active(Generation, Arc<Session>),
}

struct Inner {
    state: State,
    next_generation: u64,
}

/// Holds at most one agent session
pub struct SessionSlot {
    inner: Mutex<Inner>,
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Empty,
                next_generation: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot for a new registration.
    ///
    /// Succeeds when the slot is empty or holds a session that has already
    /// closed; returns `None` while another registration is live.
    pub fn reserve(&self) -> Option<Generation> {
        let mut inner = self.lock();

        let vacant = match &inner.state {
            State::Empty => true,
            State::Reserved(_) => false,
            State::Active(_, session) => session.is_closed(),
        };
        if !vacant {
            return None;
        }

        let generation = Generation(inner.next_generation);
        inner.next_generation += 1;
        inner.state = State::Reserved(generation);
        Some(generation)
    }

    /// Install the session for a reservation; fails if the reservation was
    /// released in the meantime
    pub fn activate(&self, generation: Generation, session: Arc<Session>) -> bool {
        let mut inner = self.lock();

        let reserved = matches!(inner.state, State::Reserved(g) if g == generation);
        if reserved {
            inner.state = State::Active(generation, session);
        }
        reserved
    }

    /// Empty the slot if it still belongs to `generation`
    pub fn release(&self, generation: Generation) -> bool {
        let mut inner = self.lock();

        let owned = match &inner.state {
            State::Reserved(g) | State::Active(g, _) => *g == generation,
            State::Empty => false,
        };
        if owned {
            inner.state = State::Empty;
        }
        owned
    }

    /// The live session, if any
    pub fn active(&self) -> Option<(Generation, Arc<Session>)> {
        match &self.lock().state {
            State::Active(generation, session) if !session.is_closed() => {
                Some((*generation, session.clone()))
            }
            _ => None,
        }
    }

    /// Empty the slot unconditionally, returning the session it held
    pub fn take(&self) -> Option<Arc<Session>> {
        let mut inner = self.lock();

        match std::mem::replace(&mut inner.state, State::Empty) {
            State::Active(_, session) => Some(session),
            _ => None,
        }
    }
}
