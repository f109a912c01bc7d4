//! Presenter slot state machine
//!
//! ```text
//!          request (slot empty)
//!   Empty ───────────────────────► Held(id)
//!     ▲                               │
//!     │  stop / force-stop / holder   │
//!     └────────────── removed ────────┘
//! ```
//!
//! The slot itself is a plain state machine; permission checks and the
//! serialization of transitions live in the registry owner, which is the
//! only mutator.

use std::time::Instant;

use crate::registry::error::RegistryError;
use crate::registry::participant::ClientId;

/// Either empty or held by exactly one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterSlot {
    Empty,
    Held { id: ClientId, since: Instant },
}

impl PresenterSlot {
    pub fn new() -> Self {
        PresenterSlot::Empty
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<ClientId> {
        match self {
            PresenterSlot::Empty => None,
            PresenterSlot::Held { id, .. } => Some(*id),
        }
    }

    pub fn is_held_by(&self, id: ClientId) -> bool {
        self.holder() == Some(id)
    }

    /// Try to take the slot. Re-requesting an already-held slot by the same
    /// participant is refused like any other taken slot.
    pub fn request(&mut self, id: ClientId) -> Result<(), RegistryError> {
        match self {
            PresenterSlot::Empty => {
                *self = PresenterSlot::Held {
                    id,
                    since: Instant::now(),
                };
                Ok(())
            }
            PresenterSlot::Held { .. } => Err(RegistryError::PresenterBusy),
        }
    }

    /// Release the slot if `id` holds it. Returns true when released.
    pub fn release_if(&mut self, id: ClientId) -> bool {
        if self.is_held_by(id) {
            *self = PresenterSlot::Empty;
            true
        } else {
            false
        }
    }

    /// Unconditionally clear the slot, returning the former holder.
    pub fn clear(&mut self) -> Option<ClientId> {
        let former = self.holder();
        *self = PresenterSlot::Empty;
        former
    }
}

impl Default for PresenterSlot {
    fn default() -> Self {
        Self::new()
    }
}
