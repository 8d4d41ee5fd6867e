//! Session registry.
//!
//! The set of active peer sessions for one account, indexed by
//! (remote identity, capability) and by cookie. The number of simultaneous
//! rendezvous sessions is small, so a linearly scanned `Vec` is all the
//! structure this needs. Insert and remove perform no I/O.

use crate::cookie::Cookie;
use crate::session::{Capability, PeerSession};

/// Owning collection of the account's active peer sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Vec<PeerSession>,
    next_id: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    /// Allocate a session id. Ids are never reused within one registry.
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn insert(&mut self, session: PeerSession) {
        log::debug!(
            "registering {} session with {} (cookie={})",
            session.capability,
            session.peer,
            session.cookie
        );
        self.sessions.push(session);
    }

    /// Detach the session with the given id from the registry, leaving its
    /// resources intact. Callers either put it back or tear it down.
    pub(crate) fn take(&mut self, id: u64) -> Option<PeerSession> {
        let pos = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.swap_remove(pos))
    }

    pub fn find_by_peer(&self, peer: &str, capability: Capability) -> Option<&PeerSession> {
        self.sessions
            .iter()
            .find(|s| s.capability == capability && s.peer == peer)
    }

    pub fn find_by_cookie(&self, cookie: &Cookie) -> Option<&PeerSession> {
        self.sessions.iter().find(|s| s.cookie == *cookie)
    }

    /// Control messages carry both the sender identity and the cookie; a
    /// message whose cookie matches but whose sender does not is never
    /// attributed to the session.
    pub fn find_by_peer_and_cookie(
        &self,
        peer: &str,
        cookie: &Cookie,
    ) -> Option<&PeerSession> {
        self.sessions
            .iter()
            .find(|s| s.cookie == *cookie && s.peer == peer)
    }

    #[cfg(test)]
    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut PeerSession> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
