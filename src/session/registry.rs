//! Keyed store of invites and sessions.
//!
//! Owned by the controller task. Everyone else sees it through
//! `RegistrySnapshot`, a cloned copy taken between events.

use std::collections::HashMap;

use serde::Serialize;

use super::{CallSession, CallState, LineGroup, PendingInvite, SessionId};

#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<SessionId, CallSession>,
    invites: HashMap<SessionId, PendingInvite>,
    /// network id -> local id, for invites only.
    by_network_id: HashMap<String, SessionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an invite. Refuses ids already present in either map.
    pub fn insert_invite(&mut self, invite: PendingInvite) -> bool {
        if self.contains(invite.id) || self.by_network_id.contains_key(&invite.network_id) {
            return false;
        }
        self.by_network_id
            .insert(invite.network_id.clone(), invite.id);
        self.invites.insert(invite.id, invite);
        true
    }

    /// Insert a session. Refuses ids already present in either map.
    pub fn insert_session(&mut self, session: CallSession) -> bool {
        if self.contains(session.id) {
            return false;
        }
        self.sessions.insert(session.id, session);
        true
    }

    pub fn invite(&self, id: SessionId) -> Option<&PendingInvite> {
        self.invites.get(&id)
    }

    pub fn invite_by_network_id(&self, network_id: &str) -> Option<&PendingInvite> {
        self.by_network_id
            .get(network_id)
            .and_then(|id| self.invites.get(id))
    }

    pub fn remove_invite(&mut self, id: SessionId) -> Option<PendingInvite> {
        let invite = self.invites.remove(&id)?;
        self.by_network_id.remove(&invite.network_id);
        Some(invite)
    }

    /// Turn an invite into a session under the same id. Both maps are
    /// updated in one step so the two never hold the same id.
    pub fn promote_invite(&mut self, id: SessionId) -> Option<&mut CallSession> {
        let invite = self.remove_invite(id)?;
        self.sessions.insert(id, CallSession::from_invite(invite));
        self.sessions.get_mut(&id)
    }

    pub fn session(&self, id: SessionId) -> Option<&CallSession> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut CallSession> {
        self.sessions.get_mut(&id)
    }

    pub fn remove_session(&mut self, id: SessionId) -> Option<CallSession> {
        self.sessions.remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id) || self.invites.contains_key(&id)
    }

    /// A session occupying `line` in a state that blocks new outgoing calls.
    pub fn busy_session_on(&self, line: LineGroup) -> Option<&CallSession> {
        self.sessions
            .values()
            .find(|s| s.line == line && s.state.is_busy())
    }

    /// Connected sessions on `line` other than `except`.
    pub fn connected_on(&self, line: LineGroup, except: SessionId) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.line == line && s.id != except && s.state == CallState::Connected)
            .map(|s| s.id)
            .collect()
    }

    /// Reconnecting sessions on `line` other than `except` that will resume
    /// as connected.
    pub fn reconnecting_active_on(&self, line: LineGroup, except: SessionId) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| {
                s.line == line
                    && s.id != except
                    && s.state == CallState::Reconnecting
                    && s.resume_state == Some(CallState::Connected)
            })
            .map(|s| s.id)
            .collect()
    }

    /// Whether `line` has no live session and no invite.
    pub fn line_is_free(&self, line: LineGroup) -> bool {
        !self
            .sessions
            .values()
            .any(|s| s.line == line && !s.state.is_terminal())
            && !self.invites.values().any(|i| i.line == line)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn invite_ids(&self) -> Vec<SessionId> {
        self.invites.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.invites.is_empty()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut sessions: Vec<CallSession> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        let mut invites: Vec<PendingInvite> = self.invites.values().cloned().collect();
        invites.sort_by_key(|i| i.received_at);
        RegistrySnapshot { sessions, invites }
    }
}

/// Point-in-time copy of the registry, ordered by creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub sessions: Vec<CallSession>,
    pub invites: Vec<PendingInvite>,
}

impl RegistrySnapshot {
    pub fn session(&self, id: SessionId) -> Option<&CallSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn invite(&self, id: SessionId) -> Option<&PendingInvite> {
        self.invites.iter().find(|i| i.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.invites.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn invite(network_id: &str) -> PendingInvite {
        PendingInvite {
            id: SessionId::new(),
            network_id: network_id.to_string(),
            remote_handle: "alice".to_string(),
            received_at: Utc::now(),
            line: LineGroup(0),
        }
    }

    #[test]
    fn test_promote_moves_invite_to_sessions() {
        let mut registry = Registry::new();
        let inv = invite("CA1");
        let id = inv.id;
        assert!(registry.insert_invite(inv));

        let session = registry.promote_invite(id).unwrap();
        assert_eq!(session.id, id);
        assert!(registry.invite(id).is_none());
        assert!(registry.invite_by_network_id("CA1").is_none());
        assert!(registry.session(id).is_some());
    }

    #[test]
    fn test_duplicate_network_id_refused() {
        let mut registry = Registry::new();
        assert!(registry.insert_invite(invite("CA1")));
        assert!(!registry.insert_invite(invite("CA1")));
        assert_eq!(registry.invite_ids().len(), 1);
    }

    #[test]
    fn test_lookup_by_network_id() {
        let mut registry = Registry::new();
        let a = invite("CA1");
        let b = invite("CA2");
        let b_id = b.id;
        registry.insert_invite(a);
        registry.insert_invite(b);

        assert_eq!(registry.invite_by_network_id("CA2").map(|i| i.id), Some(b_id));
        assert!(registry.invite_by_network_id("CA3").is_none());
    }

    #[test]
    fn test_busy_line_detection() {
        let mut registry = Registry::new();
        let session = CallSession::outgoing(SessionId::new(), "bob", LineGroup(0));
        let id = session.id;
        registry.insert_session(session);

        assert_eq!(registry.busy_session_on(LineGroup(0)).map(|s| s.id), Some(id));
        assert!(registry.busy_session_on(LineGroup(1)).is_none());
        assert!(!registry.line_is_free(LineGroup(0)));
        assert!(registry.line_is_free(LineGroup(1)));

        registry.session_mut(id).unwrap().transition(CallState::Connected);
        registry.session_mut(id).unwrap().transition(CallState::OnHold);
        assert!(registry.busy_session_on(LineGroup(0)).is_none());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut registry = Registry::new();
        let session = CallSession::outgoing(SessionId::new(), "bob", LineGroup(0));
        let id = session.id;
        registry.insert_session(session);

        let snapshot = registry.snapshot();
        registry.remove_session(id);

        assert!(snapshot.session(id).is_some());
        assert!(registry.is_empty());
    }
}
