//! # Listener Registry
//!
//! Tracks which connections are counted as listeners of which session. This is
//! membership bookkeeping only: the registry never sends anything. Count
//! change notifications are the caller's obligation, delivered through the
//! broadcast router, which keeps this component free of transport concerns.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Per-session listener membership, keyed by session code.
///
/// Invariant: a connection appears in at most one session's set. A connection
/// that re-subscribes elsewhere replaces its prior membership.
#[derive(Default)]
pub struct ListenerRegistry {
    members: RwLock<HashMap<String, HashSet<String>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a membership and return the session's new listener count.
    /// Idempotent for a duplicate add from the same connection.
    pub fn add(&self, code: &str, connection_id: &str) -> usize {
        let mut members = self.members.write().unwrap();

        // Drop any membership this connection holds elsewhere
        for (other_code, set) in members.iter_mut() {
            if other_code != code {
                set.remove(connection_id);
            }
        }
        members.retain(|_, set| !set.is_empty());

        let set = members.entry(code.to_string()).or_default();
        set.insert(connection_id.to_string());
        set.len()
    }

    /// Remove a membership if present; returns the session's new count
    /// (0 for an unknown session). Never an error.
    pub fn remove(&self, code: &str, connection_id: &str) -> usize {
        let mut members = self.members.write().unwrap();
        match members.get_mut(code) {
            Some(set) => {
                set.remove(connection_id);
                let count = set.len();
                if count == 0 {
                    members.remove(code);
                }
                count
            }
            None => 0,
        }
    }

    /// Remove a connection from whatever session holds it, returning that
    /// session's code and new count. Used on socket disconnect, where the
    /// connection doesn't tell us which session it was in.
    pub fn remove_connection(&self, connection_id: &str) -> Option<(String, usize)> {
        let mut members = self.members.write().unwrap();
        let code = members
            .iter()
            .find(|(_, set)| set.contains(connection_id))?
            .0
            .clone();

        let set = members.get_mut(&code).unwrap();
        set.remove(connection_id);
        let count = set.len();
        if count == 0 {
            members.remove(&code);
        }
        Some((code, count))
    }

    /// Drop every membership for a session (session ended).
    pub fn remove_session(&self, code: &str) {
        self.members.write().unwrap().remove(code);
    }

    pub fn count_of(&self, code: &str) -> usize {
        self.members
            .read()
            .unwrap()
            .get(code)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Snapshot of a session's listener connection ids.
    pub fn members_of(&self, code: &str) -> Vec<String> {
        self.members
            .read()
            .unwrap()
            .get(code)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total listener connections across all sessions.
    pub fn total_connections(&self) -> usize {
        self.members.read().unwrap().values().map(|s| s.len()).sum()
    }
}
