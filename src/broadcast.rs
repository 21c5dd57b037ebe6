//! # Broadcast Router
//!
//! Session-scoped fan-out of server events. One `publish` delivers a single
//! canonical event to the session's presenter connection (if one is attached)
//! and to every counted listener connection. Delivery is fire-and-forget per
//! connection: a dead or slow connection never blocks, fails or reorders
//! delivery to the others.
//!
//! The router only knows connections as [`EventSink`]s. The production sink
//! wraps an actix `Recipient` pointing at a WebSocket actor; tests plug in a
//! channel-backed sink, so fan-out behavior is checkable without a running
//! actor system.
//!
//! The original service emitted each translation twice (a new-format and a
//! legacy-format frame). That shim is gone: one event shape, one emission.

use crate::session::{ListenerRegistry, SessionStore};
use actix::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Canonical server-to-client events for the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// One recognized-and-translated utterance
    TranslationResult {
        source_text: String,
        translated_text: String,
        source_language: String,
        target_language: String,
        timestamp: DateTime<Utc>,
    },

    /// The session's counted listener membership changed
    ListenerCountUpdated { count: usize },

    /// The session was ended (explicitly or by idle expiry); sent before the
    /// session record disappears so in-flight lookups still resolve
    SessionEnded { code: String },

    /// Connection-scoped failure report
    Error { code: String, message: String },

    /// Heartbeat
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

/// Actor-mailbox envelope for a [`ServerEvent`].
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct OutboundEvent(pub ServerEvent);

/// Where events for one connection go.
///
/// `deliver` must not block: implementations enqueue and return. Failures are
/// swallowed (no acknowledgement or retry is guaranteed anywhere on this path).
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: ServerEvent);
}

impl EventSink for Recipient<OutboundEvent> {
    fn deliver(&self, event: ServerEvent) {
        // do_send drops the message if the mailbox is gone, which is exactly
        // the fire-and-forget contract we want here
        self.do_send(OutboundEvent(event));
    }
}

/// Fan-out core: connection table plus session-scoped publish.
pub struct BroadcastRouter {
    connections: RwLock<HashMap<String, Arc<dyn EventSink>>>,
    sessions: Arc<SessionStore>,
    listeners: Arc<ListenerRegistry>,
}

impl BroadcastRouter {
    pub fn new(sessions: Arc<SessionStore>, listeners: Arc<ListenerRegistry>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            sessions,
            listeners,
        }
    }

    /// Attach a connection's sink. A reconnecting connection id replaces its
    /// previous sink.
    pub fn register(&self, connection_id: &str, sink: Arc<dyn EventSink>) {
        self.connections
            .write()
            .unwrap()
            .insert(connection_id.to_string(), sink);
    }

    /// Detach a connection's sink (socket closed).
    pub fn unregister(&self, connection_id: &str) {
        self.connections.write().unwrap().remove(connection_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// Deliver an event to the session's presenter and every counted listener.
    ///
    /// Recipients are resolved at publish time, so a listener added a moment
    /// ago is included and one that just left is not. Returns how many
    /// connections were handed the event.
    pub fn publish(&self, code: &str, event: ServerEvent) -> usize {
        let mut recipient_ids = self.listeners.members_of(code);
        if let Some(presenter) = self.sessions.presenter_of(code) {
            if !recipient_ids.contains(&presenter) {
                recipient_ids.push(presenter);
            }
        }

        if recipient_ids.is_empty() {
            return 0;
        }

        // Snapshot the sinks, then deliver outside the lock: a sink that's
        // slow to enqueue must not hold up registrations
        let sinks: Vec<Arc<dyn EventSink>> = {
            let connections = self.connections.read().unwrap();
            recipient_ids
                .iter()
                .filter_map(|id| connections.get(id).cloned())
                .collect()
        };

        for sink in &sinks {
            sink.deliver(event.clone());
        }

        debug!(
            session = %code,
            recipients = sinks.len(),
            "Event published"
        );
        sinks.len()
    }
}
