//! # Application State Management
//!
//! This module wires the shared components every connection handler needs:
//! the session store, the listener registry, the broadcast router, the
//! transcription bridge and the signaling relay.
//!
//! ## Arc Pattern:
//! Each component is behind an `Arc` so HTTP handlers, WebSocket actors and
//! background tasks can all hold references to the same instance; the
//! components do their own interior locking. `AppState` itself is cheap to
//! clone - it's a bundle of pointers.
//!
//! The cross-component sequencing that spans more than one of them (ending a
//! session, sweeping idle sessions) lives here too, so HTTP handlers and the
//! background sweeper run the exact same teardown path.

use crate::broadcast::{BroadcastRouter, ServerEvent};
use crate::config::AppConfig;
use crate::error::AppResult;
use crate::session::{ListenerRegistry, SessionStore};
use crate::signaling::SignalingRelay;
use crate::transcription::{TranscriptionBridge, TranslationEvent};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::info;

/// The shared application state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub sessions: Arc<SessionStore>,
    pub listeners: Arc<ListenerRegistry>,
    pub router: Arc<BroadcastRouter>,
    pub bridge: Arc<TranscriptionBridge>,
    pub relay: Arc<SignalingRelay>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the component graph.
    ///
    /// Returns the state plus the receiving end of the translation-event
    /// queue; the caller spawns the drain task that fans those events out
    /// (a single drain preserves per-session recognized order).
    pub fn new(
        config: AppConfig,
    ) -> (Self, mpsc::UnboundedReceiver<(String, TranslationEvent)>) {
        let sessions = Arc::new(SessionStore::new(config.session.clone()));
        let listeners = Arc::new(ListenerRegistry::new());
        let router = Arc::new(BroadcastRouter::new(sessions.clone(), listeners.clone()));
        let relay = Arc::new(SignalingRelay::new(
            config.speech.clone(),
            config.ice.clone(),
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(TranscriptionBridge::new(
            config.speech.clone(),
            config.audio.clone(),
            events_tx,
        ));

        let state = Self {
            config,
            sessions,
            listeners,
            router,
            bridge,
            relay,
            start_time: Instant::now(),
        };
        (state, events_rx)
    }

    /// Tear down one session.
    ///
    /// Order matters: the channel is stopped first (best-effort), the ended
    /// notification goes out while the session record still exists (so any
    /// in-flight listener lookup during teardown still resolves), and only
    /// then are the record and its memberships removed.
    pub fn end_session(&self, code: &str) -> AppResult<()> {
        self.sessions.get(code)?;

        self.bridge.stop(code);
        self.router.publish(
            code,
            ServerEvent::SessionEnded {
                code: code.to_string(),
            },
        );
        self.sessions.remove(code);
        self.listeners.remove_session(code);

        info!(session = %code, "Session ended");
        Ok(())
    }

    /// Expire sessions idle past the configured TTL; returns how many went.
    pub fn expire_idle_sessions(&self) -> usize {
        let codes = self.sessions.idle_codes();
        for code in &codes {
            info!(session = %code, "Expiring idle session");
            let _ = self.end_session(code);
        }
        codes.len()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::EventSink;
    use crate::error::AppError;
    use crate::session::CreateSessionRequest;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<ServerEvent>>,
    }

    impl EventSink for Arc<CollectingSink> {
        fn deliver(&self, event: ServerEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            source_language: Some("en-US".to_string()),
            target_language: Some("es-ES".to_string()),
            ..Default::default()
        }
    }

    fn test_state() -> AppState {
        let mut config = AppConfig::default();
        config.speech.region = "westus2".to_string();
        config.speech.key = "test-key".to_string();
        AppState::new(config).0
    }

    #[test]
    fn test_end_session_notifies_before_removal() {
        let state = test_state();
        let session = state
            .sessions
            .create(&request())
            .unwrap();

        let sink = Arc::new(CollectingSink::default());
        state.router.register("viewer", Arc::new(sink.clone()));
        state.listeners.add(&session.code, "viewer");

        state.end_session(&session.code).unwrap();

        // The viewer heard about the end proactively...
        let events = sink.events.lock().unwrap();
        assert_eq!(
            events.as_slice(),
            &[ServerEvent::SessionEnded {
                code: session.code.clone()
            }]
        );

        // ...and the record plus its memberships are gone afterwards
        assert!(matches!(
            state.sessions.get(&session.code),
            Err(AppError::NotFound(_))
        ));
        assert_eq!(state.listeners.count_of(&session.code), 0);
    }

    #[test]
    fn test_end_unknown_session_is_not_found() {
        let state = test_state();
        assert!(matches!(
            state.end_session("000000"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_broadcast_scenario_two_listeners() {
        let state = test_state();
        let session = state
            .sessions
            .create(&request())
            .unwrap();
        state
            .sessions
            .set_presenter(&session.code, "presenter")
            .unwrap();

        let presenter = Arc::new(CollectingSink::default());
        let viewer_a = Arc::new(CollectingSink::default());
        let viewer_b = Arc::new(CollectingSink::default());
        state.router.register("presenter", Arc::new(presenter.clone()));
        state.router.register("viewer-a", Arc::new(viewer_a.clone()));
        state.router.register("viewer-b", Arc::new(viewer_b.clone()));

        // Both viewers pass signaling and get counted; each add obligates a
        // count broadcast
        for id in ["viewer-a", "viewer-b"] {
            let count = state.listeners.add(&session.code, id);
            state
                .router
                .publish(&session.code, ServerEvent::ListenerCountUpdated { count });
        }
        assert_eq!(state.listeners.count_of(&session.code), 2);

        let translation = ServerEvent::TranslationResult {
            source_text: "Hello".to_string(),
            translated_text: "Hola".to_string(),
            source_language: "en-US".to_string(),
            target_language: "es-ES".to_string(),
            timestamp: chrono::Utc::now(),
        };
        state.router.publish(&session.code, translation.clone());

        // Both viewers saw count 2 and then the translation, verbatim and in
        // order; the presenter saw the translation too
        let a = viewer_a.events.lock().unwrap();
        assert_eq!(a.last(), Some(&translation));
        assert!(a.contains(&ServerEvent::ListenerCountUpdated { count: 2 }));

        let b = viewer_b.events.lock().unwrap();
        assert_eq!(b.last(), Some(&translation));

        let p = presenter.events.lock().unwrap();
        assert_eq!(p.last(), Some(&translation));
    }

    #[test]
    fn test_expire_only_sweeps_idle_sessions() {
        let mut config = AppConfig::default();
        config.speech.region = "westus2".to_string();
        config.speech.key = "test-key".to_string();
        config.session.idle_ttl_secs = 3600;
        let (state, _events) = AppState::new(config);

        let fresh = state
            .sessions
            .create(&request())
            .unwrap();

        assert_eq!(state.expire_idle_sessions(), 0);
        assert!(state.sessions.get(&fresh.code).is_ok());
    }
}
