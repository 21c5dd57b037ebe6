//! # Transcription Bridge
//!
//! Owns the streaming recognition+translation channels, exactly one per
//! session. A channel is a WebSocket to the cloud speech service carrying
//! binary PCM frames upstream and JSON result events downstream. Recognition
//! is not frame-synchronous: results arrive on their own schedule and are
//! only ordered relative to each other, never to the audio chunks that
//! produced them.
//!
//! ## Channel lifecycle:
//! Idle -> Streaming -> Idle. `stop` tears the channel down completely; a
//! later `start` dials a fresh one (no paused state, no preserved
//! recognition context). Frames arriving after `stop` are discarded
//! silently to tolerate in-flight stragglers.
//!
//! ## Upstream wire contract:
//! The service emits one JSON object per text frame:
//! - `{"kind": "recognized", "text": ..., "translations": {"es": ...}}`
//! - `{"kind": "noMatch"}` when audio contained no usable speech
//! - `{"kind": "canceled", "reason": ...}` when the service aborts the turn

use crate::broadcast::ServerEvent;
use crate::config::{AudioConfig, SpeechConfig};
use crate::error::{AppError, AppResult};
use crate::session::Session;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

/// Frames a slow upstream may lag behind before we shed the newest ones.
const AUDIO_QUEUE_DEPTH: usize = 64;

/// One recognized-and-translated utterance, in recognized order.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationEvent {
    pub source_text: String,
    pub translated_text: String,
    pub source_language: String,
    pub target_language: String,
    pub timestamp: DateTime<Utc>,
}

impl From<TranslationEvent> for ServerEvent {
    fn from(event: TranslationEvent) -> Self {
        ServerEvent::TranslationResult {
            source_text: event.source_text,
            translated_text: event.translated_text,
            source_language: event.source_language,
            target_language: event.target_language,
            timestamp: event.timestamp,
        }
    }
}

/// Queue the bridge emits onto; a single drain task preserves per-session order.
pub type SessionEventSender = mpsc::UnboundedSender<(String, TranslationEvent)>;

/// Result messages from the recognition service.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum UpstreamMessage {
    Recognized {
        text: String,
        #[serde(default)]
        translations: HashMap<String, String>,
    },
    NoMatch,
    Canceled {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Per-channel language context the reader task needs.
#[derive(Clone)]
struct ChannelContext {
    code: String,
    source_language: String,
    target_language: String,
    target_short: String,
}

/// Handle to one open channel; dropping `audio_tx` ends the writer, the
/// notify permit ends the reader.
struct ChannelHandle {
    audio_tx: mpsc::Sender<Vec<u8>>,
    shutdown: Arc<Notify>,
}

pub struct TranscriptionBridge {
    speech: SpeechConfig,
    audio: AudioConfig,
    events: SessionEventSender,
    channels: RwLock<HashMap<String, ChannelHandle>>,
}

impl TranscriptionBridge {
    pub fn new(speech: SpeechConfig, audio: AudioConfig, events: SessionEventSender) -> Self {
        Self {
            speech,
            audio,
            events,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Open the streaming channel for a session.
    ///
    /// Fails `AlreadyActive` when this session already has one (the existing
    /// channel is unaffected) and `UpstreamUnavailable` when the service
    /// can't be dialed.
    pub async fn start(&self, session: &Session) -> AppResult<()> {
        let code = session.code.clone();

        if self.channels.read().unwrap().contains_key(&code) {
            return Err(AppError::AlreadyActive(format!(
                "Translation already running for session '{}'",
                code
            )));
        }

        let context = ChannelContext {
            code: code.clone(),
            source_language: session.source_language.clone(),
            target_language: session.target_language.clone(),
            target_short: session.target_language_short().to_string(),
        };

        let url = self
            .speech
            .recognition_url(&context.source_language, &context.target_short);
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "Ocp-Apim-Subscription-Key",
            HeaderValue::from_str(&self.speech.key)
                .map_err(|err| AppError::Internal(format!("Invalid speech key: {}", err)))?,
        );

        let (socket, _) = connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_QUEUE_DEPTH);
        let shutdown = Arc::new(Notify::new());

        // Second starter loses the race here; its freshly dialed socket is
        // dropped, which closes it
        {
            let mut channels = self.channels.write().unwrap();
            if channels.contains_key(&code) {
                return Err(AppError::AlreadyActive(format!(
                    "Translation already running for session '{}'",
                    code
                )));
            }
            channels.insert(
                code.clone(),
                ChannelHandle {
                    audio_tx,
                    shutdown: shutdown.clone(),
                },
            );
        }

        info!(
            session = %code,
            source = %context.source_language,
            target = %context.target_language,
            "Translation channel opened"
        );

        // Writer: drain queued frames into the socket, then close it
        let writer_code = code.clone();
        tokio::spawn(async move {
            let mut frames = ReceiverStream::new(audio_rx);
            while let Some(frame) = frames.next().await {
                if sink.send(Message::Binary(frame)).await.is_err() {
                    warn!(session = %writer_code, "Upstream audio write failed");
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            debug!(session = %writer_code, "Channel writer stopped");
        });

        // Reader: decode result events until the socket or the session stops.
        // The select keeps stop() bounded: the permit wakes us even if the
        // upstream never sends another frame.
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            handle_upstream_text(&text, &context, &events);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(session = %context.code, "Upstream closed the channel");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(session = %context.code, "Channel read error: {}", err);
                            break;
                        }
                    }
                }
            }
            debug!(session = %context.code, "Channel reader stopped");
        });

        Ok(())
    }

    /// Queue one chunk of 16 kHz mono PCM for a session.
    ///
    /// Never blocks the caller: a full queue sheds the newest frame, and a
    /// frame for a session with no open channel (stopped, never started, or
    /// a straggler racing a stop) is discarded without error.
    pub fn push_audio(&self, code: &str, frame: Vec<u8>) {
        let sample_bytes = usize::from(self.audio.bit_depth / 8).max(1);
        if frame.is_empty() || frame.len() % sample_bytes != 0 {
            debug!(session = %code, bytes = frame.len(), "Malformed audio frame dropped");
            return;
        }

        let sender = self
            .channels
            .read()
            .unwrap()
            .get(code)
            .map(|handle| handle.audio_tx.clone());

        match sender {
            Some(tx) => {
                if tx.try_send(frame).is_err() {
                    debug!(session = %code, "Audio queue full, frame dropped");
                }
            }
            None => {
                debug!(session = %code, "Audio frame for inactive session discarded");
            }
        }
    }

    /// Close a session's channel. Idempotent: stopping a session with no
    /// open channel is a no-op, never an error.
    pub fn stop(&self, code: &str) {
        let handle = self.channels.write().unwrap().remove(code);
        if let Some(handle) = handle {
            // notify_one stores a permit, so the reader stops even if it
            // isn't parked on the notify at this instant
            handle.shutdown.notify_one();
            info!(session = %code, "Translation channel closed");
        }
    }

    pub fn is_streaming(&self, code: &str) -> bool {
        self.channels.read().unwrap().contains_key(code)
    }

    pub fn open_channel_count(&self) -> usize {
        self.channels.read().unwrap().len()
    }
}

/// Decode one upstream text frame and emit its translation, if any.
fn handle_upstream_text(text: &str, context: &ChannelContext, events: &SessionEventSender) {
    let message: UpstreamMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(session = %context.code, "Unparsable upstream message: {}", err);
            return;
        }
    };

    match message {
        UpstreamMessage::Recognized { text, translations } => {
            let Some(translated) = translations.get(&context.target_short) else {
                debug!(
                    session = %context.code,
                    target = %context.target_short,
                    "Recognized phrase without target translation"
                );
                return;
            };

            let event = TranslationEvent {
                source_text: text,
                translated_text: translated.clone(),
                source_language: context.source_language.clone(),
                target_language: context.target_language.clone(),
                timestamp: Utc::now(),
            };

            // Receiver gone means the server is shutting down; nothing to do
            let _ = events.send((context.code.clone(), event));
        }
        UpstreamMessage::NoMatch => {
            debug!(session = %context.code, "No speech recognized");
        }
        UpstreamMessage::Canceled { reason } => {
            warn!(
                session = %context.code,
                reason = %reason.unwrap_or_default(),
                "Upstream canceled recognition"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::{CreateSessionRequest, SessionStore};

    fn audio_config() -> AudioConfig {
        AudioConfig {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }

    fn speech_config(recognition_endpoint: Option<String>) -> SpeechConfig {
        SpeechConfig {
            region: "westus2".to_string(),
            key: "test-key".to_string(),
            recognition_endpoint,
            avatar_endpoint: None,
            token_endpoint: None,
            default_voice: "DragonLatestNeural".to_string(),
        }
    }

    fn session() -> Session {
        let store = SessionStore::new(SessionConfig {
            code_length: 6,
            idle_ttl_secs: 0,
            sweep_interval_secs: 60,
            max_sessions: 10,
        });
        store
            .create(&CreateSessionRequest {
                source_language: Some("en-US".to_string()),
                target_language: Some("es-ES".to_string()),
                ..Default::default()
            })
            .unwrap()
    }

    fn context(code: &str) -> ChannelContext {
        ChannelContext {
            code: code.to_string(),
            source_language: "en-US".to_string(),
            target_language: "es-ES".to_string(),
            target_short: "es".to_string(),
        }
    }

    fn bridge_with_events(
        endpoint: Option<String>,
    ) -> (
        TranscriptionBridge,
        mpsc::UnboundedReceiver<(String, TranslationEvent)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TranscriptionBridge::new(speech_config(endpoint), audio_config(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_start_unreachable_upstream() {
        // Nothing listens on port 9; the dial must surface as an upstream failure
        let (bridge, _rx) =
            bridge_with_events(Some("ws://127.0.0.1:9/speech/universal/v2".to_string()));
        let session = session();

        match bridge.start(&session).await {
            Err(AppError::UpstreamUnavailable(_)) => {}
            other => panic!("Expected UpstreamUnavailable, got {:?}", other),
        }
        assert!(!bridge.is_streaming(&session.code));
    }

    #[tokio::test]
    async fn test_second_start_is_already_active() {
        let (bridge, _rx) = bridge_with_events(None);
        let session = session();

        // Simulate an open channel without dialing anything
        let (audio_tx, _audio_rx) = mpsc::channel(4);
        bridge.channels.write().unwrap().insert(
            session.code.clone(),
            ChannelHandle {
                audio_tx,
                shutdown: Arc::new(Notify::new()),
            },
        );

        match bridge.start(&session).await {
            Err(AppError::AlreadyActive(_)) => {}
            other => panic!("Expected AlreadyActive, got {:?}", other),
        }
        // The original channel is unaffected
        assert!(bridge.is_streaming(&session.code));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_frames_after_stop_discarded() {
        let (bridge, _rx) = bridge_with_events(None);
        let session = session();

        let (audio_tx, mut audio_rx) = mpsc::channel(4);
        bridge.channels.write().unwrap().insert(
            session.code.clone(),
            ChannelHandle {
                audio_tx,
                shutdown: Arc::new(Notify::new()),
            },
        );

        bridge.push_audio(&session.code, vec![0u8; 320]);
        assert!(audio_rx.try_recv().is_ok());

        bridge.stop(&session.code);
        bridge.stop(&session.code); // second stop must not panic or error
        assert!(!bridge.is_streaming(&session.code));

        // Straggler frame after stop: silently discarded
        bridge.push_audio(&session.code, vec![0u8; 320]);
        assert!(audio_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_audio_rejects_odd_length_frames() {
        let (bridge, _rx) = bridge_with_events(None);
        let session = session();

        let (audio_tx, mut audio_rx) = mpsc::channel(4);
        bridge.channels.write().unwrap().insert(
            session.code.clone(),
            ChannelHandle {
                audio_tx,
                shutdown: Arc::new(Notify::new()),
            },
        );

        bridge.push_audio(&session.code, vec![0u8; 321]);
        bridge.push_audio(&session.code, Vec::new());
        assert!(audio_rx.try_recv().is_err());
    }

    #[test]
    fn test_recognized_message_becomes_event() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let raw = r#"{"kind": "recognized", "text": "Hello", "translations": {"es": "Hola"}}"#;

        handle_upstream_text(raw, &context("123456"), &events);

        let (code, event) = rx.try_recv().unwrap();
        assert_eq!(code, "123456");
        assert_eq!(event.source_text, "Hello");
        assert_eq!(event.translated_text, "Hola");
        assert_eq!(event.source_language, "en-US");
        assert_eq!(event.target_language, "es-ES");
    }

    #[test]
    fn test_untranslated_and_nomatch_messages_emit_nothing() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let ctx = context("123456");

        // Recognized, but no translation for our target language
        handle_upstream_text(
            r#"{"kind": "recognized", "text": "Hello", "translations": {"fr": "Bonjour"}}"#,
            &ctx,
            &events,
        );
        handle_upstream_text(r#"{"kind": "noMatch"}"#, &ctx, &events);
        handle_upstream_text(r#"{"kind": "canceled", "reason": "quota"}"#, &ctx, &events);
        handle_upstream_text("not json", &ctx, &events);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_converts_to_canonical_server_event() {
        let event = TranslationEvent {
            source_text: "Hello".to_string(),
            translated_text: "Hola".to_string(),
            source_language: "en-US".to_string(),
            target_language: "es-ES".to_string(),
            timestamp: Utc::now(),
        };

        match ServerEvent::from(event) {
            ServerEvent::TranslationResult {
                source_text,
                translated_text,
                ..
            } => {
                assert_eq!(source_text, "Hello");
                assert_eq!(translated_text, "Hola");
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }
}
