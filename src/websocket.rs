//! # Real-Time Event Channel
//!
//! Handles the per-connection WebSocket for presenters and listeners.
//! Clients connect to `/ws` and subscribe to a session; the server pushes
//! session events (translations, listener counts, session end) as they
//! happen - real-time delivery is push-based, never polled.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: Client connects; the server assigns a connection id
//! 2. **Subscribe**: Client sends `subscribe{code, connectionId?, role?}`
//! 3. **Audio Streaming**: The presenter then sends binary PCM frames
//!    (16-bit, 16kHz, mono), which are forwarded to the session's
//!    transcription channel
//! 4. **Events**: Server sends JSON events for the subscribed session
//! 5. **Heartbeat**: Server pings every 30s; a client silent for 60s is
//!    disconnected
//!
//! Subscribing attaches the connection to the broadcast router. It does NOT
//! count the connection as a listener: listener membership is only granted
//! by a successful avatar negotiation (see `handlers::sessions`), so a
//! viewer whose signaling fails is never counted.

use crate::broadcast::{OutboundEvent, ServerEvent};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// What a connection is to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Presenter,
    #[default]
    Listener,
}

/// Client-to-server messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Attach this connection to a session's event stream
    Subscribe {
        code: String,
        /// Client-supplied connection identifier; the server keeps its own
        /// when absent. Signaling calls must quote the same id.
        #[serde(default)]
        connection_id: Option<String>,
        #[serde(default)]
        role: Role,
    },

    /// Heartbeat reply to a server ping
    Pong { timestamp: u64 },

    /// Client-initiated heartbeat
    Ping { timestamp: u64 },
}

/// WebSocket actor for one presenter or listener connection.
///
/// ## Actor Model:
/// Each connection is an independent actix actor; the broadcast router holds
/// its address as an [`crate::broadcast::EventSink`], so fan-out is a
/// mailbox send and a slow connection can't stall a publish.
pub struct RelayWebSocket {
    state: AppState,
    connection_id: String,
    session_code: Option<String>,
    role: Role,
    last_heartbeat: Instant,
}

impl RelayWebSocket {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            connection_id: Uuid::new_v4().to_string(),
            session_code: None,
            role: Role::Listener,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: &ServerEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            ctx.text(json);
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(connection = %self.connection_id, code, "WebSocket error: {}", message);
        self.send_event(
            ctx,
            &ServerEvent::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_subscribe(
        &mut self,
        code: String,
        connection_id: Option<String>,
        role: Role,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        if !self.state.sessions.contains(&code) {
            self.send_error(ctx, "not_found", &format!("Session '{}' not found", code));
            return;
        }

        // A client that carries its own id (so it can quote it in signaling
        // calls) replaces the server-assigned one
        if let Some(id) = connection_id.filter(|id| !id.trim().is_empty()) {
            self.state.router.unregister(&self.connection_id);
            self.connection_id = id;
        }

        self.role = role;
        if role == Role::Presenter {
            match self.state.sessions.set_presenter(&code, &self.connection_id) {
                Ok(true) => {}
                Ok(false) => {
                    // The presenter slot is single-occupancy; latecomers
                    // stay attached as plain viewers
                    self.role = Role::Listener;
                    self.send_error(ctx, "presenter_taken", "Session already has a presenter");
                }
                Err(err) => {
                    self.send_error(ctx, "not_found", &err.to_string());
                    return;
                }
            }
        }

        let recipient: Recipient<OutboundEvent> = ctx.address().recipient();
        self.state
            .router
            .register(&self.connection_id, Arc::new(recipient));
        self.session_code = Some(code.clone());
        self.state.sessions.touch(&code);

        info!(
            connection = %self.connection_id,
            session = %code,
            role = ?self.role,
            "Connection subscribed"
        );

        // Current membership snapshot so a fresh UI doesn't wait for the
        // next add/remove to learn the count
        self.send_event(
            ctx,
            &ServerEvent::ListenerCountUpdated {
                count: self.state.listeners.count_of(&code),
            },
        );
    }

    /// Presenter audio frame: forward to the session's transcription channel.
    /// Frames from connections that aren't a subscribed presenter, or for a
    /// session with no open channel, are dropped silently.
    fn handle_audio_frame(&self, data: &[u8]) {
        match (&self.session_code, self.role) {
            (Some(code), Role::Presenter) => {
                self.state.bridge.push_audio(code, data.to_vec());
            }
            _ => {
                debug!(
                    connection = %self.connection_id,
                    bytes = data.len(),
                    "Ignoring audio frame from non-presenter connection"
                );
            }
        }
    }

    fn cleanup(&mut self) {
        self.state.router.unregister(&self.connection_id);

        // Counted listeners leaving change the count for everyone left behind
        if let Some((code, count)) = self.state.listeners.remove_connection(&self.connection_id) {
            info!(
                connection = %self.connection_id,
                session = %code,
                count,
                "Listener disconnected"
            );
            self.state
                .router
                .publish(&code, ServerEvent::ListenerCountUpdated { count });
        }

        if let Some(code) = &self.session_code {
            if self.role == Role::Presenter {
                // The session itself survives a presenter drop; only the
                // claim on the presenter slot is released
                self.state.sessions.clear_presenter(code, &self.connection_id);
            }
        }
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection = %self.connection_id, "WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(connection = %act.connection_id, "WebSocket heartbeat timeout, closing");
                ctx.stop();
                return;
            }

            let ping = ServerEvent::Ping {
                timestamp: chrono::Utc::now().timestamp_millis() as u64,
            };
            act.send_event(ctx, &ping);
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection = %self.connection_id, "WebSocket connection stopped");
        self.cleanup();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe {
                    code,
                    connection_id,
                    role,
                }) => {
                    self.handle_subscribe(code, connection_id, role, ctx);
                }
                Ok(ClientMessage::Pong { .. }) => {
                    self.last_heartbeat = Instant::now();
                }
                Ok(ClientMessage::Ping { timestamp }) => {
                    self.last_heartbeat = Instant::now();
                    self.send_event(ctx, &ServerEvent::Pong { timestamp });
                }
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
                }
            },
            Ok(ws::Message::Binary(data)) => {
                self.handle_audio_frame(&data);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection = %self.connection_id, "WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(connection = %self.connection_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Deliver a routed session event to this connection.
impl Handler<OutboundEvent> for RelayWebSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundEvent, ctx: &mut Self::Context) {
        self.send_event(ctx, &msg.0);
    }
}

/// WebSocket endpoint handler: upgrades the HTTP request and hands the
/// connection to a fresh actor.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(RelayWebSocket::new(state.get_ref().clone()), &req, stream)
}
