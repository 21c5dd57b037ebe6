use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": "translation-relay-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "total": state.sessions.len(),
            "active": state.sessions.active_count(),
            "open_channels": state.bridge.open_channel_count(),
            "listener_connections": state.listeners.total_connections(),
            "socket_connections": state.router.connection_count()
        },
        "upstream": {
            "region": config.speech.region,
            "relay_token_cached": state.relay.has_ice_token().await,
            "speech_token_cached": state.relay.client_speech_token().await.is_some()
        }
    }))
}
