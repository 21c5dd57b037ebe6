//! Upstream token pass-through for client-side SDK use: the browser needs a
//! short-lived speech token (for local synthesis previews) and the relay's
//! ICE configuration (to gather candidates before signaling). Both are cached
//! server-side and refreshed in the background.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};

/// GET /api/speech-token
pub async fn speech_token(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    match state.relay.client_speech_token().await {
        Some(token) => Ok(HttpResponse::Ok()
            .insert_header(("SpeechRegion", state.config.speech.region.clone()))
            .content_type("text/plain")
            .body(token)),
        None => Err(AppError::UpstreamUnavailable(
            "Speech token not available yet".into(),
        )),
    }
}

/// GET /api/ice-token
pub async fn ice_token(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    match state.relay.client_ice_token().await {
        Some(token) => Ok(HttpResponse::Ok()
            .content_type("application/json")
            .body(token)),
        None => Err(AppError::UpstreamUnavailable(
            "Relay token not available yet".into(),
        )),
    }
}
