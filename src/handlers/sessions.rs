//! # Session Control Plane
//!
//! HTTP handlers composing the session store, listener registry, signaling
//! relay, transcription bridge and broadcast router into the externally
//! observable operations: create/inspect/start/stop/end a session and
//! connect a listener's avatar.
//!
//! ## Sequencing rules:
//! - Starting translation opens the streaming channel first and only then
//!   flips the session active; a session that vanished in between gets its
//!   fresh channel torn down again.
//! - A listener is only counted after its avatar negotiation succeeded - a
//!   viewer whose signaling fails is never counted.
//! - Ending a session notifies every connection before the record is
//!   removed (see [`AppState::end_session`]).

use crate::broadcast::ServerEvent;
use crate::error::{AppError, AppResult};
use crate::session::{CreateSessionRequest, Session};
use crate::state::AppState;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use tracing::info;

/// Header carrying the viewer's real-time connection id into signaling calls.
const CONNECTION_ID_HEADER: &str = "X-Connection-Id";

fn session_summary(state: &AppState, session: &Session) -> serde_json::Value {
    // Viewers need a concrete voice to ask the avatar for; fall back to the
    // configured default when the session didn't pick one
    let target_voice = session
        .target_voice
        .clone()
        .unwrap_or_else(|| state.config.speech.default_voice.clone());

    json!({
        "sessionCode": session.code,
        "sessionName": session.name,
        "sourceLanguage": session.source_language,
        "targetLanguage": session.target_language,
        "targetVoice": target_voice,
        "avatar": session.avatar,
        "active": session.active,
        "createdAt": session.created_at,
        "listenerCount": state.listeners.count_of(&session.code),
    })
}

/// POST /api/sessions
pub async fn create_session(
    state: web::Data<AppState>,
    request: web::Json<CreateSessionRequest>,
    req: HttpRequest,
) -> AppResult<HttpResponse> {
    let session = state.sessions.create(&request)?;

    let connection_info = req.connection_info();
    let listener_url = format!(
        "{}://{}/listener/{}",
        connection_info.scheme(),
        connection_info.host(),
        session.code
    );

    info!(session = %session.code, name = %session.name, "Session created");

    Ok(HttpResponse::Ok().json(json!({
        "sessionCode": session.code,
        "listenerUrl": listener_url,
        "session": session_summary(&state, &session),
    })))
}

/// GET /api/sessions/{code}
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session = state.sessions.get(&path)?;
    Ok(HttpResponse::Ok().json(session_summary(&state, &session)))
}

/// POST /api/sessions/{code}/translation
pub async fn start_translation(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let code = path.into_inner();
    let session = state.sessions.get(&code)?;

    state.bridge.start(&session).await?;

    if let Err(err) = state.sessions.set_active(&code, true) {
        // The session was ended between lookup and activation; don't leave
        // a channel streaming into nowhere
        state.bridge.stop(&code);
        return Err(err);
    }

    info!(
        session = %code,
        source = %session.source_language,
        target = %session.target_language,
        "Translation started"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "started",
        "sourceLanguage": session.source_language,
        "targetLanguage": session.target_language,
    })))
}

/// DELETE /api/sessions/{code}/translation
///
/// Lenient by design: stopping a session that isn't translating succeeds.
/// Only an unknown code is an error.
pub async fn stop_translation(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let code = path.into_inner();
    state.sessions.get(&code)?;

    let was_streaming = state.bridge.is_streaming(&code);
    state.bridge.stop(&code);
    state.sessions.set_active(&code, false)?;

    info!(session = %code, was_streaming, "Translation stopped");

    Ok(HttpResponse::Ok().json(json!({ "status": "stopped" })))
}

/// DELETE /api/sessions/{code}
pub async fn end_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    state.end_session(&path)?;
    Ok(HttpResponse::Ok().json(json!({ "status": "ended" })))
}

/// POST /api/sessions/{code}/avatar
///
/// Body: the viewer's complete local SDP offer (gathered client-side, with
/// a bounded ICE wait before submission). Response: the avatar service's
/// answer SDP, passed through verbatim.
pub async fn connect_listener_avatar(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
    body: web::Bytes,
) -> AppResult<HttpResponse> {
    let code = path.into_inner();

    let connection_id = req
        .headers()
        .get(CONNECTION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::InvalidOffer(format!("{} header is required", CONNECTION_ID_HEADER))
        })?
        .to_string();

    let offer = String::from_utf8(body.to_vec())
        .map_err(|_| AppError::InvalidOffer("SDP offer must be valid UTF-8".into()))?;

    let session = state.sessions.get(&code)?;
    let answer = state.relay.negotiate(&session, &offer).await?;

    // Relay success is the admission ticket: only now does the viewer count
    let count = state.listeners.add(&code, &connection_id);
    state.sessions.touch(&code);
    state
        .router
        .publish(&code, ServerEvent::ListenerCountUpdated { count });

    info!(
        session = %code,
        connection = %connection_id,
        listeners = count,
        "Listener avatar connected"
    );

    Ok(HttpResponse::Ok().content_type("text/plain").body(answer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    fn test_state() -> AppState {
        let mut config = AppConfig::default();
        config.speech.region = "westus2".to_string();
        config.speech.key = "test-key".to_string();
        crate::state::AppState::new(config).0
    }

    /// Builds the test service for the control-plane routes. A macro because
    /// the service type `init_service` returns isn't nameable in a helper fn.
    macro_rules! service {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .route("/api/sessions", web::post().to(create_session))
                    .route("/api/sessions/{code}", web::get().to(get_session))
                    .route("/api/sessions/{code}", web::delete().to(end_session))
                    .route(
                        "/api/sessions/{code}/translation",
                        web::delete().to(stop_translation),
                    )
                    .route(
                        "/api/sessions/{code}/avatar",
                        web::post().to(connect_listener_avatar),
                    ),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_create_and_get_roundtrip() {
        let state = test_state();
        let app = service!(state);

        let req = test::TestRequest::post()
            .uri("/api/sessions")
            .set_json(serde_json::json!({
                "sessionName": "Town hall",
                "sourceLanguage": "en-US",
                "targetLanguage": "es-ES"
            }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        let code = body["sessionCode"].as_str().unwrap().to_string();
        assert_eq!(code.len(), 6);
        assert!(body["listenerUrl"].as_str().unwrap().ends_with(&code));
        assert_eq!(body["session"]["listenerCount"], 0);

        let req = test::TestRequest::get()
            .uri(&format!("/api/sessions/{}", code))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["sessionName"], "Town hall");
        assert_eq!(body["active"], false);
        // No session voice picked: the configured default fills in
        assert_eq!(body["targetVoice"], "DragonLatestNeural");
    }

    #[actix_web::test]
    async fn test_create_without_locales_is_rejected() {
        let state = test_state();
        let app = service!(state);

        let req = test::TestRequest::post()
            .uri("/api/sessions")
            .set_json(serde_json::json!({ "sessionName": "No languages" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[actix_web::test]
    async fn test_avatar_connect_unknown_session_is_not_found() {
        let state = test_state();
        let app = service!(state);

        let req = test::TestRequest::post()
            .uri("/api/sessions/000000/avatar")
            .insert_header(("X-Connection-Id", "viewer-1"))
            .set_payload("v=0 offer")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status().as_u16(), 404);
        // A failed connect never counts the viewer
        assert_eq!(state.listeners.count_of("000000"), 0);
    }

    #[actix_web::test]
    async fn test_avatar_connect_requires_connection_id() {
        let state = test_state();
        let session = state
            .sessions
            .create(&CreateSessionRequest {
                source_language: Some("en-US".to_string()),
                target_language: Some("es-ES".to_string()),
                ..Default::default()
            })
            .unwrap();
        let app = service!(state);

        let req = test::TestRequest::post()
            .uri(&format!("/api/sessions/{}/avatar", session.code))
            .set_payload("v=0 offer")
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status().as_u16(), 400);
        assert_eq!(state.listeners.count_of(&session.code), 0);
    }

    #[actix_web::test]
    async fn test_stop_translation_is_lenient() {
        let state = test_state();
        let session = state
            .sessions
            .create(&CreateSessionRequest {
                source_language: Some("en-US".to_string()),
                target_language: Some("es-ES".to_string()),
                ..Default::default()
            })
            .unwrap();
        let app = service!(state);

        // Stopping a session that never started translating succeeds
        let req = test::TestRequest::delete()
            .uri(&format!("/api/sessions/{}/translation", session.code))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 200);

        // Unknown code is still a 404
        let req = test::TestRequest::delete()
            .uri("/api/sessions/000000/translation")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[actix_web::test]
    async fn test_end_session_then_get_is_not_found() {
        let state = test_state();
        let session = state
            .sessions
            .create(&CreateSessionRequest {
                source_language: Some("en-US".to_string()),
                target_language: Some("es-ES".to_string()),
                ..Default::default()
            })
            .unwrap();
        let app = service!(state);

        let req = test::TestRequest::delete()
            .uri(&format!("/api/sessions/{}", session.code))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 200);

        let req = test::TestRequest::get()
            .uri(&format!("/api/sessions/{}", session.code))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 404);
    }
}
