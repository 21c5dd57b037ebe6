//! # Translation Relay Backend - Main Application Entry Point
//!
//! This is the main entry point for the translation-relay-backend web server.
//! It sets up an Actix-web HTTP server that orchestrates real-time speech
//! translation sessions: a presenter's speech is transcribed and translated
//! by a cloud speech service, and the results are fanned out live to every
//! subscribed viewer, whose avatar rendering runs over its own WebRTC
//! connection negotiated through this server.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML files + environment variables)
//! - **state**: Shared component graph (store, registry, router, bridge, relay)
//! - **session**: Session records and listener membership
//! - **broadcast**: Session-scoped event fan-out
//! - **signaling**: WebRTC offer/answer relay to the avatar service
//! - **transcription**: Streaming recognition channels to the speech service
//! - **websocket**: Per-connection real-time event channel
//! - **handlers**: HTTP request handlers for the control plane
//! - **health**: System health monitoring endpoint
//! - **error**: Custom error types and HTTP error responses

mod broadcast;
mod config;
mod error;
mod handlers;
mod health;
mod session;
mod signaling;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::TranslationEvent;

/// Global shutdown signal that can be accessed from anywhere in the program.
/// Set by the signal handlers; the main loop polls it to stop the server.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Creates shared application state** that all requests can access
/// 4. **Spawns background tasks** (token refresh, event fan-out, idle sweep)
/// 5. **Configures the HTTP server** with middleware and routes
/// 6. **Handles graceful shutdown** when receiving system signals
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!(
        "Starting translation-relay-backend v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "Configuration loaded: {}:{} (region {})",
        config.server.host, config.server.port, config.speech.region
    );

    let (app_state, translation_events) = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    spawn_background_tasks(app_state.clone(), translation_events);
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api")
                    .route("/sessions", web::post().to(handlers::create_session))
                    .route("/sessions/{code}", web::get().to(handlers::get_session))
                    .route("/sessions/{code}", web::delete().to(handlers::end_session))
                    .route(
                        "/sessions/{code}/translation",
                        web::post().to(handlers::start_translation),
                    )
                    .route(
                        "/sessions/{code}/translation",
                        web::delete().to(handlers::stop_translation),
                    )
                    .route(
                        "/sessions/{code}/avatar",
                        web::post().to(handlers::connect_listener_avatar),
                    )
                    .route("/speech-token", web::get().to(handlers::speech_token))
                    .route("/ice-token", web::get().to(handlers::ice_token)),
            )
            .route("/ws", web::get().to(websocket::relay_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// `RUST_LOG` controls what gets logged; without it the default keeps this
/// crate at debug and the framework at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "translation_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Long-running tasks beside the HTTP server:
///
/// - **Event fan-out**: a single drain of the translation-event queue, so
///   results for one session reach every recipient in recognized order.
///   Events for sessions that stopped or ended in the meantime are dropped
///   here, which is what guarantees no post-stop leakage.
/// - **Token refresh**: the upstream speech and relay tokens are valid for
///   ten minutes; both are re-fetched every nine.
/// - **Idle sweep**: expires inactive sessions past the configured TTL.
fn spawn_background_tasks(
    state: AppState,
    mut translation_events: mpsc::UnboundedReceiver<(String, TranslationEvent)>,
) {
    let fanout_state = state.clone();
    tokio::spawn(async move {
        while let Some((code, event)) = translation_events.recv().await {
            if !fanout_state.sessions.is_active(&code) {
                debug!(session = %code, "Dropping translation for inactive session");
                continue;
            }
            fanout_state.sessions.touch(&code);
            fanout_state.router.publish(&code, event.into());
        }
    });

    let relay = state.relay.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(signaling::TOKEN_REFRESH_INTERVAL);
        loop {
            interval.tick().await;
            relay.refresh_speech_token().await;
            relay.refresh_ice_token().await;
        }
    });

    if state.config.session.idle_ttl_secs > 0 {
        let sweep_interval = Duration::from_secs(state.config.session.sweep_interval_secs.max(1));
        let sweeper_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                let expired = sweeper_state.expire_idle_sessions();
                if expired > 0 {
                    info!(expired, "Idle session sweep complete");
                }
            }
        });
    }
}

/// Set up signal handlers for graceful shutdown.
///
/// Listens for SIGTERM and SIGINT; when either arrives, the global shutdown
/// flag is set so the server can finish in-flight requests before exiting.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
