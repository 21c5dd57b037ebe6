//! # Session Store
//!
//! Owns the in-memory table of translation sessions, keyed by a short numeric
//! code the presenter shares with viewers. All operations are safe under
//! concurrent access from HTTP handlers, WebSocket actors and the expiry
//! sweeper; updates are atomic per session (the map is only ever mutated
//! under the write lock, so no partial record is observable).

use crate::config::SessionConfig;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Rendering configuration handed through to the avatar service untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarSettings {
    pub character: String,
    pub style: String,
    pub background_color: String,
    pub is_custom: bool,
    pub use_built_in_voice: bool,
    pub transparent_background: bool,
    pub video_crop: bool,
}

impl Default for AvatarSettings {
    fn default() -> Self {
        Self {
            character: "lisa".to_string(),
            style: "casual-sitting".to_string(),
            background_color: "#FFFFFFFF".to_string(),
            is_custom: false,
            use_built_in_voice: false,
            transparent_background: false,
            video_crop: false,
        }
    }
}

/// One translation broadcast scope: a presenter, a language pair and
/// zero-or-more listeners.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub code: String,
    pub name: String,
    pub source_language: String,
    pub target_language: String,
    pub target_voice: Option<String>,
    pub avatar: AvatarSettings,
    pub created_at: DateTime<Utc>,
    /// True while a transcription channel is open for this session
    pub active: bool,
    /// The single authorized control connection, set when the presenter subscribes
    pub presenter_connection_id: Option<String>,
    #[serde(skip)]
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Short target-language tag for the translation channel ("es-ES" -> "es").
    pub fn target_language_short(&self) -> &str {
        self.target_language
            .split('-')
            .next()
            .unwrap_or(&self.target_language)
    }
}

/// Caller-supplied session configuration.
///
/// The language pair is required - a session that can't name its locales
/// can't translate anything. Everything else falls back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub session_name: Option<String>,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
    pub target_voice: Option<String>,
    pub avatar_character: Option<String>,
    pub avatar_style: Option<String>,
    pub background_color: Option<String>,
    #[serde(default)]
    pub is_custom_avatar: bool,
    #[serde(default)]
    pub use_built_in_voice: bool,
    #[serde(default)]
    pub transparent_background: bool,
    #[serde(default)]
    pub video_crop: bool,
}

fn locale_field(value: &Option<String>, field: &str) -> AppResult<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(AppError::InvalidConfig(format!(
            "Field '{}' is required",
            field
        ))),
    }
}

fn trimmed_or(value: &Option<String>, default: &str) -> String {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => default.to_string(),
    }
}

/// Manages all live sessions.
///
/// ## Thread Safety:
/// Uses RwLock to allow multiple readers (session lookups) or one writer
/// (create/remove/state changes) at a time. Contention is per-store rather
/// than per-session, which is fine at the session counts this serves; the
/// store interface is what a sharded or distributed replacement would slot
/// in behind.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Create a new session from caller configuration.
    ///
    /// The code is drawn uniformly from the fixed-width numeric space and
    /// re-drawn on collision, so N creates yield N distinct codes.
    pub fn create(&self, request: &CreateSessionRequest) -> AppResult<Session> {
        let source_language = locale_field(&request.source_language, "sourceLanguage")?;
        let target_language = locale_field(&request.target_language, "targetLanguage")?;

        let target_voice = request
            .target_voice
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let is_custom = request.is_custom_avatar;
        let avatar = AvatarSettings {
            character: trimmed_or(&request.avatar_character, "lisa"),
            // Custom avatars carry their style in the character model itself
            style: if is_custom {
                String::new()
            } else {
                trimmed_or(&request.avatar_style, "casual-sitting")
            },
            background_color: trimmed_or(&request.background_color, "#FFFFFFFF"),
            is_custom,
            use_built_in_voice: request.use_built_in_voice,
            transparent_background: request.transparent_background,
            video_crop: request.video_crop,
        };

        let mut sessions = self.sessions.write().unwrap();

        if sessions.len() >= self.config.max_sessions {
            return Err(AppError::InvalidConfig(format!(
                "Maximum concurrent sessions ({}) reached",
                self.config.max_sessions
            )));
        }

        let code = Self::generate_code(&sessions, self.config.code_length);
        let name = trimmed_or(&request.session_name, &format!("Session {}", code));
        let now = Utc::now();

        let session = Session {
            code: code.clone(),
            name,
            source_language,
            target_language,
            target_voice,
            avatar,
            created_at: now,
            active: false,
            presenter_connection_id: None,
            last_activity: now,
        };

        sessions.insert(code, session.clone());
        Ok(session)
    }

    /// Uniform random fixed-width numeric code, re-drawn while taken.
    fn generate_code(sessions: &HashMap<String, Session>, length: usize) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code: String = (0..length)
                .map(|_| char::from(b'0' + rng.gen_range(0..10)))
                .collect();
            if !sessions.contains_key(&code) {
                return code;
            }
        }
    }

    /// Get a snapshot of a session by code.
    pub fn get(&self, code: &str) -> AppResult<Session> {
        self.sessions
            .read()
            .unwrap()
            .get(code)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", code)))
    }

    pub fn contains(&self, code: &str) -> bool {
        self.sessions.read().unwrap().contains_key(code)
    }

    pub fn is_active(&self, code: &str) -> bool {
        self.sessions
            .read()
            .unwrap()
            .get(code)
            .map(|s| s.active)
            .unwrap_or(false)
    }

    /// Toggle the translation-running flag.
    pub fn set_active(&self, code: &str, active: bool) -> AppResult<()> {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get_mut(code) {
            Some(session) => {
                session.active = active;
                session.last_activity = Utc::now();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("Session '{}' not found", code))),
        }
    }

    /// Claim the presenter slot for a connection.
    ///
    /// Only the first claim wins; a second connection claiming presenter on a
    /// session that already has one is ignored (at most one presenter per
    /// session, and later claimants never reassign it).
    pub fn set_presenter(&self, code: &str, connection_id: &str) -> AppResult<bool> {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get_mut(code) {
            Some(session) => {
                if session.presenter_connection_id.is_none() {
                    session.presenter_connection_id = Some(connection_id.to_string());
                    session.last_activity = Utc::now();
                    Ok(true)
                } else {
                    Ok(session.presenter_connection_id.as_deref() == Some(connection_id))
                }
            }
            None => Err(AppError::NotFound(format!("Session '{}' not found", code))),
        }
    }

    /// Release the presenter slot if this connection holds it (socket went away).
    pub fn clear_presenter(&self, code: &str, connection_id: &str) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(code) {
            if session.presenter_connection_id.as_deref() == Some(connection_id) {
                session.presenter_connection_id = None;
            }
        }
    }

    pub fn presenter_of(&self, code: &str) -> Option<String> {
        self.sessions
            .read()
            .unwrap()
            .get(code)
            .and_then(|s| s.presenter_connection_id.clone())
    }

    /// Record session activity for the idle-expiry clock.
    pub fn touch(&self, code: &str) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(code) {
            session.last_activity = Utc::now();
        }
    }

    /// Remove a session. Idempotent: removing an absent code is a no-op.
    pub fn remove(&self, code: &str) -> bool {
        self.sessions.write().unwrap().remove(code).is_some()
    }

    /// Codes of inactive sessions idle for longer than the configured TTL.
    ///
    /// Active sessions are never expired here: a running translation channel
    /// counts as activity regardless of wall-clock age. A TTL of 0 disables
    /// expiry entirely.
    pub fn idle_codes(&self) -> Vec<String> {
        if self.config.idle_ttl_secs == 0 {
            return Vec::new();
        }

        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.idle_ttl_secs as i64);
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| !s.active && s.last_activity < cutoff)
            .map(|s| s.code.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.active)
            .count()
    }
}
