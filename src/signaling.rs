//! # Signaling Relay
//!
//! Forwards a viewer's WebRTC offer to the avatar service's negotiation
//! endpoint and hands the answer back verbatim. The relay never inspects or
//! mutates SDP content, never retries (retry policy belongs to callers), and
//! holds no per-viewer media state beyond the duration of the exchange: one
//! negotiation per viewer connection attempt, and a reconnecting viewer does
//! a fresh offer/answer round.
//!
//! The relay also owns the two upstream token caches (speech token for
//! client-side SDK use, relay/ICE token for WebRTC connectivity). Tokens are
//! valid for ten minutes upstream; the refresh tasks re-fetch every nine.

use crate::config::{IceConfig, SpeechConfig};
use crate::error::{AppError, AppResult};
use crate::session::Session;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Refresh cadence for both upstream tokens.
pub const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(540);

/// Offers past this size are junk, not SDP.
const MAX_OFFER_BYTES: usize = 256 * 1024;

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

/// ICE server set advertised to the avatar service during negotiation.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct IceServers {
    pub urls: Vec<String>,
    pub username: String,
    pub password: String,
}

pub struct SignalingRelay {
    http: reqwest::Client,
    speech: SpeechConfig,
    ice: IceConfig,
    ice_token: RwLock<Option<String>>,
    speech_token: RwLock<Option<String>>,
}

impl SignalingRelay {
    pub fn new(speech: SpeechConfig, ice: IceConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            speech,
            ice,
            ice_token: RwLock::new(None),
            speech_token: RwLock::new(None),
        }
    }

    /// Forward one viewer's offer, returning the avatar service's answer SDP.
    pub async fn negotiate(&self, session: &Session, local_offer: &str) -> AppResult<String> {
        let offer = local_offer.trim();
        if offer.is_empty() {
            return Err(AppError::InvalidOffer("SDP offer body is required".into()));
        }
        if offer.len() > MAX_OFFER_BYTES {
            return Err(AppError::InvalidOffer(format!(
                "SDP offer exceeds {} bytes",
                MAX_OFFER_BYTES
            )));
        }

        let ice = self.ice_servers().await?;
        let payload = build_connection_payload(session, offer, &ice);

        debug!(
            session = %session.code,
            character = %session.avatar.character,
            custom = session.avatar.is_custom,
            "Negotiating avatar connection"
        );

        let response = self
            .http
            .post(self.speech.avatar_url())
            .header(SUBSCRIPTION_KEY_HEADER, &self.speech.key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::UpstreamUnavailable(format!(
                "Avatar negotiation failed with status {}: {}",
                status, detail
            )));
        }

        // The answer is already encoded for the browser; pass it through untouched
        let remote_sdp = response.text().await?;
        info!(session = %session.code, "Avatar connection negotiated");
        Ok(remote_sdp)
    }

    /// ICE servers for negotiation: the operator override when fully
    /// configured, otherwise the cached relay token.
    async fn ice_servers(&self) -> AppResult<IceServers> {
        if self.ice.is_configured() {
            let url = self
                .ice
                .server_url_remote
                .clone()
                .or_else(|| self.ice.server_url.clone())
                .unwrap_or_default();
            return Ok(IceServers {
                urls: vec![url],
                username: self.ice.username.clone().unwrap_or_default(),
                password: self.ice.password.clone().unwrap_or_default(),
            });
        }

        let token = self.ice_token.read().await.clone().ok_or_else(|| {
            AppError::UpstreamUnavailable("Relay token not available yet".into())
        })?;

        serde_json::from_str(&token).map_err(|err| {
            AppError::UpstreamUnavailable(format!("Relay token unparsable: {}", err))
        })
    }

    /// The ICE configuration handed to browsers (as opposed to the one sent
    /// upstream during negotiation, which may use the remote override URL).
    pub async fn client_ice_token(&self) -> Option<String> {
        if self.ice.is_configured() {
            return Some(
                json!({
                    "Urls": [self.ice.server_url.clone().unwrap_or_default()],
                    "Username": self.ice.username.clone().unwrap_or_default(),
                    "Password": self.ice.password.clone().unwrap_or_default(),
                })
                .to_string(),
            );
        }
        self.ice_token.read().await.clone()
    }

    pub async fn client_speech_token(&self) -> Option<String> {
        self.speech_token.read().await.clone()
    }

    pub async fn has_ice_token(&self) -> bool {
        self.ice.is_configured() || self.ice_token.read().await.is_some()
    }

    pub async fn refresh_ice_token(&self) {
        let result = self
            .http
            .get(self.speech.ice_token_url())
            .header(SUBSCRIPTION_KEY_HEADER, &self.speech.key)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(token) => {
                    *self.ice_token.write().await = Some(token);
                    info!("Relay token refreshed");
                }
                Err(err) => warn!("Relay token body unreadable: {}", err),
            },
            Ok(response) => warn!("Relay token refresh failed: {}", response.status()),
            Err(err) => error!("Relay token refresh error: {}", err),
        }
    }

    pub async fn refresh_speech_token(&self) {
        let result = self
            .http
            .post(self.speech.token_url())
            .header(SUBSCRIPTION_KEY_HEADER, &self.speech.key)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(token) => {
                    *self.speech_token.write().await = Some(token);
                    info!("Speech token refreshed");
                }
                Err(err) => warn!("Speech token body unreadable: {}", err),
            },
            Ok(response) => warn!("Speech token refresh failed: {}", response.status()),
            Err(err) => error!("Speech token refresh error: {}", err),
        }
    }
}

/// Builds the avatar service's connection-negotiation payload.
///
/// The shape is the service's `synthesis.video` contract: the viewer's client
/// description plus declarative rendering parameters. A custom avatar omits
/// the style block (the style lives in the custom model), and a transparent
/// background is requested by keying on solid green.
fn build_connection_payload(session: &Session, local_offer: &str, ice: &IceServers) -> Value {
    let avatar = &session.avatar;

    let crop_left = if avatar.video_crop { 600 } else { 0 };
    let crop_right = if avatar.video_crop { 1320 } else { 1920 };

    let background_color = if avatar.transparent_background {
        "#00FF00FF"
    } else {
        avatar.background_color.as_str()
    };

    let mut talking_avatar = json!({
        "customized": avatar.is_custom,
        "character": avatar.character,
        "background": { "color": background_color },
        "useBuiltInVoice": avatar.use_built_in_voice,
    });
    if !avatar.is_custom && !avatar.style.is_empty() {
        talking_avatar["style"] = json!(avatar.style);
    }

    json!({
        "synthesis": {
            "video": {
                "protocol": {
                    "name": "WebRTC",
                    "webrtcConfig": {
                        "clientDescription": local_offer,
                        "iceServers": [{
                            "urls": [ice.urls.first().cloned().unwrap_or_default()],
                            "username": ice.username,
                            "credential": ice.password,
                        }],
                    },
                },
                "format": {
                    "crop": {
                        "topLeft": { "x": crop_left, "y": 0 },
                        "bottomRight": { "x": crop_right, "y": 1080 },
                    },
                    "bitrate": 1_000_000,
                },
                "talkingAvatar": talking_avatar,
            }
        }
    })
}
