//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SPEECH_REGION, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The speech resource credentials also accept the bare `SPEECH_REGION` /
//! `SPEECH_KEY` variables, matching how the upstream service documents them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub speech: SpeechConfig,
    pub ice: IceConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Cloud speech/translation/avatar service settings.
///
/// The region + key pair is all that's strictly required; the endpoint fields
/// exist so deployments behind a private endpoint can point every call at
/// their own gateway. When an endpoint is left empty it's derived from the
/// region using the public service hostnames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Service region, e.g. "westus2"
    pub region: String,

    /// Subscription key for the speech resource
    pub key: String,

    /// Override for the streaming recognition endpoint (wss://...)
    pub recognition_endpoint: Option<String>,

    /// Override for the avatar WebRTC negotiation endpoint (https://...)
    pub avatar_endpoint: Option<String>,

    /// Override for the token issuing endpoint (https://...)
    pub token_endpoint: Option<String>,

    /// Voice used for avatar speech when the session doesn't pick one
    pub default_voice: String,
}

impl SpeechConfig {
    /// Streaming recognition+translation channel for one session.
    ///
    /// The source language and the (short) target language ride along as query
    /// parameters; the service answers with translated-result events on the
    /// same socket.
    pub fn recognition_url(&self, source_language: &str, target_language: &str) -> String {
        let base = match &self.recognition_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!(
                "wss://{}.stt.speech.microsoft.com/speech/universal/v2",
                self.region
            ),
        };
        format!("{}?from={}&to={}", base, source_language, target_language)
    }

    /// Avatar connection negotiation endpoint (SDP offer in, SDP answer out).
    pub fn avatar_url(&self) -> String {
        match &self.avatar_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!(
                "https://{}.tts.speech.microsoft.com/cognitiveservices/avatar/connection/v1",
                self.region
            ),
        }
    }

    /// Token issuing endpoint for client-side SDK use.
    pub fn token_url(&self) -> String {
        match &self.token_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!(
                "https://{}.api.cognitive.microsoft.com/sts/v1.0/issueToken",
                self.region
            ),
        }
    }

    /// Relay (ICE) token endpoint for WebRTC connectivity.
    pub fn ice_token_url(&self) -> String {
        format!(
            "https://{}.tts.speech.microsoft.com/cognitiveservices/avatar/relay/token/v1",
            self.region
        )
    }
}

/// Customized ICE server settings (optional).
///
/// When all three of url/username/password are present they replace the
/// relay-issued ICE configuration entirely. `server_url_remote` lets the
/// negotiation payload advertise a different address than the one handed to
/// browsers, for split-horizon deployments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceConfig {
    pub server_url: Option<String>,
    pub server_url_remote: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl IceConfig {
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.username.is_some() && self.password.is_some()
    }
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Digits in the shareable session code
    pub code_length: usize,

    /// Seconds an inactive session may sit idle before it's expired.
    /// 0 disables expiry (sessions then live until explicitly ended).
    pub idle_ttl_secs: u64,

    /// How often the expiry sweep runs
    pub sweep_interval_secs: u64,

    /// Maximum number of concurrent sessions allowed
    pub max_sessions: usize,
}

/// Expected inbound audio format for presenter streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            speech: SpeechConfig {
                region: String::new(),
                key: String::new(),
                recognition_endpoint: None,
                avatar_endpoint: None,
                token_endpoint: None,
                default_voice: "DragonLatestNeural".to_string(),
            },
            ice: IceConfig::default(),
            session: SessionConfig {
                code_length: 6,
                idle_ttl_secs: 0,       // No automatic expiry unless configured
                sweep_interval_secs: 60,
                max_sessions: 100,
            },
            audio: AudioConfig {
                sample_rate: 16000, // 16kHz mono PCM is what the recognition service expects
                channels: 1,
                bit_depth: 16,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT, SPEECH_REGION and SPEECH_KEY
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Special environment variables used by deployment platforms and the
        // upstream service docs; these don't follow the APP_ prefix convention.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(region) = env::var("SPEECH_REGION") {
            settings = settings.set_override("speech.region", region)?;
        }

        if let Ok(key) = env::var("SPEECH_KEY") {
            settings = settings.set_override("speech.key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.speech.region.is_empty() && self.speech.recognition_endpoint.is_none() {
            return Err(anyhow::anyhow!(
                "Speech region is required (set SPEECH_REGION or speech.region)"
            ));
        }

        if self.speech.key.is_empty() {
            return Err(anyhow::anyhow!(
                "Speech key is required (set SPEECH_KEY or speech.key)"
            ));
        }

        if self.session.code_length == 0 {
            return Err(anyhow::anyhow!("Session code length must be greater than 0"));
        }

        if self.session.max_sessions == 0 {
            return Err(anyhow::anyhow!("Max sessions must be greater than 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio format values must be non-zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.speech.region = "westus2".to_string();
        config.speech.key = "test-key".to_string();
        config
    }

    #[test]
    fn test_default_config_shape() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.code_length, 6);
        assert_eq!(config.audio.sample_rate, 16000);
        // Defaults alone aren't runnable: the speech resource is mandatory
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());

        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_shape() {
        // The shape an operator would put in config.toml
        let raw = r#"
            [server]
            host = "0.0.0.0"
            port = 5000

            [speech]
            region = "westeurope"
            key = "secret"
            default_voice = "DragonLatestNeural"

            [ice]

            [session]
            code_length = 6
            idle_ttl_secs = 1800
            sweep_interval_secs = 60
            max_sessions = 50

            [audio]
            sample_rate = 16000
            channels = 1
            bit_depth = 16
        "#;

        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.session.idle_ttl_secs, 1800);
        assert!(config.validate().is_ok());
        assert!(!config.ice.is_configured());
    }

    #[test]
    fn test_derived_endpoints() {
        let config = valid_config();
        let url = config.speech.recognition_url("en-US", "es");
        assert!(url.starts_with("wss://westus2."));
        assert!(url.contains("from=en-US"));
        assert!(url.contains("to=es"));

        assert!(config.speech.avatar_url().contains("westus2"));
        assert!(config.speech.ice_token_url().contains("relay/token"));
    }

    #[test]
    fn test_endpoint_overrides_win() {
        let mut config = valid_config();
        config.speech.recognition_endpoint = Some("wss://gateway.internal/speech".to_string());
        config.speech.avatar_endpoint = Some("https://gateway.internal/avatar".to_string());

        assert!(config
            .speech
            .recognition_url("en-US", "es")
            .starts_with("wss://gateway.internal/speech?"));
        assert_eq!(config.speech.avatar_url(), "https://gateway.internal/avatar");
    }
}
