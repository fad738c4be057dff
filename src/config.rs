//! # Configuration Management
//!
//! This module handles loading and managing client configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and TOML/JSON
//! - **derive macros**: Automatically generate Debug, Clone, Serialize, Deserialize
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__URL, APP_TURN__RESUME_POLICY, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main client configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, session, audio, turn
/// taking, transport) mirrors the components that consume each group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub turn: TurnConfig,
    pub transport: TransportConfig,
}

/// Where the backend lives.
///
/// ## Fields:
/// - `url`: WebSocket base URL; the persona id is appended as the last path segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
}

/// Which simulated customer to talk to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub persona_id: String,
    pub product_id: Option<String>,
}

/// Capture and keepalive settings.
///
/// ## Fields:
/// - `capture_sample_rate`: Rate of outbound PCM frames (16kHz for the backend's STT)
/// - `capture_block_size`: Samples per processing tick
/// - `silence_epsilon`: Magnitude below which a sample counts as digital silence
/// - `keepalive_interval_ms`: Longest gap without an outbound frame while the gate is open
/// - `keepalive_duration_ms`: Length of the synthetic silent frame
/// - `capture_mime_type`: Format tag attached to every outbound frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub capture_block_size: usize,
    pub silence_epsilon: f32,
    pub keepalive_interval_ms: u64,
    pub keepalive_duration_ms: u64,
    pub capture_mime_type: String,
}

/// When the microphone may resume after the customer finishes speaking.
///
/// - `Automatic`: the gate reopens as soon as playback drains
/// - `Manual`: the trainee must ask to listen again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumePolicy {
    Automatic,
    Manual,
}

impl std::str::FromStr for ResumePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "automatic" | "auto" => Ok(ResumePolicy::Automatic),
            "manual" => Ok(ResumePolicy::Manual),
            _ => Err(format!("Unknown resume policy: {}", s)),
        }
    }
}

/// Turn-taking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// How long the gate stays open after leaving `listening`
    pub listen_grace_ms: u64,
    pub resume_policy: ResumePolicy,
}

/// Channel housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Seconds between `ping` envelopes; 0 disables pinging
    pub ping_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                url: "ws://127.0.0.1:8000/api/ws/session".to_string(),
            },
            session: SessionConfig::default(),
            audio: AudioConfig {
                capture_sample_rate: 16000,
                capture_block_size: 4096,
                silence_epsilon: 1e-4,
                keepalive_interval_ms: 1000,
                keepalive_duration_ms: 20,
                capture_mime_type: "audio/pcm;rate=16000".to_string(),
            },
            turn: TurnConfig {
                listen_grace_ms: 3000,
                resume_policy: ResumePolicy::Automatic,
            },
            transport: TransportConfig {
                ping_interval_secs: 30,
            },
        }
    }
}

impl AudioConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Number of zero samples in one keepalive frame.
    ///
    /// ## Example:
    /// 20ms at 16kHz: 20 * 16000 / 1000 = 320 samples
    pub fn keepalive_samples(&self) -> usize {
        (self.keepalive_duration_ms as usize * self.capture_sample_rate as usize) / 1000
    }
}

impl TurnConfig {
    pub fn listen_grace(&self) -> Duration {
        Duration::from_millis(self.listen_grace_ms)
    }
}

impl ClientConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__URL=wss://training.example.com/api/ws/session`
    /// - `APP_SESSION__PERSONA_ID=skeptical_cfo`
    /// - `APP_TURN__RESUME_POLICY=manual`
    ///
    /// A double underscore separates nesting levels so that field names
    /// containing single underscores survive the mapping.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&ClientConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server URL is not empty and uses a WebSocket scheme
    /// - Capture rate, block size and keepalive settings are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.url.trim().is_empty() {
            return Err(anyhow::anyhow!("Server URL cannot be empty"));
        }

        if !(self.server.url.starts_with("ws://") || self.server.url.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Server URL must use ws:// or wss://, got {}",
                self.server.url
            ));
        }

        if self.audio.capture_sample_rate == 0 {
            return Err(anyhow::anyhow!("Capture sample rate must be greater than 0"));
        }

        if self.audio.capture_block_size == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if self.audio.keepalive_interval_ms == 0 || self.audio.keepalive_samples() == 0 {
            return Err(anyhow::anyhow!("Keepalive interval and duration must be greater than 0"));
        }

        if !(self.audio.silence_epsilon >= 0.0 && self.audio.silence_epsilon < 1.0) {
            return Err(anyhow::anyhow!("Silence epsilon must be in [0, 1)"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime overrides).
    ///
    /// ## Partial updates:
    /// Only the fields present are changed. For example, sending
    /// `{"turn": {"resume_policy": "manual"}}` changes only the policy.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(url) = server.get("url").and_then(|v| v.as_str()) {
                self.server.url = url.to_string();
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(persona) = session.get("persona_id").and_then(|v| v.as_str()) {
                self.session.persona_id = persona.to_string();
            }
            if let Some(product) = session.get("product_id") {
                self.session.product_id = product.as_str().map(str::to_string);
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(block) = audio.get("capture_block_size").and_then(|v| v.as_u64()) {
                self.audio.capture_block_size = block as usize;
            }
            if let Some(epsilon) = audio.get("silence_epsilon").and_then(|v| v.as_f64()) {
                self.audio.silence_epsilon = epsilon as f32;
            }
            if let Some(interval) = audio.get("keepalive_interval_ms").and_then(|v| v.as_u64()) {
                self.audio.keepalive_interval_ms = interval;
            }
        }

        if let Some(turn) = partial_config.get("turn") {
            if let Some(grace) = turn.get("listen_grace_ms").and_then(|v| v.as_u64()) {
                self.turn.listen_grace_ms = grace;
            }
            if let Some(policy) = turn.get("resume_policy").and_then(|v| v.as_str()) {
                self.turn.resume_policy = policy.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Render the effective configuration as TOML, e.g. to seed a config.toml.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
