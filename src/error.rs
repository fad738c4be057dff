//! # Error Handling
//!
//! This module defines the error taxonomy for the voice session client.
//! Errors fall into classes that decide what happens to the running session:
//!
//! ## Error Classes:
//! - **Transport**: the channel failed to open or closed unexpectedly (fatal)
//! - **Decode**: malformed base64 or an unparseable envelope (dropped locally)
//! - **AudioDecode**: audio bytes that cannot become a playable buffer (dropped locally)
//! - **Setup**: a required capability is missing before the session starts (fatal)
//! - **Config**: configuration file or environment variable problems
//!
//! ## Key Rust Concepts for Error Handling:
//! - **enum**: Each variant is one kind of failure and carries a message
//! - **From trait**: Lets `?` convert library errors into our error type
//! - **Display trait**: Defines how errors are formatted as strings

use std::fmt;

/// Custom error types for the voice session client.
///
/// ## Usage Example:
/// ```rust
/// use roleplay_voice_client::error::ClientError;
/// let err = ClientError::AudioDecode("odd byte count".to_string());
/// assert!(!err.is_fatal());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The channel to the backend failed to open, or broke while open
    Transport(String),

    /// Malformed base64 or an envelope that does not parse
    Decode(String),

    /// Audio bytes that cannot be turned into a playable buffer
    AudioDecode(String),

    /// A capability needed before the session starts is unavailable
    Setup(String),

    /// Configuration file or environment variable problems
    Config(String),
}

impl ClientError {
    /// Whether this error ends the active session.
    ///
    /// ## Policy:
    /// - Transport and Setup failures tear the session down
    /// - Decode and AudioDecode failures only drop the offending unit
    /// - Config failures happen before any session exists
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Setup(_))
    }

    /// Short machine-readable name of the error class, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Transport(_) => "transport_error",
            ClientError::Decode(_) => "decode_error",
            ClientError::AudioDecode(_) => "audio_decode_error",
            ClientError::Setup(_) => "setup_error",
            ClientError::Config(_) => "config_error",
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ClientError::Decode(msg) => write!(f, "Decode error: {}", msg),
            ClientError::AudioDecode(msg) => write!(f, "Audio decode error: {}", msg),
            ClientError::Setup(msg) => write!(f, "Setup error: {}", msg),
            ClientError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

/// Automatic conversion from anyhow::Error to ClientError.
///
/// Anything bubbling up through anyhow during setup is treated as a setup
/// failure: it happened before the session could run.
impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        ClientError::Setup(err.to_string())
    }
}

/// Automatic conversion from JSON parsing errors to ClientError.
///
/// ## Why Decode:
/// A JSON error on this side always means an envelope from the wire could not
/// be parsed, which is recovered by dropping the envelope.
impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(format!("JSON parsing error: {}", err))
    }
}

impl From<base64::DecodeError> for ClientError {
    fn from(err: base64::DecodeError) -> Self {
        ClientError::Decode(format!("base64 error: {}", err))
    }
}

/// Automatic conversion from configuration errors to ClientError.
impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Usage Example:
/// ```rust
/// use roleplay_voice_client::error::ClientResult;
/// fn parse_port(raw: &str) -> ClientResult<u16> {
///     raw.parse().map_err(|_| roleplay_voice_client::error::ClientError::Config(raw.to_string()))
/// }
/// assert!(parse_port("8000").is_ok());
/// ```
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_follows_error_class() {
        assert!(ClientError::Transport("closed".into()).is_fatal());
        assert!(ClientError::Setup("no microphone".into()).is_fatal());
        assert!(!ClientError::Decode("bad json".into()).is_fatal());
        assert!(!ClientError::AudioDecode("odd length".into()).is_fatal());
        assert!(!ClientError::Config("port".into()).is_fatal());
    }

    #[test]
    fn test_json_error_becomes_decode() {
        let err: ClientError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "decode_error");
        assert!(err.to_string().starts_with("Decode error: JSON parsing error"));
    }
}
