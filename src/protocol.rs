//! # Wire Protocol
//!
//! JSON envelopes exchanged with the training backend over the session channel.
//! Every envelope is `{"type": "...", "data": {...}}`; `data` is absent for
//! control messages such as `end_session`.
//!
//! ## Message Format:
//! - **Client → Server**: `audio`, `text`, `end_session`, `start_listening`,
//!   `stop_listening`, `ping`, `get_transcripts`, `reset_conversation`
//! - **Server → Client**: `session_initialized`, `status`, `transcript`, `audio`,
//!   `audio_stop`, `error`, `pong`, `transcript_history`, `conversation_reset`, `message`
//!
//! Envelopes carry no sequence number; ordering is the channel's delivery order.

use crate::error::{ClientError, ClientResult};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Who said a piece of the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Speaker {
    Trainee,
    Customer,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Trainee => "Trainee",
            Speaker::Customer => "Customer",
        }
    }

    /// Map a wire label onto a speaker. Anything that is not the trainee
    /// (e.g. "AI Assistant") is the simulated customer.
    pub fn from_label(label: &str) -> Self {
        if label.eq_ignore_ascii_case("trainee") {
            Speaker::Trainee
        } else {
            Speaker::Customer
        }
    }
}

impl<'de> Deserialize<'de> for Speaker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Speaker::from_label(&label))
    }
}

/// Status values the backend reports for its agent.
///
/// `Thinking` exists on the wire only; the local state machine has no such state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Connecting,
    Listening,
    Thinking,
    Speaking,
    Error,
}

/// One outbound block of captured microphone audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFrame {
    /// base64 of little-endian 16-bit PCM
    pub audio: String,
    pub mime_type: String,
}

/// Envelopes the client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundEnvelope {
    Audio(AudioFrame),
    Text { text: String },
    EndSession,
    StartListening,
    StopListening,
    Ping { timestamp: u64 },
    GetTranscripts,
    ResetConversation,
}

impl OutboundEnvelope {
    /// The `type` tag, for logging without serializing the payload.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEnvelope::Audio(_) => "audio",
            OutboundEnvelope::Text { .. } => "text",
            OutboundEnvelope::EndSession => "end_session",
            OutboundEnvelope::StartListening => "start_listening",
            OutboundEnvelope::StopListening => "stop_listening",
            OutboundEnvelope::Ping { .. } => "ping",
            OutboundEnvelope::GetTranscripts => "get_transcripts",
            OutboundEnvelope::ResetConversation => "reset_conversation",
        }
    }

    pub fn to_json(&self) -> ClientResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of `session_initialized`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub status: Option<AgentStatus>,
    #[serde(default)]
    pub persona: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A partial or final piece of recognized (or generated) speech.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TranscriptFragment {
    #[serde(default)]
    pub id: Option<u64>,
    pub speaker: Speaker,
    #[serde(default)]
    pub text: String,
    /// The backend treats a missing flag as final; so do we.
    #[serde(default = "default_true")]
    pub is_final: bool,
    #[serde(default)]
    pub confidence: Option<f32>,
}

fn default_audio_mime() -> String {
    "audio/mpeg".to_string()
}

/// Inbound synthesized speech plus its format metadata.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioChunk {
    pub audio: String,
    #[serde(default = "default_audio_mime")]
    pub mime_type: String,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u16>,
    #[serde(default)]
    pub bit_rate: Option<u32>,
    #[serde(default)]
    pub codec: Option<String>,
    #[serde(default)]
    pub bit_depth: Option<u16>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub speaker: Option<Speaker>,
}

/// Envelopes the client receives, after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEnvelope {
    SessionInitialized(SessionInfo),
    Status(AgentStatus),
    Transcript(TranscriptFragment),
    Audio(AudioChunk),
    AudioStop { reason: Option<String> },
    Error { message: String },
    Pong { timestamp: Option<u64> },
    TranscriptHistory(Vec<TranscriptFragment>),
    ConversationReset,
    Message(String),
    /// A `type` this client does not know; logged and ignored by callers
    Unknown(String),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct StatusData {
    status: AgentStatus,
}

#[derive(Deserialize)]
struct HistoryData {
    #[serde(default)]
    transcripts: Vec<TranscriptFragment>,
}

fn payload<T: for<'de> Deserialize<'de>>(kind: &str, data: Option<Value>) -> ClientResult<T> {
    let data = data.ok_or_else(|| ClientError::Decode(format!("'{}' envelope has no data", kind)))?;
    Ok(serde_json::from_value(data)?)
}

/// Pull a string field out of an optional payload, accepting a bare string too.
fn text_field(data: &Option<Value>, field: &str) -> Option<String> {
    match data {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(map)) => map.get(field).and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

/// Parse one text frame from the channel into a typed envelope.
///
/// ## Returns:
/// - **Ok(InboundEnvelope::Unknown)**: well-formed envelope with an unrecognized `type`
/// - **Err(ClientError::Decode)**: not an envelope, or a known `type` with a bad payload
pub fn parse_inbound(text: &str) -> ClientResult<InboundEnvelope> {
    let raw: RawEnvelope = serde_json::from_str(text)?;
    let kind = raw.kind.as_str();

    let envelope = match kind {
        "session_initialized" => InboundEnvelope::SessionInitialized(payload(kind, raw.data)?),
        "status" => {
            let data: StatusData = payload(kind, raw.data)?;
            InboundEnvelope::Status(data.status)
        }
        "transcript" => InboundEnvelope::Transcript(payload(kind, raw.data)?),
        "audio" => InboundEnvelope::Audio(payload(kind, raw.data)?),
        "audio_stop" => InboundEnvelope::AudioStop {
            reason: text_field(&raw.data, "reason"),
        },
        "error" => InboundEnvelope::Error {
            message: text_field(&raw.data, "message").unwrap_or_else(|| "unknown error".to_string()),
        },
        "pong" => InboundEnvelope::Pong {
            timestamp: raw
                .data
                .as_ref()
                .and_then(|d| d.get("timestamp"))
                .and_then(|v| v.as_u64()),
        },
        "transcript_history" => {
            let data: HistoryData = payload(kind, raw.data)?;
            InboundEnvelope::TranscriptHistory(data.transcripts)
        }
        "conversation_reset" => InboundEnvelope::ConversationReset,
        "message" => InboundEnvelope::Message(text_field(&raw.data, "message").unwrap_or_default()),
        other => InboundEnvelope::Unknown(other.to_string()),
    };

    Ok(envelope)
}
