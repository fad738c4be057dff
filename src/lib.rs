//! # Roleplay Voice Client
//!
//! Client-side core of a real-time voice roleplay session: a trainee talks to
//! an AI persona over a persistent WebSocket channel while audio streams in
//! both directions and a live transcript is kept in order.
//!
//! ## Architecture:
//! - **config**: Layered configuration (TOML file + environment variables)
//! - **error**: Error taxonomy shared by every component
//! - **protocol**: JSON envelopes exchanged with the backend
//! - **audio**: PCM codec, capture pipeline and gapless playback scheduling
//! - **transport**: The WebSocket channel and its reader/writer tasks
//! - **turn**: Turn-taking state machine that gates the microphone
//! - **transcript**: Reconciles streaming transcript fragments into one log
//! - **session**: Owns all of the above and dispatches every input
//!
//! ## Data Flow:
//! ```text
//! microphone → capture → transport → backend
//! backend → transport → { playback, transcript, turn }
//! turn → capture gate
//! ```

pub mod audio;       // Codec, capture and playback (audio/ directory)
pub mod config;      // Configuration management (config.rs)
pub mod error;       // Error handling types (error.rs)
pub mod protocol;    // Wire envelopes (protocol.rs)
pub mod session;     // Session lifecycle and dispatch (session.rs)
pub mod transcript;  // Transcript reconciliation (transcript.rs)
pub mod transport;   // WebSocket transport (transport.rs)
pub mod turn;        // Turn-taking state machine (turn.rs)

pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use session::{Session, SessionInput, SessionStats, SessionUpdate, UserCommand};
