//! # Audio Module
//!
//! Everything that touches samples on the client side of a roleplay session.
//!
//! ## Key Components:
//! - **Codec**: PCM <-> base64 <-> playable buffers
//! - **Capture**: gated microphone frames plus silent keepalives
//! - **Playback**: gapless scheduling of inbound speech with barge-in
//! - **Output**: a headless output for running without a sound device
//!
//! ## Audio Format Requirements (outbound):
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers, base64 in a JSON envelope

pub mod capture;      // Gated frame emission and keepalives
pub mod codec;        // Sample conversion and decoding
pub mod output;       // Headless wall-clock output
pub mod playback;     // Gapless playback scheduling
