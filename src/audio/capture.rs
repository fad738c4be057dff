//! # Capture Pipeline
//!
//! Turns blocks of microphone samples into outbound [`AudioFrame`]s while the
//! transmit gate is open, and emits short silent frames as a keepalive when
//! nothing has been sent for a while.
//!
//! ## Per-tick Decision:
//! 1. Gate closed → emit nothing, forget the keepalive baseline
//! 2. Gate open and the block holds real signal → emit it
//! 3. Gate open and nothing emitted for `keepalive_interval` → emit a silent frame
//!
//! No samples are buffered across ticks; the only carried state is the time of
//! the last emission.

use crate::audio::codec::encode_frame;
use crate::config::AudioConfig;
use crate::protocol::AudioFrame;
use std::time::{Duration, Instant};
use tracing::debug;

/// Why a frame left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Speech,
    Keepalive,
}

/// A frame ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub kind: FrameKind,
    pub frame: AudioFrame,
}

#[derive(Debug, Clone)]
struct CaptureSettings {
    silence_epsilon: f32,
    keepalive_interval: Duration,
    keepalive_samples: usize,
    mime_type: String,
}

impl From<&AudioConfig> for CaptureSettings {
    fn from(config: &AudioConfig) -> Self {
        Self {
            silence_epsilon: config.silence_epsilon,
            keepalive_interval: config.keepalive_interval(),
            keepalive_samples: config.keepalive_samples(),
            mime_type: config.capture_mime_type.clone(),
        }
    }
}

pub struct CapturePipeline {
    settings: CaptureSettings,
    /// Transmit gate; written by the session on behalf of the turn machine
    gate: bool,
    /// Last emission, or the moment the gate was first seen open
    last_emission: Option<Instant>,
}

impl CapturePipeline {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            settings: CaptureSettings::from(config),
            gate: false,
            last_emission: None,
        }
    }

    /// Swap in new thresholds; the gate and keepalive timer are untouched.
    pub fn reconfigure(&mut self, config: &AudioConfig) {
        self.settings = CaptureSettings::from(config);
    }

    /// Open or close the gate. Takes effect on the next [`process_block`](Self::process_block).
    pub fn set_gate(&mut self, open: bool) {
        if self.gate != open {
            debug!(open, "Capture gate toggled");
        }
        self.gate = open;
    }

    pub fn gate_open(&self) -> bool {
        self.gate
    }

    /// Whether any sample rises above digital silence.
    fn has_signal(&self, block: &[f32]) -> bool {
        block.iter().any(|s| s.abs() > self.settings.silence_epsilon)
    }

    fn frame(&self, samples: &[f32]) -> AudioFrame {
        AudioFrame {
            audio: encode_frame(samples),
            mime_type: self.settings.mime_type.clone(),
        }
    }

    /// Run one processing tick over a block of samples captured at `now`.
    pub fn process_block(&mut self, block: &[f32], now: Instant) -> Vec<CapturedFrame> {
        if !self.gate {
            self.last_emission = None;
            return Vec::new();
        }

        let mut frames = Vec::new();
        let baseline = *self.last_emission.get_or_insert(now);

        if !block.is_empty() && self.has_signal(block) {
            frames.push(CapturedFrame {
                kind: FrameKind::Speech,
                frame: self.frame(block),
            });
            self.last_emission = Some(now);
        }

        let since_last = now.saturating_duration_since(self.last_emission.unwrap_or(baseline));
        if since_last >= self.settings.keepalive_interval {
            let silence = vec![0.0f32; self.settings.keepalive_samples];
            frames.push(CapturedFrame {
                kind: FrameKind::Keepalive,
                frame: self.frame(&silence),
            });
            self.last_emission = Some(now);
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::decode;

    fn pipeline() -> CapturePipeline {
        CapturePipeline::new(&crate::config::ClientConfig::default().audio)
    }

    fn speech() -> Vec<f32> {
        (0..160).map(|i| (i as f32 * 0.1).sin() * 0.3).collect()
    }

    #[test]
    fn test_closed_gate_emits_nothing() {
        let mut capture = pipeline();
        let start = Instant::now();
        assert!(capture.process_block(&speech(), start).is_empty());
        assert!(capture
            .process_block(&speech(), start + Duration::from_secs(5))
            .is_empty());
    }

    #[test]
    fn test_gate_toggle_applies_from_next_tick() {
        let mut capture = pipeline();
        let start = Instant::now();
        capture.set_gate(true);
        assert_eq!(capture.process_block(&speech(), start).len(), 1);

        capture.set_gate(false);
        assert!(capture
            .process_block(&speech(), start + Duration::from_millis(20))
            .is_empty());

        capture.set_gate(true);
        let frames = capture.process_block(&speech(), start + Duration::from_millis(40));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Speech);
    }

    #[test]
    fn test_digital_silence_is_not_sent() {
        let mut capture = pipeline();
        capture.set_gate(true);
        assert!(capture.process_block(&[0.0; 256], Instant::now()).is_empty());
    }

    #[test]
    fn test_keepalive_after_one_second_of_silence() {
        let mut capture = pipeline();
        let start = Instant::now();
        capture.set_gate(true);
        assert!(capture.process_block(&[0.0; 256], start).is_empty());
        assert!(capture
            .process_block(&[0.0; 256], start + Duration::from_millis(999))
            .is_empty());

        let frames = capture.process_block(&[0.0; 256], start + Duration::from_millis(1000));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Keepalive);
        // 20ms at 16kHz, two bytes per sample
        assert_eq!(decode(&frames[0].frame.audio).unwrap(), vec![0u8; 640]);

        // The keepalive resets the interval.
        assert!(capture
            .process_block(&[0.0; 256], start + Duration::from_millis(1500))
            .is_empty());
    }

    #[test]
    fn test_speech_postpones_keepalive() {
        let mut capture = pipeline();
        let start = Instant::now();
        capture.set_gate(true);
        capture.process_block(&[0.0; 256], start);
        capture.process_block(&speech(), start + Duration::from_millis(900));
        assert!(capture
            .process_block(&[0.0; 256], start + Duration::from_millis(1500))
            .is_empty());
        assert_eq!(
            capture.process_block(&[0.0; 256], start + Duration::from_millis(1900))[0].kind,
            FrameKind::Keepalive
        );
    }

    #[test]
    fn test_reopened_gate_restarts_keepalive_clock() {
        let mut capture = pipeline();
        let start = Instant::now();
        capture.set_gate(true);
        capture.process_block(&[0.0; 256], start);
        capture.set_gate(false);
        capture.process_block(&[0.0; 256], start + Duration::from_millis(800));
        capture.set_gate(true);
        assert!(capture
            .process_block(&[0.0; 256], start + Duration::from_millis(1200))
            .is_empty());
        assert_eq!(
            capture.process_block(&[0.0; 256], start + Duration::from_millis(2200)).len(),
            1
        );
    }
}
