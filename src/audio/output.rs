//! Headless audio output driven by the tokio clock.
//!
//! Sources are not rendered to a device; each one simply "ends" once its real
//! duration has elapsed, which is enough to drive turn taking from a console.

use crate::audio::codec::{AudioBuffer, NativeDecoder};
use crate::audio::playback::{AudioOutput, SourceId};
use crate::error::{ClientError, ClientResult};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

pub struct WallClockOutput {
    origin: Instant,
    next_id: SourceId,
    pending: HashMap<SourceId, JoinHandle<()>>,
    ended_tx: mpsc::UnboundedSender<SourceId>,
}

impl WallClockOutput {
    /// Create the output and the receiver on which finished source ids arrive.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SourceId>) {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let output = Self {
            origin: Instant::now(),
            next_id: 0,
            pending: HashMap::new(),
            ended_tx,
        };
        (output, ended_rx)
    }
}

impl NativeDecoder for WallClockOutput {
    fn decode_compressed(&self, bytes: &[u8], mime_type: &str) -> ClientResult<AudioBuffer> {
        Err(ClientError::AudioDecode(format!(
            "no native decoder for {} ({} bytes)",
            mime_type,
            bytes.len()
        )))
    }
}

impl AudioOutput for WallClockOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start_source(&mut self, buffer: AudioBuffer, start_at: f64) -> ClientResult<SourceId> {
        self.pending.retain(|_, handle| !handle.is_finished());

        self.next_id += 1;
        let id = self.next_id;
        let ends_at = self.origin + Duration::from_secs_f64((start_at + buffer.duration_secs()).max(0.0));
        let ended_tx = self.ended_tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(ends_at).await;
            let _ = ended_tx.send(id);
        });
        self.pending.insert(id, handle);
        Ok(id)
    }

    fn stop_source(&mut self, id: SourceId) {
        if let Some(handle) = self.pending.remove(&id) {
            handle.abort();
        }
    }
}
