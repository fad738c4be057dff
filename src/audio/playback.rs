//! # Playback Scheduler
//!
//! Plays decoded buffers back-to-back on the output clock with no gap and no
//! overlap, and supports immediate interruption (barge-in).
//!
//! ## Scheduling Invariant:
//! A single `next_start_time` is kept on the output clock. Each buffer starts at
//! `max(next_start_time, now)` and pushes `next_start_time` forward by its
//! duration, so buffers that arrive faster than they play queue seamlessly and
//! nothing is ever scheduled in the past.

use crate::audio::codec::{AudioBuffer, NativeDecoder};
use crate::error::ClientResult;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Handle the host assigns to a started source.
pub type SourceId = u64;

/// The host audio output: a monotonic clock plus sources that can be started
/// at a given time and stopped early. The host reports natural completion of
/// a source back to the session as a separate input.
pub trait AudioOutput: NativeDecoder {
    /// Current output clock time in seconds.
    fn current_time(&self) -> f64;

    /// Start `buffer` at `start_at` on the output clock.
    fn start_source(&mut self, buffer: AudioBuffer, start_at: f64) -> ClientResult<SourceId>;

    /// Stop a source immediately. Stopping an unknown or finished id is a no-op.
    fn stop_source(&mut self, id: SourceId);
}

/// Where a buffer landed on the clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_at: f64,
    pub duration: f64,
}

/// What a completion signal meant for the live set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Other sources are still queued or playing
    StillPlaying,
    /// The last live source finished; speaking has ended
    Drained,
    /// The source was not live (already force-stopped)
    Ignored,
}

pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    next_start_time: f64,
    live: BTreeSet<SourceId>,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        let next_start_time = output.current_time();
        Self {
            output,
            next_start_time,
            live: BTreeSet::new(),
        }
    }

    /// Decoder of the underlying output, for compressed chunks.
    pub fn decoder(&self) -> &dyn NativeDecoder {
        &self.output
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn is_playing(&self) -> bool {
        !self.live.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Queue a buffer right after everything already scheduled.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> ClientResult<ScheduledSource> {
        let now = self.output.current_time();
        let start_at = self.next_start_time.max(now);
        let duration = buffer.duration_secs();

        let id = self.output.start_source(buffer, start_at)?;
        self.next_start_time = start_at + duration;
        self.live.insert(id);

        debug!(
            source = id,
            start_at,
            duration,
            queued = self.live.len(),
            "Scheduled playback source"
        );

        Ok(ScheduledSource { id, start_at, duration })
    }

    /// Handle the host's "ended" signal for a source.
    pub fn on_source_ended(&mut self, id: SourceId) -> PlaybackOutcome {
        if !self.live.remove(&id) {
            return PlaybackOutcome::Ignored;
        }
        if self.live.is_empty() {
            debug!(source = id, "Playback drained");
            PlaybackOutcome::Drained
        } else {
            PlaybackOutcome::StillPlaying
        }
    }

    /// Stop everything now and restart the clock at the present moment.
    ///
    /// ## Returns:
    /// The number of sources that were cut off.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.live.len();
        for id in std::mem::take(&mut self.live) {
            self.output.stop_source(id);
        }
        self.next_start_time = self.output.current_time();
        if stopped > 0 {
            info!(stopped, "Playback interrupted");
        }
        stopped
    }
}
