//! # Voice Roleplay Session
//!
//! One active conversation with a persona. The [`Session`] owns every moving
//! part (transport, capture pipeline, playback scheduler, turn machine and
//! transcript log) and is driven by a single dispatch function.
//!
//! ## Inputs and Outputs:
//! - **In**: [`SessionInput`] values (inbound envelopes, captured blocks,
//!   playback completions, user commands, timer ticks), applied one at a time
//! - **Out**: [`SessionUpdate`] values for the UI on an mpsc channel
//!
//! ## Lifecycle:
//! 1. `begin()` moves to `connecting` while the host opens the channel
//! 2. `open()` attaches the connected transport and finishes setup
//! 3. `dispatch()` for every input until the session ends
//! 4. `close()` disables the capture gate, stops playback, then ends the
//!    transport, in that order, so nothing is sent or rendered afterwards

use crate::audio::capture::{CapturePipeline, FrameKind};
use crate::audio::codec::{self, AudioFormat};
use crate::audio::playback::{
    AudioOutput, PlaybackOutcome, PlaybackScheduler, ScheduledSource, SourceId,
};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{AudioChunk, InboundEnvelope, OutboundEnvelope};
use crate::transcript::{TranscriptEntry, TranscriptReconciler};
use crate::transport::{Transport, TransportEvent};
use crate::turn::{SessionStatus, TurnEvent, TurnTaking};

use serde::Serialize;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Things the trainee can ask for.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Mute,
    Unmute,
    StartListening,
    StopListening,
    SendText(String),
    RequestTranscripts,
    ResetConversation,
    /// Partial JSON override of the running configuration
    Configure(String),
    End,
}

impl UserCommand {
    /// Parse a console line: `/mute`, `/unmute`, `/listen`, `/stop`,
    /// `/history`, `/reset`, `/config {json}`, `/end`; any other non-empty
    /// text is sent as-is.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        let command = match line {
            "" => return None,
            "/mute" => UserCommand::Mute,
            "/unmute" => UserCommand::Unmute,
            "/listen" => UserCommand::StartListening,
            "/stop" => UserCommand::StopListening,
            "/history" => UserCommand::RequestTranscripts,
            "/reset" => UserCommand::ResetConversation,
            "/end" | "/quit" => UserCommand::End,
            other if other.starts_with("/config ") => {
                UserCommand::Configure(other["/config ".len()..].trim().to_string())
            }
            text => UserCommand::SendText(text.to_string()),
        };
        Some(command)
    }
}

/// Everything that can happen to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    /// Something arrived from (or happened to) the channel
    Inbound(TransportEvent),
    /// One block of microphone samples
    CaptureBlock(Vec<f32>),
    /// The host reports a playback source finished on its own
    PlaybackEnded(SourceId),
    Command(UserCommand),
    /// Time passed; re-evaluate deadlines
    Tick,
}

/// What the UI needs to know.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Status(SessionStatus),
    /// An entry was appended or changed in place
    Transcript(TranscriptEntry),
    /// The whole log was replaced (history resync or conversation reset)
    TranscriptReset(Vec<TranscriptEntry>),
    Error { message: String, fatal: bool },
    Ended,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub keepalives_sent: u64,
    pub chunks_received: u64,
    pub chunks_dropped: u64,
    pub fragments_applied: u64,
}

pub struct Session<T: Transport, O: AudioOutput> {
    config: ClientConfig,
    transport: Option<T>,
    capture: CapturePipeline,
    playback: PlaybackScheduler<O>,
    turn: TurnTaking,
    transcript: TranscriptReconciler,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    stats: SessionStats,
    active: bool,
}

impl<T: Transport, O: AudioOutput> Session<T, O> {
    pub fn new(config: ClientConfig, output: O, updates: mpsc::UnboundedSender<SessionUpdate>) -> Self {
        Self {
            capture: CapturePipeline::new(&config.audio),
            playback: PlaybackScheduler::new(output),
            turn: TurnTaking::new(&config.turn),
            transcript: TranscriptReconciler::new(),
            transport: None,
            updates,
            stats: SessionStats::default(),
            active: false,
            config,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.turn.status()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.transcript.entries()
    }

    pub fn capture_gate_open(&self) -> bool {
        self.capture.gate_open()
    }

    pub fn playback(&self) -> &PlaybackScheduler<O> {
        &self.playback
    }

    /// Earliest instant at which a `Tick` would change anything.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        self.turn.next_deadline(now)
    }

    fn notify(&self, update: SessionUpdate) {
        // The UI going away does not stop the session.
        let _ = self.updates.send(update);
    }

    fn apply_turn(&mut self, event: TurnEvent, now: Instant) {
        if let Some(transition) = self.turn.handle(event, now) {
            self.notify(SessionUpdate::Status(transition.to));
        }
        self.sync_gate(now);
    }

    fn sync_gate(&mut self, now: Instant) {
        let enabled = self.active && self.turn.gate_enabled(now);
        self.capture.set_gate(enabled);
    }

    fn send(&mut self, envelope: OutboundEnvelope) {
        match self.transport.as_mut() {
            Some(transport) => transport.send(envelope),
            None => warn!(kind = envelope.kind(), "No transport attached; dropping send"),
        }
    }

    /// Enter `connecting` while the host opens the channel.
    pub fn begin(&mut self, now: Instant) {
        self.apply_turn(TurnEvent::ConnectRequested, now);
    }

    /// Attach a connected transport and finish local setup.
    ///
    /// Starts a fresh conversation: the transcript log and counters are reset.
    pub fn open(&mut self, transport: T, now: Instant) {
        if matches!(self.turn.status(), SessionStatus::Idle | SessionStatus::Error) {
            self.begin(now);
        }
        info!(
            persona_id = %self.config.session.persona_id,
            product_id = ?self.config.session.product_id,
            "Session opened"
        );

        self.transcript.reset();
        self.stats = SessionStats::default();
        self.transport = Some(transport);
        self.active = true;
        self.apply_turn(TurnEvent::SetupComplete, now);
    }

    /// The channel could not be opened.
    pub fn fail_setup(&mut self, err: ClientError, now: Instant) {
        error!(error = %err, "Session setup failed");
        self.notify(SessionUpdate::Error {
            message: err.to_string(),
            fatal: true,
        });
        self.apply_turn(TurnEvent::TransportFailed, now);
        self.notify(SessionUpdate::Ended);
    }

    /// End the session. Safe to call more than once.
    pub fn close(&mut self, now: Instant) {
        self.release(true, now);
    }

    fn release(&mut self, graceful: bool, now: Instant) {
        if !self.active && self.transport.is_none() {
            return;
        }
        self.active = false;

        self.capture.set_gate(false);
        self.playback.interrupt();
        if let Some(mut transport) = self.transport.take() {
            if graceful {
                transport.end_session();
            } else {
                transport.disconnect();
            }
        }

        if self.turn.status() != SessionStatus::Error {
            self.apply_turn(TurnEvent::SessionEnded, now);
        }
        info!(
            frames_sent = self.stats.frames_sent,
            keepalives_sent = self.stats.keepalives_sent,
            chunks_received = self.stats.chunks_received,
            chunks_dropped = self.stats.chunks_dropped,
            "Session closed"
        );
        self.notify(SessionUpdate::Ended);
    }

    /// Apply one input.
    pub fn dispatch(&mut self, input: SessionInput, now: Instant) {
        match input {
            SessionInput::Inbound(event) => self.on_transport_event(event, now),
            SessionInput::CaptureBlock(block) => self.on_capture_block(&block, now),
            SessionInput::PlaybackEnded(id) => {
                if self.playback.on_source_ended(id) == PlaybackOutcome::Drained {
                    self.apply_turn(TurnEvent::PlaybackDrained, now);
                }
            }
            SessionInput::Command(command) => self.on_command(command, now),
            SessionInput::Tick => self.sync_gate(now),
        }
    }

    fn on_capture_block(&mut self, block: &[f32], now: Instant) {
        if !self.active {
            return;
        }
        self.sync_gate(now);

        for captured in self.capture.process_block(block, now) {
            match captured.kind {
                FrameKind::Speech => self.stats.frames_sent += 1,
                FrameKind::Keepalive => self.stats.keepalives_sent += 1,
            }
            self.send(OutboundEnvelope::Audio(captured.frame));
        }
    }

    fn on_command(&mut self, command: UserCommand, now: Instant) {
        debug!(?command, "User command");
        match command {
            UserCommand::Mute => self.apply_turn(TurnEvent::Mute, now),
            UserCommand::Unmute => self.apply_turn(TurnEvent::Unmute, now),
            UserCommand::StartListening => {
                self.apply_turn(TurnEvent::ListenRequested, now);
                self.send(OutboundEnvelope::StartListening);
            }
            UserCommand::StopListening => {
                self.apply_turn(TurnEvent::ListenReleased, now);
                self.send(OutboundEnvelope::StopListening);
            }
            UserCommand::SendText(text) => self.send(OutboundEnvelope::Text { text }),
            UserCommand::RequestTranscripts => self.send(OutboundEnvelope::GetTranscripts),
            UserCommand::ResetConversation => self.send(OutboundEnvelope::ResetConversation),
            UserCommand::Configure(json) => self.reconfigure(&json, now),
            UserCommand::End => self.close(now),
        }
    }

    /// Apply a partial configuration override to the running session.
    ///
    /// Audio and turn settings take effect immediately; server and session
    /// settings apply to the next connection. A rejected override changes nothing.
    fn reconfigure(&mut self, json: &str, now: Instant) {
        let mut updated = self.config.clone();
        if let Err(e) = updated.update_from_json(json) {
            warn!(error = %e, "Rejected configuration override");
            self.notify(SessionUpdate::Error {
                message: format!("Rejected configuration override: {}", e),
                fatal: false,
            });
            return;
        }

        self.capture.reconfigure(&updated.audio);
        self.turn.reconfigure(&updated.turn);
        self.config = updated;
        info!(
            resume_policy = ?self.config.turn.resume_policy,
            listen_grace_ms = self.config.turn.listen_grace_ms,
            "Configuration override applied"
        );
        self.sync_gate(now);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn on_transport_event(&mut self, event: TransportEvent, now: Instant) {
        if !self.active {
            debug!(?event, "Ignoring transport event for inactive session");
            return;
        }

        match event {
            TransportEvent::Envelope(envelope) => self.on_envelope(envelope, now),
            TransportEvent::Closed => {
                self.notify(SessionUpdate::Error {
                    message: "Connection closed by server".to_string(),
                    fatal: true,
                });
                self.apply_turn(TurnEvent::ChannelClosed, now);
                self.release(false, now);
            }
            TransportEvent::Failed(err) => {
                self.notify(SessionUpdate::Error {
                    message: err.to_string(),
                    fatal: err.is_fatal(),
                });
                self.apply_turn(TurnEvent::TransportFailed, now);
                self.release(false, now);
            }
        }
    }

    fn on_envelope(&mut self, envelope: InboundEnvelope, now: Instant) {
        match envelope {
            InboundEnvelope::SessionInitialized(info) => {
                info!(
                    session_id = %info.session_id,
                    room_name = ?info.room_name,
                    persona = ?info.persona,
                    status = ?info.status,
                    "Session initialized by server"
                );
            }
            InboundEnvelope::Status(status) => {
                debug!(?status, "Server status");
                self.apply_turn(TurnEvent::ServerStatus(status), now);
                if self.turn.status() == SessionStatus::Error {
                    self.notify(SessionUpdate::Error {
                        message: "Server reported an error state".to_string(),
                        fatal: true,
                    });
                    self.release(false, now);
                }
            }
            InboundEnvelope::Transcript(fragment) => {
                let outcome = self.transcript.apply(fragment);
                if let Some(id) = outcome.changed_entry() {
                    self.stats.fragments_applied += 1;
                    if let Some(entry) = self.transcript.get(id) {
                        self.notify(SessionUpdate::Transcript(entry.clone()));
                    }
                }
            }
            InboundEnvelope::Audio(chunk) => self.on_audio_chunk(chunk, now),
            InboundEnvelope::AudioStop { reason } => {
                info!(reason = ?reason, "Server interrupted playback");
                self.playback.interrupt();
                self.apply_turn(TurnEvent::PlaybackInterrupted, now);
            }
            InboundEnvelope::Error { message } => {
                warn!(message = %message, "Server error");
                self.notify(SessionUpdate::Error { message, fatal: false });
            }
            InboundEnvelope::Pong { timestamp } => debug!(?timestamp, "Pong"),
            InboundEnvelope::TranscriptHistory(history) => {
                info!(entries = history.len(), "Transcript history received");
                self.transcript.replace_history(history);
                self.notify(SessionUpdate::TranscriptReset(self.transcript.entries().to_vec()));
            }
            InboundEnvelope::ConversationReset => {
                info!("Conversation reset by server");
                self.transcript.reset();
                self.notify(SessionUpdate::TranscriptReset(Vec::new()));
            }
            InboundEnvelope::Message(message) => info!(message = %message, "Server message"),
            InboundEnvelope::Unknown(kind) => warn!(kind = %kind, "Ignoring envelope of unknown type"),
        }
    }

    fn on_audio_chunk(&mut self, chunk: AudioChunk, now: Instant) {
        self.stats.chunks_received += 1;
        let format = AudioFormat::from_chunk(&chunk);

        match self.schedule_chunk(&chunk, &format) {
            Ok(source) => {
                debug!(
                    source = source.id,
                    mime_type = %format.mime_type,
                    duration = source.duration,
                    "Audio chunk scheduled"
                );
                self.apply_turn(TurnEvent::PlaybackStarted, now);
            }
            Err(e) => {
                self.stats.chunks_dropped += 1;
                warn!(mime_type = %format.mime_type, error = %e, "Dropping audio chunk");
            }
        }
    }

    fn schedule_chunk(&mut self, chunk: &AudioChunk, format: &AudioFormat) -> ClientResult<ScheduledSource> {
        let bytes = codec::decode(&chunk.audio)?;
        let buffer = codec::decode_audio_data(&bytes, format, self.playback.decoder())?;
        self.playback.schedule(buffer)
    }

    /// Drive the session until it ends.
    ///
    /// ## Parameters:
    /// - `events`: inbound traffic from the transport
    /// - `commands`: trainee commands
    /// - `capture`: microphone blocks
    /// - `ended`: ids of playback sources that finished on their own
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<UserCommand>,
        mut capture: mpsc::UnboundedReceiver<Vec<f32>>,
        mut ended: mpsc::UnboundedReceiver<SourceId>,
    ) -> SessionStats {
        while self.active {
            let deadline = self.next_deadline(Instant::now());

            let input = tokio::select! {
                Some(event) = events.recv() => SessionInput::Inbound(event),
                Some(command) = commands.recv() => SessionInput::Command(command),
                Some(block) = capture.recv() => SessionInput::CaptureBlock(block),
                Some(id) = ended.recv() => SessionInput::PlaybackEnded(id),
                _ = wait_until(deadline), if deadline.is_some() => SessionInput::Tick,
                else => {
                    warn!("All session inputs closed");
                    break;
                }
            };

            self.dispatch(input, Instant::now());
        }

        self.close(Instant::now());
        self.stats.clone()
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Transport that records calls in order; share `log` to inspect after close.
    #[derive(Debug, Default, Clone)]
    pub struct RecordingTransport {
        pub open: bool,
        pub log: Arc<Mutex<Vec<String>>>,
        pub sent: Arc<Mutex<Vec<OutboundEnvelope>>>,
    }

    impl RecordingTransport {
        pub fn connected() -> Self {
            Self {
                open: true,
                ..Self::default()
            }
        }
    }

    impl Transport for RecordingTransport {
        fn is_open(&self) -> bool {
            self.open
        }

        fn send(&mut self, envelope: OutboundEnvelope) {
            if !self.open {
                return;
            }
            self.log.lock().unwrap().push(format!("send:{}", envelope.kind()));
            self.sent.lock().unwrap().push(envelope);
        }

        fn end_session(&mut self) {
            self.send(OutboundEnvelope::EndSession);
            self.log.lock().unwrap().push("teardown".to_string());
            self.open = false;
        }

        fn disconnect(&mut self) {
            self.log.lock().unwrap().push("teardown".to_string());
            self.open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingTransport;
    use super::*;
    use crate::audio::playback::testing::FakeOutput;
    use crate::config::ResumePolicy;
    use crate::protocol::parse_inbound;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        session: Session<RecordingTransport, FakeOutput>,
        transport: RecordingTransport,
        updates: mpsc::UnboundedReceiver<SessionUpdate>,
        now: Instant,
    }

    impl Harness {
        fn new(config: ClientConfig) -> Self {
            let (tx, updates) = mpsc::unbounded_channel();
            let mut session = Session::new(config, FakeOutput::default(), tx);
            let transport = RecordingTransport::connected();
            let now = Instant::now();
            session.open(transport.clone(), now);
            Self { session, transport, updates, now }
        }

        fn inbound(&mut self, value: serde_json::Value) {
            let envelope = parse_inbound(&value.to_string()).unwrap();
            self.session
                .dispatch(SessionInput::Inbound(TransportEvent::Envelope(envelope)), self.now);
        }

        fn speak(&mut self) {
            self.session
                .dispatch(SessionInput::CaptureBlock(vec![0.5; 64]), self.now);
        }

        fn sent_kinds(&self) -> Vec<&'static str> {
            self.transport.sent.lock().unwrap().iter().map(|e| e.kind()).collect()
        }

        fn drain_updates(&mut self) -> Vec<SessionUpdate> {
            let mut out = Vec::new();
            while let Ok(update) = self.updates.try_recv() {
                out.push(update);
            }
            out
        }
    }

    fn pcm_chunk(seconds: f32) -> serde_json::Value {
        let samples = vec![0.25; (24000.0 * seconds) as usize];
        json!({
            "type": "audio",
            "data": { "audio": codec::encode_frame(&samples), "mime_type": "audio/pcm" }
        })
    }

    #[test]
    fn test_parse_console_lines() {
        assert_eq!(UserCommand::parse_line("  /mute "), Some(UserCommand::Mute));
        assert_eq!(UserCommand::parse_line("/history"), Some(UserCommand::RequestTranscripts));
        assert_eq!(UserCommand::parse_line("/end"), Some(UserCommand::End));
        assert_eq!(
            UserCommand::parse_line("What does it cost?"),
            Some(UserCommand::SendText("What does it cost?".to_string()))
        );
        assert_eq!(
            UserCommand::parse_line(r#"/config {"turn": {"listen_grace_ms": 500}}"#),
            Some(UserCommand::Configure(r#"{"turn": {"listen_grace_ms": 500}}"#.to_string()))
        );
        assert_eq!(UserCommand::parse_line("   "), None);
    }

    #[test]
    fn test_open_reaches_listening_and_transmits() {
        let mut h = Harness::new(ClientConfig::default());
        assert_eq!(
            h.drain_updates(),
            vec![
                SessionUpdate::Status(SessionStatus::Connecting),
                SessionUpdate::Status(SessionStatus::Listening),
            ]
        );
        assert!(h.session.capture_gate_open());

        h.speak();
        assert_eq!(h.sent_kinds(), vec!["audio"]);
        assert_eq!(h.session.stats().frames_sent, 1);
    }

    #[test]
    fn test_session_initialized_changes_nothing() {
        let mut h = Harness::new(ClientConfig::default());
        h.drain_updates();
        h.inbound(json!({
            "type": "session_initialized",
            "data": {
                "session_id": "abc-123",
                "room_name": "roleplay-abc-123",
                "status": "connecting",
                "persona": "skeptical_cfo"
            }
        }));

        assert!(h.session.is_active());
        assert_eq!(h.session.status(), SessionStatus::Listening);
        assert!(h.drain_updates().is_empty());
    }

    #[test]
    fn test_configure_switches_resume_policy_live() {
        let mut h = Harness::new(ClientConfig::default());
        h.session.dispatch(
            SessionInput::Command(UserCommand::Configure(
                r#"{"turn": {"resume_policy": "manual"}}"#.to_string(),
            )),
            h.now,
        );
        assert_eq!(h.session.config().turn.resume_policy, ResumePolicy::Manual);

        h.inbound(pcm_chunk(0.1));
        h.session.dispatch(SessionInput::PlaybackEnded(1), h.now);
        assert_eq!(h.session.status(), SessionStatus::Listening);
        assert!(!h.session.capture_gate_open());
    }

    #[test]
    fn test_rejected_configure_keeps_old_settings() {
        let mut h = Harness::new(ClientConfig::default());
        h.drain_updates();
        h.session.dispatch(
            SessionInput::Command(UserCommand::Configure(
                r#"{"turn": {"resume_policy": "manual"}, "audio": {"capture_block_size": 0}}"#
                    .to_string(),
            )),
            h.now,
        );

        assert_eq!(h.session.config().turn.resume_policy, ResumePolicy::Automatic);
        assert!(matches!(
            h.drain_updates().as_slice(),
            [SessionUpdate::Error { fatal: false, .. }]
        ));
        assert!(h.session.is_active());
    }

    #[test]
    fn test_chunk_speaks_and_drain_listens() {
        let mut h = Harness::new(ClientConfig::default());
        h.inbound(pcm_chunk(0.1));
        h.inbound(pcm_chunk(0.1));
        assert_eq!(h.session.status(), SessionStatus::Speaking);
        assert_eq!(h.session.playback().live_count(), 2);

        h.session.dispatch(SessionInput::PlaybackEnded(1), h.now);
        assert_eq!(h.session.status(), SessionStatus::Speaking);
        h.session.dispatch(SessionInput::PlaybackEnded(2), h.now);
        assert_eq!(h.session.status(), SessionStatus::Listening);
        assert!(h.session.capture_gate_open());
    }

    #[test]
    fn test_barge_in_stops_playback() {
        let mut h = Harness::new(ClientConfig::default());
        h.inbound(pcm_chunk(0.5));
        h.inbound(pcm_chunk(0.5));
        h.inbound(json!({ "type": "audio_stop", "data": { "reason": "user_speaking" } }));

        assert_eq!(h.session.status(), SessionStatus::Listening);
        assert!(!h.session.playback().is_playing());
        assert_eq!(h.session.playback().output().stopped, vec![1, 2]);

        // Late completion of a stopped source is ignored.
        h.session.dispatch(SessionInput::PlaybackEnded(1), h.now);
        assert_eq!(h.session.status(), SessionStatus::Listening);
    }

    #[test]
    fn test_undecodable_chunks_are_dropped() {
        let mut h = Harness::new(ClientConfig::default());
        h.inbound(json!({ "type": "audio", "data": { "audio": "!!!", "mime_type": "audio/pcm" } }));
        h.inbound(json!({ "type": "audio", "data": { "audio": "AAAA", "mime_type": "audio/garbage" } }));

        assert_eq!(h.session.status(), SessionStatus::Listening);
        assert_eq!(h.session.stats().chunks_received, 2);
        assert_eq!(h.session.stats().chunks_dropped, 2);
        assert!(h.session.is_active());
    }

    #[test]
    fn test_compressed_chunk_uses_native_decoder() {
        let mut h = Harness::new(ClientConfig::default());
        h.inbound(json!({ "type": "audio", "data": { "audio": "AAAA", "mime_type": "audio/mpeg" } }));
        assert_eq!(h.session.status(), SessionStatus::Speaking);
        let (_, start, duration) = h.session.playback().output().started[0];
        assert_eq!(start, 0.0);
        assert!((duration - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_close_orders_teardown_and_sends_nothing_after() {
        let mut h = Harness::new(ClientConfig::default());
        h.speak();
        h.inbound(pcm_chunk(0.5));

        h.session.dispatch(SessionInput::Command(UserCommand::End), h.now);
        assert!(!h.session.capture_gate_open());
        assert!(!h.session.playback().is_playing());
        assert_eq!(h.session.status(), SessionStatus::Idle);

        h.speak();
        h.session.close(h.now);

        let log = h.transport.log.lock().unwrap().clone();
        assert_eq!(log, vec!["send:audio", "send:end_session", "teardown"]);

        let updates = h.drain_updates();
        assert_eq!(updates.iter().filter(|u| **u == SessionUpdate::Ended).count(), 1);
    }

    #[test]
    fn test_unexpected_close_returns_to_idle() {
        let mut h = Harness::new(ClientConfig::default());
        h.session
            .dispatch(SessionInput::Inbound(TransportEvent::Closed), h.now);

        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert!(!h.session.is_active());
        assert_eq!(h.transport.log.lock().unwrap().clone(), vec!["teardown"]);
    }

    #[test]
    fn test_transport_failure_stays_in_error() {
        let mut h = Harness::new(ClientConfig::default());
        let failure = TransportEvent::Failed(ClientError::Transport("reset".into()));
        h.session.dispatch(SessionInput::Inbound(failure), h.now);

        assert_eq!(h.session.status(), SessionStatus::Error);
        assert!(!h.session.is_active());
        let updates = h.drain_updates();
        assert!(updates.contains(&SessionUpdate::Error {
            message: "Transport error: reset".to_string(),
            fatal: true
        }));
        assert_eq!(updates.last(), Some(&SessionUpdate::Ended));
    }

    #[test]
    fn test_transcripts_flow_to_updates() {
        let mut h = Harness::new(ClientConfig::default());
        h.drain_updates();

        h.inbound(json!({ "type": "transcript", "data": { "speaker": "Trainee", "text": "hello wor", "is_final": false } }));
        h.inbound(json!({ "type": "transcript", "data": { "speaker": "Trainee", "text": "orld today", "is_final": false } }));
        h.inbound(json!({ "type": "transcript", "data": { "speaker": "AI Assistant", "text": "Hi there", "is_final": true } }));

        assert_eq!(h.session.transcript().len(), 2);
        assert_eq!(h.session.transcript()[0].text, "hello world today");
        assert_eq!(h.session.stats().fragments_applied, 3);

        h.inbound(json!({ "type": "conversation_reset", "data": {} }));
        assert!(h.session.transcript().is_empty());
        assert_eq!(h.drain_updates().last(), Some(&SessionUpdate::TranscriptReset(Vec::new())));
    }

    #[test]
    fn test_mute_blocks_transmission() {
        let mut h = Harness::new(ClientConfig::default());
        h.session.dispatch(SessionInput::Command(UserCommand::Mute), h.now);
        h.speak();
        assert!(h.sent_kinds().is_empty());

        h.session.dispatch(SessionInput::Command(UserCommand::Unmute), h.now);
        h.speak();
        assert_eq!(h.sent_kinds(), vec!["audio"]);
    }

    #[test]
    fn test_grace_period_after_ai_starts_speaking() {
        let mut h = Harness::new(ClientConfig::default());
        h.inbound(pcm_chunk(5.0));

        h.now += Duration::from_secs(1);
        h.speak();
        assert_eq!(h.sent_kinds(), vec!["audio"]);

        h.now += Duration::from_secs(3);
        h.session.dispatch(SessionInput::Tick, h.now);
        assert!(!h.session.capture_gate_open());
        h.speak();
        assert_eq!(h.sent_kinds(), vec!["audio"]);
    }

    #[test]
    fn test_manual_resume_policy() {
        let mut config = ClientConfig::default();
        config.turn.resume_policy = ResumePolicy::Manual;
        let mut h = Harness::new(config);

        h.inbound(pcm_chunk(0.1));
        h.session.dispatch(SessionInput::PlaybackEnded(1), h.now);
        assert_eq!(h.session.status(), SessionStatus::Listening);
        assert!(!h.session.capture_gate_open());

        h.session
            .dispatch(SessionInput::Command(UserCommand::StartListening), h.now);
        assert!(h.session.capture_gate_open());
        assert_eq!(h.sent_kinds(), vec!["start_listening"]);
    }

    #[test]
    fn test_failed_setup_reports_error() {
        let (tx, mut updates) = mpsc::unbounded_channel();
        let mut session: Session<RecordingTransport, FakeOutput> =
            Session::new(ClientConfig::default(), FakeOutput::default(), tx);
        let now = Instant::now();
        session.begin(now);
        session.fail_setup(ClientError::Transport("refused".into()), now);

        assert_eq!(session.status(), SessionStatus::Error);
        assert!(!session.is_active());
        let mut seen = Vec::new();
        while let Ok(update) = updates.try_recv() {
            seen.push(update);
        }
        assert_eq!(seen.first(), Some(&SessionUpdate::Status(SessionStatus::Connecting)));
        assert_eq!(seen.last(), Some(&SessionUpdate::Ended));

        // A retry restarts from the error state.
        session.open(RecordingTransport::connected(), now);
        assert_eq!(session.status(), SessionStatus::Listening);
    }

    #[tokio::test]
    async fn test_run_ends_on_command() {
        let (tx, _updates) = mpsc::unbounded_channel();
        let mut session: Session<RecordingTransport, FakeOutput> =
            Session::new(ClientConfig::default(), FakeOutput::default(), tx);
        let transport = RecordingTransport::connected();
        session.open(transport.clone(), Instant::now());

        let (_events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (capture_tx, capture) = mpsc::unbounded_channel();
        let (_ended_tx, ended) = mpsc::unbounded_channel();

        capture_tx.send(vec![0.5; 64]).unwrap();
        commands_tx.send(UserCommand::End).unwrap();

        let stats = session.run(events, commands, capture, ended).await;
        assert!(!session.is_active());
        assert_eq!(
            transport.sent.lock().unwrap().last().map(|e| e.kind()),
            Some("end_session")
        );
        assert!(stats.frames_sent <= 1);
    }
}
