//! # Turn-Taking State Machine
//!
//! The single source of truth for what the session is doing, and therefore
//! whether the microphone may transmit.
//!
//! ## States:
//! ```text
//! idle → connecting → { listening ⇄ speaking } → idle
//!                 any → error   (left only by restarting or ending the session)
//! ```
//!
//! ## Gate Rule:
//! The capture gate is open only while `listening`, not muted, simulating, and
//! the trainee wants to talk. Leaving `listening` for `speaking` keeps the gate
//! open for a short grace period so trailing speech is not clipped. Muting,
//! ending, and errors close it at once.

use crate::config::{ResumePolicy, TurnConfig};
use crate::protocol::AgentStatus;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Local session status. Mutated only by [`TurnTaking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Listening,
    Speaking,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Listening => "listening",
            SessionStatus::Speaking => "speaking",
            SessionStatus::Error => "error",
        }
    }
}

/// Everything that can move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// A simulation is starting (or restarting after an error)
    ConnectRequested,
    /// Local setup finished; move on unless the server already decided
    SetupComplete,
    /// Status reported by the backend
    ServerStatus(AgentStatus),
    /// An inbound chunk was decoded and scheduled for playback
    PlaybackStarted,
    /// The last scheduled source finished on its own
    PlaybackDrained,
    /// Playback was cut off (barge-in or local force-stop)
    PlaybackInterrupted,
    /// The channel failed
    TransportFailed,
    /// The channel closed without being asked to
    ChannelClosed,
    /// The trainee ended the session
    SessionEnded,
    Mute,
    Unmute,
    /// The trainee asked to talk
    ListenRequested,
    /// The trainee stopped talking
    ListenReleased,
}

/// A status change, for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

pub struct TurnTaking {
    status: SessionStatus,
    policy: ResumePolicy,
    grace: Duration,
    simulating: bool,
    muted: bool,
    /// The trainee's intent to transmit while listening
    listen_requested: bool,
    /// Local playback has live sources
    playback_active: bool,
    /// Gate stays open until this instant after leaving `listening`
    grace_until: Option<Instant>,
}

impl TurnTaking {
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            status: SessionStatus::Idle,
            policy: config.resume_policy,
            grace: config.listen_grace(),
            simulating: false,
            muted: false,
            listen_requested: true,
            playback_active: false,
            grace_until: None,
        }
    }

    /// Apply new turn settings to the running machine.
    pub fn reconfigure(&mut self, config: &TurnConfig) {
        self.policy = config.resume_policy;
        self.grace = config.listen_grace();
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_simulating(&self) -> bool {
        self.simulating
    }

    pub fn listen_requested(&self) -> bool {
        self.listen_requested
    }

    /// Whether captured audio may be transmitted at `now`.
    pub fn gate_enabled(&self, now: Instant) -> bool {
        if self.muted || !self.simulating {
            return false;
        }
        match self.status {
            SessionStatus::Listening => self.listen_requested,
            SessionStatus::Speaking => self.grace_until.map_or(false, |until| now < until),
            _ => false,
        }
    }

    /// When the gate decision will next change on its own, if still ahead of `now`.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        self.grace_until.filter(|until| *until > now)
    }

    fn enter(&mut self, to: SessionStatus, now: Instant) -> Option<Transition> {
        let from = self.status;
        if from == to {
            return None;
        }

        self.grace_until = match (from, to) {
            (SessionStatus::Listening, SessionStatus::Speaking) if self.gate_enabled(now) => {
                Some(now + self.grace)
            }
            _ => None,
        };

        if to == SessionStatus::Listening
            && from == SessionStatus::Speaking
            && self.policy == ResumePolicy::Manual
        {
            self.listen_requested = false;
        }

        self.status = to;
        info!(from = from.as_str(), to = to.as_str(), "Session status changed");
        Some(Transition { from, to })
    }

    fn on_server_status(&mut self, status: AgentStatus, now: Instant) -> Option<Transition> {
        match (self.status, status) {
            (SessionStatus::Error, _) => None,
            (_, AgentStatus::Error) => self.enter(SessionStatus::Error, now),
            (SessionStatus::Connecting, AgentStatus::Listening) => {
                self.enter(SessionStatus::Listening, now)
            }
            (SessionStatus::Speaking, AgentStatus::Listening) if self.playback_active => {
                debug!("Server reports listening while audio still plays; waiting for drain");
                None
            }
            (SessionStatus::Speaking, AgentStatus::Listening) => {
                self.enter(SessionStatus::Listening, now)
            }
            (SessionStatus::Connecting | SessionStatus::Listening, AgentStatus::Speaking) => {
                self.enter(SessionStatus::Speaking, now)
            }
            (current, other) => {
                debug!(
                    local = current.as_str(),
                    server = ?other,
                    "Server status produces no transition"
                );
                None
            }
        }
    }

    /// Apply one event. Returns the status change, if any.
    pub fn handle(&mut self, event: TurnEvent, now: Instant) -> Option<Transition> {
        if self.status == SessionStatus::Error
            && !matches!(event, TurnEvent::ConnectRequested | TurnEvent::SessionEnded)
        {
            debug!(?event, "Ignoring event while in error state");
            return None;
        }

        match event {
            TurnEvent::ConnectRequested => match self.status {
                SessionStatus::Idle | SessionStatus::Error => {
                    self.simulating = true;
                    self.playback_active = false;
                    self.listen_requested = true;
                    self.enter(SessionStatus::Connecting, now)
                }
                other => {
                    warn!(status = other.as_str(), "Connect requested while a session is active");
                    None
                }
            },
            TurnEvent::SetupComplete => {
                if self.status == SessionStatus::Connecting {
                    self.enter(SessionStatus::Listening, now)
                } else {
                    None
                }
            }
            TurnEvent::ServerStatus(status) => self.on_server_status(status, now),
            TurnEvent::PlaybackStarted => {
                self.playback_active = true;
                match self.status {
                    SessionStatus::Connecting | SessionStatus::Listening => {
                        self.enter(SessionStatus::Speaking, now)
                    }
                    _ => None,
                }
            }
            TurnEvent::PlaybackDrained | TurnEvent::PlaybackInterrupted => {
                self.playback_active = false;
                if self.status == SessionStatus::Speaking {
                    self.enter(SessionStatus::Listening, now)
                } else {
                    None
                }
            }
            TurnEvent::TransportFailed => {
                self.simulating = false;
                self.playback_active = false;
                self.enter(SessionStatus::Error, now)
            }
            TurnEvent::ChannelClosed | TurnEvent::SessionEnded => {
                self.simulating = false;
                self.playback_active = false;
                self.grace_until = None;
                self.enter(SessionStatus::Idle, now)
            }
            TurnEvent::Mute => {
                self.muted = true;
                self.grace_until = None;
                None
            }
            TurnEvent::Unmute => {
                self.muted = false;
                None
            }
            TurnEvent::ListenRequested => {
                self.listen_requested = true;
                None
            }
            TurnEvent::ListenReleased => {
                self.listen_requested = false;
                self.grace_until = None;
                None
            }
        }
    }
}
