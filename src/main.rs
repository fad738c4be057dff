//! # Roleplay Voice Client - Console Entry Point
//!
//! Opens one roleplay session against the backend and drives it from the
//! terminal.
//!
//! ## Usage:
//! ```text
//! roleplay-voice-client [persona_id] [product_id]
//! ```
//! Lines typed on stdin are commands (`/mute`, `/unmute`, `/listen`, `/stop`,
//! `/history`, `/reset`, `/config {json}`, `/end`); anything else is sent to
//! the persona as text. Ctrl-C ends the session cleanly.
//!
//! ## Audio:
//! There is no device here. Playback uses [`WallClockOutput`], whose sources
//! simply end after their real duration, and the microphone is replaced by
//! silent blocks, so only keepalive frames flow while the gate is open.

use anyhow::Result;
use roleplay_voice_client::audio::output::WallClockOutput;
use roleplay_voice_client::session::{Session, SessionUpdate, UserCommand};
use roleplay_voice_client::transport::WsTransport;
use roleplay_voice_client::ClientConfig;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The console client.
///
/// ## What this function does:
/// 1. **Loads configuration** from files, environment variables and arguments
/// 2. **Sets up logging**
/// 3. **Connects the session transport** for the chosen persona
/// 4. **Runs the session** until `/end`, Ctrl-C, or the server goes away
#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let mut config = ClientConfig::load()?;
    let mut args = std::env::args().skip(1);
    if let Some(persona_id) = args.next() {
        config.session.persona_id = persona_id;
    }
    if let Some(product_id) = args.next() {
        config.session.product_id = Some(product_id);
    }
    config.validate()?;
    if config.session.persona_id.trim().is_empty() {
        anyhow::bail!("usage: roleplay-voice-client <persona_id> [product_id] (or set APP_SESSION__PERSONA_ID)");
    }

    info!("Starting roleplay-voice-client v{}", env!("CARGO_PKG_VERSION"));
    debug!("Effective configuration:\n{}", config.to_toml()?);

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_updates(updates_rx));

    let (output, ended_rx) = WallClockOutput::new();
    let mut session: Session<WsTransport, WallClockOutput> =
        Session::new(config.clone(), output, updates_tx);

    session.begin(Instant::now());
    let (transport, events_rx) = match WsTransport::connect(&config).await {
        Ok(connected) => connected,
        Err(e) => {
            session.fail_setup(e.clone(), Instant::now());
            drop(session);
            let _ = printer.await;
            return Err(e.into());
        }
    };
    session.open(transport, Instant::now());

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    spawn_stdin_commands(commands_tx.clone());
    spawn_ctrl_c(commands_tx);

    let (capture_tx, capture_rx) = mpsc::unbounded_channel();
    spawn_silent_capture(
        capture_tx,
        config.audio.capture_block_size,
        config.audio.capture_sample_rate,
    );

    let stats = session.run(events_rx, commands_rx, capture_rx, ended_rx).await;
    info!(
        frames_sent = stats.frames_sent,
        keepalives_sent = stats.keepalives_sent,
        chunks_received = stats.chunks_received,
        chunks_dropped = stats.chunks_dropped,
        fragments_applied = stats.fragments_applied,
        "Session finished"
    );

    drop(session);
    let _ = printer.await;
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "info", "roleplay_voice_client=trace")
/// - If not set, defaults to "roleplay_voice_client=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roleplay_voice_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn print_updates(mut updates: mpsc::UnboundedReceiver<SessionUpdate>) {
    while let Some(update) = updates.recv().await {
        match update {
            SessionUpdate::Status(status) => println!("[status] {}", status.as_str()),
            SessionUpdate::Transcript(entry) => {
                let marker = if entry.is_final { "" } else { " …" };
                println!("[{}#{}] {}{}", entry.speaker.as_str(), entry.id, entry.text, marker);
            }
            SessionUpdate::TranscriptReset(entries) => {
                println!("[transcript] {} entries", entries.len());
                for entry in entries {
                    println!("  [{}#{}] {}", entry.speaker.as_str(), entry.id, entry.text);
                }
            }
            SessionUpdate::Error { message, fatal } => {
                let label = if fatal { "fatal" } else { "error" };
                println!("[{}] {}", label, message);
            }
            SessionUpdate::Ended => println!("[session ended]"),
        }
    }
}

fn spawn_stdin_commands(commands: mpsc::UnboundedSender<UserCommand>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(command) = UserCommand::parse_line(&line) {
                        if commands.send(command).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
}

fn spawn_ctrl_c(commands: mpsc::UnboundedSender<UserCommand>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            let _ = commands.send(UserCommand::End);
        }
    });
}

fn spawn_silent_capture(capture: mpsc::UnboundedSender<Vec<f32>>, block_size: usize, sample_rate: u32) {
    let period = Duration::from_secs_f64(block_size as f64 / sample_rate as f64);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if capture.send(vec![0.0; block_size]).is_err() {
                break;
            }
        }
    });
}
