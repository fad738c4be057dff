//! # Session Transport
//!
//! Owns the single WebSocket channel to the roleplay backend.
//!
//! ## Channel Protocol:
//! 1. **Connection**: `{server.url}/{persona_id}[?product_id=...]`
//! 2. **Outbound**: JSON text frames `{"type": ..., "data": ...}` built from
//!    [`OutboundEnvelope`]
//! 3. **Inbound**: JSON text frames parsed into [`InboundEnvelope`] and handed
//!    to the session as [`TransportEvent`]s, in delivery order
//! 4. **Teardown**: `end_session` sends a best-effort termination envelope and
//!    then closes; `disconnect` just closes
//!
//! ## Task Layout:
//! - **writer task**: drains an unbounded mpsc queue into the socket sink
//! - **reader task**: parses frames; malformed or unknown envelopes are logged
//!   and dropped, never surfaced as failures
//! - **ping task**: optional `ping` envelope every `ping_interval_secs`
//!
//! ## Key Rust Concepts:
//! - **Split streams**: `futures_util::StreamExt::split` gives independent read
//!   and write halves, each owned by its own task
//! - **Atomic open flag**: whoever flips `open` from true to false owns the
//!   closure; a local teardown flips it first so no "closed" event is emitted

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{parse_inbound, InboundEnvelope, OutboundEnvelope};

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

/// What the channel reports to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A well-formed inbound envelope of a known type
    Envelope(InboundEnvelope),
    /// The server closed the channel without being asked to
    Closed,
    /// The channel failed while open
    Failed(ClientError),
}

/// Outbound half of the channel as the session sees it.
///
/// Sends never fail from the caller's point of view: when the channel is not
/// open they are dropped with a warning.
pub trait Transport {
    fn is_open(&self) -> bool;

    fn send(&mut self, envelope: OutboundEnvelope);

    /// Best-effort `end_session`, then unconditional teardown.
    fn end_session(&mut self);

    /// Teardown without sending anything.
    fn disconnect(&mut self);
}

/// Build the channel URL for a persona and optional product.
pub fn session_url(base: &str, persona_id: &str, product_id: Option<&str>) -> ClientResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| ClientError::Setup(format!("Invalid server URL '{}': {}", base, e)))?;

    url.path_segments_mut()
        .map_err(|_| ClientError::Setup(format!("Server URL '{}' cannot take a path", base)))?
        .pop_if_empty()
        .push(persona_id);

    if let Some(product_id) = product_id.filter(|p| !p.is_empty()) {
        url.query_pairs_mut().append_pair("product_id", product_id);
    }

    Ok(url)
}

pub struct WsTransport {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
    pinger: Option<JoinHandle<()>>,
}

impl WsTransport {
    /// Open the channel for the configured persona.
    ///
    /// ## Returns:
    /// - **Ok((transport, events))**: the channel is open; inbound traffic arrives on `events`
    /// - **Err(ClientError::Transport)**: the server refused or the handshake failed
    pub async fn connect(
        config: &ClientConfig,
    ) -> ClientResult<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let url = session_url(
            &config.server.url,
            &config.session.persona_id,
            config.session.product_id.as_deref(),
        )?;

        info!(url = %url, "Connecting session transport");
        let (socket, _response) = connect_async(url.as_str()).await.map_err(|e| {
            error!(url = %url, error = %e, "Session transport failed to open");
            ClientError::from(e)
        })?;
        info!(url = %url, "Session transport open");

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Message::Close(_) = message {
                    break;
                }
                if let Err(e) = sink.send(message).await {
                    warn!(error = %e, "Failed to write to session transport");
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("Session transport writer stopped");
        });

        let reader_open = open.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match parse_inbound(&text) {
                        Ok(InboundEnvelope::Unknown(kind)) => {
                            warn!(kind = %kind, "Ignoring envelope of unknown type");
                        }
                        Ok(envelope) => {
                            if events_tx.send(TransportEvent::Envelope(envelope)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed envelope");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "Server closed session transport");
                        break;
                    }
                    Ok(Message::Binary(data)) => {
                        debug!(bytes = data.len(), "Ignoring binary frame");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if reader_open.swap(false, Ordering::SeqCst) {
                            error!(error = %e, "Session transport failed");
                            let _ = events_tx.send(TransportEvent::Failed(e.into()));
                        }
                        return;
                    }
                }
            }
            if reader_open.swap(false, Ordering::SeqCst) {
                warn!("Session transport closed unexpectedly");
                let _ = events_tx.send(TransportEvent::Closed);
            }
        });

        let pinger = match config.transport.ping_interval_secs {
            0 => None,
            secs => Some(spawn_pinger(outbound_tx.clone(), open.clone(), secs)),
        };

        let transport = Self {
            outbound: Some(outbound_tx),
            open,
            reader,
            writer: Some(writer),
            pinger,
        };
        Ok((transport, events_rx))
    }

    fn enqueue(&self, message: Message) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    fn teardown(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(pinger) = self.pinger.take() {
            pinger.abort();
        }
        self.reader.abort();
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Wait for queued frames to be flushed after teardown.
    pub async fn closed(&mut self) {
        self.teardown();
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }
}

fn spawn_pinger(
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        // The first tick fires immediately; the channel is fresh, skip it.
        interval.tick().await;
        loop {
            interval.tick().await;
            if !open.load(Ordering::SeqCst) {
                break;
            }
            let ping = OutboundEnvelope::Ping {
                timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
            };
            let Ok(json) = ping.to_json() else { break };
            if outbound.send(Message::Text(json)).is_err() {
                break;
            }
        }
    })
}

impl Transport for WsTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.outbound.is_some()
    }

    fn send(&mut self, envelope: OutboundEnvelope) {
        if !self.is_open() {
            warn!(kind = envelope.kind(), "Dropping send on closed session transport");
            return;
        }
        match envelope.to_json() {
            Ok(json) => {
                if !self.enqueue(Message::Text(json)) {
                    warn!(kind = envelope.kind(), "Session transport writer is gone");
                }
            }
            Err(e) => warn!(kind = envelope.kind(), error = %e, "Failed to encode envelope"),
        }
    }

    fn end_session(&mut self) {
        if self.is_open() {
            info!("Ending session");
            self.send(OutboundEnvelope::EndSession);
        }
        self.teardown();
    }

    fn disconnect(&mut self) {
        if self.outbound.is_some() {
            info!("Disconnecting session transport");
        }
        self.teardown();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}
