//! Relay channel adapter over WebSocket
//!
//! Owns the single duplex connection to the signaling relay. Outbound
//! envelopes are serialized and sent only while the socket is open; otherwise
//! they are dropped silently (signaling is best-effort and superseded by later
//! messages, so there is no queueing or retry). Inbound frames are decoded and
//! surfaced as [`ChannelEvent`]s: exactly one `Opened`, then messages, then
//! exactly one terminal `Closed` or `Error`.

use super::protocol::{self, InboundEnvelope, OutboundEnvelope};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Events surfaced by the relay channel
#[derive(Debug)]
pub enum ChannelEvent {
    /// The relay connection is established (emitted exactly once)
    Opened,

    /// A well-formed signaling envelope arrived
    Message {
        /// Decoded envelope
        envelope: InboundEnvelope,
        /// Raw JSON value, kept for observability
        raw: Value,
    },

    /// An inbound frame failed to parse (recoverable, the frame is dropped)
    Malformed {
        /// Parse failure cause
        error: Error,
    },

    /// The relay connection closed normally (terminal)
    Closed,

    /// The relay connection failed (terminal)
    Error {
        /// Transport failure cause
        error: Error,
    },
}

/// Handle for transmitting envelopes over the relay connection
///
/// Cheap to clone; all clones share the open/closed state of the underlying
/// socket.
#[derive(Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl RelaySender {
    /// Send an envelope if the connection is open, silently drop it otherwise
    pub fn send(&self, envelope: &OutboundEnvelope) {
        if !self.is_open() {
            debug!(kind = envelope.kind().as_str(), "Relay closed, dropping outbound envelope");
            return;
        }

        match envelope.to_json() {
            Ok(json) => {
                debug!(kind = envelope.kind().as_str(), "Sending signaling envelope");
                // A send error means the socket task is gone; the envelope is
                // dropped, matching the closed-connection behavior.
                let _ = self.tx.send(Message::Text(json));
            }
            Err(e) => warn!("Failed to encode outbound envelope: {}", e),
        }
    }

    /// Whether the relay connection is currently open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the relay connection
    ///
    /// Marks the channel closed and queues a close frame behind any envelopes
    /// already in flight.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("Closing relay connection");
            let _ = self.tx.send(Message::Close(None));
        }
    }

    /// Build a sender backed by a plain channel, for tests that inspect
    /// outbound frames without a socket
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                open: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }
}

/// Connect to the signaling relay
///
/// Returns the outbound sender and the inbound event stream. Background tasks
/// own the two halves of the socket; they terminate when the connection ends
/// or every [`RelaySender`] clone is dropped.
pub async fn connect(url: &str) -> Result<(RelaySender, mpsc::UnboundedReceiver<ChannelEvent>)> {
    info!("Connecting to signaling relay: {}", url);

    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| Error::TransportFailure(format!("Failed to connect to relay: {}", e)))?;

    info!("Connected to signaling relay");

    let (write, read) = ws_stream.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    let _ = event_tx.send(ChannelEvent::Opened);

    tokio::spawn(sender_task(write, rx));
    tokio::spawn(receiver_task(read, event_tx, open.clone()));

    Ok((RelaySender { tx, open }, event_rx))
}

/// Sender task: forwards queued frames to the WebSocket
async fn sender_task(
    mut write: futures::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            error!("Failed to send relay frame: {}", e);
            break;
        }
        if is_close {
            break;
        }
    }

    debug!("Relay sender task terminated");
}

/// Receiver task: decodes inbound frames into channel events
///
/// Emits exactly one terminal `Closed` or `Error` event before returning.
async fn receiver_task(
    mut read: futures::stream::SplitStream<WsStream>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
) {
    let terminal = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let event = match protocol::decode(&text) {
                    Ok((envelope, raw)) => ChannelEvent::Message { envelope, raw },
                    Err(error) => {
                        warn!("Dropping malformed relay message: {}", error);
                        ChannelEvent::Malformed { error }
                    }
                };
                if events.send(event).is_err() {
                    break ChannelEvent::Closed;
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("Relay connection closed");
                break ChannelEvent::Closed;
            }
            Some(Err(e)) => {
                error!("Relay connection error: {}", e);
                break ChannelEvent::Error {
                    error: Error::TransportFailure(e.to_string()),
                };
            }
            Some(Ok(_)) => {} // ping/pong/binary frames are not signaling
        }
    };

    open.store(false, Ordering::SeqCst);
    let _ = events.send(terminal);

    debug!("Relay receiver task terminated");
}
