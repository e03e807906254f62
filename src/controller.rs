//! Room session controller
//!
//! [`RoomSession`] is the embedder-facing surface: it connects to the relay,
//! wires the dispatcher's event stream, and exposes membership snapshots,
//! listener registration and teardown. All signaling state lives in the
//! dispatcher task; the controller only holds shared read handles.

use crate::config::SessionConfig;
use crate::dispatch::{DispatchEvent, DispatchSenders, Dispatcher, Registry};
use crate::events::{EventBus, EventKind, RoomEvent};
use crate::media::LocalMedia;
use crate::peer::{NegotiatorFactory, PeerSnapshot};
use crate::signaling::{channel, OutboundEnvelope, RelaySender};
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// A live multi-party room session
///
/// Created with [`RoomSession::connect`]; ended with [`RoomSession::teardown`].
/// Cheap accessors snapshot the peer registry without blocking the dispatcher.
pub struct RoomSession {
    local_id: String,
    config: SessionConfig,
    bus: Arc<EventBus>,
    registry: Registry,
    relay: RelaySender,
    dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
    local_media: Option<Arc<dyn LocalMedia>>,
    destroyed: Arc<AtomicBool>,
}

impl RoomSession {
    /// Connect to the signaling relay and join the configured room
    ///
    /// The negotiation capability is supplied as a factory creating one engine
    /// per remote peer. `local_media`, when present, is stopped on teardown.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the relay
    /// connection cannot be established.
    pub async fn connect(
        config: SessionConfig,
        factory: Arc<dyn NegotiatorFactory>,
        local_media: Option<Arc<dyn LocalMedia>>,
    ) -> Result<Self> {
        config.validate()?;

        let local_id = config
            .peer_id
            .clone()
            .unwrap_or_else(generate_peer_id);

        info!(room = %config.room, id = %local_id, "Starting room session");

        let (relay, mut channel_rx) = channel::connect(&config.signaling_url).await?;

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (neg_tx, mut neg_rx) = mpsc::unbounded_channel();

        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let bus = Arc::new(EventBus::new());

        // Merge relay events into the dispatcher stream.
        let tx = dispatch_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = channel_rx.recv().await {
                if tx.send(DispatchEvent::Relay(event)).is_err() {
                    break;
                }
            }
        });

        // Merge negotiation-capability callbacks into the same stream.
        let tx = dispatch_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = neg_rx.recv().await {
                if tx.send(DispatchEvent::Negotiation(event)).is_err() {
                    break;
                }
            }
        });

        // Drain the dispatcher's outbound queue toward the relay.
        let relay_out = relay.clone();
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                relay_out.send(&envelope);
            }
        });

        let dispatcher = Dispatcher::new(
            local_id.clone(),
            config.room.clone(),
            config.ice_servers.clone(),
            factory,
            bus.clone(),
            registry.clone(),
            DispatchSenders {
                outbound: out_tx,
                events: dispatch_tx.clone(),
                negotiation: neg_tx,
            },
        );
        tokio::spawn(dispatcher.run(dispatch_rx));

        Ok(Self {
            local_id,
            config,
            bus,
            registry,
            relay,
            dispatch_tx,
            local_media,
            destroyed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The local peer's identity in the room
    pub fn peer_id(&self) -> &str {
        &self.local_id
    }

    /// The room this session joined
    pub fn room(&self) -> &str {
        &self.config.room
    }

    /// Whether teardown has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Register a listener for a session event kind
    pub fn add_listener<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.bus.add_listener(kind, listener);
    }

    /// Sorted ids of the currently known remote peers
    pub async fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.registry.read().await.keys().cloned().collect();
        members.sort();
        members
    }

    /// Point-in-time snapshots of every peer session, sorted by peer id
    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .registry
            .read()
            .await
            .values()
            .map(|session| session.snapshot())
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Snapshot of a single peer session, if the peer is known
    pub async fn peer(&self, peer_id: &str) -> Option<PeerSnapshot> {
        self.registry
            .read()
            .await
            .get(peer_id)
            .map(|session| session.snapshot())
    }

    /// End the session
    ///
    /// Stops local media, announces `leave`, closes every peer session,
    /// drops all listeners and, after a short grace delay that lets the leave
    /// message flush, closes the relay socket. Safe to call more than once;
    /// only the first call has any effect.
    pub async fn teardown(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            debug!("Session already destroyed, ignoring teardown");
            return;
        }

        info!(room = %self.config.room, "Tearing down room session");

        if let Some(media) = &self.local_media {
            for track in media.tracks() {
                debug!(kind = track.kind(), "Stopping local media track");
                track.stop();
            }
        }

        self.relay.send(&OutboundEnvelope::Leave);
        let _ = self.dispatch_tx.send(DispatchEvent::Teardown);
        self.bus.clear();

        // Best effort: give the leave frame a chance to flush before the
        // socket goes away. No acknowledgement exists to wait on.
        tokio::time::sleep(self.config.close_grace()).await;
        self.relay.close();
    }
}

/// Generate a relay identity for a session that did not configure one
fn generate_peer_id() -> String {
    format!("peer-{}", uuid::Uuid::new_v4())
}
