//! Per-peer session state

use super::negotiation::Negotiator;
use crate::media::RemoteMediaHandle;
use std::sync::Arc;
use tracing::debug;

/// Which side initiated the exchange with a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// This side initiated on observing the peer's join
    Offerer,
    /// This side responded to a received offer
    Answerer,
}

/// Negotiation phase of a peer session
///
/// Offerer path: `Created → OfferSent → AnswerReceived → Connected`.
/// Answerer path: `Created → OfferReceived → AnswerSent → Connected`.
/// Either path may reach `Closed` from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Session created, no description exchanged yet
    Created,
    /// Local offer sent to the peer
    OfferSent,
    /// Remote offer received, local answer pending
    OfferReceived,
    /// Local answer sent to the peer
    AnswerSent,
    /// Remote answer applied, waiting for media
    AnswerReceived,
    /// Remote media attached, the peer link is live
    Connected,
    /// Terminal; no further messages are processed for this peer
    Closed,
}

impl NegotiationPhase {
    /// Whether this phase is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationPhase::Closed)
    }
}

/// One remote participant of the room
///
/// Owns the negotiation handle for that peer; the handle is created exactly
/// once with the session and released exactly once when the session closes.
pub struct PeerSession {
    /// Remote peer identity, assigned by the relay layer
    peer_id: String,

    /// Negotiation role toward this peer
    role: NegotiationRole,

    /// Current negotiation phase
    phase: NegotiationPhase,

    /// Negotiation engine for this peer
    negotiator: Arc<dyn Negotiator>,

    /// Inbound media reference, set once connected
    remote_media: Option<RemoteMediaHandle>,
}

impl PeerSession {
    /// Create a session in the `Created` phase
    pub fn new(peer_id: String, role: NegotiationRole, negotiator: Arc<dyn Negotiator>) -> Self {
        debug!(peer_id = %peer_id, ?role, "Creating peer session");

        Self {
            peer_id,
            role,
            phase: NegotiationPhase::Created,
            negotiator,
            remote_media: None,
        }
    }

    /// The remote peer's identity
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Negotiation role toward this peer
    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    /// Current negotiation phase
    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Advance the phase; transitions out of `Closed` are ignored
    pub fn set_phase(&mut self, next: NegotiationPhase) {
        if self.phase.is_terminal() {
            debug!(peer_id = %self.peer_id, ?next, "Ignoring phase change on closed session");
            return;
        }

        if self.phase != next {
            debug!(
                peer_id = %self.peer_id,
                "Peer phase transition: {:?} -> {:?}",
                self.phase,
                next
            );
            self.phase = next;
        }
    }

    /// A clone of the negotiation handle, for spawned per-peer operations
    pub fn negotiator(&self) -> Arc<dyn Negotiator> {
        self.negotiator.clone()
    }

    /// Inbound media reference, if connected
    pub fn remote_media(&self) -> Option<&RemoteMediaHandle> {
        self.remote_media.as_ref()
    }

    /// Record the inbound media reference
    pub fn set_remote_media(&mut self, handle: RemoteMediaHandle) {
        self.remote_media = Some(handle);
    }

    /// Drop the inbound media reference
    pub fn clear_remote_media(&mut self) {
        self.remote_media = None;
    }

    /// Immutable view of this session for embedders
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.peer_id.clone(),
            role: self.role,
            phase: self.phase,
        }
    }
}

/// Point-in-time view of a peer session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    /// Remote peer identity
    pub peer_id: String,

    /// Negotiation role toward this peer
    pub role: NegotiationRole,

    /// Negotiation phase at snapshot time
    pub phase: NegotiationPhase,
}
