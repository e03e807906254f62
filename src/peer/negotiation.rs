//! Negotiation capability boundary
//!
//! The actual offer/answer/candidate engine (a WebRTC-equivalent) lives
//! outside this crate. The dispatcher drives it through [`Negotiator`] and
//! consumes its callbacks as [`NegotiationEvent`]s delivered on the session's
//! single event stream. Descriptions and candidates are opaque payloads; the
//! core never inspects SDP semantics or the ICE algorithm.

use crate::config::IceServerConfig;
use crate::media::RemoteMediaHandle;
use crate::signaling::CandidateInit;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callbacks emitted by the negotiation capability
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    /// The capability gathered a local candidate to relay to the peer
    LocalCandidate {
        /// Peer the candidate belongs to
        peer_id: String,
        /// Candidate payload to forward over the relay
        candidate: CandidateInit,
    },

    /// Remote media attached; the peer link is live
    MediaAttached {
        /// Peer whose media attached
        peer_id: String,
        /// Opaque inbound media reference
        handle: RemoteMediaHandle,
    },

    /// Remote media detached; the peer session is over
    MediaDetached {
        /// Peer whose media detached
        peer_id: String,
    },
}

/// One negotiation engine instance, owned by a single peer session
///
/// Operations may suspend; their completions are delivered back into the
/// session's single-threaded event stream, so implementations need no
/// internal ordering guarantees beyond their own correctness.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Produce a local offer description
    async fn create_offer(&self) -> Result<Value>;

    /// Apply the remote offer and produce a local answer description
    async fn create_answer(&self, remote_description: Value) -> Result<Value>;

    /// Commit a locally produced description
    async fn set_local_description(&self, description: Value) -> Result<()>;

    /// Apply a description received from the remote peer
    async fn set_remote_description(&self, description: Value) -> Result<()>;

    /// Feed a relayed remote candidate into the engine
    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<()>;

    /// Release the engine; called exactly once when the session closes
    async fn close(&self) -> Result<()>;
}

/// Factory creating one [`Negotiator`] per remote peer
pub trait NegotiatorFactory: Send + Sync {
    /// Create an engine for `peer_id`
    ///
    /// The engine reports its callbacks for this peer through `events`.
    fn create(
        &self,
        peer_id: &str,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<NegotiationEvent>,
    ) -> Result<Arc<dyn Negotiator>>;
}
