//! Peer sessions and the negotiation capability boundary
//!
//! One [`PeerSession`] exists per remote participant; it owns that peer's
//! negotiation handle and tracks its role and phase.

pub mod negotiation;
pub mod session;

pub use negotiation::{NegotiationEvent, Negotiator, NegotiatorFactory};
pub use session::{NegotiationPhase, NegotiationRole, PeerSession, PeerSnapshot};
