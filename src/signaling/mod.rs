//! Relay channel and wire protocol
//!
//! The relay is the out-of-band channel used to exchange negotiation payloads
//! before any direct peer link exists.

pub mod channel;
pub mod protocol;

pub use channel::{ChannelEvent, RelaySender};
pub use protocol::{CandidateInit, InboundEnvelope, OutboundEnvelope, SignalKind};
