//! Multi-party room signaling for WebRTC-style peer negotiation
//!
//! This crate coordinates the signaling side of a many-to-many real-time
//! session: it joins a named room through a WebSocket relay, tracks the
//! membership of remote peers, and drives each peer's offer/answer/candidate
//! exchange through a pluggable negotiation capability. The actual media
//! engine (SDP handling, ICE, transports) stays outside, behind the
//! [`Negotiator`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       RoomSession                        │
//! │   connect / teardown / members / peers / add_listener    │
//! └─────────────┬───────────────────────────────┬───────────┘
//!               │                               │
//!       ┌───────▼────────┐              ┌───────▼────────┐
//!       │  Relay channel │   events     │   Dispatcher   │
//!       │  (WebSocket)   ├─────────────►│  state machine │
//!       └────────────────┘              └───────┬────────┘
//!                                               │ one per peer
//!                                       ┌───────▼────────┐
//!                                       │  PeerSession   │
//!                                       │  + Negotiator  │
//!                                       └────────────────┘
//! ```
//!
//! A single dispatcher task consumes relay messages, negotiation callbacks
//! and completions of spawned negotiation work from one merged stream, so all
//! peer state is mutated in one place. Lifecycle is observable through the
//! event bus (`start`, `end`, `error`, `signalMessage`, `connected`,
//! `foundRemote`).
//!
//! # Example
//!
//! ```no_run
//! use roomlink::{EventKind, RoomSession, SessionConfig};
//! # use roomlink::peer::NegotiatorFactory;
//! # use std::sync::Arc;
//!
//! # async fn run(factory: Arc<dyn NegotiatorFactory>) -> roomlink::Result<()> {
//! let config = SessionConfig {
//!     signaling_url: "wss://relay.example.com/ws".to_string(),
//!     room: "standup".to_string(),
//!     ..Default::default()
//! };
//!
//! let session = RoomSession::connect(config, factory, None).await?;
//! session.add_listener(EventKind::Connected, |event| {
//!     println!("peer connected: {:?}", event);
//! });
//! // ...
//! session.teardown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod media;
pub mod peer;
pub mod signaling;

mod dispatch;

pub use config::{IceServerConfig, SessionConfig};
pub use controller::RoomSession;
pub use error::{Error, Result};
pub use events::{EventKind, RoomEvent};
pub use media::{DeviceAvailability, DeviceProbe, LocalMedia, MediaTrack, RemoteMediaHandle};
pub use peer::{NegotiationPhase, NegotiationRole, Negotiator, NegotiatorFactory, PeerSnapshot};
pub use signaling::{CandidateInit, SignalKind};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
