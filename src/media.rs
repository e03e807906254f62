//! Media boundaries: local capture handle and device availability
//!
//! The crate never touches capture or playback itself. The embedder supplies
//! a [`LocalMedia`] handle whose tracks are stopped on teardown, and may query
//! device availability lazily through a [`DeviceProbe`].

use async_trait::async_trait;
use std::sync::Arc;

/// A single local media track that can be stopped
pub trait MediaTrack: Send + Sync {
    /// Track kind, e.g. "audio" or "video"
    fn kind(&self) -> &str;

    /// Stop the track and release its device
    fn stop(&self);
}

/// Local media-capture handle supplied by the embedder
pub trait LocalMedia: Send + Sync {
    /// Enumerate the capture tracks backing this handle
    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>>;
}

/// Opaque reference to a remote peer's inbound media output
///
/// Handed over by the negotiation capability once media attaches; the core
/// only stores and surfaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMediaHandle {
    /// Capability-assigned stream identifier
    pub id: String,
}

impl RemoteMediaHandle {
    /// Wrap a capability-assigned stream identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Availability of a capture device class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// A device of this class is present
    Available,
    /// Enumeration ran and found no device of this class
    Unavailable,
    /// The platform offered no way to tell
    Unknown,
}

/// Camera and microphone availability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAvailability {
    /// Camera availability
    pub cam: Availability,
    /// Microphone availability
    pub mic: Availability,
}

impl DeviceAvailability {
    /// Both classes assumed present (platform offers no device query at all)
    pub fn assume_available() -> Self {
        Self {
            cam: Availability::Available,
            mic: Availability::Available,
        }
    }

    /// Both classes unknown (enumeration exists but has not resolved)
    pub fn unknown() -> Self {
        Self {
            cam: Availability::Unknown,
            mic: Availability::Unknown,
        }
    }
}

/// Lazy device-availability query
///
/// Invoked by the embedder when it needs the answer, never resolved eagerly
/// into process-wide state. Implementations that cannot enumerate should
/// return [`DeviceAvailability::unknown`]; platforms with no query capability
/// at all should return [`DeviceAvailability::assume_available`].
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Query current camera/microphone availability
    async fn query(&self) -> DeviceAvailability;
}
