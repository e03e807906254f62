//! Configuration types for a room session

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for a [`RoomSession`](crate::RoomSession)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// WebSocket relay URL (ws:// or wss://)
    pub signaling_url: String,

    /// Room identifier, the shared namespace announced on join
    pub room: String,

    /// Local peer ID (auto-generated if None)
    pub peer_id: Option<String>,

    /// ICE servers handed to the negotiation capability (at least one required)
    pub ice_servers: Vec<IceServerConfig>,

    /// Grace delay in milliseconds between sending `leave` and closing the
    /// relay socket on teardown (default: 100ms)
    ///
    /// Best effort only: gives the leave message a chance to flush, no
    /// acknowledgement is awaited.
    pub close_grace_ms: u64,
}

/// STUN/TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    /// Server URL (stun:, turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Create a credential-less STUN server entry
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    /// Create a TURN server entry with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080".to_string(),
            room: "default".to_string(),
            peer_id: None,
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            close_grace_ms: 100,
        }
    }
}

impl SessionConfig {
    /// Grace delay before the relay socket is closed on teardown
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a valid WebSocket URL
    /// - `room` is empty
    /// - `peer_id` is present but empty
    /// - `ice_servers` is empty
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if self.room.is_empty() {
            return Err(Error::InvalidConfig(
                "room identifier must not be empty".to_string(),
            ));
        }

        if let Some(id) = &self.peer_id {
            if id.is_empty() {
                return Err(Error::InvalidConfig(
                    "peer_id must not be empty when supplied".to_string(),
                ));
            }
        }

        if self.ice_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one ICE server is required".to_string(),
            ));
        }

        Ok(())
    }
}
