//! Error types for room signaling

/// Result type alias using the crate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating a room session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Inbound signaling envelope could not be parsed
    #[error("Malformed signaling message: {0}")]
    MalformedMessage(String),

    /// The negotiation capability rejected a description or candidate operation
    #[error("Negotiation failure: {0}")]
    NegotiationFailure(String),

    /// Relay connection error (the session is considered ended)
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Serialization/deserialization error on the wire envelope
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Any other error, typically from a negotiation-capability impl
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error leaves the session usable
    ///
    /// Recoverable faults are surfaced on the event bus and processing
    /// continues; a transport failure ends the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage(_)
                | Error::NegotiationFailure(_)
                | Error::SerializationError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}
