//! Wire envelope types for the relay protocol
//!
//! Outbound messages are wrapped as `{"fn": <kind>, "data": <payload>}`;
//! inbound messages arrive flattened as `{"fn": <kind>, "id": <sender>,
//! "payload": <kind-specific>}`. Session descriptions are carried as opaque
//! JSON values; the core never inspects them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Signaling message kinds understood by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    /// A peer announced itself to the room
    Join,
    /// A peer left the room
    Leave,
    /// Session description offer for a target peer
    Offer,
    /// Session description answer for a target peer
    Answer,
    /// Network candidate for a target peer
    IceCandidate,
}

impl SignalKind {
    /// Parse a wire kind tag, `None` for kinds outside the vocabulary
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "join" => Some(SignalKind::Join),
            "leave" => Some(SignalKind::Leave),
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "iceCandidate" => Some(SignalKind::IceCandidate),
            _ => None,
        }
    }

    /// The wire tag for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Join => "join",
            SignalKind::Leave => "leave",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "iceCandidate",
        }
    }
}

/// ICE candidate payload as exchanged on the wire
///
/// All fields are optional: a candidate message with an empty or absent
/// `candidate` string marks end-of-candidates and is never forwarded to the
/// negotiation capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateInit {
    /// Payload type tag (always "candidate" on the wire)
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// SDP media line index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<u16>,

    /// SDP media stream identification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The candidate string itself
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

impl CandidateInit {
    /// Build a candidate payload for the wire
    pub fn new(label: Option<u16>, id: Option<String>, candidate: impl Into<String>) -> Self {
        Self {
            kind: Some("candidate".to_string()),
            label,
            id,
            candidate: Some(candidate.into()),
        }
    }

    /// Whether this payload carries an actual candidate string
    pub fn is_empty(&self) -> bool {
        self.candidate.as_deref().map_or(true, str::is_empty)
    }
}

/// Outbound signaling envelope, serialized as `{"fn": .., "data": ..}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "fn", content = "data", rename_all = "camelCase")]
pub enum OutboundEnvelope {
    /// Announce the local peer to the room
    Join {
        /// Local peer identity
        id: String,
        /// Room identifier
        room: String,
    },

    /// Announce departure (no payload)
    Leave,

    /// Session description offer for a remote peer
    Offer {
        /// Remote peer the offer is addressed to
        target: String,
        /// Opaque local description
        payload: Value,
    },

    /// Session description answer for a remote peer
    Answer {
        /// Remote peer the answer is addressed to
        target: String,
        /// Opaque local description
        payload: Value,
    },

    /// Network candidate for a remote peer
    IceCandidate {
        /// Remote peer the candidate is addressed to
        target: String,
        /// Candidate payload
        payload: CandidateInit,
    },
}

impl OutboundEnvelope {
    /// Serialize to the wire format
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize envelope: {}", e))
        })
    }

    /// The message kind of this envelope
    pub fn kind(&self) -> SignalKind {
        match self {
            OutboundEnvelope::Join { .. } => SignalKind::Join,
            OutboundEnvelope::Leave => SignalKind::Leave,
            OutboundEnvelope::Offer { .. } => SignalKind::Offer,
            OutboundEnvelope::Answer { .. } => SignalKind::Answer,
            OutboundEnvelope::IceCandidate { .. } => SignalKind::IceCandidate,
        }
    }
}

/// Decoded inbound signaling envelope
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    /// Message kind, `None` when the tag is outside the known vocabulary
    /// (such messages are ignored, not errors)
    pub kind: Option<SignalKind>,

    /// Sender peer identity
    pub sender: Option<String>,

    /// Kind-specific payload, opaque to the dispatcher for descriptions
    pub payload: Option<Value>,
}

impl InboundEnvelope {
    /// Decode an inbound envelope from a parsed JSON value
    ///
    /// A missing or non-string `fn` tag is a malformed message; an unknown
    /// tag value decodes with `kind: None`.
    pub fn from_value(value: &Value) -> crate::Result<Self> {
        let tag = value
            .get("fn")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                crate::Error::MalformedMessage("missing or non-string \"fn\" tag".to_string())
            })?;

        Ok(Self {
            kind: SignalKind::parse(tag),
            sender: value.get("id").and_then(Value::as_str).map(str::to_string),
            payload: value.get("payload").cloned(),
        })
    }
}

/// Decode raw relay text into an envelope plus the raw JSON value
///
/// The raw value is kept for the `signalMessage` observability event.
pub fn decode(text: &str) -> crate::Result<(InboundEnvelope, Value)> {
    let raw: Value = serde_json::from_str(text).map_err(|e| {
        crate::Error::MalformedMessage(format!("Parsing relay message: {}", e))
    })?;
    let envelope = InboundEnvelope::from_value(&raw)?;
    Ok((envelope, raw))
}
