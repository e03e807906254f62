//! Signaling dispatcher: the per-session state machine
//!
//! One dispatcher task owns all signaling state for a session. It consumes a
//! single merged stream of relay events, negotiation-capability callbacks and
//! completions of spawned negotiation work, so peer-session mutation happens
//! on one logical thread and needs no locking discipline beyond the registry
//! being single-writer. Negotiation operations for different peers run
//! concurrently as spawned tasks; their completions re-enter the stream keyed
//! by peer id and are applied only if the peer is still in the registry, which
//! makes completions arriving after a `leave` harmless no-ops.

use crate::config::IceServerConfig;
use crate::events::{EventBus, RoomEvent};
use crate::peer::{
    NegotiationEvent, NegotiationPhase, NegotiationRole, NegotiatorFactory, PeerSession,
};
use crate::signaling::{CandidateInit, ChannelEvent, InboundEnvelope, OutboundEnvelope, SignalKind};
use crate::Error;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Membership registry: peer id to live peer session
///
/// Shared for read-only snapshots; mutated only by the dispatcher task.
pub(crate) type Registry = Arc<RwLock<HashMap<String, PeerSession>>>;

/// Everything the dispatcher reacts to, merged into one stream
#[derive(Debug)]
pub(crate) enum DispatchEvent {
    /// Relay channel lifecycle and inbound messages
    Relay(ChannelEvent),
    /// Callback from a peer's negotiation capability
    Negotiation(NegotiationEvent),
    /// Completion of a spawned negotiation operation
    Outcome(NegotiationOutcome),
    /// Session teardown; the dispatcher closes every peer and stops
    Teardown,
}

/// Completion of an asynchronous negotiation operation, keyed by peer id
#[derive(Debug)]
pub(crate) enum NegotiationOutcome {
    /// Local offer created and committed, ready to relay
    OfferReady {
        /// Peer the offer is for
        peer_id: String,
        /// The local description
        description: Value,
    },
    /// Local answer created and committed, ready to relay
    AnswerReady {
        /// Peer the answer is for
        peer_id: String,
        /// The local description
        description: Value,
    },
    /// Remote answer applied to the peer's negotiation handle
    AnswerApplied {
        /// Peer whose answer was applied
        peer_id: String,
    },
    /// The negotiation capability rejected an operation
    Failed {
        /// Peer the operation was for
        peer_id: String,
        /// Rejection cause
        error: Error,
    },
}

/// Channel endpoints the dispatcher writes to
pub(crate) struct DispatchSenders {
    /// Outbound envelope queue, drained toward the relay
    pub(crate) outbound: mpsc::UnboundedSender<OutboundEnvelope>,
    /// The dispatcher's own event stream, for spawned completions
    pub(crate) events: mpsc::UnboundedSender<DispatchEvent>,
    /// Handed to the negotiator factory for capability callbacks
    pub(crate) negotiation: mpsc::UnboundedSender<NegotiationEvent>,
}

/// The signaling state machine for one room session
pub(crate) struct Dispatcher {
    local_id: String,
    room: String,
    ice_servers: Vec<IceServerConfig>,
    factory: Arc<dyn NegotiatorFactory>,
    bus: Arc<EventBus>,
    registry: Registry,
    senders: DispatchSenders,
}

impl Dispatcher {
    /// Create a dispatcher for a session
    pub(crate) fn new(
        local_id: String,
        room: String,
        ice_servers: Vec<IceServerConfig>,
        factory: Arc<dyn NegotiatorFactory>,
        bus: Arc<EventBus>,
        registry: Registry,
        senders: DispatchSenders,
    ) -> Self {
        Self {
            local_id,
            room,
            ice_servers,
            factory,
            bus,
            registry,
            senders,
        }
    }

    /// Consume the event stream until teardown or every sender is gone
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DispatchEvent>) {
        while let Some(event) = rx.recv().await {
            let teardown = matches!(event, DispatchEvent::Teardown);
            self.handle(event).await;
            if teardown {
                break;
            }
        }

        debug!("Dispatcher terminated");
    }

    /// Process one event
    pub(crate) async fn handle(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Relay(channel_event) => self.handle_relay(channel_event).await,
            DispatchEvent::Negotiation(neg_event) => self.handle_negotiation(neg_event).await,
            DispatchEvent::Outcome(outcome) => self.handle_outcome(outcome).await,
            DispatchEvent::Teardown => self.close_all().await,
        }
    }

    async fn handle_relay(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                info!(room = %self.room, id = %self.local_id, "Relay opened, joining room");
                self.senders.outbound.send_envelope(OutboundEnvelope::Join {
                    id: self.local_id.clone(),
                    room: self.room.clone(),
                });
                self.bus.emit(&RoomEvent::Start);
            }
            ChannelEvent::Message { envelope, raw } => {
                self.handle_signal(envelope).await;
                self.bus.emit(&RoomEvent::SignalMessage { raw });
            }
            ChannelEvent::Malformed { error } => {
                self.bus.emit(&RoomEvent::Error {
                    peer_id: None,
                    error,
                });
            }
            ChannelEvent::Closed => {
                self.bus.emit(&RoomEvent::End { peer_id: None });
            }
            ChannelEvent::Error { error } => {
                self.bus.emit(&RoomEvent::Error {
                    peer_id: None,
                    error,
                });
                self.bus.emit(&RoomEvent::End { peer_id: None });
            }
        }
    }

    /// Route an inbound envelope by kind
    ///
    /// Messages outside the vocabulary, without a sender, or referencing an
    /// unknown peer are ignored silently: the signaling vocabulary has no
    /// error acknowledgement channel.
    async fn handle_signal(&mut self, envelope: InboundEnvelope) {
        let Some(kind) = envelope.kind else {
            debug!("Ignoring signaling message with unknown kind");
            return;
        };
        let Some(sender) = envelope.sender else {
            debug!(kind = kind.as_str(), "Ignoring signaling message without sender id");
            return;
        };

        match kind {
            SignalKind::Join => self.handle_join(sender).await,
            SignalKind::Leave => self.handle_leave(sender).await,
            SignalKind::Offer => self.handle_offer(sender, envelope.payload).await,
            SignalKind::Answer => self.handle_answer(sender, envelope.payload).await,
            SignalKind::IceCandidate => self.handle_candidate(sender, envelope.payload).await,
        }
    }

    /// A peer announced itself: become offerer toward it
    async fn handle_join(&mut self, sender: String) {
        if sender == self.local_id {
            debug!("Ignoring echo of own join");
            return;
        }
        if self.registry.read().await.contains_key(&sender) {
            debug!(peer_id = %sender, "Ignoring join for already known peer");
            return;
        }

        let Some(negotiator) = self.create_session(&sender, NegotiationRole::Offerer).await else {
            return;
        };

        let peer_id = sender;
        let events = self.senders.events.clone();
        tokio::spawn(async move {
            let outcome = match negotiator.create_offer().await {
                Ok(description) => {
                    match negotiator.set_local_description(description.clone()).await {
                        Ok(()) => NegotiationOutcome::OfferReady {
                            peer_id,
                            description,
                        },
                        Err(error) => NegotiationOutcome::Failed { peer_id, error },
                    }
                }
                Err(error) => NegotiationOutcome::Failed { peer_id, error },
            };
            let _ = events.send(DispatchEvent::Outcome(outcome));
        });
    }

    /// A peer left: drop its session and release the negotiation handle
    async fn handle_leave(&mut self, sender: String) {
        let removed = self.registry.write().await.remove(&sender);

        match removed {
            Some(mut session) => {
                info!(peer_id = %sender, "Peer left the room");
                session.set_phase(NegotiationPhase::Closed);
                session.clear_remote_media();
                if let Err(e) = session.negotiator().close().await {
                    warn!("Error closing negotiation handle for {}: {}", sender, e);
                }
            }
            None => debug!(peer_id = %sender, "Ignoring leave for unknown peer"),
        }
    }

    /// A peer offered to us: become answerer toward it
    async fn handle_offer(&mut self, sender: String, payload: Option<Value>) {
        let Some(description) = payload else {
            debug!(peer_id = %sender, "Ignoring offer without description");
            return;
        };

        // Glare: both sides observed each other's join and offered
        // simultaneously. The side with the lexicographically smaller peer id
        // yields, discarding its own offer and answering the remote one; the
        // other side ignores the competing offer. Only an unanswered local
        // offer can be superseded; a duplicate offer against a session that
        // already progressed past OfferSent is dropped like any other stray.
        let glare_yield = {
            let registry = self.registry.read().await;
            match registry.get(&sender) {
                Some(existing)
                    if existing.role() == NegotiationRole::Offerer
                        && matches!(
                            existing.phase(),
                            NegotiationPhase::Created | NegotiationPhase::OfferSent
                        )
                        && self.local_id.as_str() < sender.as_str() =>
                {
                    true
                }
                Some(existing) => {
                    debug!(
                        peer_id = %sender,
                        phase = ?existing.phase(),
                        "Ignoring offer for existing peer session"
                    );
                    return;
                }
                None => false,
            }
        };

        if glare_yield {
            info!(peer_id = %sender, "Simultaneous offers, yielding to the remote offer");
            if let Some(mut stale) = self.registry.write().await.remove(&sender) {
                stale.set_phase(NegotiationPhase::Closed);
                if let Err(e) = stale.negotiator().close().await {
                    warn!("Error closing superseded negotiation handle for {}: {}", sender, e);
                }
            }
        }

        let Some(negotiator) = self.create_session(&sender, NegotiationRole::Answerer).await
        else {
            return;
        };

        let peer_id = sender;
        let events = self.senders.events.clone();
        tokio::spawn(async move {
            let outcome = match negotiator.create_answer(description).await {
                Ok(answer) => match negotiator.set_local_description(answer.clone()).await {
                    Ok(()) => NegotiationOutcome::AnswerReady {
                        peer_id,
                        description: answer,
                    },
                    Err(error) => NegotiationOutcome::Failed { peer_id, error },
                },
                Err(error) => NegotiationOutcome::Failed { peer_id, error },
            };
            let _ = events.send(DispatchEvent::Outcome(outcome));
        });
    }

    /// A peer answered our offer: apply its description
    async fn handle_answer(&mut self, sender: String, payload: Option<Value>) {
        let Some(description) = payload else {
            debug!(peer_id = %sender, "Ignoring answer without description");
            return;
        };

        let negotiator = {
            let registry = self.registry.read().await;
            match registry.get(&sender) {
                Some(session) if session.phase() == NegotiationPhase::OfferSent => {
                    session.negotiator()
                }
                Some(session) => {
                    debug!(
                        peer_id = %sender,
                        phase = ?session.phase(),
                        "Ignoring answer outside OfferSent"
                    );
                    return;
                }
                None => {
                    debug!(peer_id = %sender, "Ignoring answer from unknown peer");
                    return;
                }
            }
        };

        let peer_id = sender;
        let events = self.senders.events.clone();
        tokio::spawn(async move {
            let outcome = match negotiator.set_remote_description(description).await {
                Ok(()) => NegotiationOutcome::AnswerApplied { peer_id },
                Err(error) => NegotiationOutcome::Failed { peer_id, error },
            };
            let _ = events.send(DispatchEvent::Outcome(outcome));
        });
    }

    /// A peer relayed a network candidate: feed it to the negotiation handle
    async fn handle_candidate(&mut self, sender: String, payload: Option<Value>) {
        let Some(payload) = payload else {
            debug!(peer_id = %sender, "Ignoring candidate without payload");
            return;
        };
        let candidate: CandidateInit = match serde_json::from_value(payload) {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!(peer_id = %sender, "Ignoring undecodable candidate payload: {}", e);
                return;
            }
        };
        if candidate.is_empty() {
            debug!(peer_id = %sender, "Ignoring end-of-candidates marker");
            return;
        }

        let negotiator = {
            let registry = self.registry.read().await;
            match registry.get(&sender) {
                Some(session) => session.negotiator(),
                None => {
                    debug!(peer_id = %sender, "Ignoring candidate from unknown peer");
                    return;
                }
            }
        };

        if let Err(error) = negotiator.add_ice_candidate(candidate).await {
            warn!("Candidate rejected for peer {}: {}", sender, error);
            self.bus.emit(&RoomEvent::Error {
                peer_id: Some(sender),
                error,
            });
        }
    }

    async fn handle_negotiation(&mut self, event: NegotiationEvent) {
        match event {
            NegotiationEvent::LocalCandidate { peer_id, candidate } => {
                if !self.registry.read().await.contains_key(&peer_id) {
                    debug!(peer_id = %peer_id, "Dropping local candidate for departed peer");
                    return;
                }
                self.senders.outbound.send_envelope(OutboundEnvelope::IceCandidate {
                    target: peer_id,
                    payload: candidate,
                });
            }
            NegotiationEvent::MediaAttached { peer_id, handle } => {
                {
                    let mut registry = self.registry.write().await;
                    let Some(session) = registry.get_mut(&peer_id) else {
                        debug!(peer_id = %peer_id, "Dropping media attach for departed peer");
                        return;
                    };
                    session.set_remote_media(handle);
                    session.set_phase(NegotiationPhase::Connected);
                }
                info!(peer_id = %peer_id, "Peer media attached");
                self.bus.emit(&RoomEvent::Connected { peer_id });
            }
            NegotiationEvent::MediaDetached { peer_id } => {
                let removed = self.registry.write().await.remove(&peer_id);
                let Some(mut session) = removed else {
                    debug!(peer_id = %peer_id, "Dropping media detach for departed peer");
                    return;
                };

                info!(peer_id = %peer_id, "Peer media detached, closing session");
                session.set_phase(NegotiationPhase::Closed);
                session.clear_remote_media();
                if let Err(e) = session.negotiator().close().await {
                    warn!("Error closing negotiation handle for {}: {}", peer_id, e);
                }
                self.bus.emit(&RoomEvent::End {
                    peer_id: Some(peer_id),
                });
            }
        }
    }

    /// Apply a spawned operation's completion, if the peer is still with us
    async fn handle_outcome(&mut self, outcome: NegotiationOutcome) {
        match outcome {
            NegotiationOutcome::OfferReady {
                peer_id,
                description,
            } => {
                let mut registry = self.registry.write().await;
                let Some(session) = registry.get_mut(&peer_id) else {
                    debug!(peer_id = %peer_id, "Dropping offer for departed peer");
                    return;
                };
                self.senders.outbound.send_envelope(OutboundEnvelope::Offer {
                    target: peer_id,
                    payload: description,
                });
                session.set_phase(NegotiationPhase::OfferSent);
            }
            NegotiationOutcome::AnswerReady {
                peer_id,
                description,
            } => {
                let mut registry = self.registry.write().await;
                let Some(session) = registry.get_mut(&peer_id) else {
                    debug!(peer_id = %peer_id, "Dropping answer for departed peer");
                    return;
                };
                self.senders.outbound.send_envelope(OutboundEnvelope::Answer {
                    target: peer_id,
                    payload: description,
                });
                session.set_phase(NegotiationPhase::AnswerSent);
            }
            NegotiationOutcome::AnswerApplied { peer_id } => {
                let mut registry = self.registry.write().await;
                let Some(session) = registry.get_mut(&peer_id) else {
                    debug!(peer_id = %peer_id, "Dropping answer completion for departed peer");
                    return;
                };
                // Media may have attached while the answer was being applied;
                // the completion must never move a connected peer backwards.
                if session.phase() != NegotiationPhase::OfferSent {
                    debug!(
                        peer_id = %peer_id,
                        phase = ?session.phase(),
                        "Ignoring answer completion outside OfferSent"
                    );
                    return;
                }
                session.set_phase(NegotiationPhase::AnswerReceived);
            }
            NegotiationOutcome::Failed { peer_id, error } => {
                if !self.registry.read().await.contains_key(&peer_id) {
                    debug!(peer_id = %peer_id, "Dropping failure for departed peer");
                    return;
                }
                // The peer stays in its current phase; one peer's failure
                // never ends the session.
                warn!("Negotiation failure for peer {}: {}", peer_id, error);
                self.bus.emit(&RoomEvent::Error {
                    peer_id: Some(peer_id),
                    error,
                });
            }
        }
    }

    /// Create a negotiation handle and register the peer session
    ///
    /// Returns `None` (after emitting an error) if the capability refuses to
    /// create a handle.
    async fn create_session(
        &mut self,
        peer_id: &str,
        role: NegotiationRole,
    ) -> Option<Arc<dyn crate::peer::Negotiator>> {
        let negotiator = match self.factory.create(
            peer_id,
            &self.ice_servers,
            self.senders.negotiation.clone(),
        ) {
            Ok(negotiator) => negotiator,
            Err(error) => {
                warn!("Failed to create negotiation handle for {}: {}", peer_id, error);
                self.bus.emit(&RoomEvent::Error {
                    peer_id: Some(peer_id.to_string()),
                    error,
                });
                return None;
            }
        };

        let mut session = PeerSession::new(peer_id.to_string(), role, negotiator.clone());
        if role == NegotiationRole::Answerer {
            session.set_phase(NegotiationPhase::OfferReceived);
        }
        self.registry
            .write()
            .await
            .insert(peer_id.to_string(), session);

        self.bus.emit(&RoomEvent::FoundRemote {
            peer_id: peer_id.to_string(),
        });

        Some(negotiator)
    }

    /// Drop every peer session, releasing each negotiation handle once
    async fn close_all(&mut self) {
        let sessions: Vec<PeerSession> = {
            let mut registry = self.registry.write().await;
            registry.drain().map(|(_, session)| session).collect()
        };

        for mut session in sessions {
            debug!(peer_id = %session.peer_id(), "Closing peer session");
            session.set_phase(NegotiationPhase::Closed);
            if let Err(e) = session.negotiator().close().await {
                warn!(
                    "Error closing negotiation handle for {}: {}",
                    session.peer_id(),
                    e
                );
            }
        }
    }
}

/// Extension for infallible envelope queueing
///
/// A send failure means the forwarder is gone, i.e. the session is tearing
/// down; the envelope is dropped like any send on a closed relay.
trait SendEnvelope {
    fn send_envelope(&self, envelope: OutboundEnvelope);
}

impl SendEnvelope for mpsc::UnboundedSender<OutboundEnvelope> {
    fn send_envelope(&self, envelope: OutboundEnvelope) {
        if self.send(envelope).is_err() {
            debug!("Outbound queue closed, dropping envelope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::events::EventKind;
    use crate::media::RemoteMediaHandle;
    use crate::peer::Negotiator;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockNegotiator {
        fail_offer: bool,
        fail_answer: bool,
        candidates: Mutex<Vec<CandidateInit>>,
        closed: AtomicBool,
    }

    impl MockNegotiator {
        fn new(fail_offer: bool, fail_answer: bool) -> Self {
            Self {
                fail_offer,
                fail_answer,
                candidates: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Negotiator for MockNegotiator {
        async fn create_offer(&self) -> crate::Result<Value> {
            if self.fail_offer {
                return Err(Error::NegotiationFailure("offer rejected".to_string()));
            }
            Ok(json!({"type": "offer", "sdp": "v=0"}))
        }

        async fn create_answer(&self, _remote: Value) -> crate::Result<Value> {
            if self.fail_answer {
                return Err(Error::NegotiationFailure("answer rejected".to_string()));
            }
            Ok(json!({"type": "answer", "sdp": "v=0"}))
        }

        async fn set_local_description(&self, _description: Value) -> crate::Result<()> {
            Ok(())
        }

        async fn set_remote_description(&self, _description: Value) -> crate::Result<()> {
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: CandidateInit) -> crate::Result<()> {
            self.candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn close(&self) -> crate::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockFactory {
        fail_offer: bool,
        fail_answer: bool,
        created: Mutex<Vec<(String, Arc<MockNegotiator>)>>,
    }

    impl MockFactory {
        fn negotiator_for(&self, peer_id: &str) -> Arc<MockNegotiator> {
            self.created
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(id, _)| id == peer_id)
                .map(|(_, n)| n.clone())
                .expect("no negotiator created for peer")
        }

        fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    impl NegotiatorFactory for MockFactory {
        fn create(
            &self,
            peer_id: &str,
            _ice_servers: &[IceServerConfig],
            _events: mpsc::UnboundedSender<NegotiationEvent>,
        ) -> crate::Result<Arc<dyn Negotiator>> {
            let negotiator = Arc::new(MockNegotiator::new(self.fail_offer, self.fail_answer));
            self.created
                .lock()
                .unwrap()
                .push((peer_id.to_string(), negotiator.clone()));
            Ok(negotiator)
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        rx: mpsc::UnboundedReceiver<DispatchEvent>,
        out_rx: mpsc::UnboundedReceiver<OutboundEnvelope>,
        registry: Registry,
        bus: Arc<EventBus>,
        factory: Arc<MockFactory>,
    }

    impl Harness {
        fn new(local_id: &str) -> Self {
            Self::with_factory(local_id, Arc::new(MockFactory::default()))
        }

        fn with_factory(local_id: &str, factory: Arc<MockFactory>) -> Self {
            let (events, rx) = mpsc::unbounded_channel();
            let (outbound, out_rx) = mpsc::unbounded_channel();
            let (negotiation, _neg_rx) = mpsc::unbounded_channel();
            let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
            let bus = Arc::new(EventBus::new());
            let config = SessionConfig::default();

            let dispatcher = Dispatcher::new(
                local_id.to_string(),
                "r1".to_string(),
                config.ice_servers,
                factory.clone(),
                bus.clone(),
                registry.clone(),
                DispatchSenders {
                    outbound,
                    events,
                    negotiation,
                },
            );

            Self {
                dispatcher,
                rx,
                out_rx,
                registry,
                bus,
                factory,
            }
        }

        /// Feed an inbound signaling message as the relay would deliver it
        async fn signal(&mut self, text: &str) {
            let (envelope, raw) = crate::signaling::protocol::decode(text).unwrap();
            self.dispatcher
                .handle(DispatchEvent::Relay(ChannelEvent::Message { envelope, raw }))
                .await;
        }

        /// Apply the next spawned completion to the dispatcher
        async fn pump(&mut self) {
            let event = self.rx.recv().await.expect("no pending completion");
            self.dispatcher.handle(event).await;
        }

        async fn phase(&self, peer_id: &str) -> Option<NegotiationPhase> {
            self.registry
                .read()
                .await
                .get(peer_id)
                .map(|s| s.phase())
        }

        async fn members(&self) -> Vec<String> {
            let mut members: Vec<String> =
                self.registry.read().await.keys().cloned().collect();
            members.sort();
            members
        }

        fn count_events(&self, kind: EventKind) -> Arc<AtomicUsize> {
            let counter = Arc::new(AtomicUsize::new(0));
            let clone = counter.clone();
            self.bus.add_listener(kind, move |_| {
                clone.fetch_add(1, Ordering::SeqCst);
            });
            counter
        }
    }

    #[tokio::test]
    async fn test_join_creates_offerer_and_sends_offer() {
        let mut h = Harness::new("A");
        let found = h.count_events(EventKind::FoundRemote);

        h.signal(r#"{"fn": "join", "id": "B"}"#).await;

        assert_eq!(found.load(Ordering::SeqCst), 1);
        assert_eq!(h.phase("B").await, Some(NegotiationPhase::Created));
        {
            let registry = h.registry.read().await;
            assert_eq!(registry.get("B").unwrap().role(), NegotiationRole::Offerer);
        }

        h.pump().await; // OfferReady
        assert_eq!(h.phase("B").await, Some(NegotiationPhase::OfferSent));

        match h.out_rx.try_recv().unwrap() {
            OutboundEnvelope::Offer { target, .. } => assert_eq!(target, "B"),
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offer_answer_drives_offerer_to_connected() {
        let mut h = Harness::new("A");
        let connected = h.count_events(EventKind::Connected);

        h.signal(r#"{"fn": "join", "id": "B"}"#).await;
        h.pump().await; // OfferReady -> OfferSent

        h.signal(r#"{"fn": "answer", "id": "B", "payload": {"type": "answer", "sdp": "v=0"}}"#)
            .await;
        h.pump().await; // AnswerApplied
        assert_eq!(h.phase("B").await, Some(NegotiationPhase::AnswerReceived));

        h.dispatcher
            .handle(DispatchEvent::Negotiation(NegotiationEvent::MediaAttached {
                peer_id: "B".to_string(),
                handle: RemoteMediaHandle::new("stream-b"),
            }))
            .await;

        assert_eq!(h.phase("B").await, Some(NegotiationPhase::Connected));
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.registry.read().await.get("B").unwrap().remote_media().unwrap().id,
            "stream-b"
        );
    }

    #[tokio::test]
    async fn test_own_join_echo_is_ignored() {
        let mut h = Harness::new("A");
        h.signal(r#"{"fn": "join", "id": "A"}"#).await;
        assert!(h.members().await.is_empty());
        assert_eq!(h.factory.created_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_join_keeps_single_session() {
        let mut h = Harness::new("A");
        h.signal(r#"{"fn": "join", "id": "B"}"#).await;
        h.signal(r#"{"fn": "join", "id": "B"}"#).await;

        assert_eq!(h.members().await, vec!["B"]);
        assert_eq!(h.factory.created_count(), 1);
    }

    #[tokio::test]
    async fn test_membership_follows_joins_and_leaves() {
        let mut h = Harness::new("A");

        h.signal(r#"{"fn": "join", "id": "B"}"#).await;
        h.signal(r#"{"fn": "join", "id": "C"}"#).await;
        h.signal(r#"{"fn": "join", "id": "D"}"#).await;
        h.signal(r#"{"fn": "leave", "id": "C"}"#).await;

        assert_eq!(h.members().await, vec!["B", "D"]);
    }

    #[tokio::test]
    async fn test_leave_unknown_peer_is_noop() {
        let mut h = Harness::new("A");
        let errors = h.count_events(EventKind::Error);

        h.signal(r#"{"fn": "leave", "id": "Z"}"#).await;

        assert!(h.members().await.is_empty());
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_leave_closes_negotiation_handle() {
        let mut h = Harness::new("A");
        h.signal(r#"{"fn": "join", "id": "B"}"#).await;
        let negotiator = h.factory.negotiator_for("B");

        h.signal(r#"{"fn": "leave", "id": "B"}"#).await;

        assert!(negotiator.closed.load(Ordering::SeqCst));
        assert!(h.members().await.is_empty());
    }

    #[tokio::test]
    async fn test_offer_creates_answerer_and_sends_answer() {
        let mut h = Harness::new("A");

        h.signal(r#"{"fn": "offer", "id": "C", "payload": {"type": "offer", "sdp": "v=0"}}"#)
            .await;

        assert_eq!(h.phase("C").await, Some(NegotiationPhase::OfferReceived));
        {
            let registry = h.registry.read().await;
            assert_eq!(registry.get("C").unwrap().role(), NegotiationRole::Answerer);
        }

        h.pump().await; // AnswerReady
        assert_eq!(h.phase("C").await, Some(NegotiationPhase::AnswerSent));

        match h.out_rx.try_recv().unwrap() {
            OutboundEnvelope::Answer { target, .. } => assert_eq!(target, "C"),
            other => panic!("expected answer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_answerer_connects_on_media_attach() {
        let mut h = Harness::new("A");

        h.signal(r#"{"fn": "offer", "id": "C", "payload": {"type": "offer", "sdp": "v=0"}}"#)
            .await;
        h.pump().await;

        h.dispatcher
            .handle(DispatchEvent::Negotiation(NegotiationEvent::MediaAttached {
                peer_id: "C".to_string(),
                handle: RemoteMediaHandle::new("stream-c"),
            }))
            .await;

        assert_eq!(h.phase("C").await, Some(NegotiationPhase::Connected));
    }

    #[tokio::test]
    async fn test_glare_smaller_id_yields_to_remote_offer() {
        // Local "A" offered toward "B"; B's competing offer arrives. A < B,
        // so A discards its offer and answers.
        let mut h = Harness::new("A");
        h.signal(r#"{"fn": "join", "id": "B"}"#).await;
        let first = h.factory.negotiator_for("B");

        h.signal(r#"{"fn": "offer", "id": "B", "payload": {"type": "offer", "sdp": "v=0"}}"#)
            .await;

        assert!(first.closed.load(Ordering::SeqCst));
        let registry = h.registry.read().await;
        assert_eq!(registry.get("B").unwrap().role(), NegotiationRole::Answerer);
    }

    #[tokio::test]
    async fn test_media_attach_before_answer_completion_stays_connected() {
        // The answer is applied in a spawned task; its completion and the
        // capability's media-attach callback race on independent channels.
        let mut h = Harness::new("A");

        h.signal(r#"{"fn": "join", "id": "B"}"#).await;
        h.pump().await; // OfferReady -> OfferSent

        h.signal(r#"{"fn": "answer", "id": "B", "payload": {"type": "answer", "sdp": "v=0"}}"#)
            .await;

        // Media attaches before the answer completion is processed.
        h.dispatcher
            .handle(DispatchEvent::Negotiation(NegotiationEvent::MediaAttached {
                peer_id: "B".to_string(),
                handle: RemoteMediaHandle::new("stream-b"),
            }))
            .await;
        assert_eq!(h.phase("B").await, Some(NegotiationPhase::Connected));

        h.pump().await; // the late AnswerApplied completion
        assert_eq!(h.phase("B").await, Some(NegotiationPhase::Connected));
        assert!(h.registry.read().await.get("B").unwrap().remote_media().is_some());
    }

    #[tokio::test]
    async fn test_glare_larger_id_keeps_its_offer() {
        // Local "C" offered toward "B"; B's competing offer arrives. C > B,
        // so C's offer stands and the incoming one is dropped.
        let mut h = Harness::new("C");
        h.signal(r#"{"fn": "join", "id": "B"}"#).await;
        let first = h.factory.negotiator_for("B");

        h.signal(r#"{"fn": "offer", "id": "B", "payload": {"type": "offer", "sdp": "v=0"}}"#)
            .await;

        assert!(!first.closed.load(Ordering::SeqCst));
        assert_eq!(h.factory.created_count(), 1);
        let registry = h.registry.read().await;
        assert_eq!(registry.get("B").unwrap().role(), NegotiationRole::Offerer);
    }

    #[tokio::test]
    async fn test_duplicate_offer_to_connected_peer_is_ignored() {
        // Local "A" < "B", but the session with B is already live; a stray
        // duplicate offer must not tear it down.
        let mut h = Harness::new("A");

        h.signal(r#"{"fn": "join", "id": "B"}"#).await;
        h.pump().await; // OfferReady -> OfferSent
        h.signal(r#"{"fn": "answer", "id": "B", "payload": {"type": "answer", "sdp": "v=0"}}"#)
            .await;
        h.pump().await; // AnswerApplied
        h.dispatcher
            .handle(DispatchEvent::Negotiation(NegotiationEvent::MediaAttached {
                peer_id: "B".to_string(),
                handle: RemoteMediaHandle::new("stream-b"),
            }))
            .await;
        let live = h.factory.negotiator_for("B");

        h.signal(r#"{"fn": "offer", "id": "B", "payload": {"type": "offer", "sdp": "v=0"}}"#)
            .await;

        assert!(!live.closed.load(Ordering::SeqCst));
        assert_eq!(h.factory.created_count(), 1);
        let registry = h.registry.read().await;
        let session = registry.get("B").unwrap();
        assert_eq!(session.role(), NegotiationRole::Offerer);
        assert_eq!(session.phase(), NegotiationPhase::Connected);
    }

    #[tokio::test]
    async fn test_candidate_is_forwarded() {
        let mut h = Harness::new("A");
        h.signal(r#"{"fn": "join", "id": "B"}"#).await;

        h.signal(
            r#"{"fn": "iceCandidate", "id": "B",
                "payload": {"type": "candidate", "label": 0, "id": "audio", "candidate": "candidate:1 ..."}}"#,
        )
        .await;

        let negotiator = h.factory.negotiator_for("B");
        let candidates = negotiator.candidates.lock().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].candidate.as_deref(), Some("candidate:1 ..."));
    }

    #[tokio::test]
    async fn test_empty_candidate_is_noop() {
        let mut h = Harness::new("A");
        h.signal(r#"{"fn": "join", "id": "B"}"#).await;

        h.signal(r#"{"fn": "iceCandidate", "id": "B", "payload": {"candidate": ""}}"#)
            .await;
        h.signal(r#"{"fn": "iceCandidate", "id": "B", "payload": {}}"#).await;

        let negotiator = h.factory.negotiator_for("B");
        assert!(negotiator.candidates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_candidate_for_unknown_peer_is_ignored() {
        let mut h = Harness::new("A");
        let errors = h.count_events(EventKind::Error);

        h.signal(r#"{"fn": "iceCandidate", "id": "Z", "payload": {"candidate": "candidate:1"}}"#)
            .await;

        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_answer_from_unknown_peer_is_ignored() {
        let mut h = Harness::new("A");
        let errors = h.count_events(EventKind::Error);

        h.signal(r#"{"fn": "answer", "id": "Z", "payload": {"sdp": "v=0"}}"#).await;

        assert!(h.members().await.is_empty());
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_emits_single_error() {
        let mut h = Harness::new("A");
        let errors = h.count_events(EventKind::Error);

        h.dispatcher
            .handle(DispatchEvent::Relay(ChannelEvent::Malformed {
                error: Error::MalformedMessage("bad json".to_string()),
            }))
            .await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(h.members().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_offer_completion_after_leave_is_noop() {
        let mut h = Harness::new("A");
        h.signal(r#"{"fn": "join", "id": "B"}"#).await;

        // B leaves while the offer is still being created.
        h.signal(r#"{"fn": "leave", "id": "B"}"#).await;
        h.pump().await; // the stale OfferReady completion

        assert!(h.members().await.is_empty());
        assert!(h.out_rx.try_recv().is_err(), "no offer may be sent after leave");
    }

    #[tokio::test]
    async fn test_offer_failure_keeps_phase_and_emits_error() {
        let factory = Arc::new(MockFactory {
            fail_offer: true,
            ..Default::default()
        });
        let mut h = Harness::with_factory("A", factory);
        let errors = h.count_events(EventKind::Error);

        h.signal(r#"{"fn": "join", "id": "B"}"#).await;
        h.pump().await; // Failed

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(h.phase("B").await, Some(NegotiationPhase::Created));
    }

    #[tokio::test]
    async fn test_answer_failure_keeps_phase_and_emits_error() {
        let factory = Arc::new(MockFactory {
            fail_answer: true,
            ..Default::default()
        });
        let mut h = Harness::with_factory("A", factory);
        let errors = h.count_events(EventKind::Error);

        h.signal(r#"{"fn": "offer", "id": "C", "payload": {"sdp": "v=0"}}"#).await;
        h.pump().await; // Failed

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(h.phase("C").await, Some(NegotiationPhase::OfferReceived));
    }

    #[tokio::test]
    async fn test_local_candidate_relayed_for_live_peer_only() {
        let mut h = Harness::new("A");
        h.signal(r#"{"fn": "join", "id": "B"}"#).await;

        h.dispatcher
            .handle(DispatchEvent::Negotiation(NegotiationEvent::LocalCandidate {
                peer_id: "B".to_string(),
                candidate: CandidateInit::new(Some(0), None, "candidate:1 ..."),
            }))
            .await;

        match h.out_rx.try_recv().unwrap() {
            OutboundEnvelope::IceCandidate { target, .. } => assert_eq!(target, "B"),
            other => panic!("expected candidate, got {:?}", other),
        }

        h.signal(r#"{"fn": "leave", "id": "B"}"#).await;
        h.dispatcher
            .handle(DispatchEvent::Negotiation(NegotiationEvent::LocalCandidate {
                peer_id: "B".to_string(),
                candidate: CandidateInit::new(Some(0), None, "candidate:2 ..."),
            }))
            .await;

        assert!(h.out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_media_detached_closes_peer_with_end_event() {
        let mut h = Harness::new("A");
        let ends = h.count_events(EventKind::End);
        h.signal(r#"{"fn": "join", "id": "B"}"#).await;
        let negotiator = h.factory.negotiator_for("B");

        h.dispatcher
            .handle(DispatchEvent::Negotiation(NegotiationEvent::MediaDetached {
                peer_id: "B".to_string(),
            }))
            .await;

        assert!(h.members().await.is_empty());
        assert!(negotiator.closed.load(Ordering::SeqCst));
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_relay_opened_sends_join_and_emits_start() {
        let mut h = Harness::new("A");
        let starts = h.count_events(EventKind::Start);

        h.dispatcher
            .handle(DispatchEvent::Relay(ChannelEvent::Opened))
            .await;

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        match h.out_rx.try_recv().unwrap() {
            OutboundEnvelope::Join { id, room } => {
                assert_eq!(id, "A");
                assert_eq!(room, "r1");
            }
            other => panic!("expected join, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relay_closed_emits_end() {
        let mut h = Harness::new("A");
        let ends = h.count_events(EventKind::End);

        h.dispatcher
            .handle(DispatchEvent::Relay(ChannelEvent::Closed))
            .await;

        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signal_message_event_carries_raw_envelope() {
        let mut h = Harness::new("A");
        let raws = Arc::new(Mutex::new(Vec::new()));
        let sink = raws.clone();
        h.bus.add_listener(EventKind::SignalMessage, move |event| {
            if let RoomEvent::SignalMessage { raw } = event {
                sink.lock().unwrap().push(raw.clone());
            }
        });

        h.signal(r#"{"fn": "join", "id": "B"}"#).await;

        let raws = raws.lock().unwrap();
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0], json!({"fn": "join", "id": "B"}));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_ignored_but_observable() {
        let mut h = Harness::new("A");
        let signals = h.count_events(EventKind::SignalMessage);
        let errors = h.count_events(EventKind::Error);

        h.signal(r#"{"fn": "renegotiate", "id": "B"}"#).await;

        assert!(h.members().await.is_empty());
        assert_eq!(signals.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_teardown_closes_every_session() {
        let mut h = Harness::new("A");
        h.signal(r#"{"fn": "join", "id": "B"}"#).await;
        h.signal(r#"{"fn": "join", "id": "C"}"#).await;
        let b = h.factory.negotiator_for("B");
        let c = h.factory.negotiator_for("C");

        h.dispatcher.handle(DispatchEvent::Teardown).await;

        assert!(h.members().await.is_empty());
        assert!(b.closed.load(Ordering::SeqCst));
        assert!(c.closed.load(Ordering::SeqCst));
    }
}
