use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flume::Receiver;
use peermux_core::idle::ConnectionQuality;
use peermux_core::nat::{NatClassification, NatType, StaticNatProbe};
use peermux_core::transport::memory::{GatheringMode, MemoryTransportFactory};
use peermux_core::transport::{IceCandidate, SessionDescription, TransportState};

use super::*;
use crate::config::ReconnectPolicy;
use crate::multiplex::Chunk;

fn manager(factory: &MemoryTransportFactory, config: PeerConfig) -> PeerManager {
    let probe = StaticNatProbe(NatClassification::new(NatType::FullCone, 0.9));
    PeerManager::new(config, Arc::new(factory.clone()), Arc::new(probe)).unwrap()
}

fn pair(config: PeerConfig) -> (MemoryTransportFactory, PeerManager, PeerManager) {
    let factory = MemoryTransportFactory::new();
    let alice = manager(&factory, config.clone());
    let bob = manager(&factory, config);
    (factory, alice, bob)
}

/// Runs the whole handshake: `alice` offers to "bob", `bob` answers "alice".
async fn connect(alice: &PeerManager, bob: &PeerManager) -> Arc<dyn DataChannel> {
    let (offer, primary) = alice.create_connection("bob", "Bob", "s1").await.unwrap();
    let answer = bob
        .accept_connection("alice", "Alice", "s1", offer)
        .await
        .unwrap();
    alice.complete_connection("bob", answer).await.unwrap();
    primary
}

async fn wait_for<F>(events: &Receiver<PeerEvent>, mut matches: F) -> PeerEvent
where
    F: FnMut(&PeerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv_async().await.expect("event stream ended");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not observed")
}

fn drain(events: &Receiver<PeerEvent>) -> Vec<PeerEvent> {
    events.try_iter().collect()
}

struct LoopbackRelay {
    remote: PeerManager,
    local_id: String,
}

#[async_trait]
impl RenegotiationRelay for LoopbackRelay {
    async fn relay(&self, _peer_id: &str, offer: SessionDescription) -> io::Result<SessionDescription> {
        self.remote
            .answer_renegotiation(&self.local_id, offer)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let factory = MemoryTransportFactory::new();
    let probe = StaticNatProbe(NatClassification::unknown());
    let config = PeerConfig::default().set_max_peers(0);
    let err = PeerManager::new(config, Arc::new(factory), Arc::new(probe))
        .err()
        .unwrap();
    assert!(err.is_configuration());
}

#[tokio::test]
async fn handshake_opens_both_sides() {
    let (_factory, alice, bob) = pair(PeerConfig::default());
    let alice_events = alice.subscribe();
    let bob_events = bob.subscribe();
    connect(&alice, &bob).await;

    wait_for(&alice_events, |e| matches!(e, PeerEvent::Connected { peer_id } if peer_id == "bob")).await;
    wait_for(&bob_events, |e| matches!(e, PeerEvent::Connected { peer_id } if peer_id == "alice")).await;

    let info = alice.get_peer("bob").unwrap();
    assert_eq!(info.state, PeerState::Open);
    assert!(info.is_initiator);
    assert!(info.connected_at.is_some());
    assert_eq!(info.name, "Bob");
    let info = bob.get_peer("alice").unwrap();
    assert_eq!(info.state, PeerState::Open);
    assert!(!info.is_initiator);
    assert!(bob.primary_channel("alice").is_some());
    assert_eq!(alice.peer_count(), 1);
}

#[tokio::test]
async fn handshake_reports_nat_and_strategy() {
    let (_factory, alice, bob) = pair(PeerConfig::default());
    let events = alice.subscribe();
    alice.set_remote_nat("bob", NatType::RestrictedCone);
    connect(&alice, &bob).await;

    let nat = wait_for(&events, |e| matches!(e, PeerEvent::NatDetected(_))).await;
    assert!(matches!(nat, PeerEvent::NatDetected(c) if c.nat_type == NatType::FullCone));
    let PeerEvent::StrategyDetermined { strategy, .. } =
        wait_for(&events, |e| matches!(e, PeerEvent::StrategyDetermined { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(alice.get_peer("bob").unwrap().strategy, strategy);
    assert_eq!(
        alice.nat_classification().map(|c| c.nat_type),
        Some(NatType::FullCone)
    );
}

#[tokio::test]
async fn duplicate_peer_is_a_configuration_error() {
    let (_factory, alice, _bob) = pair(PeerConfig::default());
    alice.create_connection("bob", "Bob", "s1").await.unwrap();
    let err = alice
        .create_connection("bob", "Bob", "s2")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::DuplicatePeer(ref id) if id == "bob"));
    assert!(err.is_configuration());
    assert_eq!(alice.peer_count(), 1);
}

#[tokio::test]
async fn peer_limit_is_enforced() {
    let (_factory, alice, _bob) = pair(PeerConfig::default().set_max_peers(1));
    alice.create_connection("bob", "Bob", "s1").await.unwrap();
    let err = alice
        .create_connection("carol", "Carol", "s1")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::PeerLimit { max: 1 }));
}

#[tokio::test]
async fn descriptions_of_the_wrong_kind_are_rejected() {
    let (_factory, alice, bob) = pair(PeerConfig::default());
    let (offer, _) = alice.create_connection("bob", "Bob", "s1").await.unwrap();
    let err = alice
        .complete_connection("bob", offer.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Negotiation(_)));
    let answer = SessionDescription::answer(offer.sdp);
    assert!(bob
        .accept_connection("alice", "Alice", "s1", answer)
        .await
        .is_err());
    assert!(bob.get_peer("alice").is_none());
    assert!(matches!(
        bob.complete_connection("nobody", SessionDescription::answer("x")).await,
        Err(Error::UnknownPeer(_))
    ));
}

#[tokio::test]
async fn messages_reach_the_other_side() {
    let (_factory, alice, bob) = pair(PeerConfig::default());
    let bob_events = bob.subscribe();
    connect(&alice, &bob).await;

    assert!(alice.send_message("bob", Bytes::from_static(b"hello")));
    let event = wait_for(&bob_events, |e| matches!(e, PeerEvent::MessageReceived { .. })).await;
    assert!(matches!(
        event,
        PeerEvent::MessageReceived { peer_id, data } if peer_id == "alice" && data == Bytes::from_static(b"hello")
    ));
    assert!(!alice.send_message("nobody", Bytes::from_static(b"x")));
}

#[tokio::test]
async fn send_ready_follows_primary_backpressure() {
    let (factory, alice, bob) = pair(PeerConfig::default());
    let events = alice.subscribe();
    connect(&alice, &bob).await;
    let primary = factory.transports()[0].channel(PRIMARY_CHANNEL_LABEL).unwrap();

    primary.force_buffered_amount(PRIMARY_HIGH_THRESHOLD);
    assert!(!alice.send_message("bob", Bytes::from_static(b"blocked")));
    primary.force_buffered_amount(PRIMARY_LOW_THRESHOLD);
    wait_for(&events, |e| matches!(e, PeerEvent::SendReady { peer_id } if peer_id == "bob")).await;
    assert!(alice.send_message("bob", Bytes::from_static(b"again")));
}

#[tokio::test]
async fn candidates_are_forwarded_and_unknown_peers_ignored() {
    let (factory, alice, bob) = pair(PeerConfig::default());
    let events = alice.subscribe();
    connect(&alice, &bob).await;
    wait_for(&events, |e| matches!(e, PeerEvent::IceCandidate { peer_id, .. } if peer_id == "bob")).await;

    alice
        .add_remote_candidate("bob", IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 9 typ host"))
        .await;
    alice
        .add_remote_candidate("ghost", IceCandidate::new("candidate:2"))
        .await;
    assert_eq!(factory.transports()[0].remote_candidates().len(), 1);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (_factory, alice, bob) = pair(PeerConfig::default());
    let events = alice.subscribe();
    let bob_events = bob.subscribe();
    connect(&alice, &bob).await;

    alice.disconnect("bob", "bye").await;
    alice.disconnect("bob", "bye").await;
    alice.disconnect("nobody", "bye").await;
    assert!(alice.get_peer("bob").is_none());
    assert_eq!(alice.context().task_count("bob"), 0);

    wait_for(&bob_events, |e| matches!(e, PeerEvent::Disconnected { peer_id, .. } if peer_id == "alice")).await;
    assert_eq!(bob.peer_count(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let disconnects: Vec<String> = drain(&events)
        .into_iter()
        .filter_map(|e| match e {
            PeerEvent::Disconnected { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(disconnects, vec!["bye".to_string()]);
}

#[tokio::test]
async fn shutdown_disconnects_everyone() {
    let factory = MemoryTransportFactory::new();
    let alice = manager(&factory, PeerConfig::default());
    let bob = manager(&factory, PeerConfig::default());
    let carol = manager(&factory, PeerConfig::default());
    let events = alice.subscribe();
    connect(&alice, &bob).await;
    let (offer, _) = alice.create_connection("carol", "Carol", "s2").await.unwrap();
    let answer = carol
        .accept_connection("alice", "Alice", "s2", offer)
        .await
        .unwrap();
    alice.complete_connection("carol", answer).await.unwrap();
    assert_eq!(alice.peer_count(), 2);

    alice.shutdown().await;
    assert_eq!(alice.peer_count(), 0);
    let reasons: Vec<PeerEvent> = drain(&events)
        .into_iter()
        .filter(|e| matches!(e, PeerEvent::Disconnected { reason, .. } if reason == SHUTDOWN))
        .collect();
    assert_eq!(reasons.len(), 2);
}

#[tokio::test]
async fn failed_transport_recovers_through_relay() {
    let reconnect = ReconnectPolicy::default().set_schedule(vec![Duration::from_millis(10)]);
    let (factory, alice, bob) = pair(PeerConfig::default().set_reconnect(reconnect));
    alice.set_renegotiation_relay(Arc::new(LoopbackRelay {
        remote: bob.clone(),
        local_id: "alice".to_string(),
    }));
    let events = alice.subscribe();
    connect(&alice, &bob).await;

    factory.transports()[0].inject_failure();
    wait_for(&events, |e| {
        matches!(e, PeerEvent::StateChanged { state: PeerState::Failed, .. })
    })
    .await;
    wait_for(&events, |e| matches!(e, PeerEvent::RenegotiationNeeded { attempt: 1, .. })).await;
    wait_for(&events, |e| {
        matches!(e, PeerEvent::StateChanged { state: PeerState::Open, .. })
    })
    .await;

    let info = alice.get_peer("bob").unwrap();
    assert_eq!(info.state, PeerState::Open);
    assert_eq!(info.reconnect_attempts, 0);
    assert_eq!(
        alice.transport("bob").unwrap().connection_state(),
        TransportState::Connected
    );
    assert!(alice.send_message("bob", Bytes::from_static(b"after restart")));
}

#[tokio::test(start_paused = true)]
async fn recovery_gives_up_after_the_budget() {
    let (factory, alice, bob) = pair(PeerConfig::default());
    let events = alice.subscribe();
    connect(&alice, &bob).await;

    let started = tokio::time::Instant::now();
    factory.transports()[0].inject_failure();
    let event = wait_for(&events, |e| matches!(e, PeerEvent::Disconnected { .. })).await;
    assert!(matches!(
        event,
        PeerEvent::Disconnected { reason, .. } if reason == FAILED_AFTER_RETRIES
    ));
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert!(alice.get_peer("bob").is_none());
}

/// Events up to and including the disconnect of `peer_id`.
async fn until_disconnected(events: &Receiver<PeerEvent>, peer_id: &str) -> Vec<PeerEvent> {
    let mut seen = Vec::new();
    loop {
        let event = wait_for(events, |_| true).await;
        let done = matches!(&event, PeerEvent::Disconnected { peer_id: p, .. } if p == peer_id);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn attempts(events: &[PeerEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            PeerEvent::RenegotiationNeeded { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect()
}

/// Restarts the link between the first two transports of `factory` without any relay.
async fn restart_by_hand(factory: &MemoryTransportFactory) {
    let transports = factory.transports();
    let (offerer, answerer) = (&transports[0], &transports[1]);
    let offer = offerer.create_offer(true).await.unwrap();
    offerer.set_local_description(offer.clone()).await.unwrap();
    answerer.set_remote_description(offer).await.unwrap();
    let answer = answerer.create_answer().await.unwrap();
    answerer.set_local_description(answer.clone()).await.unwrap();
    offerer.set_remote_description(answer).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_are_not_reported_as_errors() {
    let (factory, alice, bob) = pair(PeerConfig::default());
    let events = alice.subscribe();
    connect(&alice, &bob).await;

    factory.transports()[0].inject_failure();
    let seen = until_disconnected(&events, "bob").await;
    assert_eq!(attempts(&seen), vec![1, 2, 3]);
    assert!(!seen.iter().any(|e| matches!(e, PeerEvent::Error { .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        PeerEvent::QualityChanged { quality: ConnectionQuality::Disconnected, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn failing_again_during_backoff_gets_a_fresh_budget() {
    let (factory, alice, bob) = pair(PeerConfig::default());
    let events = alice.subscribe();
    connect(&alice, &bob).await;

    factory.transports()[0].inject_failure();
    wait_for(&events, |e| matches!(e, PeerEvent::StateChanged { state: PeerState::Failed, .. })).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    restart_by_hand(&factory).await;
    wait_for(&events, |e| matches!(e, PeerEvent::StateChanged { state: PeerState::Open, .. })).await;
    assert_eq!(alice.get_peer("bob").unwrap().reconnect_attempts, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let refailed = tokio::time::Instant::now();
    factory.transports()[0].inject_failure();
    let seen = until_disconnected(&events, "bob").await;
    assert_eq!(attempts(&seen), vec![1, 2, 3]);
    assert!(refailed.elapsed() >= Duration::from_secs(7));
    assert!(matches!(
        seen.last(),
        Some(PeerEvent::Disconnected { reason, .. }) if reason == FAILED_AFTER_RETRIES
    ));
}

#[tokio::test]
async fn responder_recovers_when_the_initiator_restarts() {
    let factory = MemoryTransportFactory::new();
    let fast = ReconnectPolicy::default().set_schedule(vec![Duration::from_millis(10)]);
    let alice = manager(&factory, PeerConfig::default().set_reconnect(fast));
    let bob = manager(&factory, PeerConfig::default());
    alice.set_renegotiation_relay(Arc::new(LoopbackRelay {
        remote: bob.clone(),
        local_id: "alice".to_string(),
    }));
    let bob_events = bob.subscribe();
    connect(&alice, &bob).await;

    factory.transports()[1].inject_failure();
    factory.transports()[0].inject_failure();
    let mut seen = Vec::new();
    wait_for(&bob_events, |e| {
        seen.push(e.clone());
        matches!(e, PeerEvent::StateChanged { state: PeerState::Open, .. })
            && seen.iter().any(|e| {
                matches!(e, PeerEvent::StateChanged { state: PeerState::Failed, .. })
            })
    })
    .await;

    let info = bob.get_peer("alice").unwrap();
    assert_eq!(info.state, PeerState::Open);
    assert_eq!(info.reconnect_attempts, 0);
    assert!(attempts(&seen).is_empty());
    assert!(bob.send_message("alice", Bytes::from_static(b"back")));
}

#[tokio::test(start_paused = true)]
async fn responder_gives_up_without_a_restart() {
    let (factory, alice, bob) = pair(PeerConfig::default());
    let bob_events = bob.subscribe();
    connect(&alice, &bob).await;

    let started = tokio::time::Instant::now();
    factory.transports()[1].inject_failure();
    let seen = until_disconnected(&bob_events, "alice").await;
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert!(attempts(&seen).is_empty());
    assert!(matches!(
        seen.last(),
        Some(PeerEvent::Disconnected { reason, .. }) if reason == FAILED_AFTER_RETRIES
    ));
    assert!(bob.get_peer("alice").is_none());
}

#[tokio::test]
async fn malformed_primary_frame_is_a_peer_error() {
    let (_factory, alice, bob) = pair(PeerConfig::default());
    let events = bob.subscribe();
    let primary = connect(&alice, &bob).await;

    primary.send(Bytes::from_static(&[0xee, 1, 2])).unwrap();
    let event = wait_for(&events, |e| matches!(e, PeerEvent::Error { .. })).await;
    assert_eq!(event.peer_id(), Some("alice"));
    assert_eq!(bob.get_peer("alice").unwrap().state, PeerState::Open);
}

#[tokio::test(start_paused = true)]
async fn quality_follows_idle_time() {
    let config = PeerConfig::default().set_keepalive_interval(Duration::from_secs(3600));
    let (_factory, alice, bob) = pair(config);
    let events = alice.subscribe();
    connect(&alice, &bob).await;

    let quality = |q: ConnectionQuality| {
        move |e: &PeerEvent| matches!(e, PeerEvent::QualityChanged { quality, .. } if *quality == q)
    };
    wait_for(&events, quality(ConnectionQuality::Fair)).await;
    wait_for(&events, quality(ConnectionQuality::Poor)).await;
    assert_eq!(alice.get_peer("bob").unwrap().quality, ConnectionQuality::Poor);

    assert!(bob.send_message("alice", Bytes::from_static(b"ping")));
    wait_for(&events, quality(ConnectionQuality::Excellent)).await;
    let info = alice.get_peer("bob").unwrap();
    assert_eq!(info.stats.messages_received, 1);
    assert_eq!(info.stats.bytes_received, 4);
}

#[tokio::test(start_paused = true)]
async fn stalled_gathering_proceeds_after_timeout() {
    let factory = MemoryTransportFactory::new();
    factory.set_gathering(GatheringMode::Stalled);
    let alice = manager(&factory, PeerConfig::default());
    let started = tokio::time::Instant::now();
    let (offer, _) = alice.create_connection("bob", "Bob", "s1").await.unwrap();
    assert!(offer.is_offer());
    assert!(started.elapsed() >= alice.config().connection_timeout);
}

#[tokio::test]
async fn multiplexer_opens_on_both_sides() {
    let (_factory, alice, bob) = pair(PeerConfig::default());
    connect(&alice, &bob).await;
    let config = ChannelConfig::default().set_channel_count(4);

    let sender = alice.open_multiplexer("bob", config).await.unwrap();
    let receiver = bob.open_multiplexer("alice", config).await.unwrap();
    assert_eq!(sender.channel_count(), 4);
    assert_eq!(receiver.channel_count(), 4);

    let chunk = Chunk {
        transfer_id: "t1".to_string(),
        chunk_index: 0,
        total_chunks: 1,
        hash: "abc".to_string(),
        encrypted: false,
        payload: Bytes::from_static(b"payload"),
    };
    sender.send_chunk(&chunk).unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, chunk);

    assert!(matches!(
        alice.open_multiplexer("nobody", config).await,
        Err(Error::UnknownPeer(_))
    ));
}
