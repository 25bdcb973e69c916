//! Peer connection orchestration.
//!
//! A [`PeerManager`] owns one transport per remote peer. It classifies the local
//! NAT, selects a strategy, runs the offer/answer handshake and watches the
//! transport afterwards. A failed transport is recovered through bounded
//! renegotiation: the initiator builds a restart offer, hands it to the
//! registered [`RenegotiationRelay`] and applies the answer it returns.
//!
//! Signaling is the caller's job. Offers, answers and candidates come back in
//! through [`PeerManager::accept_connection`], [`PeerManager::complete_connection`]
//! and [`PeerManager::add_remote_candidate`].

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flume::Receiver;
use parking_lot::Mutex;
use peermux_core::idle::{classify_quality, ConnectionQuality};
use peermux_core::nat::{NatClassification, NatClassifier, NatProbe, NatType};
use peermux_core::strategy::{ConnectionStrategy, IceConfig, StrategySelector};
use peermux_core::stun::StunNatProbe;
use peermux_core::transport::{
    DataChannel, EventFanout, IceCandidate, PeerTransport, SessionDescription, TransportEvent,
    TransportFactory, TransportState,
};
use tokio::time::Instant;

use crate::config::{
    ChannelConfig, PeerConfig, PRIMARY_CHANNEL_LABEL, PRIMARY_HIGH_THRESHOLD,
    PRIMARY_LOW_THRESHOLD,
};
use crate::error::{Error, Result};
use crate::event::PeerEvent;
use crate::multiplex::Multiplexer;
use crate::protocol::PrimaryFrame;

mod maintain;
mod peer_context;
#[cfg(test)]
mod tests;

pub use peer_context::{PeerConnectionInfo, PeerState, PeerStats};
use peer_context::{PeerContext, PeerEntry, Reservation};

/// Disconnect reason once the reconnect budget is spent.
pub const FAILED_AFTER_RETRIES: &str = "failed after retries";
pub const SHUTDOWN: &str = "shutdown";

/// Delivers a restart offer to the remote peer out of band and returns its answer.
#[async_trait]
pub trait RenegotiationRelay: Send + Sync {
    async fn relay(&self, peer_id: &str, offer: SessionDescription)
        -> io::Result<SessionDescription>;
}

struct ManagerInner {
    config: PeerConfig,
    classifier: NatClassifier,
    selector: StrategySelector,
    factory: Arc<dyn TransportFactory>,
    context: PeerContext,
    relay: Mutex<Option<Arc<dyn RenegotiationRelay>>>,
    events: EventFanout<PeerEvent>,
}

/// Cheap to clone; every clone drives the same set of peers.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<ManagerInner>,
}

fn negotiation(e: io::Error) -> Error {
    Error::Negotiation(e.to_string())
}

impl PeerManager {
    pub fn new(
        config: PeerConfig,
        factory: Arc<dyn TransportFactory>,
        probe: Arc<dyn NatProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let selector =
            StrategySelector::new(config.stun_servers.clone()).set_force_relay(config.force_relay);
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                classifier: NatClassifier::new(probe),
                selector,
                factory,
                context: PeerContext::default(),
                relay: Mutex::new(None),
                events: EventFanout::live(),
            }),
        })
    }
    /// Classifies the local NAT against the configured STUN servers.
    pub fn with_stun_probe(config: PeerConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        let probe = StunNatProbe::new(config.stun_servers.clone());
        Self::new(config, factory, Arc::new(probe))
    }
    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }
    pub fn subscribe(&self) -> Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }
    pub async fn detect_nat(&self) -> NatClassification {
        let fresh = self.inner.classifier.cached().is_none();
        let nat = self.inner.classifier.detect().await;
        if fresh {
            self.emit(PeerEvent::NatDetected(nat));
        }
        nat
    }
    pub fn nat_classification(&self) -> Option<NatClassification> {
        self.inner.classifier.cached()
    }
    /// NAT type of a remote peer as reported through signaling.
    pub fn set_remote_nat(&self, peer_id: &str, nat_type: NatType) {
        self.inner
            .context
            .remote_nat
            .insert(peer_id.to_string(), nat_type);
    }
    /// Replaces any previously registered relay.
    pub fn set_renegotiation_relay(&self, relay: Arc<dyn RenegotiationRelay>) {
        self.inner.relay.lock().replace(relay);
    }
    pub fn clear_renegotiation_relay(&self) {
        self.inner.relay.lock().take();
    }

    /// Initiator side: registers `peer_id` and returns the offer to signal plus the primary channel.
    pub async fn create_connection(
        &self,
        peer_id: &str,
        name: &str,
        session_id: &str,
    ) -> Result<(SessionDescription, Arc<dyn DataChannel>)> {
        let reservation = self
            .inner
            .context
            .reserve(peer_id, self.inner.config.max_peers)?;
        let (strategy, ice) = self.plan(peer_id).await;
        let transport = self.inner.factory.create(&ice)?;
        let events = transport.subscribe();
        let (offer, primary) = match self.offer(&transport).await {
            Ok(v) => v,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };
        let info = self.new_info(peer_id, name, session_id, true, strategy);
        self.register(
            reservation,
            PeerEntry::new(info, transport, Some(primary.clone())),
            events,
        );
        log::info!("peer {peer_id} offer created mode={:?}", strategy.mode);
        Ok((offer, primary))
    }

    /// Responder side: applies the remote offer and returns the answer to signal back.
    pub async fn accept_connection(
        &self,
        peer_id: &str,
        name: &str,
        session_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        if !offer.is_offer() {
            return Err(Error::Negotiation(format!(
                "expected an offer from {peer_id}"
            )));
        }
        let reservation = self
            .inner
            .context
            .reserve(peer_id, self.inner.config.max_peers)?;
        let (strategy, ice) = self.plan(peer_id).await;
        let transport = self.inner.factory.create(&ice)?;
        let events = transport.subscribe();
        let answer = match self.answer(&transport, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };
        let info = self.new_info(peer_id, name, session_id, false, strategy);
        self.register(reservation, PeerEntry::new(info, transport.clone(), None), events);
        if let Some(primary) = transport
            .data_channels()
            .into_iter()
            .find(|c| c.label() == PRIMARY_CHANNEL_LABEL)
        {
            self.adopt_primary(peer_id, primary);
        }
        if transport.connection_state() == TransportState::Connected {
            self.mark_open(peer_id);
        }
        log::info!("peer {peer_id} answer created mode={:?}", strategy.mode);
        Ok(answer)
    }

    /// Initiator side: applies the remote answer.
    pub async fn complete_connection(&self, peer_id: &str, answer: SessionDescription) -> Result<()> {
        let transport = self
            .transport(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        if !answer.is_answer() {
            return Err(Error::Negotiation(format!(
                "expected an answer from {peer_id}"
            )));
        }
        transport
            .set_remote_description(answer)
            .await
            .map_err(negotiation)?;
        if transport.connection_state() == TransportState::Connected {
            self.mark_open(peer_id);
        }
        Ok(())
    }

    /// Never fails: candidates for unknown peers are logged and dropped.
    pub async fn add_remote_candidate(&self, peer_id: &str, candidate: IceCandidate) {
        let Some(transport) = self.transport(peer_id) else {
            log::debug!("candidate for unknown peer {peer_id} dropped");
            return;
        };
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            log::warn!("peer {peer_id} add candidate e={e:?}");
            self.emit(PeerEvent::Error {
                peer_id: peer_id.to_string(),
                message: e.to_string(),
            });
        }
    }

    /// Responder side of a restart: applies the offer and returns the answer for the relay.
    pub async fn answer_renegotiation(
        &self,
        peer_id: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let transport = self
            .transport(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        if !offer.is_offer() {
            return Err(Error::Negotiation(format!(
                "expected a restart offer from {peer_id}"
            )));
        }
        let answer = self.answer(&transport, offer).await?;
        if transport.connection_state() == TransportState::Connected {
            self.mark_open(peer_id);
        }
        log::info!("peer {peer_id} restart answered");
        Ok(answer)
    }

    /// Non-blocking send over the primary channel.
    ///
    /// Returns `false` when the peer is not open or the channel buffer is at or
    /// above its high threshold; retry after [`PeerEvent::SendReady`].
    pub fn send_message(&self, peer_id: &str, data: Bytes) -> bool {
        let (primary, counters) = {
            let Some(entry) = self.inner.context.peers.get(peer_id) else {
                log::debug!("send to unknown peer {peer_id}");
                return false;
            };
            if entry.info.state != PeerState::Open {
                return false;
            }
            let Some(primary) = entry.primary.clone() else {
                return false;
            };
            (primary, entry.counters.clone())
        };
        if primary.buffered_amount() >= PRIMARY_HIGH_THRESHOLD {
            log::debug!("peer {peer_id} primary channel backpressured");
            return false;
        }
        let len = data.len();
        match primary.send(PrimaryFrame::UserData(data).encode()) {
            Ok(()) => {
                counters.record_sent(len);
                true
            }
            Err(e) => {
                log::warn!("peer {peer_id} send e={e:?}");
                false
            }
        }
    }

    /// Stripes over sub-channels of an open peer. The initiator creates them,
    /// the responder waits for their announcements.
    pub async fn open_multiplexer(&self, peer_id: &str, config: ChannelConfig) -> Result<Multiplexer> {
        let (transport, is_initiator, state) = self
            .inner
            .context
            .peers
            .get(peer_id)
            .map(|entry| {
                (
                    entry.transport.clone(),
                    entry.info.is_initiator,
                    entry.info.state,
                )
            })
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        if state != PeerState::Open {
            return Err(Error::Negotiation(format!("peer {peer_id} is not open")));
        }
        if is_initiator {
            Multiplexer::open(peer_id, &transport, config)
        } else {
            Multiplexer::accept(peer_id, &transport, config).await
        }
    }

    /// Idempotent teardown: timers first, then the primary channel, then the transport.
    pub async fn disconnect(&self, peer_id: &str, reason: &str) {
        let (transport, primary) = {
            let Some(mut entry) = self.inner.context.peers.get_mut(peer_id) else {
                log::debug!("disconnect for unknown peer {peer_id}");
                return;
            };
            if entry.info.state.is_terminating() {
                return;
            }
            entry.info.state = PeerState::Closing;
            (entry.transport.clone(), entry.primary.clone())
        };
        self.emit(PeerEvent::StateChanged {
            peer_id: peer_id.to_string(),
            state: PeerState::Closing,
        });
        self.inner.context.abort_tasks(peer_id);
        if let Some(primary) = primary {
            primary.close().await;
        }
        transport.close().await;
        self.inner.context.peers.remove(peer_id);
        self.inner.context.remote_nat.remove(peer_id);
        log::info!("peer {peer_id} disconnected reason={reason}");
        self.emit(PeerEvent::StateChanged {
            peer_id: peer_id.to_string(),
            state: PeerState::Closed,
        });
        self.emit(PeerEvent::Disconnected {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub async fn shutdown(&self) {
        let peer_ids: Vec<String> = self
            .inner
            .context
            .peers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for peer_id in peer_ids {
            self.disconnect(&peer_id, SHUTDOWN).await;
        }
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<PeerConnectionInfo> {
        self.inner
            .context
            .peers
            .get(peer_id)
            .map(|entry| entry.info.clone())
    }
    pub fn peers(&self) -> Vec<PeerConnectionInfo> {
        self.inner
            .context
            .peers
            .iter()
            .map(|entry| entry.info.clone())
            .collect()
    }
    pub fn peer_count(&self) -> usize {
        self.inner.context.peers.len()
    }
    pub fn transport(&self, peer_id: &str) -> Option<Arc<dyn PeerTransport>> {
        self.inner
            .context
            .peers
            .get(peer_id)
            .map(|entry| entry.transport.clone())
    }
    pub fn primary_channel(&self, peer_id: &str) -> Option<Arc<dyn DataChannel>> {
        self.inner
            .context
            .peers
            .get(peer_id)
            .and_then(|entry| entry.primary.clone())
    }
}

impl PeerManager {
    pub(crate) fn context(&self) -> &PeerContext {
        &self.inner.context
    }
    pub(crate) fn emit(&self, event: PeerEvent) {
        self.inner.events.emit(event);
    }

    async fn plan(&self, peer_id: &str) -> (ConnectionStrategy, IceConfig) {
        let local = self.detect_nat().await;
        let remote = self
            .inner
            .context
            .remote_nat
            .get(peer_id)
            .map(|nat| *nat)
            .unwrap_or_default();
        let strategy = self.inner.selector.select(local.nat_type, remote);
        log::debug!(
            "peer {peer_id} local={:?} remote={remote:?} strategy={strategy:?}",
            local.nat_type
        );
        self.emit(PeerEvent::StrategyDetermined {
            peer_id: peer_id.to_string(),
            strategy,
        });
        let config = &self.inner.config;
        let ice = self.inner.selector.optimized_ice_config(
            local.nat_type,
            config.relay_server.as_deref(),
            config.relay_credentials.as_ref(),
        );
        (strategy, ice)
    }

    async fn offer(
        &self,
        transport: &Arc<dyn PeerTransport>,
    ) -> Result<(SessionDescription, Arc<dyn DataChannel>)> {
        let primary =
            transport.create_data_channel(PRIMARY_CHANNEL_LABEL, self.inner.config.primary_init)?;
        primary.set_buffered_amount_low_threshold(PRIMARY_LOW_THRESHOLD);
        let offer = transport.create_offer(false).await.map_err(negotiation)?;
        transport
            .set_local_description(offer)
            .await
            .map_err(negotiation)?;
        self.gather(transport).await;
        let offer = transport
            .local_description()
            .ok_or_else(|| Error::Negotiation("local offer missing".into()))?;
        Ok((offer, primary))
    }

    async fn answer(
        &self,
        transport: &Arc<dyn PeerTransport>,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        transport
            .set_remote_description(offer)
            .await
            .map_err(negotiation)?;
        let answer = transport.create_answer().await.map_err(negotiation)?;
        transport
            .set_local_description(answer)
            .await
            .map_err(negotiation)?;
        self.gather(transport).await;
        transport
            .local_description()
            .ok_or_else(|| Error::Negotiation("local answer missing".into()))
    }

    /// Waits for candidate gathering, proceeding with partial results on timeout.
    async fn gather(&self, transport: &Arc<dyn PeerTransport>) {
        let timeout = self.inner.config.connection_timeout;
        if tokio::time::timeout(timeout, transport.gathering_complete())
            .await
            .is_err()
        {
            log::warn!("candidate gathering timed out after {timeout:?}, using partial candidates");
        }
    }

    fn new_info(
        &self,
        peer_id: &str,
        name: &str,
        session_id: &str,
        is_initiator: bool,
        strategy: ConnectionStrategy,
    ) -> PeerConnectionInfo {
        PeerConnectionInfo {
            peer_id: peer_id.to_string(),
            name: name.to_string(),
            session_id: session_id.to_string(),
            state: PeerState::Connecting,
            quality: ConnectionQuality::default(),
            is_initiator,
            strategy,
            reconnect_attempts: 0,
            created_at: Instant::now(),
            connected_at: None,
            last_activity: None,
            stats: PeerStats::default(),
        }
    }

    fn register(
        &self,
        reservation: Reservation<'_>,
        entry: PeerEntry,
        events: Receiver<TransportEvent>,
    ) {
        let peer_id = entry.info.peer_id.clone();
        let primary = entry.primary.clone();
        self.inner.context.peers.insert(peer_id.clone(), entry);
        drop(reservation);
        self.emit(PeerEvent::StateChanged {
            peer_id: peer_id.clone(),
            state: PeerState::Connecting,
        });
        self.spawn_task(
            &peer_id,
            maintain::transport_watch_loop(self.clone(), peer_id.clone(), events),
        );
        if let Some(primary) = primary {
            self.start_reader(&peer_id, primary);
        }
    }

    pub(crate) fn spawn_task<F>(&self, peer_id: &str, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.inner.context.track(peer_id, handle.abort_handle());
    }

    /// Disconnect from a detached task so a peer task never aborts itself mid-teardown.
    pub(crate) fn spawn_disconnect(&self, peer_id: &str, reason: &str) {
        let manager = self.clone();
        let peer_id = peer_id.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move { manager.disconnect(&peer_id, &reason).await });
    }

    fn start_reader(&self, peer_id: &str, primary: Arc<dyn DataChannel>) {
        let Some((activity, counters)) = self
            .inner
            .context
            .peers
            .get(peer_id)
            .map(|entry| (entry.activity.clone(), entry.counters.clone()))
        else {
            return;
        };
        self.spawn_task(
            peer_id,
            maintain::primary_read_loop(
                self.clone(),
                peer_id.to_string(),
                primary,
                activity,
                counters,
            ),
        );
    }

    pub(crate) fn adopt_primary(&self, peer_id: &str, channel: Arc<dyn DataChannel>) {
        {
            let Some(mut entry) = self.inner.context.peers.get_mut(peer_id) else {
                return;
            };
            if entry.primary.is_some() || entry.info.state.is_terminating() {
                return;
            }
            entry.primary = Some(channel.clone());
        }
        channel.set_buffered_amount_low_threshold(PRIMARY_LOW_THRESHOLD);
        log::debug!("peer {peer_id} primary channel announced");
        self.start_reader(peer_id, channel);
    }

    /// Connecting or Failed to Open. Starts the timers on the first open.
    pub(crate) fn mark_open(&self, peer_id: &str) {
        let (first_open, start_timers, quality_changed) = {
            let Some(mut entry) = self.inner.context.peers.get_mut(peer_id) else {
                return;
            };
            if !matches!(entry.info.state, PeerState::Connecting | PeerState::Failed) {
                return;
            }
            let first_open = entry.info.connected_at.is_none();
            let now = Instant::now();
            entry.info.state = PeerState::Open;
            entry.info.connected_at.get_or_insert(now);
            entry.info.reconnect_attempts = 0;
            entry.recovering = false;
            entry.recovery_epoch += 1;
            entry.activity.touch();
            entry.info.last_activity = Some(now);
            let quality = classify_quality(entry.activity.idle(), None);
            let quality_changed = (entry.info.quality != quality).then_some(quality);
            entry.info.quality = quality;
            let start_timers = !entry.timers_started;
            entry.timers_started = true;
            (first_open, start_timers, quality_changed)
        };
        let id = peer_id.to_string();
        self.emit(PeerEvent::StateChanged {
            peer_id: id.clone(),
            state: PeerState::Open,
        });
        if let Some(quality) = quality_changed {
            self.emit(PeerEvent::QualityChanged {
                peer_id: id.clone(),
                quality,
            });
        }
        if first_open {
            log::info!("peer {peer_id} connected");
            self.emit(PeerEvent::Connected { peer_id: id.clone() });
        } else {
            log::info!("peer {peer_id} recovered");
        }
        if start_timers {
            let config = &self.inner.config;
            self.spawn_task(
                peer_id,
                maintain::stats_loop(self.clone(), id.clone(), config.stats_interval),
            );
            self.spawn_task(
                peer_id,
                maintain::keepalive_loop(self.clone(), id, config.keepalive_interval),
            );
        }
    }

    /// Open or Connecting to Failed, starting recovery unless it already runs.
    pub(crate) fn mark_failed(&self, peer_id: &str) {
        let start_recovery = {
            let Some(mut entry) = self.inner.context.peers.get_mut(peer_id) else {
                return;
            };
            if !matches!(entry.info.state, PeerState::Open | PeerState::Connecting) {
                return;
            }
            entry.info.state = PeerState::Failed;
            entry.info.quality = ConnectionQuality::Disconnected;
            if entry.recovering {
                None
            } else {
                entry.recovering = true;
                entry.recovery_epoch += 1;
                Some(entry.recovery_epoch)
            }
        };
        log::warn!("peer {peer_id} transport failed");
        self.emit(PeerEvent::StateChanged {
            peer_id: peer_id.to_string(),
            state: PeerState::Failed,
        });
        self.emit(PeerEvent::QualityChanged {
            peer_id: peer_id.to_string(),
            quality: ConnectionQuality::Disconnected,
        });
        if let Some(epoch) = start_recovery {
            self.spawn_task(
                peer_id,
                maintain::recovery_loop(self.clone(), peer_id.to_string(), epoch),
            );
        }
    }

    pub(crate) fn set_quality(&self, peer_id: &str, quality: ConnectionQuality) {
        let changed = {
            let Some(mut entry) = self.inner.context.peers.get_mut(peer_id) else {
                return;
            };
            let changed = entry.info.quality != quality;
            entry.info.quality = quality;
            changed
        };
        if changed {
            self.emit(PeerEvent::QualityChanged {
                peer_id: peer_id.to_string(),
                quality,
            });
        }
    }

    /// One restart round trip through the registered relay.
    pub(crate) async fn renegotiate(&self, peer_id: &str, attempt: u32) -> Result<()> {
        self.emit(PeerEvent::RenegotiationNeeded {
            peer_id: peer_id.to_string(),
            attempt,
        });
        let relay = self
            .inner
            .relay
            .lock()
            .clone()
            .ok_or_else(|| Error::Negotiation("no renegotiation relay registered".into()))?;
        let transport = self
            .transport(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        let offer = transport.create_offer(true).await.map_err(negotiation)?;
        transport
            .set_local_description(offer)
            .await
            .map_err(negotiation)?;
        self.gather(&transport).await;
        let offer = transport
            .local_description()
            .ok_or_else(|| Error::Negotiation("local restart offer missing".into()))?;
        let answer = relay.relay(peer_id, offer).await.map_err(negotiation)?;
        if !answer.is_answer() {
            return Err(Error::Negotiation("relay returned no answer".into()));
        }
        let states = transport.subscribe();
        transport
            .set_remote_description(answer)
            .await
            .map_err(negotiation)?;
        if transport.connection_state() == TransportState::Connected {
            return Ok(());
        }
        let timeout = self.inner.config.connection_timeout;
        let reconnected = async {
            while let Ok(event) = states.recv_async().await {
                if let TransportEvent::StateChanged(TransportState::Connected) = event {
                    return true;
                }
            }
            false
        };
        match tokio::time::timeout(timeout, reconnected).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Negotiation("transport closed during restart".into())),
            Err(_) => Err(Error::Timeout(format!("restart of {peer_id}"))),
        }
    }
}
