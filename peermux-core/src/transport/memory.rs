//! In-process transports.
//!
//! Every transport created by one [`MemoryTransportFactory`] lives on the same
//! in-memory network. A description produced by one transport names its
//! session, so handing an offer to another transport of the same factory links
//! the two. The answerer is connected once it applies its answer, the offerer
//! once it applies the remote answer. Channels created on either side are
//! announced to the other side when the link comes up.
//!
//! Tests steer the network through [`MemoryTransport::inject_failure`], the
//! [`GatheringMode`] of the factory and the send buffer of a
//! [`MemoryDataChannel`].

use super::{
    ChannelEvent, ChannelState, DataChannel, DataChannelInit, EventFanout, IceCandidate,
    PeerTransport, SessionDescription, TransportEvent, TransportFactory, TransportState,
};
use crate::strategy::IceConfig;
use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;
use flume::Receiver;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const SDP_PREFIX: &str = "memory:";

/// How candidate gathering of new transports behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatheringMode {
    #[default]
    Immediate,
    Delay(Duration),
    /// Gathering never completes.
    Stalled,
}

#[derive(Default)]
struct MemoryNetwork {
    next_id: AtomicU64,
    transports: DashMap<u64, Weak<MemoryTransport>>,
}

#[derive(Default)]
struct FactoryInner {
    network: Arc<MemoryNetwork>,
    gathering: AtomicCell<GatheringMode>,
    created: Mutex<Vec<Weak<MemoryTransport>>>,
}

#[derive(Clone, Default)]
pub struct MemoryTransportFactory {
    inner: Arc<FactoryInner>,
}

impl MemoryTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }
    /// Applies to transports created afterwards.
    pub fn set_gathering(&self, mode: GatheringMode) {
        self.inner.gathering.store(mode);
    }
    /// Every live transport this factory created, in creation order.
    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        self.inner
            .created
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
    pub fn last(&self) -> Option<Arc<MemoryTransport>> {
        self.inner.created.lock().iter().rev().find_map(Weak::upgrade)
    }
    pub fn create_memory(&self, config: &IceConfig) -> Arc<MemoryTransport> {
        let network = self.inner.network.clone();
        let id = network.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let gathering = self.inner.gathering.load();
        let transport = Arc::new(MemoryTransport {
            id,
            network: network.clone(),
            ice_config: config.clone(),
            gathering,
            state: AtomicCell::new(TransportState::New),
            version: AtomicU64::new(1),
            remote: Mutex::new(None),
            local_desc: Mutex::new(None),
            remote_desc: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            local_channels: Mutex::new(Vec::new()),
            announced: Mutex::new(Vec::new()),
            events: EventFanout::new(),
        });
        network
            .transports
            .retain(|_, weak| weak.strong_count() > 0);
        network.transports.insert(id, Arc::downgrade(&transport));
        let mut created = self.inner.created.lock();
        created.retain(|weak| weak.strong_count() > 0);
        created.push(Arc::downgrade(&transport));
        drop(created);
        log::debug!("memory transport {id} created");
        transport
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, config: &IceConfig) -> io::Result<Arc<dyn PeerTransport>> {
        Ok(self.create_memory(config))
    }
}

pub struct MemoryTransport {
    id: u64,
    network: Arc<MemoryNetwork>,
    ice_config: IceConfig,
    gathering: GatheringMode,
    state: AtomicCell<TransportState>,
    version: AtomicU64,
    remote: Mutex<Option<Weak<MemoryTransport>>>,
    local_desc: Mutex<Option<SessionDescription>>,
    remote_desc: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    local_channels: Mutex<Vec<Arc<MemoryDataChannel>>>,
    announced: Mutex<Vec<Arc<MemoryDataChannel>>>,
    events: EventFanout<TransportEvent>,
}

impl MemoryTransport {
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn ice_config(&self) -> &IceConfig {
        &self.ice_config
    }
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }
    /// Drop the link as if connectivity checks had failed.
    pub fn inject_failure(&self) {
        log::debug!("memory transport {} failure injected", self.id);
        self.set_state(TransportState::Failed);
    }
    /// A channel with `label`, created locally or announced by the remote side.
    pub fn channel(&self, label: &str) -> Option<Arc<MemoryDataChannel>> {
        let local = self
            .local_channels
            .lock()
            .iter()
            .find(|c| c.label == label)
            .cloned();
        local.or_else(|| {
            self.announced
                .lock()
                .iter()
                .find(|c| c.label == label)
                .cloned()
        })
    }
    pub fn local_channels(&self) -> Vec<Arc<MemoryDataChannel>> {
        self.local_channels.lock().clone()
    }

    fn set_state(&self, state: TransportState) {
        let current = self.state.load();
        if current == state || current == TransportState::Closed {
            return;
        }
        self.state.store(state);
        self.events.emit(TransportEvent::StateChanged(state));
    }
    fn is_closed(&self) -> bool {
        self.state.load() == TransportState::Closed
    }
    fn ensure_open(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport closed",
            ));
        }
        Ok(())
    }
    fn linked(&self) -> Option<Arc<MemoryTransport>> {
        self.remote.lock().as_ref().and_then(Weak::upgrade)
    }
    fn sdp(&self) -> String {
        format!(
            "{SDP_PREFIX}{}:{}",
            self.id,
            self.version.load(Ordering::Relaxed)
        )
    }
    fn connect(&self) {
        if self.is_closed() {
            return;
        }
        self.set_state(TransportState::Connected);
        let Some(remote) = self.linked() else {
            return;
        };
        if remote.is_closed() {
            return;
        }
        offer_channels(self, &remote);
        offer_channels(&remote, self);
    }
}

fn parse_session_id(sdp: &str) -> Option<u64> {
    sdp.strip_prefix(SDP_PREFIX)?.split(':').next()?.parse().ok()
}

/// Announce every unpaired local channel of `from` on `to`.
fn offer_channels(from: &MemoryTransport, to: &MemoryTransport) {
    let unpaired: Vec<_> = from
        .local_channels
        .lock()
        .iter()
        .filter(|c| !c.is_paired())
        .cloned()
        .collect();
    for local in unpaired {
        let remote_end = MemoryDataChannel::new(local.label.clone(), local.init);
        MemoryDataChannel::link(&local, &remote_end);
        local.open();
        remote_end.open();
        to.announced.lock().push(remote_end.clone());
        to.events.emit(TransportEvent::DataChannel(remote_end));
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&self, ice_restart: bool) -> io::Result<SessionDescription> {
        self.ensure_open()?;
        if ice_restart {
            self.version.fetch_add(1, Ordering::Relaxed);
        }
        if self.state.load() == TransportState::New {
            self.set_state(TransportState::Connecting);
        }
        Ok(SessionDescription::offer(self.sdp()))
    }

    async fn create_answer(&self) -> io::Result<SessionDescription> {
        self.ensure_open()?;
        match self.remote_desc.lock().as_ref() {
            Some(desc) if desc.is_offer() => Ok(SessionDescription::answer(self.sdp())),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no remote offer to answer",
            )),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> io::Result<()> {
        self.ensure_open()?;
        let is_answer = desc.is_answer();
        self.local_desc.lock().replace(desc);
        self.events
            .emit(TransportEvent::IceCandidate(IceCandidate {
                candidate: format!("candidate:memory {} 1 udp 2130706431", self.id),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            }));
        if is_answer && self.linked().is_some() {
            self.connect();
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> io::Result<()> {
        self.ensure_open()?;
        let Some(id) = parse_session_id(&desc.sdp) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed session description",
            ));
        };
        if id == self.id {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "description belongs to this transport",
            ));
        }
        let remote = self
            .network
            .transports
            .get(&id)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown memory session"))?;
        self.remote.lock().replace(Arc::downgrade(&remote));
        let is_answer = desc.is_answer();
        self.remote_desc.lock().replace(desc);
        if self.state.load() == TransportState::New {
            self.set_state(TransportState::Connecting);
        }
        if is_answer {
            self.connect();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> io::Result<()> {
        self.ensure_open()?;
        if self.remote_desc.lock().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "remote description not set",
            ));
        }
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn gathering_complete(&self) {
        match self.gathering {
            GatheringMode::Immediate => {}
            GatheringMode::Delay(delay) => tokio::time::sleep(delay).await,
            GatheringMode::Stalled => std::future::pending::<()>().await,
        }
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.local_desc.lock().clone()
    }

    fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_desc.lock().clone()
    }

    fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> io::Result<Arc<dyn DataChannel>> {
        self.ensure_open()?;
        let channel = MemoryDataChannel::new(label.to_string(), init);
        self.local_channels.lock().push(channel.clone());
        if self.state.load() == TransportState::Connected {
            if let Some(remote) = self.linked().filter(|r| !r.is_closed()) {
                offer_channels(self, &remote);
            }
        }
        Ok(channel)
    }

    fn data_channels(&self) -> Vec<Arc<dyn DataChannel>> {
        self.announced
            .lock()
            .iter()
            .map(|c| c.clone() as Arc<dyn DataChannel>)
            .collect()
    }

    fn connection_state(&self) -> TransportState {
        self.state.load()
    }

    fn subscribe(&self) -> Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.set_state(TransportState::Closed);
        let channels: Vec<_> = self
            .local_channels
            .lock()
            .iter()
            .chain(self.announced.lock().iter())
            .cloned()
            .collect();
        for channel in channels {
            channel.shutdown();
        }
        self.network.transports.remove(&self.id);
        if let Some(remote) = self.linked() {
            remote.set_state(TransportState::Disconnected);
        }
        self.events.close();
        log::debug!("memory transport {} closed", self.id);
    }
}

#[derive(Default)]
struct SendBuffer {
    held: bool,
    queue: VecDeque<Bytes>,
    queued: usize,
    forced: usize,
}

impl SendBuffer {
    fn amount(&self) -> usize {
        self.queued + self.forced
    }
}

pub struct MemoryDataChannel {
    label: String,
    init: DataChannelInit,
    state: AtomicCell<ChannelState>,
    peer: Mutex<Option<Weak<MemoryDataChannel>>>,
    buffer: Mutex<SendBuffer>,
    low_threshold: AtomicUsize,
    sent: AtomicU64,
    events: EventFanout<ChannelEvent>,
}

impl MemoryDataChannel {
    fn new(label: String, init: DataChannelInit) -> Arc<Self> {
        Arc::new(Self {
            label,
            init,
            state: AtomicCell::new(ChannelState::Connecting),
            peer: Mutex::new(None),
            buffer: Mutex::new(SendBuffer::default()),
            low_threshold: AtomicUsize::new(0),
            sent: AtomicU64::new(0),
            events: EventFanout::new(),
        })
    }
    fn link(a: &Arc<Self>, b: &Arc<Self>) {
        a.peer.lock().replace(Arc::downgrade(b));
        b.peer.lock().replace(Arc::downgrade(a));
    }
    fn is_paired(&self) -> bool {
        self.peer.lock().is_some()
    }
    fn open(&self) {
        if self.state.swap(ChannelState::Open) != ChannelState::Open {
            self.events.emit(ChannelEvent::Open);
        }
    }
    fn shutdown(&self) {
        if self.state.swap(ChannelState::Closed) == ChannelState::Closed {
            return;
        }
        self.events.emit(ChannelEvent::Close);
        self.events.close();
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        if let Some(peer) = peer {
            peer.shutdown();
        }
    }
    fn deliver(&self, data: Bytes) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        if let Some(peer) = peer {
            if peer.state.load() == ChannelState::Open {
                peer.events.emit(ChannelEvent::Message(data));
            }
        }
    }
    fn notify_if_drained(&self, before: usize, after: usize) {
        let low = self.low_threshold.load(Ordering::Relaxed);
        if before > low && after <= low {
            self.events.emit(ChannelEvent::BufferedAmountLow);
        }
    }

    pub fn init(&self) -> DataChannelInit {
        self.init
    }
    /// Messages handed to the network so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
    /// Queue sends locally instead of delivering them.
    pub fn hold(&self) {
        self.buffer.lock().held = true;
    }
    /// Deliver everything held and empty the queue.
    pub fn release(&self) {
        let (before, queue) = {
            let mut buffer = self.buffer.lock();
            let before = buffer.amount();
            buffer.held = false;
            buffer.queued = 0;
            (before, std::mem::take(&mut buffer.queue))
        };
        for data in queue {
            self.deliver(data);
        }
        let after = self.buffer.lock().amount();
        self.notify_if_drained(before, after);
    }
    /// Pretend `amount` extra bytes sit in the send buffer.
    pub fn force_buffered_amount(&self, amount: usize) {
        let (before, after) = {
            let mut buffer = self.buffer.lock();
            let before = buffer.amount();
            buffer.forced = amount;
            (before, buffer.amount())
        };
        self.notify_if_drained(before, after);
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    fn label(&self) -> &str {
        &self.label
    }
    fn state(&self) -> ChannelState {
        self.state.load()
    }
    fn buffered_amount(&self) -> usize {
        self.buffer.lock().amount()
    }
    fn buffered_amount_low_threshold(&self) -> usize {
        self.low_threshold.load(Ordering::Relaxed)
    }
    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::Relaxed);
    }
    fn send(&self, data: Bytes) -> io::Result<()> {
        if self.state.load() != ChannelState::Open {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("channel {} not open", self.label),
            ));
        }
        {
            let mut buffer = self.buffer.lock();
            if buffer.held {
                buffer.queued += data.len();
                buffer.queue.push_back(data);
                return Ok(());
            }
        }
        self.deliver(data);
        Ok(())
    }
    fn subscribe(&self) -> Receiver<ChannelEvent> {
        self.events.subscribe()
    }
    async fn close(&self) {
        self.shutdown();
    }
}
