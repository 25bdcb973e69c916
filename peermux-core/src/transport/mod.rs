//! Transport seams.
//!
//! [`PeerTransport`] and [`DataChannel`] describe the WebRTC-like objects the
//! orchestrator drives: offer/answer negotiation, candidate gathering and
//! message-oriented channels with a readable send buffer. The [`memory`]
//! module links transports in-process.

use crate::strategy::IceConfig;
use async_trait::async_trait;
use bytes::Bytes;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;

pub mod memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
    #[inline]
    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }
    #[inline]
    pub fn is_answer(&self) -> bool {
        self.kind == SdpKind::Answer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetransmitPolicy {
    #[default]
    Reliable,
    Unreliable {
        max_retransmits: u16,
    },
    TimeBounded {
        max_lifetime_ms: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelInit {
    pub ordered: bool,
    pub retransmit: RetransmitPolicy,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            ordered: true,
            retransmit: RetransmitPolicy::Reliable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    /// The buffered amount fell from above the low threshold to at or below it.
    BufferedAmountLow,
    Close,
}

#[derive(Clone)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// A channel announced by the remote side.
    DataChannel(Arc<dyn DataChannel>),
    /// A local candidate the caller must relay to the remote side.
    IceCandidate(IceCandidate),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::StateChanged(state) => write!(f, "StateChanged({state:?})"),
            TransportEvent::DataChannel(channel) => write!(f, "DataChannel({})", channel.label()),
            TransportEvent::IceCandidate(candidate) => write!(f, "IceCandidate({candidate:?})"),
        }
    }
}

/// A message channel over a [`PeerTransport`].
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn state(&self) -> ChannelState;
    /// Bytes queued locally and not yet handed to the network.
    fn buffered_amount(&self) -> usize;
    fn buffered_amount_low_threshold(&self) -> usize;
    fn set_buffered_amount_low_threshold(&self, threshold: usize);
    /// Queue `data` without waiting; fails if the channel is not open.
    fn send(&self, data: Bytes) -> io::Result<()>;
    fn subscribe(&self) -> Receiver<ChannelEvent>;
    async fn close(&self);
}

/// One negotiated connection to a remote peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> io::Result<SessionDescription>;
    async fn create_answer(&self) -> io::Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> io::Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> io::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> io::Result<()>;
    /// Resolves once candidate gathering has finished.
    async fn gathering_complete(&self);
    /// The local description including every candidate gathered so far.
    fn local_description(&self) -> Option<SessionDescription>;
    fn remote_description(&self) -> Option<SessionDescription>;
    fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> io::Result<Arc<dyn DataChannel>>;
    /// Remote-announced channels seen so far.
    fn data_channels(&self) -> Vec<Arc<dyn DataChannel>>;
    fn connection_state(&self) -> TransportState;
    fn subscribe(&self) -> Receiver<TransportEvent>;
    async fn close(&self);
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &IceConfig) -> io::Result<Arc<dyn PeerTransport>>;
}

/// Fan-out of events to every live subscriber.
///
/// Events emitted while nobody listens are kept and replayed to the first
/// subscriber, unless the fan-out was built with [`live`](Self::live).
/// After [`close`](Self::close) every stream ends.
pub struct EventFanout<T> {
    inner: Mutex<FanoutInner<T>>,
}

struct FanoutInner<T> {
    senders: Vec<Sender<T>>,
    backlog: Option<Vec<T>>,
    closed: bool,
}

impl<T: Clone> Default for EventFanout<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> EventFanout<T> {
    pub fn new() -> Self {
        Self::build(Some(Vec::new()))
    }
    /// Events emitted without subscribers are dropped.
    pub fn live() -> Self {
        Self::build(None)
    }
    fn build(backlog: Option<Vec<T>>) -> Self {
        Self {
            inner: Mutex::new(FanoutInner {
                senders: Vec::new(),
                backlog,
                closed: false,
            }),
        }
    }
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = flume::unbounded();
        let mut guard = self.inner.lock();
        if guard.closed {
            return rx;
        }
        guard.senders.retain(|s| !s.is_disconnected());
        if guard.senders.is_empty() {
            if let Some(backlog) = guard.backlog.as_mut() {
                for event in backlog.drain(..) {
                    let _ = tx.send(event);
                }
            }
        }
        guard.senders.push(tx);
        rx
    }
    pub fn emit(&self, event: T) {
        let mut guard = self.inner.lock();
        if guard.closed {
            return;
        }
        guard.senders.retain(|s| !s.is_disconnected());
        if guard.senders.is_empty() {
            if let Some(backlog) = guard.backlog.as_mut() {
                backlog.push(event);
            }
            return;
        }
        for sender in &guard.senders {
            let _ = sender.send(event.clone());
        }
    }
    pub fn close(&self) {
        let mut guard = self.inner.lock();
        guard.closed = true;
        guard.senders.clear();
        if let Some(backlog) = guard.backlog.as_mut() {
            backlog.clear();
        }
    }
}
