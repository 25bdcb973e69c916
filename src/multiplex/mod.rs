//! Chunk striping over several sub-channels of one peer connection.
//!
//! The initiator creates `N` sub-channels labelled `mux:{index}/{N}`, the
//! responder collects the `N` announcements. Outbound chunks go round-robin to
//! the next sub-channel that is open and not paused. A sub-channel pauses once
//! its buffer reaches the high threshold and resumes only on its own drain
//! signal, so the pause has the hysteresis of the low threshold. Every frame is
//! self-describing and inbound chunks are reassembled per transfer regardless
//! of the sub-channel or the order they arrived in.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use peermux_core::transport::{ChannelEvent, ChannelState, DataChannel, PeerTransport, TransportEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::config::ChannelConfig;
use crate::error::{Error, Result};

mod frame;
mod reassembly;

pub use frame::{decode_chunk, encode_chunk, Chunk};
pub use reassembly::ReassemblyBuffer;

pub const LABEL_PREFIX: &str = "mux:";
/// Bound on collecting the remote sub-channel announcements.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_SEND_RETRIES: usize = 5;
/// Bound on one wait for a drain signal during batch sends.
pub const DRAIN_WAIT: Duration = Duration::from_secs(1);

pub fn sub_channel_label(index: usize, count: usize) -> String {
    format!("{LABEL_PREFIX}{index}/{count}")
}

/// `(index, count)` of a sub-channel label, `None` for labels of other channels.
fn parse_label(label: &str) -> Option<Option<(usize, usize)>> {
    let rest = label.strip_prefix(LABEL_PREFIX)?;
    let parsed = rest
        .split_once('/')
        .and_then(|(index, count)| Some((index.parse().ok()?, count.parse().ok()?)));
    Some(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub index: usize,
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub buffered_amount: usize,
    pub paused: bool,
    pub state: ChannelState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MultiplexStats {
    pub total_bytes_sent: u64,
    pub total_chunks_sent: u64,
    pub total_bytes_received: u64,
    pub total_chunks_received: u64,
    pub total_buffered_amount: usize,
    pub paused_channels: usize,
    pub channels: Vec<ChannelStats>,
}

struct SubChannel {
    index: usize,
    channel: Arc<dyn DataChannel>,
    paused: AtomicBool,
    bytes_sent: AtomicU64,
    chunks_sent: AtomicU64,
    bytes_received: AtomicU64,
    chunks_received: AtomicU64,
}

impl SubChannel {
    fn new(index: usize, channel: Arc<dyn DataChannel>) -> Self {
        Self {
            index,
            channel,
            paused: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            chunks_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            chunks_received: AtomicU64::new(0),
        }
    }
    fn stats(&self) -> ChannelStats {
        ChannelStats {
            index: self.index,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            buffered_amount: self.channel.buffered_amount(),
            paused: self.paused.load(Ordering::Acquire),
            state: self.channel.state(),
        }
    }
}

struct MuxInner {
    peer_id: String,
    config: ChannelConfig,
    channels: Vec<SubChannel>,
    next: AtomicUsize,
    /// At most one pending drain waiter; a new registration replaces the old one.
    waiter: Mutex<Option<oneshot::Sender<()>>>,
    reassembly: ReassemblyBuffer,
    inbound: Receiver<Chunk>,
    /// Chunks pulled off `inbound` by `clear_transfer` that belong to other transfers.
    requeued: Mutex<VecDeque<Chunk>>,
    pumps: Mutex<Vec<AbortHandle>>,
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        for pump in self.pumps.get_mut().drain(..) {
            pump.abort();
        }
    }
}

/// Striper over the sub-channels of one peer. Cheap to clone.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Initiator side: creates every sub-channel.
    pub fn open(
        peer_id: &str,
        transport: &Arc<dyn PeerTransport>,
        config: ChannelConfig,
    ) -> Result<Self> {
        config.validate()?;
        let count = config.channel_count;
        let mut channels = Vec::with_capacity(count);
        for index in 0..count {
            let label = sub_channel_label(index, count);
            let channel = transport.create_data_channel(&label, config.init())?;
            channels.push(channel);
        }
        log::debug!("peer {peer_id} opened {count} sub-channels");
        Ok(Self::start(peer_id, config, channels))
    }

    /// Responder side: waits up to [`INIT_TIMEOUT`] for all sub-channel announcements.
    pub async fn accept(
        peer_id: &str,
        transport: &Arc<dyn PeerTransport>,
        config: ChannelConfig,
    ) -> Result<Self> {
        config.validate()?;
        let count = config.channel_count;
        let events = transport.subscribe();
        let mut slots: Vec<Option<Arc<dyn DataChannel>>> = vec![None; count];
        for channel in transport.data_channels() {
            place(&mut slots, channel)?;
        }
        match tokio::time::timeout(INIT_TIMEOUT, collect_announcements(&events, &mut slots)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "{count} sub-channels from {peer_id}"
                )))
            }
        }
        let channels = slots.into_iter().flatten().collect();
        log::debug!("peer {peer_id} accepted {count} sub-channels");
        Ok(Self::start(peer_id, config, channels))
    }

    fn start(peer_id: &str, config: ChannelConfig, channels: Vec<Arc<dyn DataChannel>>) -> Self {
        let (inbound_tx, inbound_rx) = flume::unbounded();
        let channels: Vec<SubChannel> = channels
            .into_iter()
            .enumerate()
            .map(|(index, channel)| {
                channel.set_buffered_amount_low_threshold(config.buffer_low_threshold);
                SubChannel::new(index, channel)
            })
            .collect();
        let inner = Arc::new(MuxInner {
            peer_id: peer_id.to_string(),
            config,
            channels,
            next: AtomicUsize::new(0),
            waiter: Mutex::new(None),
            reassembly: ReassemblyBuffer::new(),
            inbound: inbound_rx,
            requeued: Mutex::new(VecDeque::new()),
            pumps: Mutex::new(Vec::new()),
        });
        let pumps = (0..inner.channels.len())
            .map(|index| {
                let events = inner.channels[index].channel.subscribe();
                tokio::spawn(pump(
                    Arc::downgrade(&inner),
                    index,
                    events,
                    inbound_tx.clone(),
                ))
                .abort_handle()
            })
            .collect();
        *inner.pumps.lock() = pumps;
        Self { inner }
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }
    pub fn is_paused(&self, index: usize) -> bool {
        self.inner
            .channels
            .get(index)
            .map_or(false, |sub| sub.paused.load(Ordering::Acquire))
    }

    /// Sends one chunk on the next eligible sub-channel and returns its index.
    ///
    /// Fails with [`Error::Backpressure`] when every open sub-channel is paused,
    /// and with [`Error::ChannelsClosed`] when none is open.
    pub fn send_chunk(&self, chunk: &Chunk) -> Result<usize> {
        self.send_frame(encode_chunk(chunk)?)
    }

    fn send_frame(&self, frame: Bytes) -> Result<usize> {
        let inner = &self.inner;
        let count = inner.channels.len();
        let high = inner.config.buffer_high_threshold;
        let low = inner.config.buffer_low_threshold;
        let start = inner.next.load(Ordering::Relaxed);
        let mut open = 0;
        for offset in 0..count {
            let index = (start + offset) % count;
            let sub = &inner.channels[index];
            if sub.channel.state() != ChannelState::Open {
                continue;
            }
            open += 1;
            if sub.paused.load(Ordering::Acquire) {
                continue;
            }
            if sub.channel.buffered_amount() >= high {
                sub.paused.store(true, Ordering::Release);
                // a drain that landed before the store has already signalled
                if sub.channel.buffered_amount() > low {
                    log::debug!("peer {} sub-channel {index} paused", inner.peer_id);
                    continue;
                }
                sub.paused.store(false, Ordering::Release);
            }
            if let Err(e) = sub.channel.send(frame.clone()) {
                log::warn!("peer {} sub-channel {index} send e={e:?}", inner.peer_id);
                continue;
            }
            sub.bytes_sent
                .fetch_add(frame.len() as u64, Ordering::Relaxed);
            sub.chunks_sent.fetch_add(1, Ordering::Relaxed);
            inner.next.store((index + 1) % count, Ordering::Relaxed);
            return Ok(index);
        }
        if open == 0 {
            return Err(Error::ChannelsClosed);
        }
        Err(Error::Backpressure)
    }

    /// Sends every chunk in order, waiting for drain signals while backpressured.
    ///
    /// Each chunk gets [`MAX_SEND_RETRIES`] retries. Returns the number of chunks sent.
    pub async fn send_batch(&self, chunks: &[Chunk]) -> Result<usize> {
        for chunk in chunks {
            let frame = encode_chunk(chunk)?;
            let mut retries = 0;
            loop {
                let drained = self.register_waiter();
                match self.send_frame(frame.clone()) {
                    Ok(_) => break,
                    Err(Error::Backpressure) if retries < MAX_SEND_RETRIES => {
                        retries += 1;
                        log::debug!(
                            "peer {} backpressured, retry {retries}/{MAX_SEND_RETRIES}",
                            self.inner.peer_id
                        );
                        let _ = tokio::time::timeout(DRAIN_WAIT, drained).await;
                    }
                    Err(Error::Backpressure) => {
                        return Err(Error::AllChannelsBlocked { retries });
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(chunks.len())
    }

    /// Resolves on the next drain of any sub-channel, or errors once replaced by a newer waiter.
    pub fn register_waiter(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.waiter.lock().replace(tx);
        rx
    }

    /// Next inbound chunk from any sub-channel. Errors once every sub-channel has closed.
    pub async fn recv(&self) -> Result<Chunk> {
        if let Some(chunk) = self.inner.requeued.lock().pop_front() {
            return Ok(chunk);
        }
        self.inner.inbound.recv_async().await.map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "sub-channels closed",
            ))
        })
    }
    pub fn reassembly(&self) -> &ReassemblyBuffer {
        &self.inner.reassembly
    }
    pub fn ordered_chunks(&self, transfer_id: &str) -> Vec<Chunk> {
        self.inner.reassembly.ordered(transfer_id)
    }
    /// Releases a transfer, including its chunks still waiting for [`recv`](Self::recv).
    pub fn clear_transfer(&self, transfer_id: &str) -> usize {
        let cleared = self.inner.reassembly.clear(transfer_id);
        let mut requeued = self.inner.requeued.lock();
        requeued.retain(|chunk| chunk.transfer_id != transfer_id);
        requeued.extend(
            self.inner
                .inbound
                .drain()
                .filter(|chunk| chunk.transfer_id != transfer_id),
        );
        cleared
    }
    /// Inbound chunks not yet taken by [`recv`](Self::recv).
    pub fn pending_chunks(&self) -> usize {
        self.inner.requeued.lock().len() + self.inner.inbound.len()
    }

    pub fn channel_stats(&self, index: usize) -> Option<ChannelStats> {
        self.inner.channels.get(index).map(SubChannel::stats)
    }
    pub fn stats(&self) -> MultiplexStats {
        let channels: Vec<ChannelStats> = self.inner.channels.iter().map(SubChannel::stats).collect();
        MultiplexStats {
            total_bytes_sent: channels.iter().map(|c| c.bytes_sent).sum(),
            total_chunks_sent: channels.iter().map(|c| c.chunks_sent).sum(),
            total_bytes_received: channels.iter().map(|c| c.bytes_received).sum(),
            total_chunks_received: channels.iter().map(|c| c.chunks_received).sum(),
            total_buffered_amount: channels.iter().map(|c| c.buffered_amount).sum(),
            paused_channels: channels.iter().filter(|c| c.paused).count(),
            channels,
        }
    }

    /// Closes every sub-channel and stops the pumps.
    pub async fn close(&self) {
        for pump in self.inner.pumps.lock().drain(..) {
            pump.abort();
        }
        self.inner.waiter.lock().take();
        for sub in &self.inner.channels {
            sub.channel.close().await;
        }
        log::debug!("peer {} sub-channels closed", self.inner.peer_id);
    }
}

async fn collect_announcements(
    events: &Receiver<TransportEvent>,
    slots: &mut [Option<Arc<dyn DataChannel>>],
) -> Result<()> {
    while slots.iter().any(Option::is_none) {
        match events.recv_async().await {
            Ok(TransportEvent::DataChannel(channel)) => place(slots, channel)?,
            Ok(_) => {}
            Err(_) => {
                return Err(Error::Negotiation(
                    "transport closed before sub-channels arrived".into(),
                ))
            }
        }
    }
    Ok(())
}

fn place(slots: &mut [Option<Arc<dyn DataChannel>>], channel: Arc<dyn DataChannel>) -> Result<()> {
    let count = slots.len();
    let parsed = match parse_label(channel.label()) {
        None => return Ok(()),
        Some(parsed) => parsed,
    };
    match parsed {
        Some((index, total)) if total == count && index < count => {
            if slots[index].is_none() {
                slots[index] = Some(channel);
            }
            Ok(())
        }
        _ => Err(Error::ChannelMismatch {
            label: channel.label().to_string(),
        }),
    }
}

async fn pump(
    inner: Weak<MuxInner>,
    index: usize,
    events: Receiver<ChannelEvent>,
    inbound: Sender<Chunk>,
) {
    while let Ok(event) = events.recv_async().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let sub = &inner.channels[index];
        match event {
            ChannelEvent::Open => {}
            ChannelEvent::Message(buf) => {
                let len = buf.len();
                match decode_chunk(buf) {
                    Ok(chunk) => {
                        sub.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                        sub.chunks_received.fetch_add(1, Ordering::Relaxed);
                        inner.reassembly.insert(chunk.clone());
                        let _ = inbound.send(chunk);
                    }
                    Err(e) => log::warn!(
                        "peer {} sub-channel {index} dropped frame {e:?}",
                        inner.peer_id
                    ),
                }
            }
            ChannelEvent::BufferedAmountLow => {
                sub.paused.store(false, Ordering::Release);
                if let Some(waiter) = inner.waiter.lock().take() {
                    let _ = waiter.send(());
                }
            }
            ChannelEvent::Close => {
                log::debug!("peer {} sub-channel {index} closed", inner.peer_id);
                break;
            }
        }
    }
}
