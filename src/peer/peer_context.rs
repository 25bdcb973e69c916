use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use peermux_core::idle::{ActivityTracker, ConnectionQuality};
use peermux_core::nat::NatType;
use peermux_core::strategy::ConnectionStrategy;
use peermux_core::transport::{DataChannel, PeerTransport};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Connecting,
    Open,
    Closing,
    Closed,
    /// Transport failure, bounded renegotiation in progress
    Failed,
}

impl PeerState {
    #[inline]
    pub fn is_terminating(&self) -> bool {
        matches!(self, PeerState::Closing | PeerState::Closed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub buffered_amount: usize,
}

/// Live counters of the primary channel, copied into [`PeerStats`] by the stats poll.
#[derive(Default)]
pub(crate) struct PeerCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl PeerCounters {
    pub(crate) fn record_sent(&self, len: usize) {
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_received(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn snapshot(&self, buffered_amount: usize) -> PeerStats {
        PeerStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            buffered_amount,
        }
    }
}

/// Snapshot of one peer as returned by [`PeerManager::get_peer`](super::PeerManager::get_peer).
#[derive(Debug, Clone)]
pub struct PeerConnectionInfo {
    pub peer_id: String,
    pub name: String,
    pub session_id: String,
    pub state: PeerState,
    pub quality: ConnectionQuality,
    pub is_initiator: bool,
    pub strategy: ConnectionStrategy,
    pub reconnect_attempts: u32,
    pub created_at: Instant,
    pub connected_at: Option<Instant>,
    pub last_activity: Option<Instant>,
    pub stats: PeerStats,
}

pub(crate) struct PeerEntry {
    pub(crate) info: PeerConnectionInfo,
    pub(crate) transport: Arc<dyn PeerTransport>,
    /// The responder learns its primary channel from the remote announcement.
    pub(crate) primary: Option<Arc<dyn DataChannel>>,
    pub(crate) activity: Arc<ActivityTracker>,
    pub(crate) counters: Arc<PeerCounters>,
    pub(crate) recovering: bool,
    /// Bumped whenever a recovery starts or ends; a loop holding an older value stops.
    pub(crate) recovery_epoch: u64,
    pub(crate) timers_started: bool,
}

impl PeerEntry {
    pub(crate) fn new(
        info: PeerConnectionInfo,
        transport: Arc<dyn PeerTransport>,
        primary: Option<Arc<dyn DataChannel>>,
    ) -> Self {
        Self {
            info,
            transport,
            primary,
            activity: Arc::new(ActivityTracker::new()),
            counters: Arc::new(PeerCounters::default()),
            recovering: false,
            recovery_epoch: 0,
            timers_started: false,
        }
    }
}

/// Peer registry plus the per-peer task side table.
///
/// Background tasks of a peer are tracked by `peer_id` and aborted before its
/// registry entry is removed.
#[derive(Default)]
pub(crate) struct PeerContext {
    pub(crate) peers: DashMap<String, PeerEntry>,
    pending: Mutex<HashSet<String>>,
    tasks: DashMap<String, Vec<AbortHandle>>,
    pub(crate) remote_nat: DashMap<String, NatType>,
}

impl PeerContext {
    /// Claims `peer_id` for a negotiation in progress.
    pub(crate) fn reserve(&self, peer_id: &str, max_peers: usize) -> Result<Reservation<'_>> {
        let mut pending = self.pending.lock();
        if self.peers.contains_key(peer_id) || pending.contains(peer_id) {
            return Err(Error::DuplicatePeer(peer_id.to_string()));
        }
        if self.peers.len() + pending.len() >= max_peers {
            return Err(Error::PeerLimit { max: max_peers });
        }
        pending.insert(peer_id.to_string());
        Ok(Reservation {
            context: self,
            peer_id: peer_id.to_string(),
        })
    }
    pub(crate) fn state(&self, peer_id: &str) -> Option<PeerState> {
        self.peers.get(peer_id).map(|entry| entry.info.state)
    }
    pub(crate) fn track(&self, peer_id: &str, handle: AbortHandle) {
        let mut slot = self.tasks.entry(peer_id.to_string()).or_default();
        let live = self
            .state(peer_id)
            .map_or(false, |state| !state.is_terminating());
        if live {
            slot.push(handle);
            return;
        }
        handle.abort();
        drop(slot);
        self.tasks.remove_if(peer_id, |_, handles| handles.is_empty());
    }
    pub(crate) fn abort_tasks(&self, peer_id: &str) {
        if let Some((_, handles)) = self.tasks.remove(peer_id) {
            log::debug!("peer {peer_id} aborting {} tasks", handles.len());
            for handle in handles {
                handle.abort();
            }
        }
    }
    #[cfg(test)]
    pub(crate) fn task_count(&self, peer_id: &str) -> usize {
        self.tasks.get(peer_id).map_or(0, |handles| handles.len())
    }
}

pub(crate) struct Reservation<'a> {
    context: &'a PeerContext,
    peer_id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.context.pending.lock().remove(&self.peer_id);
    }
}
