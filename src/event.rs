use bytes::Bytes;
use peermux_core::idle::ConnectionQuality;
use peermux_core::nat::NatClassification;
use peermux_core::strategy::ConnectionStrategy;
use peermux_core::transport::IceCandidate;

use crate::peer::PeerState;

/// Everything a [`PeerManager`](crate::peer::PeerManager) reports to the layer above it.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    Connected {
        peer_id: String,
    },
    /// Emitted exactly once per peer, whatever ended it.
    Disconnected {
        peer_id: String,
        reason: String,
    },
    /// A non-fatal fault of one peer, such as a rejected candidate or a malformed frame.
    /// Reconnect attempts never produce it.
    Error {
        peer_id: String,
        message: String,
    },
    StateChanged {
        peer_id: String,
        state: PeerState,
    },
    QualityChanged {
        peer_id: String,
        quality: ConnectionQuality,
    },
    MessageReceived {
        peer_id: String,
        data: Bytes,
    },
    NatDetected(NatClassification),
    StrategyDetermined {
        peer_id: String,
        strategy: ConnectionStrategy,
    },
    /// A restart offer is about to be built; without a registered relay it cannot be delivered.
    RenegotiationNeeded {
        peer_id: String,
        attempt: u32,
    },
    /// Local candidate to relay to the remote side.
    IceCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    /// The primary channel drained below its low threshold.
    SendReady {
        peer_id: String,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            PeerEvent::Connected { peer_id }
            | PeerEvent::Disconnected { peer_id, .. }
            | PeerEvent::Error { peer_id, .. }
            | PeerEvent::StateChanged { peer_id, .. }
            | PeerEvent::QualityChanged { peer_id, .. }
            | PeerEvent::MessageReceived { peer_id, .. }
            | PeerEvent::StrategyDetermined { peer_id, .. }
            | PeerEvent::RenegotiationNeeded { peer_id, .. }
            | PeerEvent::IceCandidate { peer_id, .. }
            | PeerEvent::SendReady { peer_id } => Some(peer_id),
            PeerEvent::NatDetected(_) => None,
        }
    }
}
