//! # peermux - Peer Connections and Multi-Channel Striping
//!
//! `peermux` manages up to a bounded number of peer connections for direct
//! file transfer. It classifies the local NAT, picks a connection strategy per
//! peer, runs the offer/answer handshake through caller-supplied signaling and
//! keeps each connection alive: keep-alives, idle-based quality, bounded
//! renegotiation after transport failures. On top of an open peer a
//! [`Multiplexer`] stripes self-describing chunks over several sub-channels
//! with per-channel backpressure.
//!
//! ## Architecture
//!
//! - [`peer`] - the [`PeerManager`] registry and its background loops
//! - [`multiplex`] - sub-channel striping, chunk frames and reassembly
//! - [`protocol`] - frames on the primary channel
//! - [`config`] - peer and sub-channel configuration
//! - [`event`] - events reported to the layer above
//! - [`nat`], [`stun`], [`strategy`], [`idle`], [`transport`] - re-exported from `peermux-core`
//!
//! ## Connecting two peers
//!
//! ```rust
//! use peermux::transport::memory::MemoryTransportFactory;
//! use peermux::nat::{NatClassification, NatType, StaticNatProbe};
//! use peermux::Builder;
//!
//! # #[tokio::main]
//! # async fn main() -> peermux::Result<()> {
//! let network = MemoryTransportFactory::new();
//! let probe = StaticNatProbe(NatClassification::new(NatType::FullCone, 1.0));
//! let alice = Builder::new()
//!     .factory(network.clone())
//!     .nat_probe(probe)
//!     .build()?;
//! let bob = Builder::new().factory(network).nat_probe(probe).build()?;
//!
//! let (offer, _primary) = alice.create_connection("bob", "Bob", "session").await?;
//! let answer = bob.accept_connection("alice", "Alice", "session", offer).await?;
//! alice.complete_connection("bob", answer).await?;
//! assert!(alice.send_message("bob", "hello".into()));
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use peermux_core::nat::NatProbe;
use peermux_core::stun::StunNatProbe;
use peermux_core::transport::TransportFactory;

pub mod config;
pub mod error;
pub mod event;
pub mod multiplex;
pub mod peer;
pub mod protocol;

pub use peermux_core::{idle, nat, strategy, stun, transport};

pub use config::{ChannelConfig, PeerConfig, ReconnectPolicy};
pub use error::{Error, Result};
pub use event::PeerEvent;
pub use multiplex::{Chunk, Multiplexer};
pub use peer::{PeerConnectionInfo, PeerManager, PeerState, RenegotiationRelay};

pub struct Builder {
    config: PeerConfig,
    factory: Option<Arc<dyn TransportFactory>>,
    probe: Option<Arc<dyn NatProbe>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            config: PeerConfig::default(),
            factory: None,
            probe: None,
        }
    }
    pub fn config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }
    pub fn max_peers(mut self, max_peers: usize) -> Self {
        self.config = self.config.set_max_peers(max_peers);
        self
    }
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.set_connection_timeout(timeout);
        self
    }
    pub fn stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.config = self.config.set_stun_servers(stun_servers);
        self
    }
    pub fn force_relay(mut self, force_relay: bool) -> Self {
        self.config = self.config.set_force_relay(force_relay);
        self
    }
    pub fn factory<F: TransportFactory + 'static>(mut self, factory: F) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }
    /// Replaces STUN probing against the configured servers.
    pub fn nat_probe<P: NatProbe + 'static>(mut self, probe: P) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }
    pub fn build(self) -> Result<PeerManager> {
        let factory = self
            .factory
            .ok_or_else(|| Error::InvalidConfig("transport factory is required".into()))?;
        let probe: Arc<dyn NatProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(StunNatProbe::new(self.config.stun_servers.clone())),
        };
        PeerManager::new(self.config, factory, probe)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
