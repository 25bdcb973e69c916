//! NAT (Network Address Translation) classification.
//!
//! The classification drives the connection strategy: permissive NATs are
//! attempted directly, symmetric or unknown NATs go through a relay.
//!
//! # Examples
//!
//! ```rust
//! use peermux_core::nat::{NatClassification, NatType};
//!
//! let nat = NatClassification::new(NatType::FullCone, 0.9);
//! assert!(nat.nat_type.is_permissive());
//! assert!(!NatType::Unknown.is_permissive());
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Default bound on one whole probing pass.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Type of NAT in front of the local device.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NatType {
    /// No translation, the local address is publicly reachable
    Open,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    /// Mapping changes per destination, direct paths rarely work
    Symmetric,
    #[default]
    Unknown,
}

impl NatType {
    /// Open or full-cone: any remote can reach the mapped address.
    #[inline]
    pub fn is_permissive(&self) -> bool {
        matches!(self, NatType::Open | NatType::FullCone)
    }
    #[inline]
    pub fn is_cone(&self) -> bool {
        matches!(
            self,
            NatType::FullCone | NatType::RestrictedCone | NatType::PortRestrictedCone
        )
    }
    #[inline]
    pub fn is_symmetric(&self) -> bool {
        self == &NatType::Symmetric
    }
    #[inline]
    pub fn is_unknown(&self) -> bool {
        self == &NatType::Unknown
    }
}

/// Result of one probing pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NatClassification {
    pub nat_type: NatType,
    /// 0..=1
    pub confidence: f32,
}

impl NatClassification {
    pub fn new(nat_type: NatType, confidence: f32) -> Self {
        Self {
            nat_type,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
    /// The value reported when probing fails; callers treat it as the hardest case.
    pub fn unknown() -> Self {
        Self {
            nat_type: NatType::Unknown,
            confidence: 0.0,
        }
    }
}

impl Default for NatClassification {
    fn default() -> Self {
        Self::unknown()
    }
}

/// One probing pass over the local network.
#[async_trait]
pub trait NatProbe: Send + Sync {
    async fn probe(&self) -> io::Result<NatClassification>;
}

/// A probe that always reports the same classification.
///
/// Useful when the NAT type is known out of band, and in tests.
#[derive(Clone, Copy, Debug)]
pub struct StaticNatProbe(pub NatClassification);

#[async_trait]
impl NatProbe for StaticNatProbe {
    async fn probe(&self) -> io::Result<NatClassification> {
        Ok(self.0)
    }
}

/// Memoized, single-flight NAT classification.
///
/// The first caller of [`detect`](Self::detect) runs the probe, concurrent
/// callers await the same pending result, and the outcome is kept until
/// [`reset`](Self::reset).
pub struct NatClassifier {
    probe: Arc<dyn NatProbe>,
    timeout: Duration,
    cell: Mutex<Arc<OnceCell<NatClassification>>>,
}

impl NatClassifier {
    pub fn new(probe: Arc<dyn NatProbe>) -> Self {
        Self::with_timeout(probe, DEFAULT_PROBE_TIMEOUT)
    }
    pub fn with_timeout(probe: Arc<dyn NatProbe>, timeout: Duration) -> Self {
        Self {
            probe,
            timeout,
            cell: Mutex::new(Arc::new(OnceCell::new())),
        }
    }
    /// Never fails: a failed or timed out probe yields [`NatClassification::unknown`].
    pub async fn detect(&self) -> NatClassification {
        let cell = self.cell.lock().clone();
        *cell.get_or_init(|| self.run_probe()).await
    }
    /// The memoized result, without probing.
    pub fn cached(&self) -> Option<NatClassification> {
        self.cell.lock().get().copied()
    }
    /// Drop the memoized result so the next `detect` probes again.
    /// A probe already in flight completes into the discarded cell.
    pub fn reset(&self) {
        *self.cell.lock() = Arc::new(OnceCell::new());
    }
    async fn run_probe(&self) -> NatClassification {
        match tokio::time::timeout(self.timeout, self.probe.probe()).await {
            Ok(Ok(classification)) => {
                log::info!(
                    "nat detected {:?} confidence={}",
                    classification.nat_type,
                    classification.confidence
                );
                classification
            }
            Ok(Err(e)) => {
                log::warn!("nat probe failed {e:?}");
                NatClassification::unknown()
            }
            Err(_) => {
                log::warn!("nat probe timeout after {:?}", self.timeout);
                NatClassification::unknown()
            }
        }
    }
}
