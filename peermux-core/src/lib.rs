//! # peermux-core - Connection Building Blocks
//!
//! `peermux-core` holds the pieces of `peermux` that do not depend on any
//! particular peer: NAT classification, the connection strategy derived from
//! it, connection quality bands and the transport seams the orchestrator drives.
//!
//! ## Architecture
//!
//! - [`nat`] - NAT types and the memoized, single-flight classifier
//! - [`stun`] - STUN binding messages over `stun-format` and a UDP probe that classifies the local NAT
//! - [`strategy`] - Decision table over NAT pairs and ICE configuration
//! - [`idle`] - Activity tracking and connection quality bands
//! - [`transport`] - Peer transport and data channel traits, plus an in-memory network
//!
//! ## NAT Detection
//!
//! ```rust,no_run
//! use peermux_core::nat::NatClassifier;
//! use peermux_core::stun::StunNatProbe;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let probe = StunNatProbe::new(vec![
//!     "stun.l.google.com:19302".to_string(),
//!     "stun1.l.google.com:19302".to_string(),
//! ]);
//! let classifier = NatClassifier::new(Arc::new(probe));
//! let nat = classifier.detect().await;
//! println!("nat {:?} confidence {}", nat.nat_type, nat.confidence);
//! # }
//! ```
//!
//! ## Strategy Selection
//!
//! ```rust
//! use peermux_core::nat::NatType;
//! use peermux_core::strategy::{select_strategy, ConnectionMode};
//!
//! let strategy = select_strategy(NatType::FullCone, NatType::Open);
//! assert_eq!(strategy.mode, ConnectionMode::Direct);
//! assert!(!strategy.use_relay);
//!
//! let strategy = select_strategy(NatType::Symmetric, NatType::Open);
//! assert_eq!(strategy.mode, ConnectionMode::Relay);
//! ```
//!
//! ## Thread Safety
//!
//! All public types are `Send + Sync` and meant to be shared across Tokio tasks.

pub mod error;
pub mod idle;
pub mod nat;
pub mod strategy;
pub mod stun;
pub mod transport;
