//! Connection strategy selection.
//!
//! Maps a (local, remote) NAT pair onto a [`ConnectionStrategy`] and tailors the
//! candidate-gathering configuration to it.

use crate::nat::NatType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const PERMISSIVE_DIRECT_TIMEOUT_MS: u32 = 5_000;
pub const HYBRID_DIRECT_TIMEOUT_MS: u32 = 15_000;
pub const SYMMETRIC_DIRECT_TIMEOUT_MS: u32 = 2_000;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Direct,
    Relay,
    Hybrid,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct ConnectionStrategy {
    pub mode: ConnectionMode,
    pub use_relay: bool,
    /// How long a direct path is given before falling back to the relay.
    pub direct_timeout_ms: u32,
}

impl ConnectionStrategy {
    /// The most conservative strategy, used whenever an input is unknown.
    pub fn relay_only() -> Self {
        Self {
            mode: ConnectionMode::Relay,
            use_relay: true,
            direct_timeout_ms: 0,
        }
    }
    pub fn is_direct(&self) -> bool {
        self.mode == ConnectionMode::Direct
    }
    pub fn direct_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_timeout_ms as u64)
    }
}

/// The decision table over NAT pairs.
pub fn select_strategy(local: NatType, remote: NatType) -> ConnectionStrategy {
    if local.is_unknown() || remote.is_unknown() {
        return ConnectionStrategy::relay_only();
    }
    match (local.is_symmetric(), remote.is_symmetric()) {
        (true, true) => ConnectionStrategy::relay_only(),
        (true, false) | (false, true) => ConnectionStrategy {
            mode: ConnectionMode::Relay,
            use_relay: true,
            direct_timeout_ms: SYMMETRIC_DIRECT_TIMEOUT_MS,
        },
        (false, false) if local.is_permissive() && remote.is_permissive() => ConnectionStrategy {
            mode: ConnectionMode::Direct,
            use_relay: false,
            direct_timeout_ms: PERMISSIVE_DIRECT_TIMEOUT_MS,
        },
        (false, false) => ConnectionStrategy {
            mode: ConnectionMode::Hybrid,
            use_relay: true,
            direct_timeout_ms: HYBRID_DIRECT_TIMEOUT_MS,
        },
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCredentials {
    pub username: String,
    pub credential: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// Candidate-gathering configuration handed to the transport.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
    pub transport_policy: IceTransportPolicy,
    pub candidate_pool_size: u8,
}

impl IceConfig {
    pub fn has_relay(&self) -> bool {
        self.ice_servers.iter().any(IceServer::is_relay)
    }
}

#[derive(Clone, Debug, Default)]
pub struct StrategySelector {
    stun_servers: Vec<String>,
    force_relay: bool,
}

impl StrategySelector {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self {
            stun_servers,
            force_relay: false,
        }
    }
    pub fn set_force_relay(mut self, force_relay: bool) -> Self {
        self.force_relay = force_relay;
        self
    }
    pub fn select(&self, local: NatType, remote: NatType) -> ConnectionStrategy {
        if self.force_relay {
            return ConnectionStrategy::relay_only();
        }
        select_strategy(local, remote)
    }
    /// Relay servers are listed whenever the strategy for `nat_type` is not purely direct.
    pub fn optimized_ice_config(
        &self,
        nat_type: NatType,
        relay_server: Option<&str>,
        relay_credentials: Option<&RelayCredentials>,
    ) -> IceConfig {
        let mut ice_servers: Vec<IceServer> = self
            .stun_servers
            .iter()
            .map(|server| {
                if server.starts_with("stun:") {
                    IceServer::stun(server.as_str())
                } else {
                    IceServer::stun(format!("stun:{server}"))
                }
            })
            .collect();
        let purely_direct = !self.force_relay && nat_type.is_permissive();
        let mut transport_policy = IceTransportPolicy::All;
        if let Some(relay) = relay_server.filter(|_| !purely_direct) {
            let url = if relay.starts_with("turn:") || relay.starts_with("turns:") {
                relay.to_string()
            } else {
                format!("turn:{relay}")
            };
            ice_servers.push(IceServer {
                urls: vec![url],
                username: relay_credentials.map(|c| c.username.clone()),
                credential: relay_credentials.map(|c| c.credential.clone()),
            });
            if self.force_relay || nat_type.is_symmetric() {
                transport_policy = IceTransportPolicy::Relay;
            }
        }
        IceConfig {
            ice_servers,
            transport_policy,
            candidate_pool_size: if nat_type.is_permissive() { 0 } else { 2 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NatType::*;

    const ALL: [NatType; 6] = [
        Open,
        FullCone,
        RestrictedCone,
        PortRestrictedCone,
        Symmetric,
        Unknown,
    ];

    #[test]
    fn permissive_pairs_go_direct() {
        for (a, b) in [(Open, Open), (Open, FullCone), (FullCone, FullCone)] {
            let s = select_strategy(a, b);
            assert_eq!(s.mode, ConnectionMode::Direct);
            assert!(!s.use_relay);
            assert_eq!(s.direct_timeout_ms, PERMISSIVE_DIRECT_TIMEOUT_MS);
        }
    }

    #[test]
    fn symmetric_or_unknown_prefers_relay() {
        for other in ALL {
            for hard in [Symmetric, Unknown] {
                for s in [select_strategy(hard, other), select_strategy(other, hard)] {
                    assert_eq!(s.mode, ConnectionMode::Relay, "{hard:?}/{other:?}");
                    assert!(s.use_relay);
                    assert!(s.direct_timeout_ms <= SYMMETRIC_DIRECT_TIMEOUT_MS);
                }
            }
        }
        assert_eq!(select_strategy(Unknown, Open).direct_timeout_ms, 0);
        assert_eq!(select_strategy(Symmetric, Symmetric).direct_timeout_ms, 0);
    }

    #[test]
    fn restricted_combinations_are_hybrid() {
        let s = select_strategy(RestrictedCone, FullCone);
        assert_eq!(s.mode, ConnectionMode::Hybrid);
        assert!(s.use_relay);
        assert_eq!(s.direct_timeout(), Duration::from_secs(15));
        assert_eq!(
            select_strategy(PortRestrictedCone, PortRestrictedCone).mode,
            ConnectionMode::Hybrid
        );
    }

    #[test]
    fn selection_is_symmetric_in_its_inputs() {
        for a in ALL {
            for b in ALL {
                assert_eq!(select_strategy(a, b), select_strategy(b, a));
            }
        }
    }

    #[test]
    fn force_relay_overrides_table() {
        let selector = StrategySelector::default().set_force_relay(true);
        assert_eq!(selector.select(Open, Open), ConnectionStrategy::relay_only());
    }

    #[test]
    fn ice_config_includes_relay_unless_direct() {
        let selector = StrategySelector::new(vec!["stun.l.google.com:19302".to_string()]);
        let creds = RelayCredentials {
            username: "u".into(),
            credential: "p".into(),
        };
        let direct = selector.optimized_ice_config(Open, Some("relay.example:3478"), Some(&creds));
        assert!(!direct.has_relay());
        assert_eq!(direct.ice_servers[0].urls[0], "stun:stun.l.google.com:19302");

        let hybrid =
            selector.optimized_ice_config(RestrictedCone, Some("relay.example:3478"), Some(&creds));
        assert!(hybrid.has_relay());
        assert_eq!(hybrid.transport_policy, IceTransportPolicy::All);
        let relay = hybrid.ice_servers.iter().find(|s| s.is_relay()).unwrap();
        assert_eq!(relay.urls[0], "turn:relay.example:3478");
        assert_eq!(relay.username.as_deref(), Some("u"));

        let symmetric = selector.optimized_ice_config(Symmetric, Some("turn:r:3478"), None);
        assert_eq!(symmetric.transport_policy, IceTransportPolicy::Relay);

        let no_relay = selector.optimized_ice_config(Symmetric, None, None);
        assert!(!no_relay.has_relay());
        assert_eq!(no_relay.transport_policy, IceTransportPolicy::All);
    }
}
