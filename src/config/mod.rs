use std::time::Duration;

use crate::error::{Error, Result};
use peermux_core::strategy::RelayCredentials;
use peermux_core::transport::{DataChannelInit, RetransmitPolicy};
use serde::{Deserialize, Serialize};

pub(crate) const MAX_PEERS: usize = 10;
pub(crate) const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const STATS_INTERVAL: Duration = Duration::from_secs(2);
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

pub const PRIMARY_CHANNEL_LABEL: &str = "primary";
pub const PRIMARY_HIGH_THRESHOLD: usize = 16 * 1024 * 1024;
pub const PRIMARY_LOW_THRESHOLD: usize = 4 * 1024 * 1024;

pub const MIN_SUB_CHANNELS: usize = 1;
pub const MAX_SUB_CHANNELS: usize = 8;
pub(crate) const SUB_CHANNELS: usize = 3;
pub(crate) const SUB_HIGH_THRESHOLD: usize = 1024 * 1024;
pub(crate) const SUB_LOW_THRESHOLD: usize = 256 * 1024;

#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub max_peers: usize,
    /// Upper bound on candidate gathering; negotiation proceeds with partial results.
    pub connection_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub stats_interval: Duration,
    pub keepalive_interval: Duration,
    pub force_relay: bool,
    pub stun_servers: Vec<String>,
    pub relay_server: Option<String>,
    pub relay_credentials: Option<RelayCredentials>,
    /// Ordering and retransmission of the primary channel.
    pub primary_init: DataChannelInit,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_peers: MAX_PEERS,
            connection_timeout: CONNECTION_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            stats_interval: STATS_INTERVAL,
            keepalive_interval: KEEPALIVE_INTERVAL,
            force_relay: false,
            stun_servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
            ],
            relay_server: None,
            relay_credentials: None,
            primary_init: DataChannelInit::default(),
        }
    }
}

impl PeerConfig {
    pub fn empty() -> Self {
        Self::default()
    }
    pub fn set_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }
    pub fn set_connection_timeout(mut self, connection_timeout: Duration) -> Self {
        self.connection_timeout = connection_timeout;
        self
    }
    pub fn set_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
    pub fn set_stats_interval(mut self, stats_interval: Duration) -> Self {
        self.stats_interval = stats_interval;
        self
    }
    pub fn set_keepalive_interval(mut self, keepalive_interval: Duration) -> Self {
        self.keepalive_interval = keepalive_interval;
        self
    }
    pub fn set_force_relay(mut self, force_relay: bool) -> Self {
        self.force_relay = force_relay;
        self
    }
    pub fn set_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }
    pub fn set_relay_server(mut self, relay_server: String) -> Self {
        self.relay_server.replace(relay_server);
        self
    }
    pub fn set_relay_credentials(mut self, relay_credentials: RelayCredentials) -> Self {
        self.relay_credentials.replace(relay_credentials);
        self
    }
    pub fn set_primary_init(mut self, primary_init: DataChannelInit) -> Self {
        self.primary_init = primary_init;
        self
    }
    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 {
            return Err(Error::InvalidConfig("max_peers must be at least 1".into()));
        }
        if self.stats_interval.is_zero() || self.keepalive_interval.is_zero() {
            return Err(Error::InvalidConfig("timer intervals must be non-zero".into()));
        }
        self.reconnect.validate()
    }
}

/// Bounded renegotiation budget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub schedule: Vec<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            schedule: vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
            ],
        }
    }
}

impl ReconnectPolicy {
    pub fn set_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
    pub fn set_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.schedule = schedule;
        self
    }
    /// Delay before the 1-based `attempt`; attempts past the schedule reuse its last entry.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.schedule.len().saturating_sub(1));
        self.schedule.get(index).copied().unwrap_or_default()
    }
    pub fn validate(&self) -> Result<()> {
        if self.schedule.is_empty() {
            return Err(Error::InvalidConfig("reconnect schedule is empty".into()));
        }
        Ok(())
    }
}

/// Sub-channel configuration of a [`Multiplexer`](crate::multiplex::Multiplexer).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_count: usize,
    pub ordered: bool,
    pub retransmit: RetransmitPolicy,
    pub buffer_high_threshold: usize,
    pub buffer_low_threshold: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel_count: SUB_CHANNELS,
            ordered: true,
            retransmit: RetransmitPolicy::Reliable,
            buffer_high_threshold: SUB_HIGH_THRESHOLD,
            buffer_low_threshold: SUB_LOW_THRESHOLD,
        }
    }
}

impl ChannelConfig {
    pub fn set_channel_count(mut self, channel_count: usize) -> Self {
        self.channel_count = channel_count;
        self
    }
    pub fn set_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }
    pub fn set_retransmit(mut self, retransmit: RetransmitPolicy) -> Self {
        self.retransmit = retransmit;
        self
    }
    pub fn set_thresholds(mut self, high: usize, low: usize) -> Self {
        self.buffer_high_threshold = high;
        self.buffer_low_threshold = low;
        self
    }
    pub fn init(&self) -> DataChannelInit {
        DataChannelInit {
            ordered: self.ordered,
            retransmit: self.retransmit,
        }
    }
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SUB_CHANNELS..=MAX_SUB_CHANNELS).contains(&self.channel_count) {
            return Err(Error::InvalidChannelCount(self.channel_count));
        }
        if self.buffer_low_threshold >= self.buffer_high_threshold {
            return Err(Error::InvalidThresholds {
                low: self.buffer_low_threshold,
                high: self.buffer_high_threshold,
            });
        }
        Ok(())
    }
}
