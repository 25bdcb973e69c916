use crossbeam_utils::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Idle time after which a connection is at best `Fair`.
pub const FAIR_IDLE: Duration = Duration::from_secs(15);
/// Idle time after which a connection is `Poor`.
pub const POOR_IDLE: Duration = Duration::from_secs(30);
pub const EXCELLENT_RTT: Duration = Duration::from_millis(100);
pub const GOOD_RTT: Duration = Duration::from_millis(200);

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    #[default]
    Good,
    Fair,
    Poor,
    Disconnected,
}

/// Quality of a live connection from its idle time and, when measured, its round-trip time.
///
/// Idle bands dominate. Without an RTT sample an active connection counts as excellent.
pub fn classify_quality(idle: Duration, rtt: Option<Duration>) -> ConnectionQuality {
    if idle >= POOR_IDLE {
        return ConnectionQuality::Poor;
    }
    if idle >= FAIR_IDLE {
        return ConnectionQuality::Fair;
    }
    match rtt {
        None => ConnectionQuality::Excellent,
        Some(rtt) if rtt < EXCELLENT_RTT => ConnectionQuality::Excellent,
        Some(rtt) if rtt < GOOD_RTT => ConnectionQuality::Good,
        Some(_) => ConnectionQuality::Fair,
    }
}

/// Last time anything was read from or written to a peer.
pub struct ActivityTracker {
    last: AtomicCell<Instant>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: AtomicCell::new(Instant::now()),
        }
    }
    pub fn touch(&self) {
        self.last.store(Instant::now());
    }
    pub fn last_activity(&self) -> Instant {
        self.last.load()
    }
    pub fn idle(&self) -> Duration {
        self.last.load().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_bands() {
        assert_eq!(classify_quality(Duration::from_secs(1), None), ConnectionQuality::Excellent);
        assert_eq!(classify_quality(Duration::from_secs(15), None), ConnectionQuality::Fair);
        assert_eq!(classify_quality(Duration::from_millis(29_999), None), ConnectionQuality::Fair);
        assert_eq!(classify_quality(Duration::from_secs(30), None), ConnectionQuality::Poor);
    }

    #[test]
    fn rtt_bands_apply_while_active() {
        let active = Duration::from_secs(2);
        let ms = Duration::from_millis;
        assert_eq!(classify_quality(active, Some(ms(99))), ConnectionQuality::Excellent);
        assert_eq!(classify_quality(active, Some(ms(100))), ConnectionQuality::Good);
        assert_eq!(classify_quality(active, Some(ms(199))), ConnectionQuality::Good);
        assert_eq!(classify_quality(active, Some(ms(450))), ConnectionQuality::Fair);
        assert_eq!(classify_quality(POOR_IDLE, Some(ms(10))), ConnectionQuality::Poor);
    }

    #[test]
    fn touch_resets_idle() {
        let tracker = ActivityTracker::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(tracker.idle() >= Duration::from_millis(20));
        tracker.touch();
        assert!(tracker.idle() < Duration::from_millis(20));
    }
}
