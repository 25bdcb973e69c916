use std::time::Duration;

use peermux_core::idle::classify_quality;

use crate::event::PeerEvent;
use crate::peer::{PeerManager, PeerState};

pub(crate) async fn stats_loop(manager: PeerManager, peer_id: String, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if !poll_stats(&manager, &peer_id) {
            break;
        }
    }
}

/// Refreshes the stats snapshot and re-derives quality while open.
/// Returns `false` once the peer is gone.
fn poll_stats(manager: &PeerManager, peer_id: &str) -> bool {
    let quality_changed = {
        let Some(mut entry) = manager.context().peers.get_mut(peer_id) else {
            return false;
        };
        let buffered = entry
            .primary
            .as_ref()
            .map_or(0, |channel| channel.buffered_amount());
        entry.info.stats = entry.counters.snapshot(buffered);
        entry.info.last_activity = Some(entry.activity.last_activity());
        if entry.info.state != PeerState::Open {
            return true;
        }
        // No round-trip sample is taken, idle time alone drives the bands.
        let quality = classify_quality(entry.activity.idle(), None);
        if entry.info.quality == quality {
            None
        } else {
            entry.info.quality = quality;
            Some(quality)
        }
    };
    if let Some(quality) = quality_changed {
        log::debug!("peer {peer_id} quality {quality:?}");
        manager.emit(PeerEvent::QualityChanged {
            peer_id: peer_id.to_string(),
            quality,
        });
    }
    true
}
