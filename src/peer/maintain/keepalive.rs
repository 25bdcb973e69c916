use std::time::Duration;

use crate::config::PRIMARY_HIGH_THRESHOLD;
use crate::peer::{PeerManager, PeerState};
use crate::protocol::{now_millis, PrimaryFrame};

pub(crate) async fn keepalive_loop(manager: PeerManager, peer_id: String, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(state) = manager.context().state(&peer_id) else {
            break;
        };
        if state != PeerState::Open {
            continue;
        }
        let Some(channel) = manager.primary_channel(&peer_id) else {
            continue;
        };
        if channel.buffered_amount() >= PRIMARY_HIGH_THRESHOLD {
            continue;
        }
        let frame = PrimaryFrame::KeepAlive {
            timestamp_ms: now_millis(),
        };
        if let Err(e) = channel.send(frame.encode()) {
            log::debug!("peer {peer_id} keep-alive e={e:?}");
        }
    }
}
