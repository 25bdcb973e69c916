use crate::peer::{PeerManager, PeerState, FAILED_AFTER_RETRIES};

/// Bounded renegotiation after a transport failure.
///
/// Each attempt waits out its backoff first. The initiator then runs one restart
/// round trip; the responder only waits for the initiator's restart to land.
/// Once the budget is spent the peer is disconnected and nothing retries again.
/// The loop belongs to one failure: it stops as soon as the peer's recovery
/// epoch moves past `epoch`, even if the peer has failed again since.
pub(crate) async fn recovery_loop(manager: PeerManager, peer_id: String, epoch: u64) {
    let policy = manager.config().reconnect.clone();
    loop {
        let Some((attempts, is_initiator)) = current(&manager, &peer_id, epoch) else {
            return;
        };
        if attempts >= policy.max_attempts {
            log::warn!("peer {peer_id} giving up after {attempts} reconnect attempts");
            manager.spawn_disconnect(&peer_id, FAILED_AFTER_RETRIES);
            return;
        }
        let attempt = attempts + 1;
        if let Some(mut entry) = manager.context().peers.get_mut(&peer_id) {
            entry.info.reconnect_attempts = attempt;
        }
        let delay = policy.backoff(attempt);
        log::info!(
            "peer {peer_id} reconnect attempt {attempt}/{} in {delay:?}",
            policy.max_attempts
        );
        tokio::time::sleep(delay).await;
        if current(&manager, &peer_id, epoch).is_none() {
            return;
        }
        if !is_initiator {
            continue;
        }
        match manager.renegotiate(&peer_id, attempt).await {
            Ok(()) => {
                manager.mark_open(&peer_id);
                return;
            }
            Err(e) => log::warn!("peer {peer_id} reconnect attempt {attempt} e={e:?}"),
        }
    }
}

/// Attempts so far and the initiator flag, while the peer is still failed under `epoch`.
fn current(manager: &PeerManager, peer_id: &str, epoch: u64) -> Option<(u32, bool)> {
    let entry = manager.context().peers.get(peer_id)?;
    if entry.info.state != PeerState::Failed || entry.recovery_epoch != epoch {
        return None;
    }
    Some((entry.info.reconnect_attempts, entry.info.is_initiator))
}
