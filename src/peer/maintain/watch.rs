use std::sync::Arc;

use bytes::Bytes;
use flume::Receiver;
use peermux_core::idle::{ActivityTracker, ConnectionQuality};
use peermux_core::transport::{ChannelEvent, DataChannel, TransportEvent, TransportState};

use crate::config::PRIMARY_CHANNEL_LABEL;
use crate::event::PeerEvent;
use crate::peer::peer_context::PeerCounters;
use crate::peer::PeerManager;
use crate::protocol::PrimaryFrame;

pub(crate) async fn transport_watch_loop(
    manager: PeerManager,
    peer_id: String,
    events: Receiver<TransportEvent>,
) {
    while let Ok(event) = events.recv_async().await {
        match event {
            TransportEvent::StateChanged(state) => {
                log::debug!("peer {peer_id} transport {state:?}");
                match state {
                    TransportState::Connected => manager.mark_open(&peer_id),
                    TransportState::Failed => manager.mark_failed(&peer_id),
                    TransportState::Disconnected => {
                        manager.set_quality(&peer_id, ConnectionQuality::Disconnected)
                    }
                    TransportState::Closed => {
                        manager.spawn_disconnect(&peer_id, "transport closed");
                        break;
                    }
                    TransportState::New | TransportState::Connecting => {}
                }
            }
            TransportEvent::DataChannel(channel) => {
                if channel.label() == PRIMARY_CHANNEL_LABEL {
                    manager.adopt_primary(&peer_id, channel);
                }
            }
            TransportEvent::IceCandidate(candidate) => {
                manager.emit(PeerEvent::IceCandidate {
                    peer_id: peer_id.clone(),
                    candidate,
                });
            }
        }
    }
}

pub(crate) async fn primary_read_loop(
    manager: PeerManager,
    peer_id: String,
    channel: Arc<dyn DataChannel>,
    activity: Arc<ActivityTracker>,
    counters: Arc<PeerCounters>,
) {
    let events = channel.subscribe();
    while let Ok(event) = events.recv_async().await {
        match event {
            ChannelEvent::Open => log::debug!("peer {peer_id} primary channel open"),
            ChannelEvent::Message(buf) => {
                activity.touch();
                on_frame(&manager, &peer_id, &counters, buf);
            }
            ChannelEvent::BufferedAmountLow => manager.emit(PeerEvent::SendReady {
                peer_id: peer_id.clone(),
            }),
            ChannelEvent::Close => {
                manager.spawn_disconnect(&peer_id, "channel closed");
                break;
            }
        }
    }
}

fn on_frame(manager: &PeerManager, peer_id: &str, counters: &PeerCounters, buf: Bytes) {
    match PrimaryFrame::decode(buf) {
        Ok(PrimaryFrame::UserData(data)) => {
            counters.record_received(data.len());
            manager.emit(PeerEvent::MessageReceived {
                peer_id: peer_id.to_string(),
                data,
            });
        }
        Ok(PrimaryFrame::KeepAlive { timestamp_ms }) => {
            log::trace!("peer {peer_id} keep-alive {timestamp_ms}");
        }
        Err(e) => {
            log::warn!("peer {peer_id} dropped primary frame {e:?}");
            manager.emit(PeerEvent::Error {
                peer_id: peer_id.to_string(),
                message: e.to_string(),
            });
        }
    }
}
