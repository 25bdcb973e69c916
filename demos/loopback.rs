use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use env_logger::Env;

use peermux::nat::{NatClassification, NatType, StaticNatProbe};
use peermux::transport::memory::MemoryTransportFactory;
use peermux::{Builder, ChannelConfig, Chunk, PeerEvent};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of sub-channels to stripe over, 1 to 8.
    #[arg(short, long, default_value_t = 3)]
    channels: usize,
    /// Number of chunks to transfer.
    #[arg(short = 'n', long, default_value_t = 64)]
    chunks: u32,
    /// Payload bytes per chunk.
    #[arg(short = 's', long, default_value_t = 16 * 1024)]
    chunk_size: usize,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let Args {
        channels,
        chunks,
        chunk_size,
    } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let network = MemoryTransportFactory::new();
    let probe = StaticNatProbe(NatClassification::new(NatType::PortRestrictedCone, 1.0));
    let sender = Builder::new()
        .factory(network.clone())
        .nat_probe(probe)
        .build()?;
    let receiver = Builder::new().factory(network).nat_probe(probe).build()?;

    let events = receiver.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                PeerEvent::MessageReceived { peer_id, data } => {
                    log::info!("{peer_id}: {}", String::from_utf8_lossy(&data))
                }
                PeerEvent::QualityChanged { .. } | PeerEvent::IceCandidate { .. } => {}
                other => log::info!("receiver event {other:?}"),
            }
        }
    });

    let (offer, _primary) = sender.create_connection("receiver", "Receiver", "demo").await?;
    let answer = sender_answer(&receiver, offer).await?;
    sender.complete_connection("receiver", answer).await?;
    sender.send_message("receiver", Bytes::from_static(b"hello over the primary channel"));

    let config = ChannelConfig::default().set_channel_count(channels);
    let outbound = sender.open_multiplexer("receiver", config).await?;
    let inbound = receiver.open_multiplexer("sender", config).await?;

    let batch: Vec<Chunk> = (0..chunks)
        .map(|index| Chunk {
            transfer_id: "demo".to_string(),
            chunk_index: index,
            total_chunks: chunks,
            hash: format!("{index:08x}"),
            encrypted: false,
            payload: Bytes::from(vec![(index % 251) as u8; chunk_size]),
        })
        .collect();
    let sent = outbound.send_batch(&batch).await?;
    log::info!("sent {sent} chunks over {channels} sub-channels");

    for _ in 0..chunks {
        tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .context("waiting for chunks")??;
    }
    let ordered = inbound.ordered_chunks("demo");
    anyhow::ensure!(ordered.len() == chunks as usize, "transfer incomplete");
    for channel in outbound.stats().channels {
        log::info!(
            "sub-channel {} sent {} chunks, {} bytes",
            channel.index,
            channel.chunks_sent,
            channel.bytes_sent
        );
    }

    outbound.close().await;
    sender.shutdown().await;
    receiver.shutdown().await;
    Ok(())
}

async fn sender_answer(
    receiver: &peermux::PeerManager,
    offer: peermux::transport::SessionDescription,
) -> peermux::Result<peermux::transport::SessionDescription> {
    receiver
        .accept_connection("sender", "Sender", "demo", offer)
        .await
}
