// Loopback demo of the transform pipeline
//
// Two UDP connectors talk to each other over localhost. Both run a payload
// type remapping chain, so the sender's local payload type travels as the
// wire payload type and is restored on receipt. A picture loss indication is
// sent over the control channel to exercise feedback dispatch.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use clap::Parser;
use rtp_transform::{
    connector::{RtpTransformUdpConnector, UdpTransport},
    feedback::{FeedbackMessageEvent, FeedbackMessageListener},
    init_logging,
    transform::payload_type::PayloadTypeTransformEngine,
    Config, TransformEngine, TransformEngineChain,
};
use tokio::net::UdpSocket;
use tracing::info;

/// Send RTP through a transform chain over a local UDP pair
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Number of RTP packets to send
    #[clap(short, long, default_value = "5")]
    packets: u16,

    /// Payload type used by the media stack
    #[clap(short, long, default_value = "96")]
    local_payload_type: u8,

    /// Payload type used on the wire
    #[clap(short, long, default_value = "111")]
    wire_payload_type: u8,

    /// Optional JSON configuration file
    #[clap(short, long)]
    config: Option<String>,
}

struct LoggingFeedback;

impl FeedbackMessageListener for LoggingFeedback {
    fn feedback_message_received(&self, event: &FeedbackMessageEvent) {
        info!(
            "Feedback {:?} from SSRC {:#010x} about SSRC {:#010x}",
            event.kind(),
            event.sender_ssrc,
            event.media_ssrc
        );
    }
}

async fn bind_pair() -> Result<UdpTransport> {
    let data = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let control = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    Ok(UdpTransport::new(data, control))
}

fn addresses(transport: &UdpTransport) -> Result<(SocketAddr, SocketAddr)> {
    Ok((transport.data_socket().local_addr()?, transport.control_socket().local_addr()?))
}

fn build_engine(local: u8, wire: u8) -> Result<Arc<dyn TransformEngine>> {
    let payload_types = PayloadTypeTransformEngine::new();
    payload_types.transformer().add_mapping(local, wire)?;

    let engines: Vec<Arc<dyn TransformEngine>> = vec![Arc::new(payload_types)];
    Ok(Arc::new(TransformEngineChain::new(&engines)))
}

fn rtp_packet(payload_type: u8, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0x80, payload_type & 0x7f];
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(&(u32::from(sequence) * 960).to_be_bytes());
    packet.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    packet.extend_from_slice(b"media payload");
    packet
}

fn picture_loss_indication() -> Vec<u8> {
    let mut packet = vec![0x81, 206, 0x00, 0x02];
    packet.extend_from_slice(&0x1111_1111u32.to_be_bytes());
    packet.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    packet
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    // Parse command line arguments
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Create both connectors
    let sender = RtpTransformUdpConnector::new(
        bind_pair().await?,
        Some(build_engine(args.local_payload_type, args.wire_payload_type)?),
    )
    .with_receive_buffer_size(config.stream.receive_buffer_size);
    let receiver = RtpTransformUdpConnector::new(
        bind_pair().await?,
        Some(build_engine(args.local_payload_type, args.wire_payload_type)?),
    )
    .with_receive_buffer_size(config.stream.receive_buffer_size);

    let (data, control) = addresses(receiver.transport())?;
    sender.add_target(data, control)?;
    info!("Sending to {} (RTP) and {} (RTCP)", data, control);

    let output = sender.data_output_stream()?;
    let input = receiver.data_input_stream()?;

    for sequence in 0..args.packets {
        output.write(&rtp_packet(args.local_payload_type, sequence)).await?;

        let received = tokio::time::timeout(Duration::from_secs(2), input.read()).await??;
        let payload_type = received.packet.payload_type()?;
        info!(
            "Received sequence {} with payload type {} from {}",
            received.packet.sequence_number()?,
            payload_type,
            received.from
        );

        if payload_type != args.local_payload_type {
            bail!("Payload type was not restored for sequence {}", sequence);
        }
    }

    // Exercise feedback dispatch on the control channel
    let control_input = receiver.control_input_stream()?;
    control_input.add_feedback_listener(Arc::new(LoggingFeedback));
    sender.control_output_stream()?.write(&picture_loss_indication()).await?;
    tokio::time::timeout(Duration::from_secs(2), control_input.read()).await??;

    info!(
        "Loopback done: {} sent, {} received",
        output.counters().packets(),
        input.counters().packets()
    );

    sender.close();
    receiver.close();
    Ok(())
}
