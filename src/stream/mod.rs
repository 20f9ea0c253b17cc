// Transform streams between sockets and the media stack
//
// Input streams wrap every received datagram or frame as a RawPacket and run
// it through the reverse transform before handing it up. Output streams run
// outgoing packets through the forward transform before they hit the socket.

pub mod udp;
pub mod tcp;
pub mod control;

use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;

use crate::{
    packet::RawPacket,
    transform::{PacketTransformer, SharedTransformer, TransformerHandle},
    Result, TransformError,
};

pub use control::ControlTransformInputStream;
pub use tcp::{TcpPacketSink, TcpPacketSource, TransformTcpInputStream, TransformTcpOutputStream};
pub use udp::{TransformUdpInputStream, TransformUdpOutputStream, UdpPacketSink, UdpPacketSource};

/// Largest UDP payload, used as the default receive buffer size
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 65535;

/// Socket side of an input stream
#[async_trait]
pub trait PacketSource: Send + Sync {
    /// Receive one packet into `buf`, returning its length and sender
    async fn receive(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Socket side of an output stream
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Write one packet to every active target, returning the number of targets written
    async fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// Number of targets currently expecting packets
    fn active_targets(&self) -> usize;
}

/// Packet delivered by an input stream
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    /// Packet after the reverse transform
    pub packet: RawPacket,
    /// Address the packet came from
    pub from: SocketAddr,
}

/// Per-stream packet counters
#[derive(Debug, Default)]
pub struct StreamCounters {
    /// Packets handed to or taken from the socket
    packets: AtomicU64,
    /// Packets dropped by the transformer or on transform errors
    dropped: AtomicU64,
}

impl StreamCounters {
    /// Packets that passed through the stream
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Packets dropped by the stream
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Input stream applying the reverse transform to every received packet
pub struct TransformInputStream<S> {
    /// Socket side
    source: S,
    /// Current transformer
    transformer: TransformerHandle,
    /// Largest packet accepted; larger ones are dropped
    receive_buffer_size: usize,
    /// Receive scratch buffer, one byte larger than `receive_buffer_size`
    scratch: tokio::sync::Mutex<Vec<u8>>,
    /// Packet counters
    counters: StreamCounters,
}

impl<S: PacketSource> TransformInputStream<S> {
    /// Create an input stream reading from `source`
    pub fn new(source: S, transformer: Option<SharedTransformer>) -> Self {
        Self {
            source,
            transformer: TransformerHandle::new(transformer),
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            scratch: tokio::sync::Mutex::new(Vec::new()),
            counters: StreamCounters::default(),
        }
    }

    /// Set the largest packet size accepted
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    /// Replace the transformer; `None` passes packets through
    pub fn set_transformer(&self, transformer: Option<SharedTransformer>) {
        self.transformer.set(transformer);
    }

    /// Get the current transformer
    pub fn transformer(&self) -> Option<SharedTransformer> {
        self.transformer.get()
    }

    /// Get the socket side
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Get the packet counters
    pub fn counters(&self) -> &StreamCounters {
        &self.counters
    }

    /// Wait for the next packet that survives the reverse transform
    ///
    /// Packets larger than the receive buffer size, and packets the
    /// transformer drops or fails on, are skipped. Socket errors are returned.
    pub async fn read(&self) -> Result<ReceivedPacket> {
        loop {
            let Some((raw, from)) = self.receive_raw().await? else {
                continue;
            };
            if let Some(packet) = self.reverse_transform(raw, from) {
                return Ok(ReceivedPacket { packet, from });
            }
        }
    }

    /// Receive one packet from the socket without transforming it
    ///
    /// Returns `None` for a packet that did not fit the receive buffer. The
    /// returned packet owns a buffer of exactly its length.
    pub(crate) async fn receive_raw(&self) -> Result<Option<(RawPacket, SocketAddr)>> {
        let mut scratch = self.scratch.lock().await;
        scratch.resize(self.receive_buffer_size + 1, 0);

        let (length, from) = self.source.receive(&mut scratch[..]).await?;
        if length > self.receive_buffer_size {
            // A datagram filling the spare byte was truncated by the socket
            tracing::warn!(
                "Dropped packet from {} larger than the {} byte receive buffer",
                from,
                self.receive_buffer_size
            );
            self.counters.record_drop();
            return Ok(None);
        }

        Ok(Some((RawPacket::from_slice(&scratch[..length]), from)))
    }

    /// Run the reverse transform, turning drops and transform errors into `None`
    pub(crate) fn reverse_transform(&self, packet: RawPacket, from: SocketAddr) -> Option<RawPacket> {
        let transformer = match self.transformer.get() {
            Some(transformer) => transformer,
            None => {
                self.counters.record_packet();
                return Some(packet);
            }
        };

        match transformer.reverse_transform(packet) {
            Ok(Some(packet)) => {
                self.counters.record_packet();
                Some(packet)
            }
            Ok(None) => {
                tracing::debug!("Dropped packet from {} rejected by transformer", from);
                self.counters.record_drop();
                None
            }
            Err(e) => {
                tracing::warn!("Dropped packet from {}: {}", from, e);
                self.counters.record_drop();
                None
            }
        }
    }
}

/// Output stream applying the forward transform to every written packet
pub struct TransformOutputStream<W> {
    /// Socket side
    sink: W,
    /// Current transformer
    transformer: TransformerHandle,
    /// Packet counters
    counters: StreamCounters,
}

impl<W: PacketSink> TransformOutputStream<W> {
    /// Create an output stream writing to `sink`
    pub fn new(sink: W, transformer: Option<SharedTransformer>) -> Self {
        Self {
            sink,
            transformer: TransformerHandle::new(transformer),
            counters: StreamCounters::default(),
        }
    }

    /// Replace the transformer; `None` passes packets through
    pub fn set_transformer(&self, transformer: Option<SharedTransformer>) {
        self.transformer.set(transformer);
    }

    /// Get the current transformer
    pub fn transformer(&self) -> Option<SharedTransformer> {
        self.transformer.get()
    }

    /// Get the socket side
    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// Get the packet counters
    pub fn counters(&self) -> &StreamCounters {
        &self.counters
    }

    /// Transform `data` and write it to every active target
    ///
    /// Returns the number of bytes handed to the socket per target, or 0 when
    /// the transformer dropped the packet and nobody was expecting it. A drop
    /// while targets are active fails with [`TransformError::OutputBlocked`].
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let mut packet = RawPacket::from_slice(data);

        if let Some(transformer) = self.transformer.get() {
            match transformer.transform(packet)? {
                Some(transformed) => packet = transformed,
                None => {
                    self.counters.record_drop();

                    let targets = self.sink.active_targets();
                    if targets > 0 {
                        return Err(TransformError::OutputBlocked { targets });
                    }

                    tracing::debug!("Dropped outgoing packet with no active targets");
                    return Ok(0);
                }
            }
        }

        self.sink.send(packet.as_slice()).await?;
        self.counters.record_packet();

        Ok(packet.length())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Arc};

    use parking_lot::Mutex;

    use super::*;

    struct QueueSource {
        packets: Mutex<VecDeque<Vec<u8>>>,
    }

    #[async_trait]
    impl PacketSource for QueueSource {
        async fn receive(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let next = self.packets.lock().pop_front();
            match next {
                Some(data) => {
                    // Truncate like a datagram socket
                    let length = data.len().min(buf.len());
                    buf[..length].copy_from_slice(&data[..length]);
                    Ok((length, "127.0.0.1:5000".parse().unwrap()))
                }
                None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "drained")),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Vec<u8>>>,
        targets: usize,
    }

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn send(&self, data: &[u8]) -> io::Result<usize> {
            self.sent.lock().push(data.to_vec());
            Ok(self.targets)
        }

        fn active_targets(&self) -> usize {
            self.targets
        }
    }

    /// Drops packets starting with 0, fails on packets starting with 1
    struct Picky;

    impl PacketTransformer for Picky {
        fn transform(&self, packet: RawPacket) -> Result<Option<RawPacket>> {
            self.reverse_transform(packet)
        }

        fn reverse_transform(&self, packet: RawPacket) -> Result<Option<RawPacket>> {
            match packet.read_u8(0)? {
                0 => Ok(None),
                1 => Err(TransformError::Transform("bad packet".to_string())),
                _ => Ok(Some(packet)),
            }
        }
    }

    fn source(packets: &[&[u8]]) -> QueueSource {
        QueueSource {
            packets: Mutex::new(packets.iter().map(|p| p.to_vec()).collect()),
        }
    }

    #[tokio::test]
    async fn read_skips_dropped_and_failed_packets() {
        let stream = TransformInputStream::new(source(&[&[0, 9], &[1, 9], &[2, 9]]), Some(Arc::new(Picky)));

        let received = stream.read().await.unwrap();
        assert_eq!(received.packet.as_slice(), &[2, 9]);
        assert_eq!(stream.counters().dropped(), 2);
        assert_eq!(stream.counters().packets(), 1);

        assert!(matches!(stream.read().await, Err(TransformError::Io(_))));
    }

    #[tokio::test]
    async fn read_drops_packets_larger_than_the_buffer() {
        let oversized = [7u8; 200];
        let exact = [8u8; 100];
        let stream =
            TransformInputStream::new(source(&[&oversized, &exact, &[9, 9]]), None).with_receive_buffer_size(100);

        let received = stream.read().await.unwrap();
        assert_eq!(received.packet.as_slice(), &exact[..]);
        assert_eq!(stream.counters().dropped(), 1);

        let small = stream.read().await.unwrap();
        assert_eq!(small.packet.as_slice(), &[9, 9]);
    }

    #[tokio::test]
    async fn received_packets_own_only_their_bytes() {
        let stream = TransformInputStream::new(source(&[&[1, 2, 3]]), None);

        let received = stream.read().await.unwrap();
        assert_eq!(received.packet.length(), 3);
        assert_eq!(received.packet.capacity(), 3);
    }

    #[tokio::test]
    async fn read_without_transformer_passes_through() {
        let stream = TransformInputStream::new(source(&[&[0, 1, 2]]), None);
        assert_eq!(stream.read().await.unwrap().packet.as_slice(), &[0, 1, 2]);
    }

    #[tokio::test]
    async fn write_with_active_targets_fails_when_blocked() {
        let stream = TransformOutputStream::new(RecordingSink { targets: 2, ..Default::default() }, Some(Arc::new(Picky)));

        assert!(matches!(stream.write(&[0, 1]).await, Err(TransformError::OutputBlocked { targets: 2 })));
        assert!(stream.sink().sent.lock().is_empty());

        assert_eq!(stream.write(&[5, 1]).await.unwrap(), 2);
        assert_eq!(*stream.sink().sent.lock(), vec![vec![5, 1]]);
    }

    #[tokio::test]
    async fn write_without_targets_drops_silently() {
        let stream = TransformOutputStream::new(RecordingSink::default(), Some(Arc::new(Picky)));

        assert_eq!(stream.write(&[0]).await.unwrap(), 0);
        assert_eq!(stream.counters().dropped(), 1);
        assert!(stream.sink().sent.lock().is_empty());
    }

    #[tokio::test]
    async fn write_propagates_transform_errors() {
        let stream = TransformOutputStream::new(RecordingSink::default(), Some(Arc::new(Picky)));
        assert!(matches!(stream.write(&[1]).await, Err(TransformError::Transform(_))));
    }
}
