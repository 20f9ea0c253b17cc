// Packet transform framework
//
// This module defines the transformer/engine contracts and the chain that
// composes engines into one virtual transformer per channel.

pub mod payload_type;

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;

use crate::{packet::RawPacket, Result};

/// Bidirectional single-stage packet transform
///
/// `transform` runs on the send path and `reverse_transform` on the receive
/// path. Returning `Ok(None)` drops the packet. Both calls run synchronously on
/// the socket task, so implementations must not block.
pub trait PacketTransformer: Send + Sync {
    /// Transform an outgoing packet
    fn transform(&self, packet: RawPacket) -> Result<Option<RawPacket>>;

    /// Undo the transform on an incoming packet
    fn reverse_transform(&self, packet: RawPacket) -> Result<Option<RawPacket>>;

    /// Release transformer resources. Must be idempotent.
    fn close(&self) {}
}

/// Transformer shared between streams
pub type SharedTransformer = Arc<dyn PacketTransformer>;

/// Pair of transformers, one per channel. `None` passes that channel through.
pub trait TransformEngine: Send + Sync {
    /// Transformer for RTP (data) packets
    fn rtp_transformer(&self) -> Option<SharedTransformer>;

    /// Transformer for RTCP (control) packets
    fn rtcp_transformer(&self) -> Option<SharedTransformer>;

    /// Engine name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Media channel a transformer applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// RTP data channel
    Rtp,
    /// RTCP control channel
    Rtcp,
}

impl Channel {
    /// Get the transformer an engine provides for this channel
    pub fn transformer_of(self, engine: &dyn TransformEngine) -> Option<SharedTransformer> {
        match self {
            Channel::Rtp => engine.rtp_transformer(),
            Channel::Rtcp => engine.rtcp_transformer(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Rtp => write!(f, "RTP"),
            Channel::Rtcp => write!(f, "RTCP"),
        }
    }
}

/// Ordered composition of transform engines
///
/// Outgoing packets visit engines in declaration order; incoming packets visit
/// them in reverse, so the last transform applied on send is the first undone
/// on receive. A stage returning `None` stops the chain in either direction.
pub struct TransformEngineChain {
    /// Engines in declaration order
    engines: Arc<[Arc<dyn TransformEngine>]>,
    /// Synthesized RTP transformer
    rtp_transformer: SharedTransformer,
    /// Synthesized RTCP transformer
    rtcp_transformer: SharedTransformer,
}

impl TransformEngineChain {
    /// Create a chain over a copy of `engines`
    pub fn new(engines: &[Arc<dyn TransformEngine>]) -> Self {
        let engines: Arc<[Arc<dyn TransformEngine>]> = engines.to_vec().into();

        Self {
            rtp_transformer: Arc::new(ChainedTransformer {
                engines: engines.clone(),
                channel: Channel::Rtp,
            }),
            rtcp_transformer: Arc::new(ChainedTransformer {
                engines: engines.clone(),
                channel: Channel::Rtcp,
            }),
            engines,
        }
    }

    /// Get the engines in declaration order
    pub fn engines(&self) -> &[Arc<dyn TransformEngine>] {
        &self.engines
    }
}

impl TransformEngine for TransformEngineChain {
    fn rtp_transformer(&self) -> Option<SharedTransformer> {
        Some(self.rtp_transformer.clone())
    }

    fn rtcp_transformer(&self) -> Option<SharedTransformer> {
        Some(self.rtcp_transformer.clone())
    }

    fn name(&self) -> &str {
        "transform-engine-chain"
    }
}

/// Transformer iterating one channel of a chain
struct ChainedTransformer {
    engines: Arc<[Arc<dyn TransformEngine>]>,
    channel: Channel,
}

impl PacketTransformer for ChainedTransformer {
    fn transform(&self, mut packet: RawPacket) -> Result<Option<RawPacket>> {
        for engine in self.engines.iter() {
            if let Some(transformer) = self.channel.transformer_of(engine.as_ref()) {
                match transformer.transform(packet)? {
                    Some(transformed) => packet = transformed,
                    None => {
                        tracing::debug!("{} transform dropped by engine {}", self.channel, engine.name());
                        return Ok(None);
                    }
                }
            }
        }

        Ok(Some(packet))
    }

    fn reverse_transform(&self, mut packet: RawPacket) -> Result<Option<RawPacket>> {
        for engine in self.engines.iter().rev() {
            if let Some(transformer) = self.channel.transformer_of(engine.as_ref()) {
                match transformer.reverse_transform(packet)? {
                    Some(restored) => packet = restored,
                    None => {
                        tracing::debug!("{} reverse transform dropped by engine {}", self.channel, engine.name());
                        return Ok(None);
                    }
                }
            }
        }

        Ok(Some(packet))
    }

    fn close(&self) {
        for engine in self.engines.iter() {
            if let Some(transformer) = self.channel.transformer_of(engine.as_ref()) {
                transformer.close();
            }
        }
    }
}

/// Atomically swappable reference to a stream's current transformer
///
/// Each read or write takes one snapshot, so a packet in flight sees either
/// the old or the new transformer, never a mix.
pub struct TransformerHandle {
    current: ArcSwap<Option<SharedTransformer>>,
}

impl TransformerHandle {
    /// Create a handle holding `transformer`
    pub fn new(transformer: Option<SharedTransformer>) -> Self {
        Self {
            current: ArcSwap::from_pointee(transformer),
        }
    }

    /// Replace the current transformer
    pub fn set(&self, transformer: Option<SharedTransformer>) {
        self.current.store(Arc::new(transformer));
    }

    /// Take a snapshot of the current transformer
    pub fn get(&self) -> Option<SharedTransformer> {
        let current = self.current.load();
        Option::clone(&current)
    }

    /// Check whether a transformer is installed
    pub fn is_set(&self) -> bool {
        self.current.load().is_some()
    }
}

// Default implementation
impl Default for TransformerHandle {
    fn default() -> Self {
        Self::new(None)
    }
}

impl fmt::Debug for TransformerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformerHandle")
            .field("is_set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::TransformError;

    /// Appends a tag byte on send and strips it on receive, recording the order
    struct TagTransformer {
        tag: u8,
        log: Arc<Mutex<Vec<(char, u8)>>>,
        drop_on_reverse: bool,
    }

    impl PacketTransformer for TagTransformer {
        fn transform(&self, mut packet: RawPacket) -> Result<Option<RawPacket>> {
            self.log.lock().push(('t', self.tag));
            packet.append(&[self.tag]);
            Ok(Some(packet))
        }

        fn reverse_transform(&self, mut packet: RawPacket) -> Result<Option<RawPacket>> {
            self.log.lock().push(('r', self.tag));
            if self.drop_on_reverse {
                return Ok(None);
            }

            let last = packet.read_u8(packet.length() - 1)?;
            if last != self.tag {
                return Err(TransformError::Transform(format!("expected tag {} got {}", self.tag, last)));
            }
            packet.shrink(1)?;
            Ok(Some(packet))
        }
    }

    struct XorTransformer(u8);

    impl PacketTransformer for XorTransformer {
        fn transform(&self, mut packet: RawPacket) -> Result<Option<RawPacket>> {
            packet.as_mut_slice().iter_mut().for_each(|b| *b ^= self.0);
            Ok(Some(packet))
        }

        fn reverse_transform(&self, packet: RawPacket) -> Result<Option<RawPacket>> {
            self.transform(packet)
        }
    }

    struct DropTransformer;

    impl PacketTransformer for DropTransformer {
        fn transform(&self, _packet: RawPacket) -> Result<Option<RawPacket>> {
            Ok(None)
        }

        fn reverse_transform(&self, _packet: RawPacket) -> Result<Option<RawPacket>> {
            Ok(None)
        }
    }

    struct CountingClose(AtomicUsize);

    impl PacketTransformer for CountingClose {
        fn transform(&self, packet: RawPacket) -> Result<Option<RawPacket>> {
            Ok(Some(packet))
        }

        fn reverse_transform(&self, packet: RawPacket) -> Result<Option<RawPacket>> {
            Ok(Some(packet))
        }

        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Engine {
        rtp: Option<SharedTransformer>,
        rtcp: Option<SharedTransformer>,
    }

    impl TransformEngine for Engine {
        fn rtp_transformer(&self) -> Option<SharedTransformer> {
            self.rtp.clone()
        }

        fn rtcp_transformer(&self) -> Option<SharedTransformer> {
            self.rtcp.clone()
        }
    }

    fn rtp_engine(transformer: SharedTransformer) -> Arc<dyn TransformEngine> {
        Arc::new(Engine { rtp: Some(transformer), rtcp: None })
    }

    fn tag_engine(tag: u8, log: &Arc<Mutex<Vec<(char, u8)>>>, drop_on_reverse: bool) -> Arc<dyn TransformEngine> {
        rtp_engine(Arc::new(TagTransformer { tag, log: log.clone(), drop_on_reverse }))
    }

    fn round_trip(engines: &[Arc<dyn TransformEngine>], data: &[u8]) -> Vec<u8> {
        let chain = TransformEngineChain::new(engines);
        let transformer = chain.rtp_transformer().unwrap();

        let sent = transformer.transform(RawPacket::from_slice(data)).unwrap().unwrap();
        let received = transformer.reverse_transform(sent).unwrap().unwrap();
        received.as_slice().to_vec()
    }

    #[test]
    fn reverse_undoes_transform_for_zero_one_and_three_stages() {
        let data = b"\x80\x60\x00\x01media".to_vec();

        assert_eq!(round_trip(&[], &data), data);
        assert_eq!(round_trip(&[rtp_engine(Arc::new(XorTransformer(0x5A)))], &data), data);

        let three: Vec<Arc<dyn TransformEngine>> = vec![
            rtp_engine(Arc::new(XorTransformer(0x11))),
            Arc::new(Engine { rtp: None, rtcp: None }),
            rtp_engine(Arc::new(XorTransformer(0x42))),
        ];
        assert_eq!(round_trip(&three, &data), data);
    }

    #[test]
    fn transform_runs_in_declared_order_and_reverse_in_opposite_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = TransformEngineChain::new(&[
            tag_engine(b'A', &log, false),
            tag_engine(b'B', &log, false),
            tag_engine(b'C', &log, false),
        ]);
        let transformer = chain.rtp_transformer().unwrap();

        let sent = transformer.transform(RawPacket::from_slice(b"x")).unwrap().unwrap();
        assert_eq!(sent.as_slice(), b"xABC");

        let received = transformer.reverse_transform(sent).unwrap().unwrap();
        assert_eq!(received.as_slice(), b"x");

        assert_eq!(
            *log.lock(),
            vec![('t', b'A'), ('t', b'B'), ('t', b'C'), ('r', b'C'), ('r', b'B'), ('r', b'A')]
        );
    }

    #[test]
    fn reverse_stops_at_first_dropping_stage() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = TransformEngineChain::new(&[
            tag_engine(b'A', &log, false),
            tag_engine(b'B', &log, true),
            tag_engine(b'C', &log, false),
        ]);
        let transformer = chain.rtp_transformer().unwrap();

        let result = transformer.reverse_transform(RawPacket::from_slice(b"xC")).unwrap();
        assert!(result.is_none());
        assert_eq!(*log.lock(), vec![('r', b'C'), ('r', b'B')]);
    }

    #[test]
    fn forward_stops_at_first_dropping_stage() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = TransformEngineChain::new(&[
            rtp_engine(Arc::new(DropTransformer)),
            tag_engine(b'B', &log, false),
        ]);

        let result = chain.rtp_transformer().unwrap().transform(RawPacket::from_slice(b"x")).unwrap();
        assert!(result.is_none());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn stage_errors_propagate() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = TransformEngineChain::new(&[tag_engine(b'A', &log, false)]);

        let result = chain.rtp_transformer().unwrap().reverse_transform(RawPacket::from_slice(b"xZ"));
        assert!(matches!(result, Err(TransformError::Transform(_))));
    }

    #[test]
    fn chain_channels_are_independent_and_cached() {
        let chain = TransformEngineChain::new(&[rtp_engine(Arc::new(DropTransformer))]);

        let rtcp = chain.rtcp_transformer().unwrap();
        let packet = rtcp.transform(RawPacket::from_slice(b"rtcp")).unwrap().unwrap();
        assert_eq!(packet.as_slice(), b"rtcp");

        assert!(Arc::ptr_eq(&chain.rtp_transformer().unwrap(), &chain.rtp_transformer().unwrap()));
    }

    #[test]
    fn chain_copies_engine_list_on_construction() {
        let mut engines = vec![rtp_engine(Arc::new(XorTransformer(1)))];
        let chain = TransformEngineChain::new(&engines);
        engines.push(rtp_engine(Arc::new(DropTransformer)));

        assert_eq!(chain.engines().len(), 1);
        assert!(chain.rtp_transformer().unwrap().transform(RawPacket::from_slice(b"a")).unwrap().is_some());
    }

    #[test]
    fn close_reaches_every_stage() {
        let counter = Arc::new(CountingClose(AtomicUsize::new(0)));
        let chain = TransformEngineChain::new(&[
            rtp_engine(counter.clone()),
            rtp_engine(counter.clone()),
        ]);

        chain.rtp_transformer().unwrap().close();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handle_swaps_snapshots() {
        let handle = TransformerHandle::default();
        assert!(handle.get().is_none());

        let first: SharedTransformer = Arc::new(XorTransformer(1));
        handle.set(Some(first.clone()));
        let snapshot = handle.get().unwrap();

        handle.set(Some(Arc::new(DropTransformer)));
        assert!(Arc::ptr_eq(&snapshot, &first));
        assert!(!Arc::ptr_eq(&handle.get().unwrap(), &first));

        handle.set(None);
        assert!(!handle.is_set());
    }
}
