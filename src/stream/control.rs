// RTCP control input stream
//
// Inspects the wire bytes of every received control packet for feedback
// messages before the reverse transform consumes them.

use std::sync::Arc;

use crate::{
    feedback::{FeedbackListeners, FeedbackMessageListener},
    stream::{udp::UdpPacketSource, PacketSource, ReceivedPacket, StreamCounters, TransformInputStream},
    transform::SharedTransformer,
    Result,
};

/// Input stream for the control channel with feedback demultiplexing
pub struct ControlTransformInputStream<S = UdpPacketSource> {
    /// Plain transform input stream
    inner: TransformInputStream<S>,
    /// Feedback listeners
    listeners: FeedbackListeners,
}

impl<S: PacketSource> ControlTransformInputStream<S> {
    /// Create a control input stream reading from `source`
    pub fn new(source: S, transformer: Option<SharedTransformer>) -> Self {
        Self::from_stream(TransformInputStream::new(source, transformer))
    }

    /// Add feedback demultiplexing to an existing input stream
    pub fn from_stream(inner: TransformInputStream<S>) -> Self {
        Self {
            inner,
            listeners: FeedbackListeners::new(),
        }
    }

    /// Register a feedback listener; registering twice does nothing
    pub fn add_feedback_listener(&self, listener: Arc<dyn FeedbackMessageListener>) {
        self.listeners.add(listener);
    }

    /// Unregister a feedback listener; unknown listeners are ignored
    pub fn remove_feedback_listener(&self, listener: &Arc<dyn FeedbackMessageListener>) {
        self.listeners.remove(listener);
    }

    /// Replace the transformer; `None` passes packets through
    pub fn set_transformer(&self, transformer: Option<SharedTransformer>) {
        self.inner.set_transformer(transformer);
    }

    /// Get the current transformer
    pub fn transformer(&self) -> Option<SharedTransformer> {
        self.inner.transformer()
    }

    /// Get the socket side
    pub fn source(&self) -> &S {
        self.inner.source()
    }

    /// Get the packet counters
    pub fn counters(&self) -> &StreamCounters {
        self.inner.counters()
    }

    /// Wait for the next control packet that survives the reverse transform
    ///
    /// Feedback listeners see every packet, including ones the transformer
    /// then drops.
    pub async fn read(&self) -> Result<ReceivedPacket> {
        loop {
            let Some((raw, from)) = self.inner.receive_raw().await? else {
                continue;
            };
            self.listeners.dispatch(raw.as_slice());

            if let Some(packet) = self.inner.reverse_transform(raw, from) {
                return Ok(ReceivedPacket { packet, from });
            }
        }
    }
}
