// RTP transform connector
//
// This module binds a TransformEngine to the data and control streams of a
// media socket pair and rewires those streams whenever the engine changes.

pub mod udp;
pub mod tcp;

use std::{io, sync::Arc};

use parking_lot::Mutex;

use crate::{
    stream::{
        ControlTransformInputStream, PacketSink, PacketSource, TransformInputStream, TransformOutputStream,
        DEFAULT_RECEIVE_BUFFER_SIZE,
    },
    transform::{Channel, TransformEngine},
    Result, TransformError,
};

pub use tcp::{RtpTransformTcpConnector, TcpTransport};
pub use udp::{RtpTransformUdpConnector, UdpTransport};

/// Socket pair a connector builds its streams on
pub trait ConnectorTransport: Send + Sync {
    /// Receiving side of a socket
    type Source: PacketSource;
    /// Sending side of a socket
    type Sink: PacketSink;

    /// Create the receiving side of the data (RTP) socket
    fn data_source(&self) -> io::Result<Self::Source>;

    /// Create the sending side of the data (RTP) socket
    fn data_sink(&self) -> io::Result<Self::Sink>;

    /// Create the receiving side of the control (RTCP) socket
    fn control_source(&self) -> io::Result<Self::Source>;

    /// Create the sending side of the control (RTCP) socket
    fn control_sink(&self) -> io::Result<Self::Sink>;
}

type Slot<S> = Mutex<Option<Arc<S>>>;

/// Connector owning one transform engine and the four streams it applies to
///
/// Streams are created on first use and pick up the engine current at that
/// moment. Replacing the engine re-points every stream already created.
pub struct RtpTransformConnector<T: ConnectorTransport> {
    /// Socket pair
    transport: T,
    /// Current engine
    engine: Mutex<Option<Arc<dyn TransformEngine>>>,
    /// Receive buffer size for input streams
    receive_buffer_size: usize,
    /// RTP input stream
    data_input: Slot<TransformInputStream<T::Source>>,
    /// RTP output stream
    data_output: Slot<TransformOutputStream<T::Sink>>,
    /// RTCP input stream
    control_input: Slot<ControlTransformInputStream<T::Source>>,
    /// RTCP output stream
    control_output: Slot<TransformOutputStream<T::Sink>>,
}

impl<T: ConnectorTransport> RtpTransformConnector<T> {
    /// Create a connector over `transport`
    pub fn new(transport: T, engine: Option<Arc<dyn TransformEngine>>) -> Self {
        Self {
            transport,
            engine: Mutex::new(engine),
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            data_input: Mutex::new(None),
            data_output: Mutex::new(None),
            control_input: Mutex::new(None),
            control_output: Mutex::new(None),
        }
    }

    /// Set the receive buffer size used by input streams created later
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    /// Get the socket pair
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get the current engine
    pub fn engine(&self) -> Option<Arc<dyn TransformEngine>> {
        self.engine.lock().clone()
    }

    /// Replace the engine and rewire every stream created so far
    ///
    /// Setting the engine already installed does nothing.
    pub fn set_engine(&self, engine: Option<Arc<dyn TransformEngine>>) {
        let mut current = self.engine.lock();
        if same_engine(&current, &engine) {
            return;
        }

        tracing::info!(
            "Replacing transform engine {} with {}",
            engine_name(&current),
            engine_name(&engine)
        );
        *current = engine;

        let rtp = current.as_deref().and_then(|e| Channel::Rtp.transformer_of(e));
        let rtcp = current.as_deref().and_then(|e| Channel::Rtcp.transformer_of(e));

        if let Some(stream) = self.data_input.lock().as_ref() {
            stream.set_transformer(rtp.clone());
        }
        if let Some(stream) = self.data_output.lock().as_ref() {
            stream.set_transformer(rtp);
        }
        if let Some(stream) = self.control_input.lock().as_ref() {
            stream.set_transformer(rtcp.clone());
        }
        if let Some(stream) = self.control_output.lock().as_ref() {
            stream.set_transformer(rtcp);
        }
    }

    /// Get the RTP input stream, creating it on first use
    pub fn data_input_stream(&self) -> Result<Arc<TransformInputStream<T::Source>>> {
        let buffer_size = self.receive_buffer_size;
        self.get_or_create(&self.data_input, "data input", |engine| {
            let source = self.transport.data_source()?;
            let transformer = engine.and_then(|e| Channel::Rtp.transformer_of(e));
            Ok(TransformInputStream::new(source, transformer).with_receive_buffer_size(buffer_size))
        })
    }

    /// Get the RTP output stream, creating it on first use
    pub fn data_output_stream(&self) -> Result<Arc<TransformOutputStream<T::Sink>>> {
        self.get_or_create(&self.data_output, "data output", |engine| {
            let sink = self.transport.data_sink()?;
            Ok(TransformOutputStream::new(sink, engine.and_then(|e| Channel::Rtp.transformer_of(e))))
        })
    }

    /// Get the RTCP input stream, creating it on first use
    pub fn control_input_stream(&self) -> Result<Arc<ControlTransformInputStream<T::Source>>> {
        let buffer_size = self.receive_buffer_size;
        self.get_or_create(&self.control_input, "control input", |engine| {
            let source = self.transport.control_source()?;
            let transformer = engine.and_then(|e| Channel::Rtcp.transformer_of(e));
            let stream = TransformInputStream::new(source, transformer).with_receive_buffer_size(buffer_size);
            Ok(ControlTransformInputStream::from_stream(stream))
        })
    }

    /// Get the RTCP output stream, creating it on first use
    pub fn control_output_stream(&self) -> Result<Arc<TransformOutputStream<T::Sink>>> {
        self.get_or_create(&self.control_output, "control output", |engine| {
            let sink = self.transport.control_sink()?;
            Ok(TransformOutputStream::new(sink, engine.and_then(|e| Channel::Rtcp.transformer_of(e))))
        })
    }

    /// Drop every stream created so far
    ///
    /// Later calls create fresh streams only if the transport can hand out
    /// new sources and sinks. UDP transports share their sockets and always
    /// can. A [`TcpTransport`](tcp::TcpTransport) hands each connection half
    /// out once, so after `close` its stream accessors fail with
    /// [`TransformError::Connector`].
    pub fn close(&self) {
        self.data_input.lock().take();
        self.data_output.lock().take();
        self.control_input.lock().take();
        self.control_output.lock().take();
        tracing::debug!("Connector streams closed");
    }

    fn get_or_create<S>(
        &self,
        slot: &Slot<S>,
        kind: &str,
        create: impl FnOnce(Option<&dyn TransformEngine>) -> io::Result<S>,
    ) -> Result<Arc<S>> {
        // Holding the engine lock keeps creation and engine swaps serialized
        let engine = self.engine.lock();
        let mut slot = slot.lock();

        if let Some(stream) = slot.as_ref() {
            return Ok(stream.clone());
        }

        let stream = create(engine.as_deref())
            .map(Arc::new)
            .map_err(|e| TransformError::Connector(format!("Failed to create {} stream: {}", kind, e)))?;
        *slot = Some(stream.clone());

        Ok(stream)
    }
}

fn same_engine(a: &Option<Arc<dyn TransformEngine>>, b: &Option<Arc<dyn TransformEngine>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ()),
        _ => false,
    }
}

fn engine_name(engine: &Option<Arc<dyn TransformEngine>>) -> &str {
    engine.as_deref().map_or("none", |e| e.name())
}
