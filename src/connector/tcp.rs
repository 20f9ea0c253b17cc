// TCP connector transport
//
// A TCP connection cannot be shared by several readers, so each half is handed
// out once to the stream the connector creates for it.

use std::{io, net::SocketAddr};

use parking_lot::Mutex;
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};

use crate::{
    connector::{ConnectorTransport, RtpTransformConnector},
    stream::{TcpPacketSink, TcpPacketSource},
};

/// TCP connector
pub type RtpTransformTcpConnector = RtpTransformConnector<TcpTransport>;

/// Halves of one connected TCP stream
struct Connection {
    peer: SocketAddr,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl Connection {
    fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            peer,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }

    fn take_reader(&self, channel: &str) -> io::Result<TcpPacketSource> {
        let reader = self.reader.lock().take().ok_or_else(|| already_taken(channel, "read"))?;
        Ok(TcpPacketSource::new(reader, self.peer))
    }

    fn take_writer(&self, channel: &str) -> io::Result<TcpPacketSink> {
        let writer = self.writer.lock().take().ok_or_else(|| already_taken(channel, "write"))?;
        Ok(TcpPacketSink::new(writer, self.peer))
    }
}

fn already_taken(channel: &str, half: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::AddrInUse,
        format!("{} {} half is already owned by a stream", channel, half),
    )
}

/// Pair of connected TCP streams for RTP and RTCP
pub struct TcpTransport {
    data: Connection,
    control: Connection,
}

impl TcpTransport {
    /// Create a transport over already connected streams
    pub fn new(data: TcpStream, control: TcpStream) -> io::Result<Self> {
        Ok(Self {
            data: Connection::new(data)?,
            control: Connection::new(control)?,
        })
    }

    /// Remote address of the data connection
    pub fn data_peer(&self) -> SocketAddr {
        self.data.peer
    }

    /// Remote address of the control connection
    pub fn control_peer(&self) -> SocketAddr {
        self.control.peer
    }
}

impl ConnectorTransport for TcpTransport {
    type Source = TcpPacketSource;
    type Sink = TcpPacketSink;

    fn data_source(&self) -> io::Result<Self::Source> {
        self.data.take_reader("data")
    }

    fn data_sink(&self) -> io::Result<Self::Sink> {
        self.data.take_writer("data")
    }

    fn control_source(&self) -> io::Result<Self::Source> {
        self.control.take_reader("control")
    }

    fn control_sink(&self) -> io::Result<Self::Sink> {
        self.control.take_writer("control")
    }
}

impl RtpTransformConnector<TcpTransport> {
    /// Shut down the write halves of both connections
    ///
    /// Fails with [`TransformError::Connector`](crate::TransformError::Connector)
    /// after [`close`](RtpTransformConnector::close), since the write halves
    /// went away with the dropped streams.
    pub async fn shutdown(&self) -> crate::Result<()> {
        let data = self.data_output_stream()?;
        let control = self.control_output_stream()?;

        data.sink().shutdown().await?;
        control.sink().shutdown().await?;
        Ok(())
    }
}
