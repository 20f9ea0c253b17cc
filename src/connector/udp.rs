// UDP connector transport

use std::{io, net::SocketAddr, sync::Arc};

use tokio::net::UdpSocket;

use crate::{
    connector::{ConnectorTransport, RtpTransformConnector},
    stream::{UdpPacketSink, UdpPacketSource},
    Result,
};

/// UDP connector
pub type RtpTransformUdpConnector = RtpTransformConnector<UdpTransport>;

/// Pair of bound UDP sockets for RTP and RTCP
pub struct UdpTransport {
    data: Arc<UdpSocket>,
    control: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Create a transport over already bound sockets
    pub fn new(data: Arc<UdpSocket>, control: Arc<UdpSocket>) -> Self {
        Self { data, control }
    }

    /// Get the data socket
    pub fn data_socket(&self) -> &Arc<UdpSocket> {
        &self.data
    }

    /// Get the control socket
    pub fn control_socket(&self) -> &Arc<UdpSocket> {
        &self.control
    }
}

impl ConnectorTransport for UdpTransport {
    type Source = UdpPacketSource;
    type Sink = UdpPacketSink;

    fn data_source(&self) -> io::Result<Self::Source> {
        Ok(UdpPacketSource::new(self.data.clone()))
    }

    fn data_sink(&self) -> io::Result<Self::Sink> {
        Ok(UdpPacketSink::new(self.data.clone()))
    }

    fn control_source(&self) -> io::Result<Self::Source> {
        Ok(UdpPacketSource::new(self.control.clone()))
    }

    fn control_sink(&self) -> io::Result<Self::Sink> {
        Ok(UdpPacketSink::new(self.control.clone()))
    }
}

impl RtpTransformConnector<UdpTransport> {
    /// Send RTP to `data` and RTCP to `control` from now on
    pub fn add_target(&self, data: SocketAddr, control: SocketAddr) -> Result<()> {
        self.data_output_stream()?.sink().add_target(data);
        self.control_output_stream()?.sink().add_target(control);
        Ok(())
    }

    /// Stop sending to a target pair, returning whether either address was present
    pub fn remove_target(&self, data: &SocketAddr, control: &SocketAddr) -> Result<bool> {
        let removed_data = self.data_output_stream()?.sink().remove_target(data);
        let removed_control = self.control_output_stream()?.sink().remove_target(control);
        Ok(removed_data || removed_control)
    }

    /// Stop sending to every target
    pub fn remove_targets(&self) -> Result<()> {
        self.data_output_stream()?.sink().remove_targets();
        self.control_output_stream()?.sink().remove_targets();
        Ok(())
    }
}
