// UDP transform streams
//
// One shared UdpSocket backs both directions of a channel. The output side
// keeps the list of remote targets every packet is sent to.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::UdpSocket;

use crate::stream::{PacketSink, PacketSource, TransformInputStream, TransformOutputStream};

/// UDP input stream
pub type TransformUdpInputStream = TransformInputStream<UdpPacketSource>;

/// UDP output stream
pub type TransformUdpOutputStream = TransformOutputStream<UdpPacketSink>;

/// Receiving side of a UDP socket
pub struct UdpPacketSource {
    socket: Arc<UdpSocket>,
}

impl UdpPacketSource {
    /// Create a source over `socket`
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    /// Get the underlying socket
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

#[async_trait]
impl PacketSource for UdpPacketSource {
    async fn receive(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// Sending side of a UDP socket with its remote targets
pub struct UdpPacketSink {
    socket: Arc<UdpSocket>,
    targets: RwLock<Vec<SocketAddr>>,
}

impl UdpPacketSink {
    /// Create a sink over `socket` with no targets
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            targets: RwLock::new(Vec::new()),
        }
    }

    /// Get the underlying socket
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Add a remote target; adding one already present does nothing
    pub fn add_target(&self, target: SocketAddr) {
        let mut targets = self.targets.write();
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    /// Remove a remote target, returning whether it was present
    pub fn remove_target(&self, target: &SocketAddr) -> bool {
        let mut targets = self.targets.write();
        let before = targets.len();
        targets.retain(|t| t != target);
        targets.len() != before
    }

    /// Remove every remote target
    pub fn remove_targets(&self) {
        self.targets.write().clear();
    }

    /// Get the current remote targets
    pub fn targets(&self) -> Vec<SocketAddr> {
        self.targets.read().clone()
    }
}

#[async_trait]
impl PacketSink for UdpPacketSink {
    async fn send(&self, data: &[u8]) -> io::Result<usize> {
        // Copy so no lock is held across the await
        let targets = self.targets();

        for target in &targets {
            self.socket.send_to(data, target).await?;
        }

        Ok(targets.len())
    }

    fn active_targets(&self) -> usize {
        self.targets.read().len()
    }
}
