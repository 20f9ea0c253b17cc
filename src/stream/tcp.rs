// TCP transform streams
//
// RTP and RTCP over TCP use RFC 4571 framing: every packet is preceded by a
// 2-byte big-endian length.

use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::Mutex,
};

use crate::stream::{PacketSink, PacketSource, TransformInputStream, TransformOutputStream};

/// TCP input stream
pub type TransformTcpInputStream = TransformInputStream<TcpPacketSource>;

/// TCP output stream
pub type TransformTcpOutputStream = TransformOutputStream<TcpPacketSink>;

/// Largest packet an RFC 4571 frame can carry
pub const MAX_FRAME_LENGTH: usize = u16::MAX as usize;

/// Frame a packet with its 2-byte length prefix
pub fn encode_frame(data: &[u8]) -> io::Result<Bytes> {
    if data.len() > MAX_FRAME_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} byte packet exceeds the RFC 4571 frame limit", data.len()),
        ));
    }

    let mut frame = BytesMut::with_capacity(2 + data.len());
    frame.put_u16(data.len() as u16);
    frame.put_slice(data);
    Ok(frame.freeze())
}

/// Read one framed packet into `buf`, skipping empty frames
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let length = reader.read_u16().await? as usize;
        if length == 0 {
            continue;
        }

        if length > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} byte frame exceeds the {} byte receive buffer", length, buf.len()),
            ));
        }

        reader.read_exact(&mut buf[..length]).await?;
        return Ok(length);
    }
}

/// Receiving half of a TCP connection
pub struct TcpPacketSource {
    reader: Mutex<OwnedReadHalf>,
    peer: SocketAddr,
}

impl TcpPacketSource {
    /// Create a source over the read half of a connection to `peer`
    pub fn new(reader: OwnedReadHalf, peer: SocketAddr) -> Self {
        Self {
            reader: Mutex::new(reader),
            peer,
        }
    }

    /// Get the remote address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl PacketSource for TcpPacketSource {
    async fn receive(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut reader = self.reader.lock().await;
        let length = read_frame(&mut *reader, buf).await?;
        Ok((length, self.peer))
    }
}

/// Sending half of a TCP connection
///
/// The connected peer is the only target; it stays active until the sink is
/// shut down or a write fails.
pub struct TcpPacketSink {
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
    open: AtomicBool,
}

impl TcpPacketSink {
    /// Create a sink over the write half of a connection to `peer`
    pub fn new(writer: OwnedWriteHalf, peer: SocketAddr) -> Self {
        Self {
            writer: Mutex::new(writer),
            peer,
            open: AtomicBool::new(true),
        }
    }

    /// Get the remote address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Check whether the connection is still writable
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Shut down the write half
    pub async fn shutdown(&self) -> io::Result<()> {
        self.open.store(false, Ordering::Release);
        self.writer.lock().await.shutdown().await
    }
}

#[async_trait]
impl PacketSink for TcpPacketSink {
    async fn send(&self, data: &[u8]) -> io::Result<usize> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "TCP stream is closed"));
        }

        let frame = encode_frame(data)?;
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, &frame).await {
            self.open.store(false, Ordering::Release);
            return Err(e);
        }

        Ok(1)
    }

    fn active_targets(&self) -> usize {
        usize::from(self.is_open())
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream};
    use tokio_test::io::Builder;

    use super::*;

    #[test]
    fn frames_carry_big_endian_length() {
        let frame = encode_frame(b"abc").unwrap();
        assert_eq!(&frame[..], &[0x00, 0x03, b'a', b'b', b'c']);

        assert!(encode_frame(&vec![0; MAX_FRAME_LENGTH + 1]).is_err());
    }

    #[tokio::test]
    async fn reads_frames_split_across_segments() {
        let mut reader = Builder::new()
            .read(&[0x00])
            .read(&[0x00, 0x00, 0x04, b'r', b't'])
            .read(&[b'c', b'p'])
            .build();
        let mut buf = [0u8; 16];

        let length = read_frame(&mut reader, &mut buf).await.unwrap();
        assert_eq!(&buf[..length], b"rtcp");
    }

    #[tokio::test]
    async fn rejects_frames_larger_than_buffer() {
        let mut reader = Builder::new().read(&[0x00, 0x08]).build();
        let mut buf = [0u8; 4];

        let err = read_frame(&mut reader, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn output_reaches_input_over_a_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        let (_client_read, client_write) = client.into_split();
        let (server_read, _server_write) = server.into_split();

        let output = TransformTcpOutputStream::new(
            TcpPacketSink::new(client_write, listener.local_addr().unwrap()),
            None,
        );
        let input = TransformTcpInputStream::new(TcpPacketSource::new(server_read, peer), None);

        output.write(b"first").await.unwrap();
        output.write(b"second").await.unwrap();

        assert_eq!(input.read().await.unwrap().packet.as_slice(), b"first");
        assert_eq!(input.read().await.unwrap().packet.as_slice(), b"second");

        assert_eq!(output.sink().active_targets(), 1);
        output.sink().shutdown().await.unwrap();
        assert_eq!(output.sink().active_targets(), 0);
        assert!(output.write(b"late").await.is_err());
    }
}
