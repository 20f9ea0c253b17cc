// Raw packet buffers for the transform pipeline
//
// A RawPacket is a length-bounded view over a byte buffer carrying one RTP or
// RTCP payload as it came off (or is about to go onto) the wire.

use bytes::Bytes;

use crate::{Result, TransformError};

/// Size of the fixed RTP header
pub const RTP_FIXED_HEADER_SIZE: usize = 12;

/// Size of the fixed RTCP header
pub const RTCP_FIXED_HEADER_SIZE: usize = 8;

/// One RTP or RTCP packet occupying `buffer[offset..offset + length]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Backing buffer
    buffer: Vec<u8>,
    /// Start of the packet within the buffer
    offset: usize,
    /// Length of the packet
    length: usize,
}

impl RawPacket {
    /// Create a packet over an existing buffer region
    pub fn new(buffer: Vec<u8>, offset: usize, length: usize) -> Result<Self> {
        match offset.checked_add(length) {
            Some(end) if end <= buffer.len() => Ok(Self { buffer, offset, length }),
            _ => Err(TransformError::Packet(format!(
                "Region {}+{} exceeds buffer capacity {}",
                offset,
                length,
                buffer.len()
            ))),
        }
    }

    /// Create a packet by copying `data` into a fresh buffer
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buffer: data.to_vec(),
            offset: 0,
            length: data.len(),
        }
    }

    /// Get the whole backing buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Get the offset of the packet within the buffer
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Get the packet length
    pub fn length(&self) -> usize {
        self.length
    }

    /// Get the capacity of the backing buffer
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Check whether the packet holds no bytes
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Get the packet bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.length]
    }

    /// Get the packet bytes for in-place modification
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer[self.offset..self.offset + self.length]
    }

    /// Set the packet length without touching the buffer
    pub fn set_length(&mut self, length: usize) -> Result<()> {
        if self.offset + length > self.buffer.len() {
            return Err(TransformError::Packet(format!(
                "Length {} at offset {} exceeds buffer capacity {}",
                length,
                self.offset,
                self.buffer.len()
            )));
        }

        self.length = length;
        Ok(())
    }

    /// Make room for `additional` bytes past the end of the packet
    pub fn grow(&mut self, additional: usize) {
        let required = self.offset + self.length + additional;
        if required > self.buffer.len() {
            self.buffer.resize(required, 0);
        }
    }

    /// Append bytes to the end of the packet, growing the buffer if needed
    pub fn append(&mut self, data: &[u8]) {
        self.grow(data.len());

        let end = self.offset + self.length;
        self.buffer[end..end + data.len()].copy_from_slice(data);
        self.length += data.len();
    }

    /// Remove `count` bytes from the end of the packet
    pub fn shrink(&mut self, count: usize) -> Result<()> {
        if count > self.length {
            return Err(TransformError::Packet(format!(
                "Cannot shrink {} bytes from a {} byte packet",
                count, self.length
            )));
        }

        self.length -= count;
        Ok(())
    }

    /// Read one byte at `index` relative to the packet start
    pub fn read_u8(&self, index: usize) -> Result<u8> {
        self.check_range(index, 1)?;
        Ok(self.buffer[self.offset + index])
    }

    /// Read a big-endian u16 at `index` relative to the packet start
    pub fn read_u16(&self, index: usize) -> Result<u16> {
        self.check_range(index, 2)?;
        let at = self.offset + index;
        Ok(((self.buffer[at] as u16) << 8) | (self.buffer[at + 1] as u16))
    }

    /// Read a big-endian u32 at `index` relative to the packet start
    pub fn read_u32(&self, index: usize) -> Result<u32> {
        self.check_range(index, 4)?;
        let at = self.offset + index;
        Ok(((self.buffer[at] as u32) << 24)
            | ((self.buffer[at + 1] as u32) << 16)
            | ((self.buffer[at + 2] as u32) << 8)
            | (self.buffer[at + 3] as u32))
    }

    /// Write one byte at `index` relative to the packet start
    pub fn write_u8(&mut self, index: usize, value: u8) -> Result<()> {
        self.check_range(index, 1)?;
        self.buffer[self.offset + index] = value;
        Ok(())
    }

    /// RTP version (2 for every packet this stack produces)
    pub fn version(&self) -> Result<u8> {
        Ok((self.read_u8(0)? >> 6) & 0x03)
    }

    /// RTP padding flag
    pub fn padding(&self) -> Result<bool> {
        Ok((self.read_u8(0)? >> 5) & 0x01 != 0)
    }

    /// RTP header extension flag
    pub fn extension(&self) -> Result<bool> {
        Ok((self.read_u8(0)? >> 4) & 0x01 != 0)
    }

    /// RTP CSRC count
    pub fn csrc_count(&self) -> Result<u8> {
        Ok(self.read_u8(0)? & 0x0F)
    }

    /// RTP marker bit
    pub fn marker(&self) -> Result<bool> {
        Ok((self.read_u8(1)? >> 7) & 0x01 != 0)
    }

    /// RTP payload type
    pub fn payload_type(&self) -> Result<u8> {
        Ok(self.read_u8(1)? & 0x7F)
    }

    /// Replace the RTP payload type, keeping the marker bit
    pub fn set_payload_type(&mut self, payload_type: u8) -> Result<()> {
        let b1 = self.read_u8(1)?;
        self.write_u8(1, (b1 & 0x80) | (payload_type & 0x7F))
    }

    /// RTP sequence number
    pub fn sequence_number(&self) -> Result<u16> {
        self.read_u16(2)
    }

    /// RTP timestamp
    pub fn timestamp(&self) -> Result<u32> {
        self.read_u32(4)
    }

    /// RTP synchronization source
    pub fn ssrc(&self) -> Result<u32> {
        self.read_u32(8)
    }

    /// Length of the RTP header including CSRCs and the header extension
    pub fn header_length(&self) -> Result<usize> {
        if self.length < RTP_FIXED_HEADER_SIZE {
            return Err(TransformError::Packet("RTP packet too short".to_string()));
        }

        let mut length = RTP_FIXED_HEADER_SIZE + self.csrc_count()? as usize * 4;

        if self.extension()? {
            // Extension length counts 32-bit words after the 4 byte extension header
            let words = self.read_u16(length + 2)? as usize;
            length += 4 + words * 4;
        }

        if length > self.length {
            return Err(TransformError::Packet("RTP packet too short for its header".to_string()));
        }

        Ok(length)
    }

    /// RTP payload bytes following the header
    pub fn payload(&self) -> Result<&[u8]> {
        let header_length = self.header_length()?;
        Ok(&self.as_slice()[header_length..])
    }

    /// RTCP packet type (second byte of the RTCP header)
    pub fn rtcp_packet_type(&self) -> Result<u8> {
        if self.length < RTCP_FIXED_HEADER_SIZE {
            return Err(TransformError::Packet("RTCP packet too short".to_string()));
        }

        self.read_u8(1)
    }

    /// Check whether the packet looks like RTCP when RTP and RTCP share a socket
    pub fn is_rtcp(&self) -> bool {
        // RFC 5761: RTCP packet types 192..=223 never collide with RTP payload types
        matches!(self.read_u8(1), Ok(pt) if (192..=223).contains(&pt))
    }

    /// Consume the packet and return its bytes
    pub fn into_bytes(self) -> Bytes {
        let end = self.offset + self.length;
        Bytes::from(self.buffer).slice(self.offset..end)
    }

    fn check_range(&self, index: usize, width: usize) -> Result<()> {
        if index + width > self.length {
            return Err(TransformError::Packet(format!(
                "Read of {} byte(s) at {} outside a {} byte packet",
                width, index, self.length
            )));
        }
        Ok(())
    }
}

impl From<Vec<u8>> for RawPacket {
    fn from(buffer: Vec<u8>) -> Self {
        let length = buffer.len();
        Self { buffer, offset: 0, length }
    }
}
