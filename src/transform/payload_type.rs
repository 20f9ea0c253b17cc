// Payload type rewriting engine
//
// Maps locally used RTP payload type numbers to the numbers negotiated with
// the remote side on send, and back again on receive.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    packet::{RawPacket, RTP_FIXED_HEADER_SIZE},
    transform::{PacketTransformer, SharedTransformer, TransformEngine},
    Result, TransformError,
};

#[derive(Default)]
struct Mappings {
    /// Local payload type to wire payload type
    outbound: HashMap<u8, u8>,
    /// Wire payload type to local payload type
    inbound: HashMap<u8, u8>,
}

impl Mappings {
    /// Forget `wire` only while it still maps back to `local`
    fn remove_inbound(&mut self, wire: u8, local: u8) {
        if self.inbound.get(&wire) == Some(&local) {
            self.inbound.remove(&wire);
        }
    }
}

/// RTP transformer rewriting payload types
///
/// Each wire payload type belongs to at most one local payload type, so the
/// reverse transform always undoes the forward one.
#[derive(Default)]
pub struct PayloadTypeTransformer {
    mappings: RwLock<Mappings>,
}

impl PayloadTypeTransformer {
    /// Create a transformer with no mappings
    pub fn new() -> Self {
        Self::default()
    }

    /// Send packets carrying `local` as `wire`, and map `wire` back on receive
    pub fn add_mapping(&self, local: u8, wire: u8) -> Result<()> {
        if local > 0x7F || wire > 0x7F {
            return Err(TransformError::Transform(format!(
                "Payload type mapping {} -> {} outside 0..=127",
                local, wire
            )));
        }

        let mut mappings = self.mappings.write();
        if let Some(&owner) = mappings.inbound.get(&wire) {
            if owner != local {
                return Err(TransformError::Transform(format!(
                    "Wire payload type {} is already mapped from {}",
                    wire, owner
                )));
            }
        }

        if let Some(previous) = mappings.outbound.insert(local, wire) {
            mappings.remove_inbound(previous, local);
        }
        mappings.inbound.insert(wire, local);

        Ok(())
    }

    /// Remove the mapping for `local`
    pub fn remove_mapping(&self, local: u8) {
        let mut mappings = self.mappings.write();
        if let Some(wire) = mappings.outbound.remove(&local) {
            mappings.remove_inbound(wire, local);
        }
    }

    /// Get the current local to wire mappings
    pub fn mappings(&self) -> HashMap<u8, u8> {
        self.mappings.read().outbound.clone()
    }

    fn rewrite(packet: &mut RawPacket, table: &HashMap<u8, u8>) -> Result<()> {
        if packet.length() < RTP_FIXED_HEADER_SIZE || table.is_empty() {
            return Ok(());
        }

        let payload_type = packet.payload_type()?;
        if let Some(&mapped) = table.get(&payload_type) {
            packet.set_payload_type(mapped)?;
        }

        Ok(())
    }
}

impl PacketTransformer for PayloadTypeTransformer {
    fn transform(&self, mut packet: RawPacket) -> Result<Option<RawPacket>> {
        Self::rewrite(&mut packet, &self.mappings.read().outbound)?;
        Ok(Some(packet))
    }

    fn reverse_transform(&self, mut packet: RawPacket) -> Result<Option<RawPacket>> {
        Self::rewrite(&mut packet, &self.mappings.read().inbound)?;
        Ok(Some(packet))
    }
}

/// Engine rewriting RTP payload types; RTCP passes through
#[derive(Default)]
pub struct PayloadTypeTransformEngine {
    transformer: Arc<PayloadTypeTransformer>,
}

impl PayloadTypeTransformEngine {
    /// Create an engine with no mappings
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the RTP transformer to manage mappings
    pub fn transformer(&self) -> &Arc<PayloadTypeTransformer> {
        &self.transformer
    }
}

impl TransformEngine for PayloadTypeTransformEngine {
    fn rtp_transformer(&self) -> Option<SharedTransformer> {
        Some(self.transformer.clone())
    }

    fn rtcp_transformer(&self) -> Option<SharedTransformer> {
        None
    }

    fn name(&self) -> &str {
        "payload-type"
    }
}
