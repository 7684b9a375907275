use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::encoder::MessageEncoder;

/// Why a connection was torn down. Travels as the one-byte payload of a disconnect
///  notice, and doubles as the status value that channel / connection operations
///  return to request a disconnect from the layer above (the shard worker or the
///  host's update loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Explicitly requested by the application (local or remote).
    Requested = 0,
    /// No inbound traffic within the timeout, or the handshake was never acknowledged.
    Timeout = 1,
    /// A reliable message stayed unacknowledged past the disconnect timeout, or the
    ///  in-flight backlog exceeded its bound.
    Backlog = 2,
    /// The receive window fell too far behind the peer's sequence numbers.
    WindowBehind = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlKeepAlive {
    pub id: u32,
    pub is_response: bool,
}

impl ControlKeepAlive {
    pub fn ser(&self, enc: &mut MessageEncoder) {
        enc.encode_u32(self.id);
        enc.encode_bool(self.is_response);
    }

    pub fn deser(enc: &mut MessageEncoder) -> anyhow::Result<ControlKeepAlive> {
        let id = enc.decode_u32()?;
        let is_response = enc.decode_bool()?;
        Ok(ControlKeepAlive { id, is_response })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlAcknowledgement {
    pub channel_id: u8,
    pub sequence_index: u32,
}

impl ControlAcknowledgement {
    pub fn ser(&self, enc: &mut MessageEncoder) {
        enc.encode_u8(self.channel_id);
        enc.encode_u32(self.sequence_index);
    }

    pub fn deser(enc: &mut MessageEncoder) -> anyhow::Result<ControlAcknowledgement> {
        let channel_id = enc.decode_u8()?;
        let sequence_index = enc.decode_u32()?;
        Ok(ControlAcknowledgement { channel_id, sequence_index })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDisconnect {
    pub reason: DisconnectReason,
}

impl ControlDisconnect {
    pub fn ser(&self, enc: &mut MessageEncoder) {
        enc.encode_u8(self.reason.into());
    }

    pub fn deser(enc: &mut MessageEncoder) -> anyhow::Result<ControlDisconnect> {
        let raw = enc.decode_u8()?;
        // an unknown reason byte from a newer peer is still a valid disconnect
        let reason = DisconnectReason::try_from(raw).unwrap_or(DisconnectReason::Requested);
        Ok(ControlDisconnect { reason })
    }
}
