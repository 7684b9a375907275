use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;

use crate::connection::Connection;
use crate::dispatch::Handler;
use crate::encoder::MessageEncoder;

/// Byte offset of the sequence index slot in frames on channels that carry one.
pub const SEQUENCE_OFFSET: usize = 1;

/// One message, outbound or inbound, together with its wire framing.
///
/// The frame layout is `[channel id][sequence index?][signature][payload]` - see the
///  crate documentation. Outbound messages are built via [`Message::for_connection`],
///  which writes the header and leaves the cursor at the start of the payload; the
///  sequence index slot (if the channel has one) is reserved zero-filled and patched
///  by the channel when the message is stamped. Inbound messages are built via
///  [`Message::inbound`] with the cursor just past the channel id; the channel strips
///  the sequence index and the dispatch tree consumes the signature, so a handler
///  callback sees the cursor at the start of the payload.
#[derive(Clone)]
pub struct Message {
    endpoint: SocketAddr,
    channel_id: u8,
    pub encoder: MessageEncoder,
    enqueued_at: u64,
    connection: Option<Arc<Connection>>,
}

impl Message {
    /// Builds an outbound message addressed at `handler` on the given channel.
    ///
    /// Fails if the channel id is not configured on this connection, or if the handler
    ///  is a branch node or the dispatch tree has not been optimized yet (a message
    ///  cannot be routed without a leaf signature).
    pub fn for_connection(
        connection: &Arc<Connection>,
        handler: &Handler,
        channel_id: u8,
    ) -> anyhow::Result<Message> {
        let Some(template) = connection.channel_template(channel_id) else {
            bail!("channel {} is not configured on this connection", channel_id);
        };

        let mut encoder = MessageEncoder::new();
        encoder.encode_u8(channel_id);
        if template.has_sequence_header() {
            // stamped by the channel when the message leaves the send queue
            encoder.skip(4);
        }
        encoder.encode_raw(handler.signature()?);

        Ok(Message {
            endpoint: connection.endpoint(),
            channel_id,
            encoder,
            enqueued_at: connection.now_millis(),
            connection: Some(connection.clone()),
        })
    }

    /// Wraps a received datagram, decoding the channel id.
    pub fn inbound(endpoint: SocketAddr, data: Vec<u8>, now: u64) -> anyhow::Result<Message> {
        let mut encoder = MessageEncoder::from_bytes(data);
        let channel_id = encoder.decode_u8()?;

        Ok(Message {
            endpoint,
            channel_id,
            encoder,
            enqueued_at: now,
            connection: None,
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    pub fn enqueued_at(&self) -> u64 {
        self.enqueued_at
    }

    /// The connection this message belongs to. Set on outbound messages from the start;
    ///  set on inbound messages once the endpoint has been resolved against the pool.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    pub fn set_connection(&mut self, connection: Arc<Connection>) {
        self.connection = Some(connection);
    }

    /// The complete wire frame (everything written, regardless of the cursor).
    pub fn frame(&self) -> Vec<u8> {
        let mut encoder = self.encoder.clone();
        let len = encoder.len();
        encoder.set_position(len);
        encoder.written().to_vec()
    }
}
