use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::ChannelTemplate;
use crate::control::DisconnectReason;
use crate::message::{Message, SEQUENCE_OFFSET};
use crate::reliable::{InFlightCopy, ReliableReceiveChannel, ReliableSendChannel};

/// Send-side state of one channel. The reliability variant is picked at construction
///  from the channel's template; there is no dynamic dispatch on the hot path.
///
/// Send and receive state are separate types so a connection can guard its outbound
///  and inbound directions with independent locks.
pub enum SendChannel {
    Unreliable(UnreliableSendChannel),
    Reliable(ReliableSendChannel),
}

impl SendChannel {
    pub fn new(
        template: ChannelTemplate,
        unreliable_drop_timeout: u64,
        resend_interval: u64,
        disconnect_timeout: u64,
    ) -> SendChannel {
        if template.reliable {
            SendChannel::Reliable(ReliableSendChannel::new(resend_interval, disconnect_timeout))
        } else {
            SendChannel::Unreliable(UnreliableSendChannel::new(
                template.sequenced,
                unreliable_drop_timeout,
            ))
        }
    }

    pub fn enqueue(&mut self, message: Message) {
        match self {
            SendChannel::Unreliable(channel) => channel.enqueue(message),
            SendChannel::Reliable(channel) => channel.enqueue(message),
        }
    }

    /// The next frame to put on the wire, or `None` if the channel has nothing due.
    pub fn dequeue(&mut self, now: u64) -> Result<Option<Vec<u8>>, DisconnectReason> {
        match self {
            SendChannel::Unreliable(channel) => Ok(channel.dequeue(now)),
            SendChannel::Reliable(channel) => channel.dequeue(now),
        }
    }

    /// The shared in-flight list, for acknowledgement processing. `None` for
    ///  unreliable channels, which never expect acknowledgements.
    pub fn in_flight(&self) -> Option<Arc<Mutex<Vec<InFlightCopy>>>> {
        match self {
            SendChannel::Unreliable(_) => None,
            SendChannel::Reliable(channel) => Some(channel.in_flight()),
        }
    }
}

/// Receive-side state of one channel.
pub enum ReceiveChannel {
    Unreliable(UnreliableReceiveChannel),
    Reliable(ReliableReceiveChannel),
}

impl ReceiveChannel {
    pub fn new(template: ChannelTemplate) -> ReceiveChannel {
        if template.reliable {
            ReceiveChannel::Reliable(ReliableReceiveChannel::new(template.sequenced))
        } else {
            ReceiveChannel::Unreliable(UnreliableReceiveChannel::new(template.sequenced))
        }
    }

    /// Feeds one inbound message into the channel. Deliverable messages (possibly
    ///  several, when a gap closes) are queued for [`ReceiveChannel::pop_deliverable`].
    ///  Returns the sequence index to acknowledge, if any - reliable channels
    ///  acknowledge every non-fatal arrival, duplicates included.
    pub fn receive(&mut self, message: Message) -> Result<Option<u32>, DisconnectReason> {
        match self {
            ReceiveChannel::Unreliable(channel) => {
                channel.receive(message);
                Ok(None)
            }
            ReceiveChannel::Reliable(channel) => channel.receive(message),
        }
    }

    pub fn pop_deliverable(&mut self) -> Option<Message> {
        match self {
            ReceiveChannel::Unreliable(channel) => channel.deliverable.pop_front(),
            ReceiveChannel::Reliable(channel) => channel.pop_deliverable(),
        }
    }
}

pub struct UnreliableSendChannel {
    sequenced: bool,
    drop_timeout: u64,
    send_sequence_index: u32,
    queue: VecDeque<Message>,
}

impl UnreliableSendChannel {
    fn new(sequenced: bool, drop_timeout: u64) -> UnreliableSendChannel {
        UnreliableSendChannel {
            sequenced,
            drop_timeout,
            send_sequence_index: 0,
            queue: VecDeque::new(),
        }
    }

    /// Sequenced channels stamp the sequence index at enqueue time: the order in
    ///  which the application hands over messages is the order the receiver honors.
    fn enqueue(&mut self, mut message: Message) {
        if self.sequenced {
            self.send_sequence_index += 1;
            let end = message.encoder.position();
            message.encoder.set_position(SEQUENCE_OFFSET);
            message.encoder.encode_u32(self.send_sequence_index);
            message.encoder.set_position(end);
        }
        self.queue.push_back(message);
    }

    fn dequeue(&mut self, now: u64) -> Option<Vec<u8>> {
        while let Some(message) = self.queue.pop_front() {
            if now.saturating_sub(message.enqueued_at()) > self.drop_timeout {
                debug!(channel = message.channel_id(), "dropping stale unreliable message");
                continue;
            }
            return Some(message.frame());
        }
        None
    }
}

pub struct UnreliableReceiveChannel {
    sequenced: bool,
    receive_sequence_index: u32,
    deliverable: VecDeque<Message>,
}

impl UnreliableReceiveChannel {
    fn new(sequenced: bool) -> UnreliableReceiveChannel {
        UnreliableReceiveChannel {
            sequenced,
            receive_sequence_index: 0,
            deliverable: VecDeque::new(),
        }
    }

    /// Sequenced: anything not strictly newer than the last delivered message is
    ///  dropped; gaps are never waited on. Unsequenced: everything is delivered.
    fn receive(&mut self, mut message: Message) {
        if self.sequenced {
            let sequence_index = match message.encoder.decode_u32() {
                Ok(sequence_index) => sequence_index,
                Err(_) => {
                    debug!("dropping unreliable message with a truncated sequence index");
                    return;
                }
            };
            if sequence_index <= self.receive_sequence_index {
                debug!(
                    sequence_index,
                    newest = self.receive_sequence_index,
                    "dropping stale or duplicate unreliable message"
                );
                return;
            }
            self.receive_sequence_index = sequence_index;
        }
        self.deliverable.push_back(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    /// channel id 1, a zero-filled sequence slot, one payload byte
    fn outbound(payload: u8, enqueued_at: u64) -> Message {
        Message::inbound(addr(), vec![1, 0, 0, 0, 0, payload], enqueued_at).unwrap()
    }

    /// channel id 1 and an explicit sequence index, cursor past the channel id
    fn inbound(sequence_index: u32, payload: u8) -> Message {
        let mut data = vec![1u8];
        data.extend_from_slice(&sequence_index.to_be_bytes());
        data.push(payload);
        Message::inbound(addr(), data, 0).unwrap()
    }

    #[test]
    fn sequenced_send_stamps_increasing_indices_at_enqueue() {
        let mut channel = UnreliableSendChannel::new(true, 500);
        channel.enqueue(outbound(0xaa, 0));
        channel.enqueue(outbound(0xbb, 0));

        let first = channel.dequeue(0).unwrap();
        let second = channel.dequeue(0).unwrap();
        assert_eq!(first, vec![1, 0, 0, 0, 1, 0xaa]);
        assert_eq!(second, vec![1, 0, 0, 0, 2, 0xbb]);
        assert!(channel.dequeue(0).is_none());
    }

    #[test]
    fn unsequenced_send_leaves_the_header_untouched() {
        let mut channel = UnreliableSendChannel::new(false, 500);
        channel.enqueue(outbound(0xaa, 0));

        assert_eq!(channel.dequeue(0).unwrap(), vec![1, 0, 0, 0, 0, 0xaa]);
    }

    #[test]
    fn stale_messages_are_dropped_at_dequeue() {
        let mut channel = UnreliableSendChannel::new(false, 500);
        channel.enqueue(outbound(0xaa, 100));
        channel.enqueue(outbound(0xbb, 650));

        // at t=700 the first message is 600ms old and past the 500ms drop timeout
        assert_eq!(channel.dequeue(700).unwrap(), vec![1, 0, 0, 0, 0, 0xbb]);
        assert!(channel.dequeue(700).is_none());
    }

    #[rstest]
    #[case::older(1, false)]
    #[case::duplicate(2, false)]
    #[case::newer(3, true)]
    fn sequenced_receive_drops_anything_not_strictly_newer(
        #[case] sequence_index: u32,
        #[case] delivered: bool,
    ) {
        let mut channel = UnreliableReceiveChannel::new(true);
        channel.receive(inbound(2, 0xaa));
        assert!(channel.deliverable.pop_front().is_some());

        channel.receive(inbound(sequence_index, 0xbb));
        assert_eq!(channel.deliverable.pop_front().is_some(), delivered);
    }

    #[test]
    fn sequenced_receive_skips_gaps_without_waiting() {
        let mut channel = UnreliableReceiveChannel::new(true);
        channel.receive(inbound(1, 0xaa));
        channel.receive(inbound(5, 0xbb));
        // the gap 2..4 is gone for good, 5 was delivered anyway
        channel.receive(inbound(3, 0xcc));

        assert_eq!(channel.deliverable.len(), 2);
    }

    #[test]
    fn unsequenced_receive_delivers_everything() {
        let mut channel = UnreliableReceiveChannel::new(false);
        for _ in 0..3 {
            channel.receive(Message::inbound(addr(), vec![1, 0xaa], 0).unwrap());
        }

        assert_eq!(channel.deliverable.len(), 3);
    }

    #[test]
    fn enum_facade_routes_acks_only_for_reliable() {
        let unreliable = SendChannel::new(
            ChannelTemplate { reliable: false, sequenced: true },
            500,
            300,
            3000,
        );
        let reliable = SendChannel::new(
            ChannelTemplate { reliable: true, sequenced: true },
            500,
            300,
            3000,
        );

        assert!(unreliable.in_flight().is_none());
        assert!(reliable.in_flight().is_some());
    }
}
