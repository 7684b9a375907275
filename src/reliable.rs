use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::control::DisconnectReason;
use crate::message::{Message, SEQUENCE_OFFSET};
use crate::ring_buffer::RingBuffer;

/// Size of the receive window: how far ahead of the delivery watermark a sequence
///  number may run and still be tracked for buffering / duplicate suppression.
pub const WINDOW_SIZE: usize = 128;

/// Half the window. A sequence number this far *behind* the watermark means the peer
///  has fallen hopelessly behind; a gap offset reaching the full window triggers a
///  forward jump of this size (see [`ReliableReceiveChannel::receive`]).
const HALF_WINDOW: u32 = 64;

/// Upper bound on unacknowledged in-flight copies per channel before the connection
///  is considered broken.
const IN_FLIGHT_LIMIT: usize = 64;

/// A retained copy of a sent reliable message, kept until acknowledged.
pub struct InFlightCopy {
    pub sequence_index: u32,
    /// When the message was originally enqueued - bounds total time-to-ack.
    pub enqueued_at: u64,
    /// When the frame last went on the wire - schedules retransmission.
    pub sent_at: u64,
    pub frame: Vec<u8>,
}

/// Removes the acknowledged copy, if it is still in flight. Duplicate
///  acknowledgements are normal (every arrival is acked) and simply find nothing.
pub fn acknowledge(in_flight: &Mutex<Vec<InFlightCopy>>, sequence_index: u32) {
    let mut copies = in_flight.lock().unwrap();
    if let Some(position) = copies.iter().position(|c| c.sequence_index == sequence_index) {
        copies.remove(position);
    } else {
        debug!(sequence_index, "acknowledgement for a message no longer in flight");
    }
}

pub struct ReliableSendChannel {
    resend_interval: u64,
    disconnect_timeout: u64,
    send_sequence_index: u32,
    queue: VecDeque<Message>,
    /// Shared with the acknowledgement path, which runs under the connection's send
    ///  lock but must not re-enter this channel - hence the own lock.
    in_flight: Arc<Mutex<Vec<InFlightCopy>>>,
}

impl ReliableSendChannel {
    pub fn new(resend_interval: u64, disconnect_timeout: u64) -> ReliableSendChannel {
        ReliableSendChannel {
            resend_interval,
            disconnect_timeout,
            send_sequence_index: 0,
            queue: VecDeque::new(),
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn in_flight(&self) -> Arc<Mutex<Vec<InFlightCopy>>> {
        self.in_flight.clone()
    }

    pub fn enqueue(&mut self, message: Message) {
        self.queue.push_back(message);
    }

    /// Retransmissions take strict priority over fresh messages, and a fresh message
    ///  is only stamped with its sequence number when it actually leaves the queue.
    ///
    /// Fatal conditions are checked first: a backlog beyond the in-flight bound, or
    ///  any copy unacknowledged for longer than the disconnect timeout, mean the peer
    ///  is not consuming what we send.
    pub fn dequeue(&mut self, now: u64) -> Result<Option<Vec<u8>>, DisconnectReason> {
        let mut in_flight = self.in_flight.lock().unwrap();

        if in_flight.len() > IN_FLIGHT_LIMIT {
            return Err(DisconnectReason::Backlog);
        }
        if in_flight
            .iter()
            .any(|c| now.saturating_sub(c.enqueued_at) > self.disconnect_timeout)
        {
            return Err(DisconnectReason::Timeout);
        }

        if let Some(copy) = in_flight
            .iter_mut()
            .find(|c| now.saturating_sub(c.sent_at) >= self.resend_interval)
        {
            copy.sent_at = now;
            return Ok(Some(copy.frame.clone()));
        }

        if let Some(mut message) = self.queue.pop_front() {
            self.send_sequence_index += 1;
            let end = message.encoder.position();
            message.encoder.set_position(SEQUENCE_OFFSET);
            message.encoder.encode_u32(self.send_sequence_index);
            message.encoder.set_position(end);

            let frame = message.frame();
            in_flight.push(InFlightCopy {
                sequence_index: self.send_sequence_index,
                enqueued_at: message.enqueued_at(),
                sent_at: now,
                frame: frame.clone(),
            });
            return Ok(Some(frame));
        }

        Ok(None)
    }
}

#[derive(Clone)]
struct WindowSlot {
    sequence_index: u32,
    /// Present for sequenced channels buffering an ahead-of-order message; `None` when
    ///  the slot merely records a seen sequence number for duplicate suppression.
    buffered: Option<Message>,
}

pub struct ReliableReceiveChannel {
    sequenced: bool,
    /// Sequenced: the last delivered sequence index. Unsequenced: the watermark below
    ///  which every sequence index has been seen.
    receive_sequence_index: u32,
    window: RingBuffer<Option<WindowSlot>>,
    deliverable: VecDeque<Message>,
}

impl ReliableReceiveChannel {
    pub fn new(sequenced: bool) -> ReliableReceiveChannel {
        ReliableReceiveChannel {
            sequenced,
            receive_sequence_index: 0,
            window: RingBuffer::new(WINDOW_SIZE),
            deliverable: VecDeque::new(),
        }
    }

    pub fn pop_deliverable(&mut self) -> Option<Message> {
        self.deliverable.pop_front()
    }

    /// Feeds one inbound reliable message into the window.
    ///
    /// Every non-fatal arrival is acknowledged, duplicates and already-delivered
    ///  messages included - the peer retransmits until it sees the acknowledgement,
    ///  so a lost ack must not lead to a stuck retransmit loop.
    ///
    /// A sequence index trailing the watermark by half a window or more is fatal: the
    ///  peer is retransmitting something we moved past long ago, the connection is
    ///  beyond repair.
    ///
    /// When the gap between watermark and arrival reaches the full window, the
    ///  watermark jumps forward by half a window. Sequenced messages inside the
    ///  jumped-over range are then treated as already delivered: acknowledged, never
    ///  handed to the application. That loss is inherent to the fixed-size window.
    pub fn receive(&mut self, mut message: Message) -> Result<Option<u32>, DisconnectReason> {
        let sequence_index = match message.encoder.decode_u32() {
            Ok(sequence_index) => sequence_index,
            Err(_) => {
                debug!("dropping reliable message with a truncated sequence index");
                return Ok(None);
            }
        };

        if sequence_index as u64 + HALF_WINDOW as u64 <= self.receive_sequence_index as u64 {
            return Err(DisconnectReason::WindowBehind);
        }
        if sequence_index <= self.receive_sequence_index {
            // delivered earlier; the peer missed our acknowledgement
            return Ok(Some(sequence_index));
        }

        let mut offset = sequence_index - self.receive_sequence_index;
        if offset as usize >= WINDOW_SIZE {
            self.receive_sequence_index += HALF_WINDOW;
            offset -= HALF_WINDOW;
        }

        // the window capacity is fixed and non-zero, these lookups cannot fail
        {
            let Ok(slot) = self.window.get(sequence_index as i64) else {
                return Ok(None);
            };
            if slot.as_ref().map(|s| s.sequence_index) == Some(sequence_index) {
                return Ok(Some(sequence_index));
            }
        }

        if self.sequenced {
            if offset == 1 {
                self.receive_sequence_index = sequence_index;
                self.deliverable.push_back(message);
                let _ = self.window.set(sequence_index as i64, None);
                self.drain_contiguous(true);
            } else {
                let _ = self.window.set(
                    sequence_index as i64,
                    Some(WindowSlot { sequence_index, buffered: Some(message) }),
                );
            }
        } else {
            self.deliverable.push_back(message);
            let _ = self.window.set(
                sequence_index as i64,
                Some(WindowSlot { sequence_index, buffered: None }),
            );
            self.drain_contiguous(false);
        }

        Ok(Some(sequence_index))
    }

    /// Advances the watermark across contiguously present successor slots. For
    ///  sequenced channels this also releases the buffered messages in order.
    fn drain_contiguous(&mut self, deliver: bool) {
        loop {
            let next = self.receive_sequence_index + 1;
            let Ok(slot) = self.window.get_mut(next as i64) else {
                return;
            };
            match slot {
                Some(s) if s.sequence_index == next => {
                    if deliver {
                        match s.buffered.take() {
                            Some(buffered) => self.deliverable.push_back(buffered),
                            None => return,
                        }
                    }
                    *slot = None;
                    self.receive_sequence_index = next;
                }
                _ => return,
            }
        }
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

    /// channel id 2, a zero-filled sequence slot, one payload byte
    fn outbound(payload: u8, enqueued_at: u64) -> Message {
        Message::inbound(addr(), vec![2, 0, 0, 0, 0, payload], enqueued_at).unwrap()
    }

    /// channel id 2 with an explicit sequence index, cursor past the channel id
    fn inbound(sequence_index: u32, payload: u8) -> Message {
        let mut data = vec![2u8];
        data.extend_from_slice(&sequence_index.to_be_bytes());
        data.push(payload);
        Message::inbound(addr(), data, 0).unwrap()
    }

    fn payload_of(message: &Message) -> u8 {
        *message.frame().last().unwrap()
    }

    mod send {
        use super::*;

        #[test]
        fn fresh_messages_are_stamped_at_dequeue() {
            let mut channel = ReliableSendChannel::new(300, 3000);
            channel.enqueue(outbound(0xaa, 0));
            channel.enqueue(outbound(0xbb, 0));

            assert_eq!(channel.dequeue(0).unwrap().unwrap(), vec![2, 0, 0, 0, 1, 0xaa]);
            assert_eq!(channel.dequeue(0).unwrap().unwrap(), vec![2, 0, 0, 0, 2, 0xbb]);
            // both copies were just sent, nothing is due
            assert!(channel.dequeue(0).unwrap().is_none());
        }

        #[test]
        fn unacknowledged_copies_are_retransmitted_unchanged() {
            let mut channel = ReliableSendChannel::new(300, 3000);
            channel.enqueue(outbound(0xaa, 0));

            let first = channel.dequeue(0).unwrap().unwrap();
            assert!(channel.dequeue(100).unwrap().is_none());
            let resent = channel.dequeue(300).unwrap().unwrap();
            assert_eq!(resent, first);
            // retransmission rescheduled the copy
            assert!(channel.dequeue(400).unwrap().is_none());
            assert!(channel.dequeue(600).unwrap().is_some());
        }

        #[test]
        fn retransmission_takes_priority_over_fresh_messages() {
            let mut channel = ReliableSendChannel::new(300, 3000);
            channel.enqueue(outbound(0xaa, 0));
            channel.dequeue(0).unwrap().unwrap();
            channel.enqueue(outbound(0xbb, 0));

            let frame = channel.dequeue(300).unwrap().unwrap();
            assert_eq!(payload_of(&Message::inbound(addr(), frame, 0).unwrap()), 0xaa);
        }

        #[test]
        fn acknowledged_copies_stop_retransmitting() {
            let mut channel = ReliableSendChannel::new(300, 3000);
            channel.enqueue(outbound(0xaa, 0));
            channel.dequeue(0).unwrap().unwrap();

            acknowledge(&channel.in_flight(), 1);
            assert!(channel.dequeue(1000).unwrap().is_none());

            // a duplicate ack is harmless
            acknowledge(&channel.in_flight(), 1);
        }

        #[test]
        fn in_flight_backlog_beyond_the_limit_is_fatal() {
            let mut channel = ReliableSendChannel::new(300, 30_000);
            for _ in 0..(IN_FLIGHT_LIMIT + 1) {
                channel.enqueue(outbound(0xaa, 0));
            }
            for _ in 0..(IN_FLIGHT_LIMIT + 1) {
                // stay under the resend interval so every dequeue sends a fresh copy
                assert!(channel.dequeue(0).unwrap().is_some());
            }

            assert_eq!(channel.dequeue(0), Err(DisconnectReason::Backlog));
        }

        #[test]
        fn a_copy_unacknowledged_past_the_disconnect_timeout_is_fatal() {
            let mut channel = ReliableSendChannel::new(300, 3000);
            channel.enqueue(outbound(0xaa, 0));
            channel.dequeue(0).unwrap().unwrap();

            assert!(channel.dequeue(3000).unwrap().is_some());
            assert_eq!(channel.dequeue(3001), Err(DisconnectReason::Timeout));
        }
    }

    mod receive {
        use super::*;

        #[test]
        fn in_order_messages_deliver_immediately_and_are_acked() {
            let mut channel = ReliableReceiveChannel::new(true);
            for sequence_index in 1..=3 {
                assert_eq!(
                    channel.receive(inbound(sequence_index, sequence_index as u8)),
                    Ok(Some(sequence_index))
                );
            }

            let delivered: Vec<u8> = std::iter::from_fn(|| channel.pop_deliverable())
                .map(|m| payload_of(&m))
                .collect();
            assert_eq!(delivered, vec![1, 2, 3]);
        }

        #[test]
        fn a_closing_gap_releases_buffered_successors_in_order() {
            let mut channel = ReliableReceiveChannel::new(true);
            channel.receive(inbound(1, 1)).unwrap();
            channel.receive(inbound(3, 3)).unwrap();
            channel.receive(inbound(4, 4)).unwrap();
            assert!(channel.pop_deliverable().is_some());
            // 3 and 4 are buffered, waiting on 2
            assert!(channel.pop_deliverable().is_none());

            channel.receive(inbound(2, 2)).unwrap();
            let delivered: Vec<u8> = std::iter::from_fn(|| channel.pop_deliverable())
                .map(|m| payload_of(&m))
                .collect();
            assert_eq!(delivered, vec![2, 3, 4]);
        }

        #[rstest]
        #[case::duplicate_of_delivered(1)]
        #[case::duplicate_of_buffered(3)]
        fn duplicates_are_acked_but_delivered_only_once(#[case] duplicate: u32) {
            let mut channel = ReliableReceiveChannel::new(true);
            channel.receive(inbound(1, 1)).unwrap();
            channel.receive(inbound(3, 3)).unwrap();

            assert_eq!(channel.receive(inbound(duplicate, 0)), Ok(Some(duplicate)));

            channel.receive(inbound(2, 2)).unwrap();
            let delivered: Vec<u8> = std::iter::from_fn(|| channel.pop_deliverable())
                .map(|m| payload_of(&m))
                .collect();
            assert_eq!(delivered, vec![1, 2, 3]);
        }

        #[test]
        fn unsequenced_delivers_unseen_messages_in_arrival_order() {
            let mut channel = ReliableReceiveChannel::new(false);
            channel.receive(inbound(2, 2)).unwrap();
            channel.receive(inbound(1, 1)).unwrap();
            channel.receive(inbound(3, 3)).unwrap();
            // watermark has advanced past 1..=3, the duplicate is acked only
            assert_eq!(channel.receive(inbound(2, 2)), Ok(Some(2)));

            let delivered: Vec<u8> = std::iter::from_fn(|| channel.pop_deliverable())
                .map(|m| payload_of(&m))
                .collect();
            assert_eq!(delivered, vec![2, 1, 3]);
        }

        #[test]
        fn a_peer_half_a_window_behind_is_fatal() {
            let mut channel = ReliableReceiveChannel::new(true);
            for sequence_index in 1..=70 {
                channel.receive(inbound(sequence_index, 0)).unwrap();
            }

            // 70 - 6 = 64: exactly half a window behind the watermark
            assert_eq!(channel.receive(inbound(6, 0)), Err(DisconnectReason::WindowBehind));
            // one closer is still tolerated as a duplicate
            assert_eq!(channel.receive(inbound(7, 0)), Ok(Some(7)));
        }

        #[test]
        fn a_full_window_gap_jumps_the_watermark_forward() {
            let mut channel = ReliableReceiveChannel::new(true);
            // a gap of a full window: the watermark jumps from 0 to 64
            channel.receive(inbound(128, 0)).unwrap();

            // messages below the jumped watermark are acknowledged but never delivered
            assert_eq!(channel.receive(inbound(1, 1)), Ok(Some(1)));
            assert!(channel.pop_deliverable().is_none());

            // delivery resumes at the jumped watermark
            channel.receive(inbound(65, 65)).unwrap();
            assert_eq!(payload_of(&channel.pop_deliverable().unwrap()), 65);
        }

        #[test]
        fn truncated_sequence_index_is_dropped_without_an_ack() {
            let mut channel = ReliableReceiveChannel::new(true);
            let message = Message::inbound(addr(), vec![2, 0, 0], 0).unwrap();

            assert_eq!(channel.receive(message), Ok(None));
            assert!(channel.pop_deliverable().is_none());
        }
    }
}
