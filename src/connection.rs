use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use tracing::debug;

use crate::channel::{ReceiveChannel, SendChannel};
use crate::clock::Clock;
use crate::config::{ChannelTemplate, HostConfig};
use crate::control::{ControlAcknowledgement, ControlDisconnect, DisconnectReason};
use crate::dispatch::Handler;
use crate::encoder::MessageEncoder;
use crate::message::Message;
use crate::pump::PacketPump;
use crate::ring_buffer::RingBuffer;

/// A disconnect notice is best-effort and unacknowledged, so it is sent this many
///  times to survive moderate loss.
const DISCONNECT_NOTICE_REPEAT: usize = 3;

/// Sentinel for "never" in the probe timestamp, so the first tick probes immediately.
const NEVER: u64 = u64::MAX;

/// Handles to the control leaves in the dispatch tree, registered by the host before
///  any application handlers. Connections use them to frame outbound control traffic.
#[derive(Clone)]
pub struct ControlHandlers {
    pub connect: Handler,
    pub keep_alive: Handler,
    pub disconnect: Handler,
    pub acknowledgement: Handler,
}

#[derive(Clone, Default)]
struct KeepAliveProbe {
    id: u32,
    sent_at: u64,
}

/// One peer: lifecycle state, ping tracking, and the per-channel send / receive state.
///
/// Lifecycle is Connecting -> Connected -> Disconnected (terminal); a slot in the pool
///  plus the remote endpoint identify the connection. All state is guarded by atomics
///  or `std::sync::Mutex` - a connection is driven concurrently by its shard worker
///  ([`Connection::tick`]) and by the host's update loop (the receive path), and none
///  of its locks is ever held across an await point.
pub struct Connection {
    slot: usize,
    endpoint: SocketAddr,
    config: Arc<HostConfig>,
    clock: Clock,
    pump: Arc<PacketPump>,
    control: ControlHandlers,

    created_at: u64,
    successful: AtomicBool,
    disconnected: AtomicBool,
    disconnect_event_fired: AtomicBool,
    disconnected_at: AtomicU64,
    last_inbound: AtomicU64,
    last_probe: AtomicU64,

    next_keep_alive_id: AtomicU32,
    keep_alives: Mutex<RingBuffer<KeepAliveProbe>>,
    latest_ping: AtomicU32,
    average_ping: AtomicU32,

    send_rotation: AtomicUsize,
    send_channels: Mutex<Vec<SendChannel>>,
    receive_channels: Mutex<Vec<ReceiveChannel>>,
}

impl Connection {
    pub(crate) fn new(
        slot: usize,
        endpoint: SocketAddr,
        config: Arc<HostConfig>,
        clock: Clock,
        pump: Arc<PacketPump>,
        control: ControlHandlers,
    ) -> Connection {
        let now = clock.now_millis();
        let drop_timeout = config.unreliable_drop_timeout.as_millis() as u64;
        let resend_interval = config.resend_interval.as_millis() as u64;
        let disconnect_timeout = config.disconnect_timeout.as_millis() as u64;

        let mut send_channels = Vec::with_capacity(config.num_channels());
        let mut receive_channels = Vec::with_capacity(config.num_channels());
        let channel_zero = ChannelTemplate { reliable: false, sequenced: false };
        for template in std::iter::once(channel_zero).chain(config.channels.iter().copied()) {
            send_channels.push(SendChannel::new(
                template,
                drop_timeout,
                resend_interval,
                disconnect_timeout,
            ));
            receive_channels.push(ReceiveChannel::new(template));
        }

        let keep_alives = RingBuffer::new(config.keep_alive_history);

        Connection {
            slot,
            endpoint,
            config,
            clock,
            pump,
            control,
            created_at: now,
            successful: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            disconnect_event_fired: AtomicBool::new(false),
            disconnected_at: AtomicU64::new(NEVER),
            last_inbound: AtomicU64::new(now),
            last_probe: AtomicU64::new(NEVER),
            next_keep_alive_id: AtomicU32::new(1),
            keep_alives: Mutex::new(keep_alives),
            latest_ping: AtomicU32::new(0),
            average_ping: AtomicU32::new(0),
            send_rotation: AtomicUsize::new(0),
            send_channels: Mutex::new(send_channels),
            receive_channels: Mutex::new(receive_channels),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn channel_template(&self, channel_id: u8) -> Option<ChannelTemplate> {
        self.config.channel_template(channel_id)
    }

    pub fn control(&self) -> &ControlHandlers {
        &self.control
    }

    /// Whether the handshake has completed.
    pub fn is_successful(&self) -> bool {
        self.successful.load(Ordering::SeqCst)
    }

    /// Marks the handshake as completed. Returns `true` when this call made the
    ///  transition, i.e. exactly once per connection.
    pub fn set_successful(&self) -> bool {
        !self.successful.swap(true, Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// When the connection was disconnected, for slot reclamation. `None` while live.
    pub fn disconnected_at(&self) -> Option<u64> {
        match self.disconnected_at.load(Ordering::SeqCst) {
            NEVER => None,
            at => Some(at),
        }
    }

    /// Marks the local disconnect event as delivered. Returns `true` exactly once.
    pub fn mark_disconnect_event_fired(&self) -> bool {
        !self.disconnect_event_fired.swap(true, Ordering::SeqCst)
    }

    /// Round-trip time of the latest answered keep-alive, in milliseconds.
    pub fn latest_ping(&self) -> u32 {
        self.latest_ping.load(Ordering::Relaxed)
    }

    /// Smoothed round-trip time: each answered keep-alive contributes half of the new
    ///  average, `(average + latest) / 2`, starting from 0.
    pub fn average_ping(&self) -> u32 {
        self.average_ping.load(Ordering::Relaxed)
    }

    /// Records inbound traffic from the peer, resetting the silence timeout.
    pub fn note_inbound(&self, now: u64) {
        self.last_inbound.store(now, Ordering::SeqCst);
    }

    /// One scheduler pass: handshake / keep-alive probing, timeout detection, and
    ///  flushing the outbound backlog. A fatal condition is returned as the reason the
    ///  connection should be torn down; the caller converts it into a disconnect.
    pub fn tick(&self, now: u64) -> Result<(), DisconnectReason> {
        if self.is_disconnected() {
            return Ok(());
        }

        if !self.is_successful() {
            if now.saturating_sub(self.created_at) > self.config.connect_timeout.as_millis() as u64 {
                return Err(DisconnectReason::Timeout);
            }
            if self.probe_due(now) {
                self.send_control(&self.control.connect, |_| {});
            }
            return Ok(());
        }

        let silence = now.saturating_sub(self.last_inbound.load(Ordering::SeqCst));
        if silence > self.config.disconnect_timeout.as_millis() as u64 {
            return Err(DisconnectReason::Timeout);
        }

        if self.probe_due(now) {
            self.send_keep_alive_probe(now);
        }

        self.flush_sends(now)
    }

    fn probe_due(&self, now: u64) -> bool {
        let last = self.last_probe.load(Ordering::SeqCst);
        if last != NEVER
            && now.saturating_sub(last) < self.config.handshake_frequency.as_millis() as u64
        {
            return false;
        }
        self.last_probe.store(now, Ordering::SeqCst);
        true
    }

    fn send_keep_alive_probe(&self, now: u64) {
        let id = self.next_keep_alive_id.fetch_add(1, Ordering::Relaxed);
        self.keep_alives.lock().unwrap().push(KeepAliveProbe { id, sent_at: now });

        self.send_control(&self.control.keep_alive, |enc| {
            crate::control::ControlKeepAlive { id, is_response: false }.ser(enc);
        });
    }

    /// Matches an echoed keep-alive against the probe history and updates the ping
    ///  estimates. Any inbound keep-alive response also proves the peer knows us, so
    ///  the handshake is marked successful as a side effect.
    pub fn handle_keep_alive_response(&self, id: u32, now: u64) {
        self.successful.store(true, Ordering::SeqCst);

        let probes = self.keep_alives.lock().unwrap();
        for i in 0..probes.capacity() as i64 {
            let Ok(probe) = probes.get(-i) else { return };
            if probe.id == id {
                let latest = now.saturating_sub(probe.sent_at) as u32;
                let average = (self.average_ping.load(Ordering::Relaxed) + latest) / 2;
                self.latest_ping.store(latest, Ordering::Relaxed);
                self.average_ping.store(average, Ordering::Relaxed);
                return;
            }
        }
        debug!(id, "keep-alive response for a probe no longer in the history");
    }

    /// Queues an outbound message on its channel. Sequenced unreliable channels stamp
    ///  the sequence index here; the actual send happens on the next tick.
    pub fn enqueue_to_send(&self, message: Message) -> anyhow::Result<()> {
        if self.is_disconnected() {
            bail!("cannot send on a disconnected connection");
        }

        let channel_id = message.channel_id();
        let mut channels = self.send_channels.lock().unwrap();
        match channels.get_mut(channel_id as usize) {
            Some(channel) => {
                channel.enqueue(message);
                Ok(())
            }
            None => bail!("channel {} is not configured on this connection", channel_id),
        }
    }

    /// Feeds one inbound message into its channel's receive state and sends whatever
    ///  acknowledgement that produces. Unknown channels drop the message.
    pub fn enqueue_to_receive(&self, message: Message) -> Result<(), DisconnectReason> {
        let channel_id = message.channel_id();
        let ack = {
            let mut channels = self.receive_channels.lock().unwrap();
            let Some(channel) = channels.get_mut(channel_id as usize) else {
                debug!(channel_id, "dropping message for an unconfigured channel");
                return Ok(());
            };
            channel.receive(message)?
        };

        // the receive lock is released before anything goes near the pump
        if let Some(sequence_index) = ack {
            self.send_control(&self.control.acknowledgement, |enc| {
                ControlAcknowledgement { channel_id, sequence_index }.ser(enc);
            });
        }
        Ok(())
    }

    /// The next message ready for the application, scanning channels in id order.
    pub fn dequeue_received(&self) -> Option<Message> {
        let mut channels = self.receive_channels.lock().unwrap();
        for channel in channels.iter_mut() {
            if let Some(message) = channel.pop_deliverable() {
                return Some(message);
            }
        }
        None
    }

    /// Removes the acknowledged copy from the reliable channel's in-flight list.
    pub fn acknowledge(&self, channel_id: u8, sequence_index: u32) {
        let in_flight = {
            let channels = self.send_channels.lock().unwrap();
            match channels.get(channel_id as usize).and_then(|c| c.in_flight()) {
                Some(in_flight) => in_flight,
                None => {
                    debug!(channel_id, "acknowledgement for a channel without in-flight state");
                    return;
                }
            }
        };
        crate::reliable::acknowledge(&in_flight, sequence_index);
    }

    /// Tears the connection down. Idempotent; returns `true` when this call made the
    ///  transition. Sends the disconnect notice a few times (best effort, the peer may
    ///  be gone) and loops a copy into the local receive path so the local disconnect
    ///  event fires even when the network is dead.
    pub fn disconnect(&self, reason: DisconnectReason) -> bool {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.disconnected_at.store(self.clock.now_millis(), Ordering::SeqCst);
        debug!(endpoint = %self.endpoint, ?reason, "disconnecting");

        match self.control_frame(&self.control.disconnect, |enc| {
            ControlDisconnect { reason }.ser(enc);
        }) {
            Ok(frame) => {
                for _ in 0..DISCONNECT_NOTICE_REPEAT {
                    self.pump.send(self.endpoint, frame.clone());
                }
                self.pump.loopback(self.endpoint, frame);
            }
            Err(e) => debug!("cannot frame disconnect notice: {}", e),
        }
        true
    }

    /// Drains the outbound backlog, polling channels round-robin from a rotating
    ///  start index so no channel starves the others.
    fn flush_sends(&self, now: u64) -> Result<(), DisconnectReason> {
        let mut frames = Vec::new();
        {
            let mut channels = self.send_channels.lock().unwrap();
            let num_channels = channels.len();
            let start = self.send_rotation.fetch_add(1, Ordering::Relaxed) % num_channels;

            loop {
                let mut any = false;
                for i in 0..num_channels {
                    let index = (start + i) % num_channels;
                    if let Some(frame) = channels[index].dequeue(now)? {
                        frames.push(frame);
                        any = true;
                    }
                }
                if !any {
                    break;
                }
            }
        }

        for frame in frames {
            self.pump.send(self.endpoint, frame);
        }
        Ok(())
    }

    fn send_control<F: FnOnce(&mut MessageEncoder)>(&self, handler: &Handler, body: F) {
        match self.control_frame(handler, body) {
            Ok(frame) => self.pump.send(self.endpoint, frame),
            Err(e) => debug!("cannot frame control message: {}", e),
        }
    }

    /// Frames a control message: channel 0 (no sequence slot), the control leaf's
    ///  signature, then the body.
    fn control_frame<F: FnOnce(&mut MessageEncoder)>(
        &self,
        handler: &Handler,
        body: F,
    ) -> anyhow::Result<Vec<u8>> {
        let mut enc = MessageEncoder::new();
        enc.encode_u8(0);
        enc.encode_raw(handler.signature()?);
        body(&mut enc);
        Ok(enc.written().to_vec())
    }
}
