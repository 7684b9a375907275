use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::bail;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;
use crate::config::HostConfig;
use crate::connection::{Connection, ControlHandlers};
use crate::control::DisconnectReason;
use crate::message::Message;
use crate::pump::PacketPump;

/// The connection pool and its scheduler.
///
/// A fixed array of `max_connections` slots holds the connections; worker tasks each
///  drive a contiguous shard of slots, running every connection's [`Connection::tick`]
///  and reclaiming slots whose connection has been disconnected for longer than the
///  grace period. A fatal tick result is converted into an ordinary disconnect right
///  there - one broken connection never affects its shard neighbors.
///
/// Connect / disconnect events are queued here and only handed to application
///  callbacks from the host's explicit update entry point, never from a worker.
pub struct ConnectionManager {
    config: Arc<HostConfig>,
    clock: Clock,
    control: OnceLock<ControlHandlers>,
    pump: OnceLock<Arc<PacketPump>>,
    connections: Mutex<Vec<Option<Arc<Connection>>>>,
    receive_rotation: AtomicUsize,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    connect_events: Mutex<VecDeque<Arc<Connection>>>,
    disconnect_events: Mutex<VecDeque<Arc<Connection>>>,
}

impl ConnectionManager {
    pub(crate) fn new(config: Arc<HostConfig>, clock: Clock) -> ConnectionManager {
        let mut connections = Vec::with_capacity(config.max_connections);
        connections.resize_with(config.max_connections, || None);

        ConnectionManager {
            config,
            clock,
            control: OnceLock::new(),
            pump: OnceLock::new(),
            connections: Mutex::new(connections),
            receive_rotation: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            connect_events: Mutex::new(VecDeque::new()),
            disconnect_events: Mutex::new(VecDeque::new()),
        }
    }

    /// Wires in the control handler leaves, once, right after they are registered.
    pub fn set_control(&self, control: ControlHandlers) {
        let _ = self.control.set(control);
    }

    pub fn control(&self) -> Option<&ControlHandlers> {
        self.control.get()
    }

    pub fn start(self: &Arc<ConnectionManager>, pump: Arc<PacketPump>) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("connection manager is already started");
        }
        if self.pump.set(pump).is_err() {
            bail!("connection manager cannot be restarted");
        }

        let num_slots = self.config.max_connections;
        let shard_size = self.config.connections_per_worker;
        let mut workers = self.workers.lock().unwrap();
        let mut first = 0;
        while first < num_slots {
            let last = usize::min(first + shard_size, num_slots);
            workers.push(tokio::spawn(self.clone().worker_loop(first..last)));
            first = last;
        }
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            bail!("connection manager is not started");
        }

        for connection in self.snapshot().into_iter().flatten() {
            connection.disconnect(DisconnectReason::Requested);
        }

        let workers = mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }

    /// Opens (or returns) the connection to `endpoint`. Idempotent: a live connection
    ///  to the same endpoint is returned unchanged. Fails when the pool is full.
    pub fn connect(&self, endpoint: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        let (Some(pump), Some(control)) = (self.pump.get(), self.control.get()) else {
            bail!("cannot connect: the host is not started");
        };

        let mut connections = self.connections.lock().unwrap();
        for connection in connections.iter().flatten() {
            if connection.endpoint() == endpoint && !connection.is_disconnected() {
                return Ok(connection.clone());
            }
        }

        let Some(slot) = connections.iter().position(|c| c.is_none()) else {
            bail!("connection limit of {} reached", connections.len());
        };

        let connection = Arc::new(Connection::new(
            slot,
            endpoint,
            self.config.clone(),
            self.clock.clone(),
            pump.clone(),
            control.clone(),
        ));
        connections[slot] = Some(connection.clone());
        debug!(%endpoint, slot, "opened connection");
        Ok(connection)
    }

    /// The connection for `endpoint`, if any. Disconnected connections still resolve
    ///  until their slot is reclaimed, so late packets from a dead peer reach the dead
    ///  connection instead of leaking into a fresh one - but a live connection to the
    ///  same endpoint always wins.
    pub fn resolve(&self, endpoint: SocketAddr) -> Option<Arc<Connection>> {
        let connections = self.connections.lock().unwrap();
        connections
            .iter()
            .flatten()
            .find(|c| c.endpoint() == endpoint && !c.is_disconnected())
            .or_else(|| connections.iter().flatten().find(|c| c.endpoint() == endpoint))
            .cloned()
    }

    /// The next deliverable message from any connection, scanning from a rotating
    ///  start index so one busy connection cannot starve the others.
    pub fn receive(&self) -> Option<Message> {
        let connections = self.snapshot();
        if connections.is_empty() {
            return None;
        }

        let start = self.receive_rotation.fetch_add(1, Ordering::Relaxed) % connections.len();
        for i in 0..connections.len() {
            let Some(connection) = &connections[(start + i) % connections.len()] else {
                continue;
            };
            if let Some(mut message) = connection.dequeue_received() {
                message.set_connection(connection.clone());
                return Some(message);
            }
        }
        None
    }

    pub fn push_connect_event(&self, connection: Arc<Connection>) {
        self.connect_events.lock().unwrap().push_back(connection);
    }

    pub fn push_disconnect_event(&self, connection: Arc<Connection>) {
        self.disconnect_events.lock().unwrap().push_back(connection);
    }

    pub fn take_connect_events(&self) -> Vec<Arc<Connection>> {
        self.connect_events.lock().unwrap().drain(..).collect()
    }

    pub fn take_disconnect_events(&self) -> Vec<Arc<Connection>> {
        self.disconnect_events.lock().unwrap().drain(..).collect()
    }

    fn snapshot(&self) -> Vec<Option<Arc<Connection>>> {
        self.connections.lock().unwrap().clone()
    }

    async fn worker_loop(self: Arc<ConnectionManager>, shard: Range<usize>) {
        let reclaim_grace = self.config.reclaim_grace.as_millis() as u64;

        while self.started.load(Ordering::SeqCst) {
            let now = self.clock.now_millis();
            for slot in shard.clone() {
                let connection = { self.connections.lock().unwrap()[slot].clone() };
                let Some(connection) = connection else { continue };

                if let Some(at) = connection.disconnected_at() {
                    if now.saturating_sub(at) > reclaim_grace {
                        debug!(slot, "reclaiming slot of a disconnected connection");
                        self.connections.lock().unwrap()[slot] = None;
                    }
                    continue;
                }

                // the fault boundary: a fatal tick tears down this connection only
                if let Err(reason) = connection.tick(now) {
                    connection.disconnect(reason);
                }
            }
            tokio::time::sleep(self.config.worker_tick).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MessageDispatcher;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn test_handlers() -> ControlHandlers {
        let mut dispatcher = MessageDispatcher::new();
        let root = dispatcher.root();
        let connect = dispatcher.register(&root, Box::new(|_| {})).unwrap();
        let keep_alive = dispatcher.register(&root, Box::new(|_| {})).unwrap();
        let disconnect = dispatcher.register(&root, Box::new(|_| {})).unwrap();
        let acknowledgement = dispatcher.register(&root, Box::new(|_| {})).unwrap();
        dispatcher.optimize().unwrap();

        ControlHandlers { connect, keep_alive, disconnect, acknowledgement }
    }

    async fn started_manager(config: HostConfig) -> Arc<ConnectionManager> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let pump = Arc::new(PacketPump::new(socket, Duration::from_millis(10)));
        let manager = Arc::new(ConnectionManager::new(Arc::new(config), Clock::new()));
        manager.set_control(test_handlers());
        manager.start(pump).unwrap();
        manager
    }

    fn peer(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn connecting_before_start_fails() {
        let manager = ConnectionManager::new(Arc::new(HostConfig::new(0)), Clock::new());
        assert!(manager.connect(peer(9000)).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_is_idempotent_per_endpoint() {
        let manager = started_manager(HostConfig::new(0)).await;

        let first = manager.connect(peer(9000)).unwrap();
        let again = manager.connect(peer(9000)).unwrap();
        let other = manager.connect(peer(9001)).unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(first.slot(), 0);
        assert_eq!(other.slot(), 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_full_pool_rejects_further_connects() {
        let mut config = HostConfig::new(0);
        config.max_connections = 1;
        let manager = started_manager(config).await;

        let first = manager.connect(peer(9000)).unwrap();
        assert!(manager.connect(peer(9001)).is_err());
        // the existing connection is untouched
        assert!(!first.is_disconnected());
        assert!(Arc::ptr_eq(&first, &manager.connect(peer(9000)).unwrap()));
        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_timed_out_handshake_is_disconnected_and_the_slot_reclaimed() {
        let mut config = HostConfig::new(0);
        config.connect_timeout = Duration::from_millis(30);
        config.reclaim_grace = Duration::from_millis(50);
        let manager = started_manager(config).await;

        let connection = manager.connect(peer(9000)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(connection.is_disconnected());
        assert!(manager.resolve(peer(9000)).is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.resolve(peer(9000)).is_none());
        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn received_messages_carry_their_connection() {
        let manager = started_manager(HostConfig::new(0)).await;
        let connection = manager.connect(peer(9000)).unwrap();

        // a channel-0 frame with one signature byte
        let inbound = Message::inbound(peer(9000), vec![0, 0], 0).unwrap();
        connection.enqueue_to_receive(inbound).unwrap();

        let message = manager.receive().unwrap();
        assert!(Arc::ptr_eq(message.connection().unwrap(), &connection));
        assert!(manager.receive().is_none());
        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lifecycle_misuse_is_an_error() {
        let manager = started_manager(HostConfig::new(0)).await;
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let pump = Arc::new(PacketPump::new(socket, Duration::from_millis(10)));

        assert!(manager.start(pump).is_err());
        manager.stop().await.unwrap();
        assert!(manager.stop().await.is_err());
    }
}
