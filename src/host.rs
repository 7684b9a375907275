use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use anyhow::bail;
use tokio::net::UdpSocket;
use tracing::{debug, debug_span};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::HostConfig;
use crate::connection::{Connection, ControlHandlers};
use crate::connection_manager::ConnectionManager;
use crate::control::{ControlAcknowledgement, ControlDisconnect, ControlKeepAlive};
use crate::dispatch::{Callback, Handler, MessageDispatcher};
use crate::message::Message;
use crate::pump::PacketPump;

/// The facade over the whole stack: one UDP socket, one dispatch tree, one connection
///  pool.
///
/// Usage follows a strict phase order: register handlers and event callbacks on a
///  fresh host, [`Host::start`] it (which freezes the dispatch tree and binds the
///  socket), then drive it by calling [`Host::update`] in the application's own loop.
///  All handler callbacks and connect / disconnect events run on the `update` caller's
///  thread - the background tasks only move packets and protocol state.
pub struct Host {
    config: Arc<HostConfig>,
    clock: Clock,
    dispatcher: MessageDispatcher,
    manager: Arc<ConnectionManager>,
    pump: OnceLock<Arc<PacketPump>>,
    started: bool,
    on_connect: Option<Box<dyn FnMut(&Arc<Connection>) + Send>>,
    on_disconnect: Option<Box<dyn FnMut(&Arc<Connection>) + Send>>,
}

impl Host {
    pub fn new(config: HostConfig) -> anyhow::Result<Host> {
        config.validate()?;
        let config = Arc::new(config);
        let clock = Clock::new();
        let manager = Arc::new(ConnectionManager::new(config.clone(), clock.clone()));

        let mut dispatcher = MessageDispatcher::new();
        register_control_handlers(&mut dispatcher, &manager)?;

        Ok(Host {
            config,
            clock,
            dispatcher,
            manager,
            pump: OnceLock::new(),
            started: false,
            on_connect: None,
            on_disconnect: None,
        })
    }

    /// The root of the dispatch tree, the default parent for handler registration.
    pub fn root(&self) -> Handler {
        self.dispatcher.root()
    }

    /// Registers a message handler leaf. Only valid before [`Host::start`].
    pub fn register(&mut self, parent: &Handler, callback: Callback) -> anyhow::Result<Handler> {
        self.dispatcher.register(parent, callback)
    }

    /// Adds a branch to the dispatch tree. Only valid before [`Host::start`].
    pub fn sub_handler(&mut self, parent: &Handler) -> anyhow::Result<Handler> {
        self.dispatcher.sub_handler(parent)
    }

    pub fn on_connect(&mut self, callback: impl FnMut(&Arc<Connection>) + Send + 'static) {
        self.on_connect = Some(Box::new(callback));
    }

    pub fn on_disconnect(&mut self, callback: impl FnMut(&Arc<Connection>) + Send + 'static) {
        self.on_disconnect = Some(Box::new(callback));
    }

    /// Binds the socket, freezes the dispatch tree and starts the background tasks.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.started {
            bail!("host is already started (a host cannot be restarted)");
        }
        self.started = true;

        let socket = UdpSocket::bind(("0.0.0.0", self.config.port)).await?;
        let pump = Arc::new(PacketPump::new(Arc::new(socket), self.config.receive_timeout));

        self.dispatcher.optimize()?;
        pump.start()?;
        self.manager.start(pump.clone())?;
        let _ = self.pump.set(pump);
        Ok(())
    }

    /// Disconnects everything and joins all background tasks.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(pump) = self.pump.get() else {
            bail!("host is not started");
        };
        self.manager.stop().await?;
        pump.stop().await?;
        Ok(())
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        match self.pump.get() {
            Some(pump) => pump.local_addr(),
            None => bail!("host is not started"),
        }
    }

    /// Opens (or returns) the connection to `endpoint` and begins the handshake.
    pub fn connect(&self, endpoint: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        self.manager.connect(endpoint)
    }

    pub fn resolve_connection(&self, endpoint: SocketAddr) -> Option<Arc<Connection>> {
        self.manager.resolve(endpoint)
    }

    /// Queues an outbound message, built via [`Message::for_connection`], on its
    ///  connection's channel.
    pub fn send(&self, message: Message) -> anyhow::Result<()> {
        let Some(connection) = message.connection().cloned() else {
            bail!("message is not addressed to a connection");
        };
        connection.enqueue_to_send(message)
    }

    /// One application-side pass: drains received datagrams into the channel state,
    ///  routes deliverable messages through the dispatch tree, and fires pending
    ///  connect / disconnect events. All application callbacks run here, on the
    ///  caller's thread.
    pub fn update(&mut self) {
        let Some(pump) = self.pump.get().cloned() else {
            return;
        };
        let now = self.clock.now_millis();

        while let Some((from, data)) = pump.try_receive() {
            let span = debug_span!("packet", packet_id = %Uuid::new_v4());
            let _entered = span.enter();

            let mut message = match Message::inbound(from, data, now) {
                Ok(message) => message,
                Err(e) => {
                    debug!("dropping undecodable datagram from {}: {}", from, e);
                    continue;
                }
            };

            match self.manager.resolve(from) {
                Some(connection) => {
                    connection.note_inbound(now);
                    message.set_connection(connection.clone());
                    if let Err(reason) = connection.enqueue_to_receive(message) {
                        if connection.disconnect(reason)
                            && connection.mark_disconnect_event_fired()
                        {
                            self.manager.push_disconnect_event(connection);
                        }
                    }
                }
                None if message.channel_id() == 0 => {
                    // unknown peer: only channel 0 traffic can bootstrap a connection
                    self.dispatcher.handle(&mut message);
                }
                None => {
                    debug!(
                        channel = message.channel_id(),
                        "dropping non-control message from unknown peer {}", from
                    );
                }
            }
        }

        while let Some(mut message) = self.manager.receive() {
            self.dispatcher.handle(&mut message);
        }

        for connection in self.manager.take_connect_events() {
            if let Some(callback) = &mut self.on_connect {
                callback(&connection);
            }
        }
        for connection in self.manager.take_disconnect_events() {
            if let Some(callback) = &mut self.on_disconnect {
                callback(&connection);
            }
        }
    }
}

/// Registers the control leaves on the dispatch root, ahead of any application
///  handlers so their signatures are stable across versions and hosts.
fn register_control_handlers(
    dispatcher: &mut MessageDispatcher,
    manager: &Arc<ConnectionManager>,
) -> anyhow::Result<()> {
    let root = dispatcher.root();

    let connect = {
        let manager = manager.clone();
        dispatcher.register(
            &root,
            Box::new(move |message| match message.connection() {
                Some(connection) => {
                    // a connect request for an existing connection is the handshake ack
                    if connection.is_disconnected() {
                        return;
                    }
                    if connection.set_successful() {
                        manager.push_connect_event(connection.clone());
                    }
                }
                None => {
                    if let Err(e) = manager.connect(message.endpoint()) {
                        debug!("cannot accept connection from {}: {}", message.endpoint(), e);
                    }
                }
            }),
        )?
    };

    let keep_alive = {
        let manager = manager.clone();
        dispatcher.register(
            &root,
            Box::new(move |message| {
                let Some(connection) = message.connection().cloned() else { return };
                let body = match ControlKeepAlive::deser(&mut message.encoder) {
                    Ok(body) => body,
                    Err(e) => {
                        debug!("dropping malformed keep-alive: {}", e);
                        return;
                    }
                };

                if body.is_response {
                    connection.handle_keep_alive_response(body.id, connection.now_millis());
                    return;
                }

                // an inbound probe proves the peer considers the connection live
                if connection.set_successful() {
                    manager.push_connect_event(connection.clone());
                }
                let Some(control) = manager.control() else { return };
                let reply = Message::for_connection(&connection, &control.keep_alive, 0)
                    .map(|mut reply| {
                        ControlKeepAlive { id: body.id, is_response: true }.ser(&mut reply.encoder);
                        reply
                    });
                match reply.and_then(|reply| connection.enqueue_to_send(reply)) {
                    Ok(()) => {}
                    Err(e) => debug!("cannot answer keep-alive: {}", e),
                }
            }),
        )?
    };

    let disconnect = {
        let manager = manager.clone();
        dispatcher.register(
            &root,
            Box::new(move |message| {
                let Some(connection) = message.connection().cloned() else { return };
                let body = match ControlDisconnect::deser(&mut message.encoder) {
                    Ok(body) => body,
                    Err(e) => {
                        debug!("dropping malformed disconnect notice: {}", e);
                        return;
                    }
                };

                connection.disconnect(body.reason);
                if connection.mark_disconnect_event_fired() {
                    manager.push_disconnect_event(connection);
                }
            }),
        )?
    };

    let acknowledgement = dispatcher.register(
        &root,
        Box::new(move |message| {
            let Some(connection) = message.connection().cloned() else { return };
            match ControlAcknowledgement::deser(&mut message.encoder) {
                Ok(body) => connection.acknowledge(body.channel_id, body.sequence_index),
                Err(e) => debug!("dropping malformed acknowledgement: {}", e),
            }
        }),
    )?;

    // batching and fragmentation occupy their signature slots but carry no logic
    dispatcher.register(&root, Box::new(|_| {}))?;
    dispatcher.register(&root, Box::new(|_| {}))?;

    manager.set_control(ControlHandlers { connect, keep_alive, disconnect, acknowledgement });
    Ok(())
}
