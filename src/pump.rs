use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            // sending is best-effort; the reliability layer retransmits what matters
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }
}

/// The socket end of the stack: two tasks pumping datagrams between the UDP socket and
///  a pair of in-memory FIFOs.
///
/// [`PacketPump::send`] never blocks beyond pushing onto the outbound queue, and
///  [`PacketPump::try_receive`] never blocks at all - the protocol loops above stay
///  decoupled from socket latency. Transient socket errors are logged and the loops
///  continue; a bad datagram never stops the pump.
pub struct PacketPump {
    receive_socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    receive_timeout: Duration,
    outbound: Mutex<VecDeque<(SocketAddr, Vec<u8>)>>,
    outbound_available: Notify,
    inbound: Mutex<VecDeque<(SocketAddr, Vec<u8>)>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PacketPump {
    pub fn new(socket: Arc<UdpSocket>, receive_timeout: Duration) -> PacketPump {
        PacketPump::with_send_socket(socket.clone(), Arc::new(socket), receive_timeout)
    }

    pub fn with_send_socket(
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
        receive_timeout: Duration,
    ) -> PacketPump {
        PacketPump {
            receive_socket,
            send_socket,
            receive_timeout,
            outbound: Mutex::new(VecDeque::new()),
            outbound_available: Notify::new(),
            inbound: Mutex::new(VecDeque::new()),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.receive_socket.local_addr()?)
    }

    /// Queues one frame for sending. Never blocks.
    pub fn send(&self, to: SocketAddr, frame: Vec<u8>) {
        self.outbound.lock().unwrap().push_back((to, frame));
        self.outbound_available.notify_one();
    }

    /// The next received datagram, if one is waiting. Never blocks.
    pub fn try_receive(&self) -> Option<(SocketAddr, Vec<u8>)> {
        self.inbound.lock().unwrap().pop_front()
    }

    /// Injects a synthetic inbound datagram, as if `from` had sent it. Used to make
    ///  locally originated disconnect notices visible to the local receive path even
    ///  when the network drops them.
    pub fn loopback(&self, from: SocketAddr, frame: Vec<u8>) {
        self.inbound.lock().unwrap().push_back((from, frame));
    }

    pub fn start(self: &Arc<PacketPump>) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("packet pump is already started");
        }

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(self.clone().send_loop()));
        tasks.push(tokio::spawn(self.clone().receive_loop()));
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            bail!("packet pump is not started");
        }
        self.outbound_available.notify_one();

        let tasks = mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    async fn send_loop(self: Arc<PacketPump>) {
        while self.running.load(Ordering::SeqCst) {
            let next = self.outbound.lock().unwrap().pop_front();
            match next {
                Some((to, frame)) => self.send_socket.do_send_packet(to, &frame).await,
                None => {
                    // woken early by a push, or re-checks the running flag on timeout
                    let _ = tokio::time::timeout(
                        self.receive_timeout,
                        self.outbound_available.notified(),
                    )
                    .await;
                }
            }
        }
    }

    async fn receive_loop(self: Arc<PacketPump>) {
        let mut buf = vec![0u8; 65536];
        while self.running.load(Ordering::SeqCst) {
            match tokio::time::timeout(self.receive_timeout, self.receive_socket.recv_from(&mut buf))
                .await
            {
                Ok(Ok((len, from))) => {
                    trace!("UDP socket: received {} bytes from {:?}", len, from);
                    self.inbound.lock().unwrap().push_back((from, buf[..len].to_vec()));
                }
                Ok(Err(e)) => {
                    warn!("error receiving UDP packet: {}", e);
                }
                Err(_) => {
                    // receive timeout: bounds shutdown latency, drops nothing
                }
            }
        }
    }

    #[cfg(test)]
    pub fn drain_outbound(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.outbound.lock().unwrap().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pump() -> Arc<PacketPump> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Arc::new(PacketPump::new(socket, Duration::from_millis(10)))
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn send_enqueues_without_a_started_pump() {
        let pump = test_pump().await;
        pump.send(addr(), vec![1, 2, 3]);

        assert_eq!(pump.drain_outbound(), vec![(addr(), vec![1, 2, 3])]);
    }

    #[tokio::test]
    async fn loopback_frames_surface_via_try_receive() {
        let pump = test_pump().await;
        assert!(pump.try_receive().is_none());

        pump.loopback(addr(), vec![7]);
        assert_eq!(pump.try_receive(), Some((addr(), vec![7])));
        assert!(pump.try_receive().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn started_pump_drains_the_outbound_queue_through_the_socket() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let mut send_socket = MockSendSocket::new();
        send_socket
            .expect_do_send_packet()
            .withf(|to, buf| *to == "127.0.0.1:9000".parse().unwrap() && buf == [9, 9])
            .times(1)
            .return_const(());

        let pump = Arc::new(PacketPump::with_send_socket(
            socket,
            Arc::new(send_socket),
            Duration::from_millis(10),
        ));
        pump.start().unwrap();
        pump.send(addr(), vec![9, 9]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        pump.stop().await.unwrap();
        // the mock verifies the expected send on drop
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_pumps_exchange_datagrams() {
        let a = test_pump().await;
        let b = test_pump().await;
        a.start().unwrap();
        b.start().unwrap();

        a.send(b.local_addr().unwrap(), vec![42]);

        let mut received = None;
        for _ in 0..100 {
            if let Some(datagram) = b.try_receive() {
                received = Some(datagram);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(received.map(|(_, frame)| frame), Some(vec![42]));
        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_an_error() {
        let pump = test_pump().await;
        assert!(pump.stop().await.is_err());

        pump.start().unwrap();
        assert!(pump.start().is_err());
        pump.stop().await.unwrap();
        assert!(pump.stop().await.is_err());
    }
}
