//! UDP transport for OSC datagrams
//!
//! Owns the session socket. Sends are fire-and-forget: they go through a
//! non-blocking std handle of the same socket and never wait for the
//! reactor. Receiving runs in a spawned task that decodes every datagram and
//! hands the contained messages to the registered [`PacketHandler`]. Decode
//! failures are logged and the datagram is dropped.

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::error::{OscError, Result};
use crate::osc::{codec, into_messages, OscMessage, OscMessageExt};

/// Largest datagram we accept
pub const MAX_DATAGRAM: usize = 65_536;

/// Callback for each decoded inbound message and its sender
pub type PacketHandler = Arc<dyn Fn(OscMessage, SocketAddr) + Send + Sync>;

/// Bind a non-blocking, address-sharing IPv4 UDP socket on all interfaces.
/// Port 0 picks an ephemeral port.
fn bind_std(port: u16, broadcast: bool) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// [`bind_std`] registered with tokio. Must be called inside a runtime.
pub(crate) fn bind_udp(port: u16, broadcast: bool) -> std::io::Result<UdpSocket> {
    UdpSocket::from_std(bind_std(port, broadcast)?)
}

/// Datagram counters
#[derive(Debug, Default)]
pub struct TransportStats {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub dropped: AtomicU64,
}

impl TransportStats {
    pub fn summary(&self) -> (u64, u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

/// Send side of a bound socket. The receive side lives in the receive task.
struct BoundSocket {
    local: SocketAddr,
    sender: Arc<std::net::UdpSocket>,
}

/// UDP socket plus mixer target
pub struct OscTransport {
    socket: RwLock<Option<BoundSocket>>,
    target: RwLock<Option<SocketAddr>>,
    handler: Arc<RwLock<Option<PacketHandler>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<TransportStats>,
}

impl OscTransport {
    pub fn new() -> Self {
        Self {
            socket: RwLock::new(None),
            target: RwLock::new(None),
            handler: Arc::new(RwLock::new(None)),
            recv_task: Mutex::new(None),
            stats: Arc::new(TransportStats::default()),
        }
    }

    /// Register the inbound message callback (replaces any previous one)
    pub fn set_packet_handler(&self, handler: PacketHandler) {
        *self.handler.write() = Some(handler);
    }

    /// Bind the local port and start the receive loop.
    ///
    /// Idempotent: returns the current local address if already bound.
    pub fn open(&self, local_port: u16) -> Result<SocketAddr> {
        let mut guard = self.socket.write();
        if let Some(bound) = guard.as_ref() {
            return Ok(bound.local);
        }

        let bind_error = |source: std::io::Error| OscError::Bind {
            port: local_port,
            source,
        };
        let std_socket = bind_std(local_port, false).map_err(bind_error)?;
        let sender = std_socket.try_clone().map_err(bind_error)?;
        let socket = UdpSocket::from_std(std_socket).map_err(bind_error)?;
        let local = socket.local_addr()?;

        let task = spawn_receive_loop(socket, Arc::clone(&self.handler), Arc::clone(&self.stats));
        *self.recv_task.lock() = Some(task);
        *guard = Some(BoundSocket {
            local,
            sender: Arc::new(sender),
        });

        info!("OSC socket bound on {}", local);
        Ok(local)
    }

    pub fn is_open(&self) -> bool {
        self.socket.read().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.read().as_ref().map(|bound| bound.local)
    }

    pub fn set_target(&self, target: SocketAddr) {
        debug!("OSC target set to {}", target);
        *self.target.write() = Some(target);
    }

    pub fn target(&self) -> Option<SocketAddr> {
        *self.target.read()
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Write one datagram to the target without waiting
    pub fn send(&self, bytes: &[u8]) -> Result<usize> {
        let target = self.target().ok_or(OscError::NoTargetConfigured)?;
        let sender = self
            .socket
            .read()
            .as_ref()
            .map(|bound| Arc::clone(&bound.sender))
            .ok_or(OscError::NotOpen)?;

        let sent = sender.send_to(bytes, target)?;
        if sent != bytes.len() {
            return Err(OscError::SendIncomplete {
                target,
                sent,
                expected: bytes.len(),
            });
        }
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(sent)
    }

    pub fn send_message(&self, msg: &OscMessage) -> Result<()> {
        let bytes = codec::encode_message(msg)?;
        self.send(&bytes)?;
        trace!("TX {}", msg.display());
        Ok(())
    }

    /// Stop the receive loop and drop the send handle. The target is kept.
    ///
    /// The port is free once the runtime has dropped the cancelled receive
    /// task; use [`shutdown`](Self::shutdown) to wait for that.
    pub fn close(&self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
        if self.socket.write().take().is_some() {
            info!("OSC socket closed");
        }
    }

    /// [`close`](Self::close), then wait until the receive task has let go
    /// of the socket so the port can be bound again
    pub async fn shutdown(&self) {
        let task = self.recv_task.lock().take();
        if self.socket.write().take().is_some() {
            info!("OSC socket closed");
        }
        if let Some(task) = task {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    debug!("Receive task ended abnormally: {}", e);
                }
            }
        }
    }
}

impl Default for OscTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OscTransport {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
    }
}

fn spawn_receive_loop(
    socket: UdpSocket,
    handler: Arc<RwLock<Option<PacketHandler>>>,
    stats: Arc<TransportStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP unreachable surfaces here on some platforms; not fatal
                    debug!("UDP receive error: {}", e);
                    continue;
                }
            };
            stats.received.fetch_add(1, Ordering::Relaxed);

            let datagram = &buf[..len];
            let packet = match codec::decode(datagram) {
                Ok(packet) => packet,
                Err(e) => {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Dropping datagram from {} ({} bytes): {} [{}]",
                        from,
                        len,
                        e,
                        hex::encode(&datagram[..len.min(32)])
                    );
                    continue;
                }
            };

            let Some(handler) = handler.read().clone() else {
                continue;
            };
            for msg in into_messages(packet) {
                trace!("RX {} from {}", msg.display(), from);
                handler(msg, from);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osc::{message, OscType};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    #[tokio::test]
    async fn test_send_requires_target() {
        let transport = OscTransport::new();
        transport.open(0).unwrap();
        assert!(matches!(
            transport.send(b"/x\0\0,\0\0\0"),
            Err(OscError::NoTargetConfigured)
        ));
    }

    #[tokio::test]
    async fn test_send_requires_socket() {
        let transport = OscTransport::new();
        transport.set_target(loopback(10024));
        assert!(matches!(transport.send(b"/x\0\0"), Err(OscError::NotOpen)));
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let transport = OscTransport::new();
        let first = transport.open(0).unwrap();
        let second = transport.open(0).unwrap();
        assert_eq!(first, second);
        assert!(transport.is_open());

        transport.close();
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_bind_error_when_port_taken() {
        let holder = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let transport = OscTransport::new();
        match transport.open(port) {
            Err(OscError::Bind { port: p, .. }) => assert_eq!(p, port),
            other => panic!("expected bind error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_over_loopback() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let receiver = OscTransport::new();
        receiver.set_packet_handler(Arc::new(move |msg: OscMessage, _from: SocketAddr| {
            let _ = tx.send(msg);
        }));
        let rx_addr = receiver.open(0).unwrap();

        let sender = OscTransport::new();
        sender.open(0).unwrap();
        sender.set_target(loopback(rx_addr.port()));

        // Garbage first: must be dropped without stopping the loop
        sender.send(b"garbage").unwrap();
        let msg = message("/ch/01/mix/fader", vec![OscType::Float(0.25)]);
        sender.send_message(&msg).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, msg);
        assert_eq!(receiver.stats().dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_send_right_after_open() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let transport = OscTransport::new();
        transport.set_target(peer.local_addr().unwrap());
        transport.open(0).unwrap();
        // No await between bind and send
        transport.send_message(&message("/xremote", vec![])).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"/xremote\0\0\0\0,\0\0\0");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rebind_fixed_port_after_shutdown() {
        let port = {
            let spare = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
            spare.local_addr().unwrap().port()
        };

        let transport = OscTransport::new();
        for _ in 0..20 {
            assert_eq!(transport.open(port).unwrap().port(), port);
            transport.shutdown().await;
            assert!(!transport.is_open());
        }

        // Plain close followed by an immediate rebind also succeeds
        transport.open(port).unwrap();
        transport.close();
        transport.open(port).unwrap();
    }
}
