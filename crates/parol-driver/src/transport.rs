//! Datagram transport
//!
//! The Command Channel talks to the controller through [`Transport`] so the
//! wire can be replaced in tests.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::{debug, trace};

/// Shortest read timeout handed to the OS (zero means "block forever").
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// A connected, message-oriented transport.
pub trait Transport: Send {
    /// Write one datagram.
    fn send(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Read one datagram, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    /// Discard datagrams already queued. Returns the number dropped.
    fn drain(&mut self) -> usize {
        0
    }
}

/// UDP transport connected to the controller endpoint.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Bind an ephemeral local port and connect it to `host:port`.
    pub fn connect(host: &str, port: u16) -> io::Result<Self> {
        let peer = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve {host}:{port}"),
            )
        })?;
        let local: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().map_err(io::Error::other)?
        } else {
            "[::]:0".parse().map_err(io::Error::other)?
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        debug!(%peer, local = ?socket.local_addr().ok(), "UDP transport connected");
        Ok(Self { socket, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.socket.send(payload).map(|_| ())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        self.socket.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    fn drain(&mut self) -> usize {
        if self.socket.set_nonblocking(true).is_err() {
            return 0;
        }
        let mut buf = [0u8; parol_protocol::MAX_DATAGRAM];
        let mut dropped = 0;
        loop {
            match self.socket.recv(&mut buf) {
                Ok(_) => dropped += 1,
                // Pending ICMP errors surface here too; they are stale as well.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) if dropped < 64 => dropped += 1,
                Err(_) => break,
            }
        }
        let _ = self.socket.set_nonblocking(false);
        if dropped > 0 {
            trace!(dropped, "drained stale datagrams");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn echo_peer() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    #[test]
    fn test_send_and_recv() {
        let (peer, port) = echo_peer();
        let mut transport = UdpTransport::connect("127.0.0.1", port).unwrap();
        transport.send(b"PING").unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"PING");
        peer.send_to(b"PONG", from).unwrap();

        let n = transport
            .recv(&mut buf, Duration::from_millis(500))
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"PONG");
    }

    #[test]
    fn test_recv_timeout_returns_none() {
        let (_peer, port) = echo_peer();
        let mut transport = UdpTransport::connect("127.0.0.1", port).unwrap();
        let start = Instant::now();
        let mut buf = [0u8; 16];
        let got = transport.recv(&mut buf, Duration::from_millis(50)).unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_drain_discards_queued() {
        let (peer, port) = echo_peer();
        let mut transport = UdpTransport::connect("127.0.0.1", port).unwrap();
        transport.send(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let (_, from) = peer.recv_from(&mut buf).unwrap();
        peer.send_to(b"stale-1", from).unwrap();
        peer.send_to(b"stale-2", from).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(transport.drain(), 2);
        assert!(
            transport
                .recv(&mut buf, Duration::from_millis(20))
                .unwrap()
                .is_none()
        );
    }
}
