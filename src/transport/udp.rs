//! UDP socket backed by mio.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use tracing::trace;

use super::socket::{Received, SocketError, SocketMode, TransportSocket};

/// Receive buffer size; large enough for any UDP datagram.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 65535;

/// Non-blocking UDP socket.
#[derive(Debug)]
pub struct UdpTransportSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: Vec<u8>,
}

impl UdpTransportSocket {
    /// Bind to `addr`. Port 0 picks an ephemeral port.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            recv_buffer: vec![0u8; DEFAULT_RECV_BUFFER_SIZE],
        })
    }

    /// Bind an ephemeral socket in the same address family as `peer`.
    pub fn bind_for(peer: SocketAddr) -> io::Result<Self> {
        let any: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        Self::bind(any)
    }
}

impl TransportSocket for UdpTransportSocket {
    fn mode(&self) -> SocketMode {
        SocketMode::Datagram
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn try_send(&mut self, peer: SocketAddr, frame: &[u8]) -> Result<usize, SocketError> {
        match self.socket.send_to(frame, peer) {
            Ok(n) => {
                trace!(%peer, len = n, "udp send");
                Ok(n)
            }
            Err(err) => Err(SocketError::from_peer_io(err, peer)),
        }
    }

    fn try_receive(&mut self) -> Result<Option<Received>, SocketError> {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((len, peer)) => {
                    trace!(%peer, len, "udp recv");
                    return Ok(Some(Received {
                        peer,
                        data: Bytes::copy_from_slice(&self.recv_buffer[..len]),
                    }));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // ICMP errors from an earlier send_to surface here without a peer.
                Err(err) => return Err(SocketError::from_io(err, None)),
            }
        }
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.socket, token, Interest::READABLE)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn receive_within(socket: &mut UdpTransportSocket, limit: Duration) -> Option<Received> {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if let Some(received) = socket.try_receive().unwrap() {
                return Some(received);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_bind_ephemeral() {
        let socket = UdpTransportSocket::bind(loopback()).unwrap();
        assert_ne!(socket.local_addr().port(), 0);
        assert_eq!(socket.mode(), SocketMode::Datagram);
    }

    #[test]
    fn test_empty_receive_is_none() {
        let mut socket = UdpTransportSocket::bind(loopback()).unwrap();
        assert!(socket.try_receive().unwrap().is_none());
    }

    #[test]
    fn test_send_receive_loopback() {
        let mut a = UdpTransportSocket::bind(loopback()).unwrap();
        let mut b = UdpTransportSocket::bind(loopback()).unwrap();

        a.try_send(b.local_addr(), b"ping").unwrap();
        let received = receive_within(&mut b, Duration::from_secs(2)).unwrap();

        assert_eq!(received.peer, a.local_addr());
        assert_eq!(&received.data[..], b"ping");
    }
}
