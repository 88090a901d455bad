//! Non-blocking UDP socket registered with mio.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, BorrowedFd};

use mio::event::Source;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// A non-blocking UDP socket.
///
/// Reads return `WouldBlock` when nothing is queued; wait for readiness with
/// [`mio::Poll`] and then drain with [`UdpSocket::try_recv_from`] until it
/// yields `None`, since mio readiness is edge-triggered.
pub struct UdpSocket {
    inner: MioUdpSocket,
}

impl UdpSocket {
    /// Binds a socket to `endpoint`. Port `0` picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is unavailable or already in use.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Sends one datagram.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or `WouldBlock`.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(buf, dest.into())
    }

    /// Receives one datagram; excess bytes beyond `buf` are discarded.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or `WouldBlock`.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        self.inner
            .recv_from(buf)
            .map(|(n, addr)| (n, Endpoint::from(addr)))
    }

    /// [`UdpSocket::recv_from`] with `WouldBlock` mapped to `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns any error other than `WouldBlock`.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.recv_from(buf) {
            Ok((n, ep)) => Ok(Some((n, ep))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sets `SO_RCVBUF`. The kernel may round or double the value.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the option cannot be read.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_recv_buffer_size(
            self.inner.as_fd(),
        )?)
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for UdpSocket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ephemeral_port() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_eq!(addr.ip(), std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn loopback_datagram() {
        let sender = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let receiver = UdpSocket::bind(Endpoint::localhost(0)).unwrap();

        let sent = sender
            .send_to(b"pose", receiver.local_addr().unwrap())
            .unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 64];
        let (received, from) = loop {
            if let Some(got) = receiver.try_recv_from(&mut buf).unwrap() {
                break got;
            }
            std::thread::yield_now();
        };
        assert_eq!(&buf[..received], b"pose");
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn try_recv_on_idle_socket() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let mut buf = [0u8; 64];
        assert!(socket.try_recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn second_bind_on_same_port_fails() {
        let first = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let taken = first.local_addr().unwrap();
        let err = UdpSocket::bind(taken).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
    }

    #[test]
    fn recv_buffer_size() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let before = socket.recv_buffer_size().unwrap();
        assert!(before > 0);
        socket.set_recv_buffer_size(256 * 1024).unwrap();
        assert!(socket.recv_buffer_size().unwrap() > 0);
    }
}
