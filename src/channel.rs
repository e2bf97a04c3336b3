//! Datagram channel abstraction.
//!
//! [`Channel`] is the narrow interface the ARQ engines consume: send one
//! datagram to an address, or wait a bounded time for one to arrive.  A
//! timeout is `Ok(None)`, never an error.  A zero wait polls without blocking.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` implementing
//! it.  All protocol logic lives elsewhere; this module owns only byte I/O.
//! [`crate::simulator`] provides an in-memory link and a fault-injecting
//! wrapper with the same interface.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::ChannelError;

/// Unreliable, unordered datagram transport.
///
/// All methods take `&self`, so one channel can serve both directions of a
/// session.
#[allow(async_fn_in_trait)]
pub trait Channel {
    /// Send `datagram` to `dest`; returns the number of bytes sent.
    async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<usize, ChannelError>;

    /// Receive one datagram into `buf`, waiting at most `wait`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn recv_from(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, ChannelError>;
}

/// An async UDP socket.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, ChannelError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }
}

impl Channel for Socket {
    async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<usize, ChannelError> {
        match self.inner.send_to(datagram, dest).await {
            Ok(n) => Ok(n),
            Err(e) if is_transient(&e) => {
                log::debug!("[socket] send to {dest} lost: {e}");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, ChannelError> {
        if wait.is_zero() {
            return match self.inner.try_recv_from(buf) {
                Ok(got) => Ok(Some(got)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || is_transient(&e) => Ok(None),
                Err(e) => Err(e.into()),
            };
        }
        match tokio::time::timeout(wait, self.inner.recv_from(buf)).await {
            Ok(Ok(got)) => Ok(Some(got)),
            Ok(Err(e)) if is_transient(&e) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Ok(None),
        }
    }
}

/// Resolve `host` and pick the address to send to, preferring IPv4.
///
/// Receivers bind the IPv4 wildcard unless told otherwise, while dual-stack
/// names such as `localhost` often resolve to `::1` first.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ChannelError> {
    let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    let chosen = candidates
        .iter()
        .copied()
        .find(SocketAddr::is_ipv4)
        .or_else(|| candidates.first().copied());
    log::debug!("[socket] {host} resolved to {candidates:?}, using {chosen:?}");
    chosen.ok_or_else(|| {
        ChannelError::from(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address for {host}"),
        ))
    })
}

/// Wildcard address of the same family as `peer`, for binding a socket that
/// can reach it.
pub fn wildcard_for(peer: SocketAddr, port: u16) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
    }
}

/// ICMP port-unreachable surfaces as `ConnectionRefused` on some platforms;
/// for a datagram protocol that is just a lost packet.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback() -> Socket {
        Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn datagram_round_trip() {
        let a = loopback().await;
        let b = loopback().await;

        let sent = a.send_to(b"ping", b.local_addr).await.unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let (n, from) = b
            .recv_from(&mut buf, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("datagram should arrive");
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr);
    }

    #[tokio::test]
    async fn recv_timeout_is_not_an_error() {
        let a = loopback().await;
        let mut buf = [0u8; 16];
        let got = a.recv_from(&mut buf, Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn localhost_resolves_to_ipv4() {
        let addr = resolve("localhost", 4000).await.unwrap();
        assert_eq!(addr, SocketAddr::from((Ipv4Addr::LOCALHOST, 4000)));
        assert_eq!(wildcard_for(addr, 0), SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    }

    #[tokio::test]
    async fn ipv6_literal_kept_when_no_ipv4_exists() {
        let addr = resolve("::1", 4000).await.unwrap();
        assert_eq!(addr, SocketAddr::from((Ipv6Addr::LOCALHOST, 4000)));
        assert!(wildcard_for(addr, 7).is_ipv6());
    }

    #[tokio::test]
    async fn zero_wait_polls_without_blocking() {
        let a = loopback().await;
        let mut buf = [0u8; 16];
        assert!(a.recv_from(&mut buf, Duration::ZERO).await.unwrap().is_none());
    }
}
