//! UDP datagram provider over a static peer table.
//!
//! The socket is created and tuned through `socket2` (address reuse, buffer
//! sizes, dual-stack IPv6) and then used as a plain non-blocking
//! [`std::net::UdpSocket`]. Datagrams from addresses outside the table are
//! dropped.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::provider::MAX_DATAGRAM_SIZE;
use crate::{Handle, NetError, PeerProvider};

/// Socket options applied when binding.
#[derive(Debug, Clone)]
pub struct UdpSocketConfig {
    /// Enable `SO_REUSEADDR`. Default: true on Linux/macOS, false on Windows.
    pub reuse_addr: bool,
    /// Kernel send buffer size in bytes.
    pub send_buffer_size: usize,
    /// Kernel receive buffer size in bytes.
    pub recv_buffer_size: usize,
}

impl Default for UdpSocketConfig {
    fn default() -> Self {
        Self {
            reuse_addr: !cfg!(target_os = "windows"),
            send_buffer_size: 256 * 1024,
            recv_buffer_size: 256 * 1024,
        }
    }
}

/// One remote (or the local) entry of the peer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPeer {
    /// Handle used for this peer.
    pub handle: Handle,
    /// Display name.
    pub name: String,
    /// Address datagrams go to and come from.
    pub addr: SocketAddr,
}

/// Non-blocking UDP provider.
pub struct UdpProvider {
    socket: UdpSocket,
    local: UdpPeer,
    peers: Vec<UdpPeer>,
    primary: Handle,
}

/// Create a non-blocking UDP socket with the given options.
pub fn bind_udp(addr: SocketAddr, config: &UdpSocketConfig) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(config.reuse_addr)?;
    socket.set_send_buffer_size(config.send_buffer_size)?;
    socket.set_recv_buffer_size(config.recv_buffer_size)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

impl UdpProvider {
    /// Bind `local.addr` and serve the given peer table. The local peer is
    /// primary until told otherwise.
    pub fn bind(
        local: UdpPeer,
        peers: Vec<UdpPeer>,
        config: &UdpSocketConfig,
    ) -> Result<Self, NetError> {
        let socket = bind_udp(local.addr, config)?;
        let peers = peers
            .into_iter()
            .filter(|peer| peer.handle != local.handle)
            .collect();
        tracing::info!("UDP provider {} bound to {}", local.handle, local.addr);
        Ok(Self {
            socket,
            primary: local.handle,
            local,
            peers,
        })
    }

    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.socket.local_addr()?)
    }

    /// Add or replace a peer table entry.
    pub fn add_peer(&mut self, peer: UdpPeer) {
        if peer.handle == self.local.handle {
            return;
        }
        self.peers.retain(|existing| existing.handle != peer.handle);
        self.peers.push(peer);
    }

    fn entry(&self, index: usize) -> Option<&UdpPeer> {
        if index == 0 {
            Some(&self.local)
        } else {
            self.peers.get(index - 1)
        }
    }
}

impl PeerProvider for UdpProvider {
    fn update(&mut self) -> Result<(), NetError> {
        match self.socket.take_error()? {
            Some(err) => Err(NetError::TransportClosed(err.to_string())),
            None => Ok(()),
        }
    }

    fn local_handle(&self) -> Handle {
        self.local.handle
    }

    fn set_primary_peer_handle(&mut self, handle: Handle) -> bool {
        if handle != self.local.handle && !self.peers.iter().any(|peer| peer.handle == handle) {
            return false;
        }
        self.primary = handle;
        true
    }

    fn primary_peer_handle(&self) -> Handle {
        self.primary
    }

    fn peer_count(&self) -> usize {
        self.peers.len() + 1
    }

    fn peer_handle(&self, index: usize) -> Option<Handle> {
        self.entry(index).map(|peer| peer.handle)
    }

    fn peer_name(&self, index: usize) -> Option<String> {
        self.entry(index).map(|peer| peer.name.clone())
    }

    fn send(&mut self, to: Handle, data: &[u8]) -> Result<(), NetError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(NetError::PayloadTooLarge {
                size: data.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        let addr = if to == self.local.handle {
            self.local_addr()?
        } else {
            self.peers
                .iter()
                .find(|peer| peer.handle == to)
                .map(|peer| peer.addr)
                .ok_or(NetError::UnknownPeer(to))?
        };

        match self.socket.send_to(data, addr) {
            Ok(sent) if sent == data.len() => Ok(()),
            Ok(_) => Err(NetError::Saturated),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(NetError::Saturated),
            Err(err) => Err(NetError::Io(err)),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, Handle)> {
        loop {
            let (size, addr) = match self.socket.recv_from(buf) {
                Ok(received) => received,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return None,
                Err(err) => {
                    tracing::trace!("UDP receive error: {err}");
                    return None;
                }
            };
            let local_addr = self.socket.local_addr().ok();
            let from = self
                .peers
                .iter()
                .find(|peer| peer.addr == addr)
                .map(|peer| peer.handle)
                .or_else(|| (Some(addr) == local_addr).then_some(self.local.handle));
            match from {
                Some(handle) => return Some((size, handle)),
                None => tracing::debug!("UDP datagram from unknown address {addr} dropped"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn recv_with_timeout(provider: &mut UdpProvider, buf: &mut [u8]) -> Option<(usize, Handle)> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(received) = provider.recv(buf) {
                return Some(received);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_send_and_receive_over_loopback() {
        let config = UdpSocketConfig::default();
        let mut a = UdpProvider::bind(
            UdpPeer {
                handle: Handle(1),
                name: "a".into(),
                addr: loopback(),
            },
            Vec::new(),
            &config,
        )
        .unwrap();
        let mut b = UdpProvider::bind(
            UdpPeer {
                handle: Handle(2),
                name: "b".into(),
                addr: loopback(),
            },
            Vec::new(),
            &config,
        )
        .unwrap();

        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        a.add_peer(UdpPeer {
            handle: Handle(2),
            name: "b".into(),
            addr: b_addr,
        });
        b.add_peer(UdpPeer {
            handle: Handle(1),
            name: "a".into(),
            addr: a_addr,
        });

        assert_eq!(a.peer_count(), 2);
        assert_eq!(a.peer_handle(0), Some(Handle(1)));
        assert_eq!(a.peer_name(1).as_deref(), Some("b"));

        a.send(Handle(2), b"ping").unwrap();
        let mut buf = [0u8; 64];
        let (size, from) = recv_with_timeout(&mut b, &mut buf).unwrap();
        assert_eq!(&buf[..size], b"ping");
        assert_eq!(from, Handle(1));
        assert!(a.update().is_ok());
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let mut a = UdpProvider::bind(
            UdpPeer {
                handle: Handle(1),
                name: "a".into(),
                addr: loopback(),
            },
            Vec::new(),
            &UdpSocketConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            a.send(Handle(9), b"x"),
            Err(NetError::UnknownPeer(_))
        ));
        assert!(!a.set_primary_peer_handle(Handle(9)));
        assert_eq!(a.primary_peer_handle(), Handle(1));
    }
}
