//! Data-plane transport collaborator.
//!
//! The SM core does not touch the data plane directly; it depends on it
//! only through the [`Transport`] trait: routing-info exchange during the
//! handshake and per-session resource accounting. Failures map onto the
//! wire-visible [`SmErrType`] kinds a server reports in its responses.

use std::net::{Ipv4Addr, ToSocketAddrs, UdpSocket};

use crate::sm::{EndpointMetadata, SmErrType};

/// Size of the opaque routing-info blob in endpoint metadata, sized to
/// the widest supported transport.
pub const MAX_ROUTING_INFO_LEN: usize = 48;

/// Transport kind tag carried in endpoint metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportKind {
    /// Sentinel for metadata that has not been filled in.
    Invalid = 0,
    /// Datagram data plane over UDP.
    Udp = 1,
    /// InfiniBand UD data plane.
    InfiniBand = 2,
}

impl TryFrom<u8> for TransportKind {
    type Error = crate::error::Error;

    fn try_from(value: u8) -> crate::error::Result<Self> {
        match value {
            0 => Ok(TransportKind::Invalid),
            1 => Ok(TransportKind::Udp),
            2 => Ok(TransportKind::InfiniBand),
            _ => Err(crate::error::Error::InvalidTransportKind(value)),
        }
    }
}

/// The capabilities the SM core consumes from the data plane.
///
/// `alloc_session_resources` reserves data-plane queue state for one
/// session and is undone by `free_session_resources` when the session is
/// buried. Routing info is opaque to the SM core; only the transport
/// reads and writes the blob.
pub trait Transport {
    /// The transport kind advertised in this endpoint's metadata.
    fn kind(&self) -> TransportKind;

    /// Reserve data-plane resources for one session.
    fn alloc_session_resources(&mut self) -> Result<(), SmErrType>;

    /// Release the resources of one buried session.
    fn free_session_resources(&mut self);

    /// Write this endpoint's routing info into local metadata.
    fn fill_local_routing_info(&self, meta: &mut EndpointMetadata);

    /// Resolve a remote endpoint's routing info in place, using its
    /// hostname and the routing fields its owner filled in.
    fn resolve_remote_routing_info(&self, meta: &mut EndpointMetadata) -> Result<(), SmErrType>;
}

/// Routing blob layout for [`UdpDataTransport`]:
/// bytes 0..2 hold the data-plane UDP port, bytes 2..6 the resolved IPv4
/// address (zero until the peer resolves it). The rest is reserved.
const ROUTING_PORT_OFF: usize = 0;
const ROUTING_ADDR_OFF: usize = 2;

/// A UDP data plane: one datagram socket per endpoint, a bounded pool of
/// per-session ring slots.
pub struct UdpDataTransport {
    socket: UdpSocket,
    data_port: u16,
    max_rings: usize,
    rings_in_use: usize,
}

impl UdpDataTransport {
    /// Bind a data-plane socket on an ephemeral port.
    pub fn new(max_rings: usize) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let data_port = socket.local_addr()?.port();
        Ok(Self {
            socket,
            data_port,
            max_rings,
            rings_in_use: 0,
        })
    }

    /// The local data-plane UDP port.
    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    /// The data-plane socket, for the message-transfer layer.
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Read the peer address out of resolved routing info.
    pub fn routing_addr(meta: &EndpointMetadata) -> (Ipv4Addr, u16) {
        let ri = &meta.routing_info;
        let port = u16::from_ne_bytes([ri[ROUTING_PORT_OFF], ri[ROUTING_PORT_OFF + 1]]);
        let addr = Ipv4Addr::new(
            ri[ROUTING_ADDR_OFF],
            ri[ROUTING_ADDR_OFF + 1],
            ri[ROUTING_ADDR_OFF + 2],
            ri[ROUTING_ADDR_OFF + 3],
        );
        (addr, port)
    }
}

impl Transport for UdpDataTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn alloc_session_resources(&mut self) -> Result<(), SmErrType> {
        if self.rings_in_use >= self.max_rings {
            return Err(SmErrType::RingExhausted);
        }
        self.rings_in_use += 1;
        Ok(())
    }

    fn free_session_resources(&mut self) {
        debug_assert!(self.rings_in_use > 0);
        self.rings_in_use = self.rings_in_use.saturating_sub(1);
    }

    fn fill_local_routing_info(&self, meta: &mut EndpointMetadata) {
        meta.routing_info = [0; MAX_ROUTING_INFO_LEN];
        let port = self.data_port.to_ne_bytes();
        meta.routing_info[ROUTING_PORT_OFF] = port[0];
        meta.routing_info[ROUTING_PORT_OFF + 1] = port[1];
    }

    fn resolve_remote_routing_info(&self, meta: &mut EndpointMetadata) -> Result<(), SmErrType> {
        let (_, port) = Self::routing_addr(meta);
        let addrs = (meta.hostname_str(), port)
            .to_socket_addrs()
            .map_err(|_| SmErrType::RoutingResolutionFailure)?;
        let v4 = addrs
            .filter_map(|a| match a {
                std::net::SocketAddr::V4(v4) => Some(*v4.ip()),
                std::net::SocketAddr::V6(_) => None,
            })
            .next()
            .ok_or(SmErrType::RoutingResolutionFailure)?;
        meta.routing_info[ROUTING_ADDR_OFF..ROUTING_ADDR_OFF + 4].copy_from_slice(&v4.octets());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_accounting() {
        let mut t = UdpDataTransport::new(2).unwrap();
        assert!(t.alloc_session_resources().is_ok());
        assert!(t.alloc_session_resources().is_ok());
        assert_eq!(
            t.alloc_session_resources(),
            Err(SmErrType::RingExhausted)
        );
        t.free_session_resources();
        assert!(t.alloc_session_resources().is_ok());
    }

    #[test]
    fn test_routing_roundtrip() {
        let t = UdpDataTransport::new(4).unwrap();
        let mut meta = EndpointMetadata::invalid();
        meta.set_hostname("127.0.0.1").unwrap();

        t.fill_local_routing_info(&mut meta);
        t.resolve_remote_routing_info(&mut meta).unwrap();

        let (addr, port) = UdpDataTransport::routing_addr(&meta);
        assert_eq!(addr, Ipv4Addr::LOCALHOST);
        assert_eq!(port, t.data_port());
    }

    #[test]
    fn test_resolve_failure() {
        let t = UdpDataTransport::new(4).unwrap();
        let mut meta = EndpointMetadata::invalid();
        meta.set_hostname("no-such-host.invalid").unwrap();
        t.fill_local_routing_info(&mut meta);
        assert_eq!(
            t.resolve_remote_routing_info(&mut meta),
            Err(SmErrType::RoutingResolutionFailure)
        );
    }
}
