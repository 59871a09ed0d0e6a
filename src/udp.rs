//! Management-plane UDP sender.
//!
//! SM packets are fire-and-forget datagrams aimed at the well-known
//! management port of the destination process; reliability comes from the
//! retry engine, not from the socket. The sender carries a
//! drop-probability hook so tests can inject deterministic loss.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;
use tracing::trace;

use crate::error::Result;
use crate::sm::{SmPacket, SM_PACKET_SIZE};

/// Sender for session management packets.
pub struct UdpClient {
    socket: UdpSocket,
    mgmt_udp_port: u16,
    /// Drop probability, stored as f32 bits for lock-free updates.
    drop_prob: AtomicU32,
}

impl UdpClient {
    /// Create a sender targeting the given management port on every
    /// destination host.
    pub fn new(mgmt_udp_port: u16, drop_prob: f32) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket,
            mgmt_udp_port,
            drop_prob: AtomicU32::new(drop_prob.to_bits()),
        })
    }

    /// The management UDP port this sender targets.
    pub fn mgmt_udp_port(&self) -> u16 {
        self.mgmt_udp_port
    }

    /// Current drop probability.
    pub fn drop_prob(&self) -> f32 {
        f32::from_bits(self.drop_prob.load(Ordering::Relaxed))
    }

    /// Set the drop probability. Testing hook; 0.0 in production.
    pub fn set_drop_prob(&self, drop_prob: f32) {
        self.drop_prob.store(drop_prob.to_bits(), Ordering::Relaxed);
    }

    /// Send one SM packet to `dst_hostname` at the management port.
    ///
    /// Subject to the drop hook: a dropped packet still reports success,
    /// exactly like loss in the fabric would.
    pub fn send(&self, pkt: &SmPacket, dst_hostname: &str) -> Result<()> {
        let drop_prob = self.drop_prob();
        if drop_prob > 0.0 && rand::thread_rng().gen::<f32>() < drop_prob {
            trace!(dst = dst_hostname, "dropping sm packet (drop hook)");
            return Ok(());
        }

        let bytes = pkt.to_bytes();
        let sent = self
            .socket
            .send_to(&bytes, (dst_hostname, self.mgmt_udp_port))?;
        debug_assert_eq!(sent, SM_PACKET_SIZE);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::SmPktType;
    use std::time::Duration;

    #[test]
    fn test_send_and_drop() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let client = UdpClient::new(port, 0.0).unwrap();
        let pkt = SmPacket::new(SmPktType::ConnectReq);
        client.send(&pkt, "127.0.0.1").unwrap();

        let mut buf = [0u8; 1024];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(n, SM_PACKET_SIZE);
        assert!(SmPacket::from_bytes(&buf[..n]).is_ok());

        // With the drop hook fully open nothing reaches the socket.
        client.set_drop_prob(1.0);
        client.send(&pkt, "127.0.0.1").unwrap();
        assert!(receiver.recv_from(&mut buf).is_err());
    }
}
