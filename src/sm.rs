//! Session management wire types.
//!
//! Control packets are fixed-layout records sent "as is" in a single UDP
//! datagram: a type byte, an error byte, and two [`EndpointMetadata`]
//! copies (client then server). Both sides carry both copies, filled in
//! incrementally as the handshake progresses, so a response echoes enough
//! state for the client to match it without a separate transaction id.
//!
//! Layouts are pinned with `#[repr(C, packed)]` and byte order is the
//! native order of the cluster; endpoints are presumed homogeneous.

use crate::error::{Error, Result};
use crate::transport::{TransportKind, MAX_ROUTING_INFO_LEN};

/// Maximum hostname length, including the NUL terminator.
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Size of one endpoint metadata record on the wire.
pub const ENDPOINT_METADATA_SIZE: usize = 1 + MAX_HOSTNAME_LEN + 1 + 1 + 4 + 8 + MAX_ROUTING_INFO_LEN;

/// Size of a session management packet on the wire.
pub const SM_PACKET_SIZE: usize = 2 + 2 * ENDPOINT_METADATA_SIZE;

/// Invalid-value sentinels for metadata fields that are filled in later.
pub const INVALID_APP_TID: u8 = u8::MAX;
pub const INVALID_PHY_PORT: u8 = u8::MAX;
pub const INVALID_SESSION_NUM: u32 = u32::MAX;
pub const INVALID_START_SEQ: u64 = u64::MAX;

/// Session management packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmPktType {
    /// Client request to establish a session.
    ConnectReq = 1,
    /// Server response to a connect request.
    ConnectResp = 2,
    /// Client request to tear down a session.
    DisconnectReq = 3,
    /// Server response to a disconnect request.
    DisconnectResp = 4,
}

impl SmPktType {
    /// Check if this is a request type.
    #[inline]
    pub fn is_req(self) -> bool {
        matches!(self, SmPktType::ConnectReq | SmPktType::DisconnectReq)
    }

    /// Map a request type to its response type.
    #[inline]
    pub fn to_resp(self) -> SmPktType {
        match self {
            SmPktType::ConnectReq => SmPktType::ConnectResp,
            SmPktType::DisconnectReq => SmPktType::DisconnectResp,
            other => {
                debug_assert!(false, "to_resp on response type {other:?}");
                other
            }
        }
    }
}

impl TryFrom<u8> for SmPktType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(SmPktType::ConnectReq),
            2 => Ok(SmPktType::ConnectResp),
            3 => Ok(SmPktType::DisconnectReq),
            4 => Ok(SmPktType::DisconnectResp),
            _ => Err(Error::InvalidSmPktType(value)),
        }
    }
}

/// Session management error kind, meaningful on responses only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmErrType {
    /// Success.
    NoError = 0,
    /// The server did not answer within the SM timeout.
    SrvDisconnected = 1,
    /// The server's data-plane ring buffers are exhausted.
    RingExhausted = 2,
    /// The server ran out of memory for session state.
    OutOfMemory = 3,
    /// Data-plane routing information could not be resolved.
    RoutingResolutionFailure = 4,
    /// No RPC endpoint with the requested thread id exists at the server.
    InvalidRemoteRpcId = 5,
    /// The two endpoints run incompatible transports.
    InvalidTransport = 6,
}

impl TryFrom<u8> for SmErrType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SmErrType::NoError),
            1 => Ok(SmErrType::SrvDisconnected),
            2 => Ok(SmErrType::RingExhausted),
            3 => Ok(SmErrType::OutOfMemory),
            4 => Ok(SmErrType::RoutingResolutionFailure),
            5 => Ok(SmErrType::InvalidRemoteRpcId),
            6 => Ok(SmErrType::InvalidTransport),
            _ => Err(Error::InvalidSmErrType(value)),
        }
    }
}

/// Events delivered to the application's session management handler.
///
/// Each client session sees exactly one of these as its terminal event,
/// plus `Connected` before `Disconnected` on the happy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmEventType {
    /// The session is established and usable by the data plane.
    Connected,
    /// Connection establishment failed; the session is gone.
    ConnectFailed,
    /// The session is torn down; the session is gone.
    Disconnected,
}

/// Identity and locator of one side of a session.
///
/// Equality covers the location triple only (hostname, thread id, session
/// number); fabric port, sequence, and routing fields are ignored.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct EndpointMetadata {
    /// Transport kind tag, see [`TransportKind`].
    pub transport: u8,
    /// NUL-terminated, zero-padded ASCII hostname.
    pub hostname: [u8; MAX_HOSTNAME_LEN],
    /// Thread id of the Rpc that owns this endpoint.
    pub app_tid: u8,
    /// Physical fabric port used by this endpoint.
    pub phy_port: u8,
    /// Session number local to the owning endpoint.
    pub session_num: u32,
    /// Starting data-plane sequence number, 48 significant bits.
    pub start_seq: u64,
    /// Opaque data-plane routing info, interpreted by the transport.
    pub routing_info: [u8; MAX_ROUTING_INFO_LEN],
}

impl EndpointMetadata {
    /// An all-invalid record; fields are filled in as the handshake runs.
    pub fn invalid() -> Self {
        Self {
            transport: TransportKind::Invalid as u8,
            hostname: [0; MAX_HOSTNAME_LEN],
            app_tid: INVALID_APP_TID,
            phy_port: INVALID_PHY_PORT,
            session_num: INVALID_SESSION_NUM,
            start_seq: INVALID_START_SEQ,
            routing_info: [0; MAX_ROUTING_INFO_LEN],
        }
    }

    /// Set the hostname, zero-padding the buffer.
    ///
    /// One byte is reserved for the NUL terminator.
    pub fn set_hostname(&mut self, hostname: &str) -> Result<()> {
        let bytes = hostname.as_bytes();
        if bytes.len() >= MAX_HOSTNAME_LEN {
            return Err(Error::HostnameTooLong {
                got: bytes.len(),
                max: MAX_HOSTNAME_LEN - 1,
            });
        }
        self.hostname = [0; MAX_HOSTNAME_LEN];
        self.hostname[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Get the hostname up to the first NUL.
    pub fn hostname_str(&self) -> &str {
        let end = self
            .hostname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_HOSTNAME_LEN);
        std::str::from_utf8(&self.hostname[..end]).unwrap_or("")
    }

    /// Get the validated transport kind.
    pub fn transport_kind(&self) -> Result<TransportKind> {
        TransportKind::try_from(self.transport)
    }

    /// Short name for log lines: hostname, thread id, session number.
    pub fn name(&self) -> String {
        let session_num = self.session_num;
        let app_tid = self.app_tid;
        let sn = if session_num == INVALID_SESSION_NUM {
            "XX".to_string()
        } else {
            session_num.to_string()
        };
        format!("[H: {}, R: {}, S: {}]", self.hostname_str(), app_tid, sn)
    }
}

impl Default for EndpointMetadata {
    fn default() -> Self {
        Self::invalid()
    }
}

impl PartialEq for EndpointMetadata {
    fn eq(&self, other: &Self) -> bool {
        let (sn, other_sn) = (self.session_num, other.session_num);
        self.hostname == other.hostname && self.app_tid == other.app_tid && sn == other_sn
    }
}

impl std::fmt::Debug for EndpointMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// A session management packet as laid out on the wire.
///
/// Responses are constructed by mutating the request in place, see
/// [`SmPacket::to_resp_mut`].
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct SmPacket {
    /// Raw packet type byte, see [`SmPktType`].
    pub pkt_type: u8,
    /// Raw error kind byte, meaningful on responses only.
    pub err: u8,
    /// Client-side endpoint metadata.
    pub client: EndpointMetadata,
    /// Server-side endpoint metadata.
    pub server: EndpointMetadata,
}

impl SmPacket {
    /// Create a packet of the given type with invalid metadata.
    pub fn new(pkt_type: SmPktType) -> Self {
        Self {
            pkt_type: pkt_type as u8,
            err: SmErrType::NoError as u8,
            client: EndpointMetadata::invalid(),
            server: EndpointMetadata::invalid(),
        }
    }

    /// Get the validated packet type.
    #[inline]
    pub fn pkt_type(&self) -> Result<SmPktType> {
        SmPktType::try_from(self.pkt_type)
    }

    /// Get the validated error kind.
    #[inline]
    pub fn err_type(&self) -> Result<SmErrType> {
        SmErrType::try_from(self.err)
    }

    /// Turn this request into its response in place: flip the packet type
    /// and record the error kind. The metadata pair is left for the caller
    /// to update.
    pub fn to_resp_mut(&mut self, err: SmErrType) {
        if let Ok(pkt_type) = self.pkt_type() {
            debug_assert!(pkt_type.is_req());
            self.pkt_type = pkt_type.to_resp() as u8;
        }
        self.err = err as u8;
    }

    /// Validate the type and error bytes.
    pub fn validate(&self) -> Result<()> {
        self.pkt_type()?;
        self.err_type()?;
        Ok(())
    }

    /// Serialize the packet to a byte slice.
    ///
    /// # Safety
    /// The destination buffer must be at least `SM_PACKET_SIZE` bytes.
    #[inline]
    pub unsafe fn write_to(&self, dst: *mut u8) {
        unsafe {
            std::ptr::copy_nonoverlapping(self as *const Self as *const u8, dst, SM_PACKET_SIZE);
        }
    }

    /// Deserialize a packet from a byte slice.
    ///
    /// # Safety
    /// The source buffer must be at least `SM_PACKET_SIZE` bytes.
    #[inline]
    pub unsafe fn read_from(src: *const u8) -> Self {
        unsafe {
            let mut pkt = std::mem::MaybeUninit::<Self>::uninit();
            std::ptr::copy_nonoverlapping(src, pkt.as_mut_ptr() as *mut u8, SM_PACKET_SIZE);
            pkt.assume_init()
        }
    }

    /// Serialize the packet into an owned byte array.
    pub fn to_bytes(&self) -> [u8; SM_PACKET_SIZE] {
        let mut buf = [0u8; SM_PACKET_SIZE];
        unsafe { self.write_to(buf.as_mut_ptr()) };
        buf
    }

    /// Parse and validate a packet from received bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SM_PACKET_SIZE {
            return Err(Error::TruncatedSmPacket {
                got: bytes.len(),
                expected: SM_PACKET_SIZE,
            });
        }
        let pkt = unsafe { Self::read_from(bytes.as_ptr()) };
        pkt.validate()?;
        Ok(pkt)
    }
}

impl std::fmt::Debug for SmPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SmPacket {{ type: {:?}, err: {:?}, client: {:?}, server: {:?} }}",
            self.pkt_type(),
            self.err_type(),
            self.client,
            self.server
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_size() {
        assert_eq!(std::mem::size_of::<EndpointMetadata>(), ENDPOINT_METADATA_SIZE);
        assert_eq!(std::mem::size_of::<SmPacket>(), SM_PACKET_SIZE);
        // Must fit one UDP datagram without fragmentation.
        assert!(SM_PACKET_SIZE < 1400);
    }

    #[test]
    fn test_pkt_type_mapping() {
        assert!(SmPktType::ConnectReq.is_req());
        assert!(SmPktType::DisconnectReq.is_req());
        assert!(!SmPktType::ConnectResp.is_req());
        assert_eq!(SmPktType::ConnectReq.to_resp(), SmPktType::ConnectResp);
        assert_eq!(SmPktType::DisconnectReq.to_resp(), SmPktType::DisconnectResp);
        assert!(SmPktType::try_from(0).is_err());
        assert!(SmPktType::try_from(5).is_err());
    }

    #[test]
    fn test_metadata_location_equality() {
        let mut a = EndpointMetadata::invalid();
        a.set_hostname("node0").unwrap();
        a.app_tid = 3;
        a.session_num = 7;

        let mut b = a;
        b.phy_port = 1;
        b.start_seq = 0x1234;
        b.routing_info[0] = 0xFF;
        // Non-location fields do not participate in equality.
        assert_eq!(a, b);

        b.session_num = 8;
        assert_ne!(a, b);
    }

    #[test]
    fn test_hostname_roundtrip() {
        let mut meta = EndpointMetadata::invalid();
        meta.set_hostname("server-17.cluster").unwrap();
        assert_eq!(meta.hostname_str(), "server-17.cluster");

        let long = "x".repeat(MAX_HOSTNAME_LEN);
        assert!(meta.set_hostname(&long).is_err());
    }

    #[test]
    fn test_packet_roundtrip() {
        let mut pkt = SmPacket::new(SmPktType::ConnectReq);
        pkt.client.set_hostname("client").unwrap();
        pkt.client.app_tid = 1;
        pkt.client.session_num = 42;
        pkt.client.start_seq = 0xABCD_EF01_2345;
        pkt.server.set_hostname("server").unwrap();
        pkt.server.app_tid = 2;

        let bytes = pkt.to_bytes();
        let parsed = SmPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.pkt_type().unwrap(), SmPktType::ConnectReq);
        assert_eq!(parsed.err_type().unwrap(), SmErrType::NoError);
        assert_eq!(parsed.client, pkt.client);
        assert_eq!(parsed.server, pkt.server);
        let start_seq = parsed.client.start_seq;
        assert_eq!(start_seq, 0xABCD_EF01_2345);
    }

    #[test]
    fn test_resp_mut() {
        let mut pkt = SmPacket::new(SmPktType::DisconnectReq);
        pkt.to_resp_mut(SmErrType::NoError);
        assert_eq!(pkt.pkt_type().unwrap(), SmPktType::DisconnectResp);
        assert_eq!(pkt.err_type().unwrap(), SmErrType::NoError);

        let mut pkt = SmPacket::new(SmPktType::ConnectReq);
        pkt.to_resp_mut(SmErrType::OutOfMemory);
        assert_eq!(pkt.pkt_type().unwrap(), SmPktType::ConnectResp);
        assert_eq!(pkt.err_type().unwrap(), SmErrType::OutOfMemory);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        let short = [0u8; 10];
        assert!(matches!(
            SmPacket::from_bytes(&short),
            Err(Error::TruncatedSmPacket { .. })
        ));

        let mut bytes = SmPacket::new(SmPktType::ConnectReq).to_bytes();
        bytes[0] = 99; // bogus type byte
        assert!(matches!(
            SmPacket::from_bytes(&bytes),
            Err(Error::InvalidSmPktType(99))
        ));

        let mut bytes = SmPacket::new(SmPktType::ConnectReq).to_bytes();
        bytes[1] = 200; // bogus error byte
        assert!(matches!(
            SmPacket::from_bytes(&bytes),
            Err(Error::InvalidSmErrType(200))
        ));
    }
}
