//! # udrpc - session management for a per-thread datagram RPC runtime
//!
//! This crate implements the session management (SM) control plane of an
//! RPC runtime built on an unreliable datagram fabric: the out-of-band
//! protocol, carried over lossy UDP, by which two RPC endpoints
//! negotiate, establish, and tear down long-lived sessions before any
//! data-plane traffic flows.
//!
//! ## Features
//!
//! - **Single-threaded endpoints**: each `Rpc` is owned by one thread and
//!   mutates all session state without locks
//! - **Bounded teardown**: every in-flight SM request resolves within the
//!   SM timeout, retransmitting along the way
//! - **Idempotent handshakes**: duplicated and reordered control packets
//!   are absorbed by the handlers, not by the fabric
//! - **Pluggable data plane**: the transport appears only as a small
//!   routing/resource capability trait
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use udrpc::{Nexus, NexusConfig, Rpc, SmEventType, UdpDataTransport};
//!
//! // One Nexus per process, shared by all endpoints.
//! let nexus = Arc::new(Nexus::new(NexusConfig::default())?);
//!
//! // One Rpc per worker thread.
//! let transport = UdpDataTransport::new(64)?;
//! let mut rpc = Rpc::new(nexus, 0, transport, vec![0], |session, event, err| {
//!     println!("sm event {:?} (err {:?})", event, err);
//! })?;
//!
//! // Connect to thread 1 on a remote host; the handler reports the outcome.
//! let session_num = rpc.create_session(0, "server-1", 1, 0)?;
//!
//! loop {
//!     rpc.run_event_loop_once();
//! }
//! ```
//!
//! ## Architecture
//!
//! The crate is organized as follows:
//!
//! - [`config`]: Nexus configuration (`NexusConfig`)
//! - [`sm`]: SM wire records and codec (`SmPacket`, `EndpointMetadata`)
//! - [`session`]: Session state machine and table (`Session`, `SessionTable`)
//! - [`transport`]: Data-plane collaborator trait (`Transport`)
//! - [`udp`]: Management-plane sender with loss injection (`UdpClient`)
//! - [`nexus`]: Process-wide demultiplexer and per-endpoint inbox (`Nexus`, `SmHook`)
//! - [`timing`]: Cycle counter and frequency calibration
//! - [`rpc`]: Per-thread endpoint API (`Rpc`)

pub mod config;
pub mod error;
pub mod nexus;
pub mod rpc;
pub mod session;
pub mod sm;
pub mod timing;
pub mod transport;
pub mod udp;

// Re-export main types
pub use config::NexusConfig;
pub use error::{Error, Result};
pub use nexus::{Nexus, SmHook};
pub use rpc::{Rpc, SmHandler, SM_RETRANS_MS, SM_TIMEOUT_MS};
pub use session::{Session, SessionRole, SessionState, SessionTable, MAX_SESSIONS_PER_THREAD};
pub use sm::{
    EndpointMetadata, SmErrType, SmEventType, SmPacket, SmPktType, INVALID_APP_TID,
    INVALID_PHY_PORT, INVALID_SESSION_NUM, INVALID_START_SEQ, SM_PACKET_SIZE,
};
pub use transport::{Transport, TransportKind, UdpDataTransport, MAX_ROUTING_INFO_LEN};
pub use udp::UdpClient;
