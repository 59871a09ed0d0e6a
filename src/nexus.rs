//! Process-wide session management demultiplexer.
//!
//! The Nexus owns the management UDP socket and a table of per-endpoint
//! hooks. A background thread receives SM datagrams and appends them to
//! the destination endpoint's inbox; the endpoint drains its inbox from
//! its own event loop. The inbox mutex is the only synchronization point
//! between the Nexus and an endpoint.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{trace, warn};

use crate::config::NexusConfig;
use crate::error::{Error, Result};
use crate::sm::{SmErrType, SmPacket, SmPktType};
use crate::timing::measure_freq_ghz;
use crate::udp::UdpClient;

/// Per-endpoint SM inbox, shared between the Nexus receive thread and the
/// owning endpoint.
///
/// The producer appends heap-owned packets under the mutex; the consumer
/// swaps the whole list out and processes it outside the lock. The event
/// counter is a hint only; the list is the source of truth.
pub struct SmHook {
    app_tid: u8,
    ev_counter: AtomicUsize,
    pkt_list: Mutex<Vec<Box<SmPacket>>>,
}

impl SmHook {
    /// Create an empty hook for the endpoint with the given thread id.
    pub fn new(app_tid: u8) -> Self {
        Self {
            app_tid,
            ev_counter: AtomicUsize::new(0),
            pkt_list: Mutex::new(Vec::new()),
        }
    }

    /// Thread id of the owning endpoint.
    pub fn app_tid(&self) -> u8 {
        self.app_tid
    }

    /// Number of queued packets. Hint only.
    pub fn pending_hint(&self) -> usize {
        self.ev_counter.load(Ordering::Relaxed)
    }

    /// Producer side: enqueue one packet.
    pub fn push(&self, pkt: Box<SmPacket>) {
        let mut list = self.pkt_list.lock();
        list.push(pkt);
        self.ev_counter.store(list.len(), Ordering::Relaxed);
    }

    /// Consumer side: take every queued packet.
    pub fn drain(&self) -> Vec<Box<SmPacket>> {
        if self.pending_hint() == 0 {
            return Vec::new();
        }
        let mut list = self.pkt_list.lock();
        self.ev_counter.store(0, Ordering::Relaxed);
        std::mem::take(&mut *list)
    }
}

/// Process-wide SM demultiplexer.
///
/// Constructed once per process and shared (via `Arc`) with every
/// [`Rpc`](crate::rpc::Rpc) endpoint the process hosts.
pub struct Nexus {
    hostname: String,
    mgmt_udp_port: u16,
    freq_ghz: f64,
    udp: Arc<UdpClient>,
    hooks: Arc<Mutex<HashMap<u8, Arc<SmHook>>>>,
    shutdown: Arc<AtomicBool>,
    sm_thread: Option<JoinHandle<()>>,
}

impl Nexus {
    /// Bind the management socket and start the receive thread.
    pub fn new(config: NexusConfig) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_addr: std::net::SocketAddr =
            ([0, 0, 0, 0], config.mgmt_udp_port).into();
        socket.bind(&bind_addr.into())?;
        socket.set_nonblocking(true)?;
        let socket: UdpSocket = socket.into();

        let udp = Arc::new(UdpClient::new(config.mgmt_udp_port, config.drop_prob)?);
        let hooks = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let sm_thread = {
            let hooks = Arc::clone(&hooks);
            let udp = Arc::clone(&udp);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("udrpc-sm".to_string())
                .spawn(move || sm_thread_loop(socket, hooks, udp, shutdown))?
        };

        Ok(Self {
            hostname: config.hostname,
            mgmt_udp_port: config.mgmt_udp_port,
            freq_ghz: measure_freq_ghz(),
            udp,
            hooks,
            shutdown,
            sm_thread: Some(sm_thread),
        })
    }

    /// Hostname of this process.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Management UDP port of this process.
    pub fn mgmt_udp_port(&self) -> u16 {
        self.mgmt_udp_port
    }

    /// Calibrated cycle-counter frequency in GHz.
    pub fn freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    /// The shared SM packet sender.
    pub fn udp_client(&self) -> &UdpClient {
        &self.udp
    }

    /// Update the SM drop probability. Testing hook.
    pub fn set_drop_prob(&self, drop_prob: f32) {
        self.udp.set_drop_prob(drop_prob);
    }

    /// Register an endpoint's inbox. Fails if the thread id is taken.
    pub fn register_hook(&self, hook: Arc<SmHook>) -> Result<()> {
        let mut hooks = self.hooks.lock();
        let app_tid = hook.app_tid();
        if hooks.contains_key(&app_tid) {
            return Err(Error::TidAlreadyRegistered(app_tid));
        }
        hooks.insert(app_tid, hook);
        Ok(())
    }

    /// Remove an endpoint's inbox. Packets for the tid are rejected or
    /// dropped afterwards.
    pub fn unregister_hook(&self, app_tid: u8) {
        self.hooks.lock().remove(&app_tid);
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sm_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Receive loop of the SM thread: poll the nonblocking socket, decode,
/// route by thread id.
fn sm_thread_loop(
    socket: UdpSocket,
    hooks: Arc<Mutex<HashMap<u8, Arc<SmHook>>>>,
    udp: Arc<UdpClient>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 1024];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((n, src)) => match SmPacket::from_bytes(&buf[..n]) {
                Ok(pkt) => route_sm_packet(pkt, &hooks, &udp),
                Err(e) => warn!(%src, error = %e, "dropping malformed sm packet"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_micros(100));
            }
            Err(e) => {
                warn!(error = %e, "sm socket receive error");
                std::thread::sleep(Duration::from_micros(100));
            }
        }
    }
}

/// Hand a decoded packet to its endpoint's inbox.
///
/// Requests route by the server-side thread id, responses by the client
/// side. A ConnectReq for an unknown tid is answered here with
/// `InvalidRemoteRpcId` so the client fails fast instead of timing out;
/// a DisconnectReq for an unknown tid gets `NoError` since teardown is
/// idempotent. Responses for unknown tids are stale and dropped.
fn route_sm_packet(
    pkt: SmPacket,
    hooks: &Mutex<HashMap<u8, Arc<SmHook>>>,
    udp: &UdpClient,
) {
    // from_bytes validated the type byte already.
    let Ok(pkt_type) = pkt.pkt_type() else {
        return;
    };
    let app_tid = if pkt_type.is_req() {
        pkt.server.app_tid
    } else {
        pkt.client.app_tid
    };

    let hook = hooks.lock().get(&app_tid).cloned();
    match hook {
        Some(hook) => hook.push(Box::new(pkt)),
        None => match pkt_type {
            SmPktType::ConnectReq => {
                trace!(app_tid, "connect request for unknown rpc id");
                let mut resp = pkt;
                resp.to_resp_mut(SmErrType::InvalidRemoteRpcId);
                let dst = resp.client.hostname_str().to_string();
                if let Err(e) = udp.send(&resp, &dst) {
                    warn!(error = %e, %dst, "failed to send invalid-rpc-id response");
                }
            }
            SmPktType::DisconnectReq => {
                let mut resp = pkt;
                resp.to_resp_mut(SmErrType::NoError);
                let dst = resp.client.hostname_str().to_string();
                if let Err(e) = udp.send(&resp, &dst) {
                    warn!(error = %e, %dst, "failed to send disconnect response");
                }
            }
            _ => trace!(app_tid, "dropping sm response for unknown rpc id"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm::EndpointMetadata;
    use std::time::Instant;

    fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(v) = poll() {
                return Some(v);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_hook_push_drain() {
        let hook = SmHook::new(3);
        assert_eq!(hook.pending_hint(), 0);
        assert!(hook.drain().is_empty());

        hook.push(Box::new(SmPacket::new(SmPktType::ConnectReq)));
        hook.push(Box::new(SmPacket::new(SmPktType::DisconnectReq)));
        assert_eq!(hook.pending_hint(), 2);

        let pkts = hook.drain();
        assert_eq!(pkts.len(), 2);
        assert_eq!(hook.pending_hint(), 0);
        assert!(hook.drain().is_empty());
    }

    #[test]
    fn test_duplicate_tid_rejected() {
        let nexus = Nexus::new(NexusConfig::new().with_mgmt_udp_port(31901)).unwrap();
        nexus.register_hook(Arc::new(SmHook::new(1))).unwrap();
        assert!(matches!(
            nexus.register_hook(Arc::new(SmHook::new(1))),
            Err(Error::TidAlreadyRegistered(1))
        ));
    }

    #[test]
    fn test_routing_and_unknown_tid_reject() {
        let port = 31902;
        let nexus = Nexus::new(
            NexusConfig::new()
                .with_hostname("127.0.0.1")
                .with_mgmt_udp_port(port),
        )
        .unwrap();
        let hook = Arc::new(SmHook::new(5));
        nexus.register_hook(Arc::clone(&hook)).unwrap();

        // A request for tid 5 lands in the hook.
        let mut req = SmPacket::new(SmPktType::ConnectReq);
        req.client = EndpointMetadata::invalid();
        req.client.set_hostname("127.0.0.1").unwrap();
        req.client.app_tid = 5;
        req.server.app_tid = 5;
        nexus.udp_client().send(&req, "127.0.0.1").unwrap();

        let pkt = wait_for(|| hook.drain().into_iter().next()).expect("request not routed");
        assert_eq!(pkt.pkt_type().unwrap(), SmPktType::ConnectReq);

        // A request for an unregistered tid bounces back as a response
        // carrying InvalidRemoteRpcId, routed to the client's hook.
        req.server.app_tid = 9;
        nexus.udp_client().send(&req, "127.0.0.1").unwrap();

        let pkt = wait_for(|| hook.drain().into_iter().next()).expect("reject not routed");
        assert_eq!(pkt.pkt_type().unwrap(), SmPktType::ConnectResp);
        assert_eq!(pkt.err_type().unwrap(), SmErrType::InvalidRemoteRpcId);
    }
}
