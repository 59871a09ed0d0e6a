//! Per-thread RPC endpoint: the session management core.
//!
//! An `Rpc` owns every session it hosts, as client or server, and runs a
//! non-blocking event loop that drains the SM inbox and scans the retry
//! queue. All session state is mutated on the owning thread; the inbox is
//! the only cross-thread surface.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::nexus::{Nexus, SmHook};
use crate::session::{
    Session, SessionRole, SessionState, SessionTable, MAX_SESSIONS_PER_THREAD,
};
use crate::sm::{EndpointMetadata, SmErrType, SmEventType, SmPacket, SmPktType};
use crate::timing::{rdtsc, to_ms};
use crate::transport::Transport;

/// Retransmission interval for in-flight SM requests, in milliseconds.
pub const SM_RETRANS_MS: u64 = 5;

/// Timeout after which an in-flight SM request fails, in milliseconds.
pub const SM_TIMEOUT_MS: u64 = 50;

/// Start sequence numbers use the low 48 bits; the high 16 are reserved.
const START_SEQ_MASK: u64 = (1 << 48) - 1;

/// Application handler for session management events.
///
/// Invoked synchronously from the endpoint thread, exactly once per
/// terminal transition. The handler must not call back into this
/// endpoint's SM API, and must not retain the session reference after
/// returning: for terminal events the session is buried as soon as the
/// handler is done.
pub type SmHandler = Box<dyn FnMut(&Session, SmEventType, SmErrType)>;

/// A per-thread RPC endpoint.
pub struct Rpc<T: Transport> {
    nexus: Arc<Nexus>,
    app_tid: u8,
    transport: T,
    /// Fabric ports managed by this endpoint.
    phy_ports: Vec<u8>,
    /// This endpoint's metadata with the per-session fields left invalid.
    local_base: EndpointMetadata,
    sessions: SessionTable,
    /// Client sessions with one SM request in flight.
    retry_queue: Vec<u32>,
    hook: Arc<SmHook>,
    sm_handler: SmHandler,
    freq_ghz: f64,
}

impl<T: Transport> Rpc<T> {
    /// Create an endpoint and register its inbox with the Nexus.
    pub fn new<F>(
        nexus: Arc<Nexus>,
        app_tid: u8,
        transport: T,
        phy_ports: Vec<u8>,
        sm_handler: F,
    ) -> Result<Self>
    where
        F: FnMut(&Session, SmEventType, SmErrType) + 'static,
    {
        let mut local_base = EndpointMetadata::invalid();
        local_base.transport = transport.kind() as u8;
        local_base.set_hostname(nexus.hostname())?;
        local_base.app_tid = app_tid;

        let hook = Arc::new(SmHook::new(app_tid));
        nexus.register_hook(Arc::clone(&hook))?;
        let freq_ghz = nexus.freq_ghz();

        Ok(Self {
            nexus,
            app_tid,
            transport,
            phy_ports,
            local_base,
            sessions: SessionTable::new(),
            retry_queue: Vec::new(),
            hook,
            sm_handler: Box::new(sm_handler),
            freq_ghz,
        })
    }

    /// Thread id of this endpoint.
    pub fn app_tid(&self) -> u8 {
        self.app_tid
    }

    /// Number of live sessions, as client and server combined.
    pub fn num_live_sessions(&self) -> usize {
        self.sessions.live_count()
    }

    /// Check if a session is established.
    pub fn is_connected(&self, session_num: u32) -> bool {
        self.sessions
            .get(session_num)
            .is_some_and(|s| s.is_connected())
    }

    /// Create a client session and start connecting to the remote
    /// endpoint `(rem_hostname, rem_tid)` through its fabric port
    /// `rem_port`.
    ///
    /// Returns the local session number. The outcome arrives later
    /// through the SM handler as `Connected` or `ConnectFailed`.
    pub fn create_session(
        &mut self,
        local_port: u8,
        rem_hostname: &str,
        rem_tid: u8,
        rem_port: u8,
    ) -> Result<u32> {
        if !self.phy_ports.contains(&local_port) {
            return Err(Error::InvalidPhyPort(local_port));
        }
        if self.sessions.is_full() {
            return Err(Error::SessionTableFull(MAX_SESSIONS_PER_THREAD));
        }

        let mut session = Session::new(SessionRole::Client, SessionState::ConnectInProgress);
        session.client = self.local_base;
        session.client.phy_port = local_port;
        session.client.session_num = self.sessions.next_session_num();
        session.client.start_seq = gen_start_seq();
        self.transport.fill_local_routing_info(&mut session.client);

        session.server.transport = self.transport.kind() as u8;
        session.server.set_hostname(rem_hostname)?;
        session.server.app_tid = rem_tid;
        session.server.phy_port = rem_port;
        // Server session number and start sequence stay invalid until the
        // connect response fills them.

        let session_num = self
            .sessions
            .push(session)
            .ok_or(Error::SessionTableFull(MAX_SESSIONS_PER_THREAD))?;

        debug!(session_num, dst = rem_hostname, rem_tid, "creating session");
        self.retry_queue_add(session_num);
        self.send_connect_req(session_num);
        Ok(session_num)
    }

    /// Disconnect and destroy a client session.
    ///
    /// Returns true if the disconnect handshake was started; the
    /// `Disconnected` event fires later and the session number must not
    /// be used afterwards. Returns false for unknown or server sessions,
    /// for sessions still connecting (wait for the connect event first),
    /// and for sessions already disconnecting.
    pub fn destroy_session(&mut self, session_num: u32) -> bool {
        let Some(session) = self.sessions.get_mut(session_num) else {
            trace!(session_num, "destroy of unknown session ignored");
            return false;
        };
        if !session.is_client() {
            warn!(session_num, "destroy of server session ignored");
            return false;
        }
        match session.state {
            SessionState::Connected => {
                session.advance_state(SessionState::DisconnectInProgress);
                debug!(session_num, "disconnecting session");
                self.retry_queue_add(session_num);
                self.send_disconnect_req(session_num);
                true
            }
            // Mid-connect teardown is not allowed; the caller must wait
            // for the connect event and destroy afterwards.
            _ => false,
        }
    }

    /// Run one non-blocking iteration of the event loop: drain the SM
    /// inbox, then scan the retry queue.
    pub fn run_event_loop_once(&mut self) {
        self.handle_session_management();
        self.mgmt_retry();
    }

    /// Run the event loop forever.
    pub fn run_event_loop(&mut self) -> ! {
        loop {
            self.run_event_loop_once();
        }
    }

    /// Run the event loop for `timeout_ms` milliseconds.
    pub fn run_event_loop_timeout(&mut self, timeout_ms: u64) {
        let start_tsc = rdtsc();
        loop {
            self.run_event_loop_once();
            let elapsed_ms = to_ms(rdtsc().wrapping_sub(start_tsc), self.freq_ghz);
            if elapsed_ms > timeout_ms as f64 {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbox
    // ------------------------------------------------------------------

    /// Process every SM packet queued by the Nexus since the last tick.
    fn handle_session_management(&mut self) {
        let pkts = self.hook.drain();
        for pkt in pkts {
            match pkt.pkt_type() {
                Ok(SmPktType::ConnectReq) => self.handle_connect_req(&pkt),
                Ok(SmPktType::ConnectResp) => self.handle_connect_resp(&pkt),
                Ok(SmPktType::DisconnectReq) => self.handle_disconnect_req(&pkt),
                Ok(SmPktType::DisconnectResp) => self.handle_disconnect_resp(&pkt),
                Err(e) => warn!(error = %e, "dropping sm packet with invalid type"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Server-side request handlers
    // ------------------------------------------------------------------

    fn handle_connect_req(&mut self, pkt: &SmPacket) {
        debug!(client = %pkt.client.name(), "handling connect request");
        let mut resp = *pkt;

        if pkt.client.transport != self.transport.kind() as u8 {
            self.send_sm_resp(&mut resp, SmErrType::InvalidTransport);
            return;
        }
        if !self.phy_ports.contains(&pkt.server.phy_port) {
            self.send_sm_resp(&mut resp, SmErrType::RoutingResolutionFailure);
            return;
        }

        // A retransmitted request racing its own response: a session for
        // this client location already exists. Echo its metadata and
        // allocate nothing, so duplicates stay idempotent.
        let existing = self
            .sessions
            .iter()
            .find(|(_, s)| s.role == SessionRole::Server && s.client == pkt.client)
            .map(|(_, s)| s.server);
        if let Some(server_meta) = existing {
            resp.server = server_meta;
            self.send_sm_resp(&mut resp, SmErrType::NoError);
            return;
        }

        if self.sessions.is_full() {
            self.send_sm_resp(&mut resp, SmErrType::OutOfMemory);
            return;
        }
        if let Err(err) = self.transport.alloc_session_resources() {
            self.send_sm_resp(&mut resp, err);
            return;
        }
        let mut client_meta = pkt.client;
        if self
            .transport
            .resolve_remote_routing_info(&mut client_meta)
            .is_err()
        {
            self.transport.free_session_resources();
            self.send_sm_resp(&mut resp, SmErrType::RoutingResolutionFailure);
            return;
        }

        let mut session = Session::new(SessionRole::Server, SessionState::Connected);
        session.client = client_meta;
        session.server = self.local_base;
        session.server.phy_port = pkt.server.phy_port;
        session.server.session_num = self.sessions.next_session_num();
        session.server.start_seq = gen_start_seq();
        self.transport.fill_local_routing_info(&mut session.server);

        let server_meta = session.server;
        let Some(session_num) = self.sessions.push(session) else {
            // Capacity was checked above; treat a lost race as exhaustion.
            self.transport.free_session_resources();
            self.send_sm_resp(&mut resp, SmErrType::OutOfMemory);
            return;
        };

        debug!(session_num, client = %resp.client.name(), "server session connected");
        resp.server = server_meta;
        self.send_sm_resp(&mut resp, SmErrType::NoError);
    }

    fn handle_disconnect_req(&mut self, pkt: &SmPacket) {
        let session_num = pkt.server.session_num;
        debug!(session_num, client = %pkt.client.name(), "handling disconnect request");
        let mut resp = *pkt;

        let is_match = self
            .sessions
            .get(session_num)
            .is_some_and(|s| s.role == SessionRole::Server && s.client == pkt.client);
        if is_match {
            self.bury_session(session_num);
        }
        // An unknown session means a duplicate disconnect; the client has
        // proved it no longer cares, so the reply is success either way.
        self.send_sm_resp(&mut resp, SmErrType::NoError);
    }

    // ------------------------------------------------------------------
    // Client-side response handlers
    // ------------------------------------------------------------------

    fn handle_connect_resp(&mut self, pkt: &SmPacket) {
        let session_num = pkt.client.session_num;
        let err = match pkt.err_type() {
            Ok(err) => err,
            Err(e) => {
                warn!(error = %e, "dropping connect response with invalid error kind");
                return;
            }
        };

        // Match the response to an in-flight session; anything that does
        // not line up is a late duplicate or a stray.
        {
            let Some(session) = self.sessions.get(session_num) else {
                trace!(session_num, "dropping connect response for unknown session");
                return;
            };
            if !session.is_client()
                || session.client != pkt.client
                || session.server.hostname != pkt.server.hostname
                || session.server.app_tid != pkt.server.app_tid
            {
                trace!(session_num, "dropping connect response with mismatched endpoints");
                return;
            }
            if session.state != SessionState::ConnectInProgress {
                trace!(session_num, "dropping duplicate connect response");
                return;
            }
        }

        self.retry_queue_remove(session_num);

        if err != SmErrType::NoError {
            if let Some(session) = self.sessions.get_mut(session_num) {
                session.advance_state(SessionState::Error);
            }
            debug!(session_num, ?err, "connect refused by server");
            self.invoke_sm_handler(session_num, SmEventType::ConnectFailed, err);
            self.bury_session(session_num);
            return;
        }

        // The server filled in its metadata; resolve its routing info so
        // the data plane can address it.
        let mut server_meta = pkt.server;
        match self.transport.resolve_remote_routing_info(&mut server_meta) {
            Ok(()) => {
                if let Some(session) = self.sessions.get_mut(session_num) {
                    session.server = server_meta;
                    session.advance_state(SessionState::Connected);
                }
                debug!(session_num, server = %server_meta.name(), "session connected");
                self.invoke_sm_handler(session_num, SmEventType::Connected, SmErrType::NoError);
            }
            Err(resolve_err) => {
                if let Some(session) = self.sessions.get_mut(session_num) {
                    session.advance_state(SessionState::Error);
                }
                debug!(session_num, "connect failed: server routing unresolvable");
                self.invoke_sm_handler(session_num, SmEventType::ConnectFailed, resolve_err);
                self.bury_session(session_num);
            }
        }
    }

    fn handle_disconnect_resp(&mut self, pkt: &SmPacket) {
        let session_num = pkt.client.session_num;
        {
            let Some(session) = self.sessions.get(session_num) else {
                trace!(session_num, "dropping disconnect response for unknown session");
                return;
            };
            if !session.is_client() || session.client != pkt.client {
                trace!(session_num, "dropping disconnect response with mismatched endpoints");
                return;
            }
            if session.state != SessionState::DisconnectInProgress {
                trace!(session_num, "dropping duplicate disconnect response");
                return;
            }
        }

        self.retry_queue_remove(session_num);
        if let Some(session) = self.sessions.get_mut(session_num) {
            session.advance_state(SessionState::Disconnected);
        }
        debug!(session_num, "session disconnected");
        // Whatever the response says, the server no longer has the
        // session, so teardown counts as success.
        self.invoke_sm_handler(session_num, SmEventType::Disconnected, SmErrType::NoError);
        self.bury_session(session_num);
    }

    // ------------------------------------------------------------------
    // Retry engine
    // ------------------------------------------------------------------

    /// Scan in-flight SM requests: retransmit the slow ones, fail the
    /// ones past the timeout.
    fn mgmt_retry(&mut self) {
        if self.retry_queue.is_empty() {
            return;
        }
        let cur_tsc = rdtsc();
        let mut timed_out: Vec<u32> = Vec::new();

        let queue = self.retry_queue.clone();
        for session_num in queue {
            let Some(session) = self.sessions.get(session_num) else {
                debug_assert!(false, "buried session {session_num} in retry queue");
                continue;
            };
            let state = session.state;
            debug_assert!(
                matches!(
                    state,
                    SessionState::ConnectInProgress | SessionState::DisconnectInProgress
                ),
                "session {session_num} in retry queue with state {state:?}"
            );

            let elapsed_ms = to_ms(cur_tsc.wrapping_sub(session.mgmt_req_tsc), self.freq_ghz);
            if elapsed_ms > SM_TIMEOUT_MS as f64 {
                timed_out.push(session_num);
                continue;
            }
            if elapsed_ms > SM_RETRANS_MS as f64 {
                match state {
                    SessionState::ConnectInProgress => {
                        trace!(session_num, "retrying connect request");
                        self.send_connect_req(session_num);
                    }
                    SessionState::DisconnectInProgress => {
                        trace!(session_num, "retrying disconnect request");
                        self.send_disconnect_req(session_num);
                    }
                    _ => {}
                }
                if let Some(session) = self.sessions.get_mut(session_num) {
                    session.mgmt_req_tsc = rdtsc();
                }
            }
        }

        for session_num in timed_out {
            self.retry_queue_remove(session_num);
            let Some(session) = self.sessions.get_mut(session_num) else {
                continue;
            };
            match session.state {
                SessionState::ConnectInProgress => {
                    session.advance_state(SessionState::Error);
                    debug!(session_num, "connect request timed out");
                    self.invoke_sm_handler(
                        session_num,
                        SmEventType::ConnectFailed,
                        SmErrType::SrvDisconnected,
                    );
                }
                SessionState::DisconnectInProgress => {
                    session.advance_state(SessionState::Disconnected);
                    debug!(session_num, "disconnect request timed out; tearing down locally");
                    self.invoke_sm_handler(
                        session_num,
                        SmEventType::Disconnected,
                        SmErrType::SrvDisconnected,
                    );
                }
                _ => continue,
            }
            self.bury_session(session_num);
        }
    }

    fn retry_queue_add(&mut self, session_num: u32) {
        debug_assert!(!self.retry_queue.contains(&session_num));
        if let Some(session) = self.sessions.get_mut(session_num) {
            debug_assert!(session.is_client());
            session.mgmt_req_tsc = rdtsc();
        }
        self.retry_queue.push(session_num);
    }

    fn retry_queue_remove(&mut self, session_num: u32) {
        self.retry_queue.retain(|&sn| sn != session_num);
    }

    // ------------------------------------------------------------------
    // Sends and teardown
    // ------------------------------------------------------------------

    fn send_connect_req(&self, session_num: u32) {
        let Some(session) = self.sessions.get(session_num) else {
            return;
        };
        debug_assert!(session.is_client() && session.state == SessionState::ConnectInProgress);
        let mut pkt = SmPacket::new(SmPktType::ConnectReq);
        pkt.client = session.client;
        pkt.server = session.server;
        if let Err(e) = self
            .nexus
            .udp_client()
            .send(&pkt, session.server.hostname_str())
        {
            warn!(session_num, error = %e, "failed to send connect request");
        }
    }

    fn send_disconnect_req(&self, session_num: u32) {
        let Some(session) = self.sessions.get(session_num) else {
            return;
        };
        debug_assert!(session.is_client() && session.state == SessionState::DisconnectInProgress);
        let mut pkt = SmPacket::new(SmPktType::DisconnectReq);
        pkt.client = session.client;
        pkt.server = session.server;
        if let Err(e) = self
            .nexus
            .udp_client()
            .send(&pkt, session.server.hostname_str())
        {
            warn!(session_num, error = %e, "failed to send disconnect request");
        }
    }

    /// Flip a request into its response in place and send it back to the
    /// client endpoint.
    fn send_sm_resp(&self, resp: &mut SmPacket, err: SmErrType) {
        resp.to_resp_mut(err);
        let dst = resp.client.hostname_str().to_string();
        if let Err(e) = self.nexus.udp_client().send(resp, &dst) {
            warn!(error = %e, %dst, "failed to send sm response");
        }
    }

    /// Deliver one SM event to the application handler. The session must
    /// still be live; terminal events bury it right after this returns.
    fn invoke_sm_handler(&mut self, session_num: u32, event: SmEventType, err: SmErrType) {
        if let Some(session) = self.sessions.get(session_num) {
            (self.sm_handler)(session, event, err);
        }
    }

    /// Tombstone a session and release its data-plane resources.
    fn bury_session(&mut self, session_num: u32) {
        if let Some(session) = self.sessions.get(session_num) {
            if session.role == SessionRole::Server {
                self.transport.free_session_resources();
            }
        }
        self.sessions.bury(session_num);
    }
}

impl<T: Transport> Drop for Rpc<T> {
    fn drop(&mut self) {
        self.nexus.unregister_hook(self.app_tid);
    }
}

/// Generate a random 48-bit starting sequence number.
fn gen_start_seq() -> u64 {
    rand::thread_rng().gen::<u64>() & START_SEQ_MASK
}
