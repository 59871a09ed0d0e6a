//! Common test utilities for session management integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use udrpc::{
    Nexus, NexusConfig, Rpc, Session, SmErrType, SmEventType, UdpDataTransport,
    INVALID_SESSION_NUM, INVALID_START_SEQ,
};

/// Each test gets its own Nexus, so each needs its own management port.
static NEXT_MGMT_PORT: AtomicU16 = AtomicU16::new(31921);

pub fn alloc_mgmt_port() -> u16 {
    NEXT_MGMT_PORT.fetch_add(1, Ordering::Relaxed)
}

/// Install the test log writer once, controlled by `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A loopback Nexus on a fresh management port.
pub fn test_nexus() -> Arc<Nexus> {
    init_tracing();
    Arc::new(
        Nexus::new(
            NexusConfig::new()
                .with_hostname("127.0.0.1")
                .with_mgmt_udp_port(alloc_mgmt_port()),
        )
        .expect("failed to create test nexus"),
    )
}

/// One recorded SM event, captured from the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmEventRecord {
    pub session_num: u32,
    pub event: SmEventType,
    pub err: SmErrType,
    /// True if the server-side metadata was fully populated when the
    /// event fired. Meaningful for `Connected`.
    pub server_filled: bool,
}

pub type EventLog = Rc<RefCell<Vec<SmEventRecord>>>;

pub fn event_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// Handler that appends every event to the log.
pub fn recording_handler(
    log: &EventLog,
) -> impl FnMut(&Session, SmEventType, SmErrType) + 'static {
    let log = Rc::clone(log);
    move |session, event, err| {
        let session_num = session.client.session_num;
        let server_session_num = session.server.session_num;
        let server_start_seq = session.server.start_seq;
        log.borrow_mut().push(SmEventRecord {
            session_num,
            event,
            err,
            server_filled: server_session_num != INVALID_SESSION_NUM
                && server_start_seq != INVALID_START_SEQ,
        });
    }
}

/// An endpoint on the shared test Nexus, managing fabric port 0.
pub fn test_rpc(nexus: &Arc<Nexus>, app_tid: u8, log: &EventLog) -> Rpc<UdpDataTransport> {
    let transport = UdpDataTransport::new(64).expect("failed to bind data socket");
    Rpc::new(
        Arc::clone(nexus),
        app_tid,
        transport,
        vec![0],
        recording_handler(log),
    )
    .expect("failed to create test rpc")
}

/// Tick both endpoints until `cond` holds or `timeout` passes. Returns
/// whether the condition was met.
pub fn tick_until(
    client: &mut Rpc<UdpDataTransport>,
    server: &mut Rpc<UdpDataTransport>,
    timeout: Duration,
    mut cond: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        client.run_event_loop_once();
        server.run_event_loop_once();
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    cond()
}

/// Tick one endpoint until `cond` holds or `timeout` passes.
pub fn tick_until_one(
    rpc: &mut Rpc<UdpDataTransport>,
    timeout: Duration,
    mut cond: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        rpc.run_event_loop_once();
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    cond()
}

/// Tick both endpoints for a fixed duration.
pub fn tick_for(
    client: &mut Rpc<UdpDataTransport>,
    server: &mut Rpc<UdpDataTransport>,
    duration: Duration,
) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        client.run_event_loop_once();
        server.run_event_loop_once();
        std::thread::sleep(Duration::from_micros(200));
    }
}
