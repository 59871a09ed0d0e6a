//! Sessions and the per-endpoint session table.
//!
//! A session is a long-lived one-to-one control record between a client
//! endpoint and a server endpoint, owned by the endpoint that allocated
//! it. The table is append-only: burying a session leaves a tombstone and
//! the slot is never reused, so session numbers are stable for the life
//! of the endpoint.

use crate::sm::EndpointMetadata;

/// Maximum number of sessions (as client and server combined) an endpoint
/// can create over its lifetime.
pub const MAX_SESSIONS_PER_THREAD: usize = 1024;

/// The role of this endpoint in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// The endpoint that initiated the session.
    Client,
    /// The endpoint that accepted the session.
    Server,
}

/// Session state. States only advance; there are no back-edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connect request sent, waiting for the response. Client only.
    ConnectInProgress,
    /// Established. The only state server sessions are ever in.
    Connected,
    /// Disconnect request sent, waiting for the response. Client only.
    DisconnectInProgress,
    /// Transient state entered just to fire the disconnected event; the
    /// session is buried in the same turn.
    Disconnected,
    /// Terminal failure. Client only.
    Error,
}

impl SessionState {
    /// Check whether `self -> next` is a legal forward transition.
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (ConnectInProgress, Connected)
                | (ConnectInProgress, Error)
                | (Connected, DisconnectInProgress)
                | (DisconnectInProgress, Disconnected)
        )
    }
}

/// One session endpoint's record of a session.
pub struct Session {
    /// Whether this endpoint is the session's client or server.
    pub role: SessionRole,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Client-side endpoint metadata.
    pub client: EndpointMetadata,
    /// Server-side endpoint metadata.
    pub server: EndpointMetadata,
    /// Cycle count at the last SM request transmission. Client only.
    pub mgmt_req_tsc: u64,
    /// True if congestion control is enabled for this session's data plane.
    pub is_cc: bool,
}

impl Session {
    /// Create a session record.
    pub fn new(role: SessionRole, state: SessionState) -> Self {
        debug_assert!(role == SessionRole::Client || state == SessionState::Connected);
        Self {
            role,
            state,
            client: EndpointMetadata::invalid(),
            server: EndpointMetadata::invalid(),
            mgmt_req_tsc: 0,
            is_cc: false,
        }
    }

    /// Check if the session is established.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Check if this endpoint is the session's client.
    #[inline]
    pub fn is_client(&self) -> bool {
        self.role == SessionRole::Client
    }

    /// Advance the lifecycle state. Illegal transitions are programmer
    /// errors, checked in debug builds.
    pub fn advance_state(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal session state transition {:?} -> {next:?}",
            self.state
        );
        self.state = next;
    }

    /// Enable congestion control for this session.
    pub fn enable_congestion_control(&mut self) {
        self.is_cc = true;
    }

    /// Disable congestion control for this session.
    pub fn disable_congestion_control(&mut self) {
        self.is_cc = false;
    }
}

/// Append-only session table indexed by local session number.
///
/// Buried sessions leave a `None` tombstone so live and dead slots both
/// count against [`MAX_SESSIONS_PER_THREAD`].
#[derive(Default)]
pub struct SessionTable {
    sessions: Vec<Option<Session>>,
}

impl SessionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The session number the next successful [`push`](Self::push) returns.
    #[inline]
    pub fn next_session_num(&self) -> u32 {
        self.sessions.len() as u32
    }

    /// Check if the table has reached its lifetime cap.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.sessions.len() >= MAX_SESSIONS_PER_THREAD
    }

    /// Append a session, returning its session number. `None` when the
    /// table is at capacity.
    pub fn push(&mut self, session: Session) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        let session_num = self.sessions.len() as u32;
        self.sessions.push(Some(session));
        Some(session_num)
    }

    /// Get a live session by number.
    pub fn get(&self, session_num: u32) -> Option<&Session> {
        self.sessions
            .get(session_num as usize)
            .and_then(|s| s.as_ref())
    }

    /// Get a live session mutably by number.
    pub fn get_mut(&mut self, session_num: u32) -> Option<&mut Session> {
        self.sessions
            .get_mut(session_num as usize)
            .and_then(|s| s.as_mut())
    }

    /// Replace a slot with the tombstone. Idempotent on buried slots; the
    /// slot is never reallocated.
    pub fn bury(&mut self, session_num: u32) {
        if let Some(slot) = self.sessions.get_mut(session_num as usize) {
            *slot = None;
        }
    }

    /// Number of live sessions.
    pub fn live_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    /// Iterate over live sessions with their session numbers.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Session)> {
        self.sessions
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i as u32, s)))
    }
}
