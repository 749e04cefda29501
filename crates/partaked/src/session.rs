//! Per-connection session state.
//!
//! A session owns one client's handles. The handle table (and its token
//! index) is the session's only source of truth for what the client holds;
//! the daemon never synthesizes aliases. Deferred responses are pushed into
//! the session's outbound queue, which the connection's writer drains in
//! order.

use crate::object::{HandleId, ObjectId, SessionId};
use log::warn;
use partake_proto::{ResponseMessage, Status, Token};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Longest client name retained from a Hello request.
const MAX_CLIENT_NAME_LEN: usize = 1023;

/// A session's view of one proper object: how many times the client has it
/// open, plus any suspended requests.
#[derive(Debug)]
pub struct Handle {
    pub object: ObjectId,
    /// Successful opens by this session not yet matched by closes.
    pub open_count: u32,
    /// Number of continuations this handle has registered in its object's
    /// awaiting-share FIFO.
    pub pending_share: u32,
    /// Seqno of the one suspended unshare, if any.
    pub pending_unique: Option<u64>,
}

impl Handle {
    pub fn new(object: ObjectId) -> Self {
        Self {
            object,
            open_count: 0,
            pending_share: 0,
            pending_unique: None,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open_count > 0
    }

    /// A handle with no opens and no pending requests is eligible for
    /// destruction.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.open_count == 0 && self.pending_share == 0 && self.pending_unique.is_none()
    }
}

pub struct Session {
    id: SessionId,
    has_said_hello: bool,
    client_name: String,
    client_pid: u32,
    pub(crate) handles: HashMap<HandleId, Handle>,
    pub(crate) tokens: HashMap<Token, HandleId>,
    outbox: mpsc::UnboundedSender<ResponseMessage>,
}

impl Session {
    pub fn new(id: SessionId, outbox: mpsc::UnboundedSender<ResponseMessage>) -> Self {
        Self {
            id,
            has_said_hello: false,
            client_name: String::new(),
            client_pid: 0,
            handles: HashMap::new(),
            tokens: HashMap::new(),
            outbox,
        }
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.client_name
    }

    pub fn pid(&self) -> u32 {
        self.client_pid
    }

    /// First-call-only client introduction; records name and pid and returns
    /// the session id.
    pub fn hello(&mut self, name: &str, pid: u32) -> Result<SessionId, Status> {
        if self.has_said_hello {
            return Err(Status::InvalidRequest);
        }
        self.client_name = truncate_to_boundary(name, MAX_CLIENT_NAME_LEN).to_owned();
        self.client_pid = pid;
        self.has_said_hello = true;
        Ok(self.id)
    }

    pub fn find_handle(&self, token: Token) -> Option<HandleId> {
        self.tokens.get(&token).copied()
    }

    pub fn handle(&self, id: HandleId) -> &Handle {
        match self.handles.get(&id) {
            Some(h) => h,
            None => unreachable!("stale handle reference"),
        }
    }

    pub fn handle_mut(&mut self, id: HandleId) -> &mut Handle {
        match self.handles.get_mut(&id) {
            Some(h) => h,
            None => unreachable!("stale handle reference"),
        }
    }

    /// Queues a deferred response. A send failure means the connection is
    /// already tearing down; the response is dropped with the socket.
    pub fn push_response(&self, msg: ResponseMessage) {
        if self.outbox.send(msg).is_err() {
            warn!("client {}: dropped response for closed connection", self.id);
        }
    }

    /// Table maintenance; see `Repository::housekeeping`.
    pub fn housekeeping(&mut self) {
        crate::repository::maybe_shrink(&mut self.handles);
        crate::repository::maybe_shrink(&mut self.tokens);
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty() && self.tokens.is_empty()
    }
}

/// Byte-limited prefix of `name`, backed off to a char boundary.
fn truncate_to_boundary(name: &str, max_len: usize) -> &str {
    if name.len() <= max_len {
        return name;
    }
    let mut end = max_len;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
