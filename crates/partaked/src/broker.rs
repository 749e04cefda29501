//! The arbitration engine.
//!
//! One broker owns all daemon state: the allocator, the repository, and
//! every session. Each semantic operation (alloc, open, close, share,
//! unshare, voucher create/discard) runs to completion while the connection
//! task holds the broker; operations that cannot complete register a
//! continuation on the handle and return, and the continuation is resumed
//! synchronously from inside whichever later operation makes its predicate
//! true (or proves it can never become true).
//!
//! Resuming always re-validates the predicate; a resumption never trusts
//! the state observed at suspension time.

use crate::arena::ShmemAllocator;
use crate::invariants::{debug_assert_no_unique_waiter, debug_assert_writer_allowed};
use crate::object::{HandleId, HandleRef, ObjectId, SessionId, ShareWaiter};
use crate::repository::{Claim, Repository};
use crate::session::{Handle, Session};
use crate::voucher_queue::TimerHandle;
use log::{debug, info};
use partake_proto::{
    KeySequence, Mapping, Policy, Response, ResponseBody, ResponseMessage, SegmentSpec, Status,
    Token,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub struct Broker {
    allocator: ShmemAllocator,
    segment_spec: SegmentSpec,
    repo: Repository,
    sessions: HashMap<SessionId, Session>,
    session_counter: u32,
    next_handle_id: HandleId,
    voucher_ttl: Duration,
}

impl Drop for Broker {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        // Sessions must tear down before the repository drops its objects;
        // object destructors check that they are fully unreferenced.
        self.shutdown();
    }
}

fn handle_of<'a>(sessions: &'a HashMap<SessionId, Session>, r: HandleRef) -> &'a Handle {
    match sessions.get(&r.0) {
        Some(sess) => sess.handle(r.1),
        None => unreachable!("stale session reference"),
    }
}

fn handle_mut<'a>(sessions: &'a mut HashMap<SessionId, Session>, r: HandleRef) -> &'a mut Handle {
    match sessions.get_mut(&r.0) {
        Some(sess) => sess.handle_mut(r.1),
        None => unreachable!("stale session reference"),
    }
}

impl Broker {
    pub fn new(
        allocator: ShmemAllocator,
        segment_spec: SegmentSpec,
        voucher_ttl: Duration,
        keys: KeySequence,
        timer: TimerHandle,
    ) -> Self {
        Self {
            allocator,
            segment_spec,
            repo: Repository::new(keys, timer),
            sessions: HashMap::new(),
            session_counter: 0,
            next_handle_id: 0,
            voucher_ttl,
        }
    }

    pub fn allocator(&self) -> &ShmemAllocator {
        &self.allocator
    }

    pub fn object_count(&self) -> usize {
        self.repo.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ---------------------------------------------------------------------
    // Session lifecycle
    // ---------------------------------------------------------------------

    /// Registers a new session; deferred responses go to `outbox`.
    pub fn add_session(&mut self, outbox: mpsc::UnboundedSender<ResponseMessage>) -> SessionId {
        let sid = self.session_counter;
        self.session_counter += 1;
        self.sessions.insert(sid, Session::new(sid, outbox));
        sid
    }

    /// Tears down a session: drops its pending requests (so none resume into
    /// the teardown), closes all its handles, and removes it. Fan-out from
    /// the closes still resumes *other* sessions' continuations normally.
    pub fn remove_session(&mut self, sid: SessionId) {
        let Some(sess) = self.sessions.get(&sid) else {
            return;
        };
        info!(
            "client {sid} (pid {}, \"{}\"): session closed",
            sess.pid(),
            sess.name()
        );
        self.drop_pending_requests(sid);
        let hids: Vec<HandleId> = self.sessions[&sid].handles.keys().copied().collect();
        for hid in hids {
            loop {
                let open = match self.sessions.get(&sid).and_then(|s| s.handles.get(&hid)) {
                    Some(h) => h.open_count,
                    None => break,
                };
                if open == 0 {
                    break;
                }
                self.close_handle((sid, hid));
            }
            self.reap_handle((sid, hid));
        }
        let sess = self.sessions.remove(&sid);
        debug_assert!(sess.is_some_and(|s| s.is_empty()));
    }

    /// Drops every continuation this session has registered, without sending
    /// responses. Called before session teardown and at daemon quit.
    pub fn drop_pending_requests(&mut self, sid: SessionId) {
        let Some(sess) = self.sessions.get(&sid) else {
            return;
        };
        let hids: Vec<HandleId> = sess.handles.keys().copied().collect();
        for hid in hids {
            let Some(h) = self.sessions.get_mut(&sid).and_then(|s| s.handles.get_mut(&hid))
            else {
                continue;
            };
            let oid = h.object;
            if h.pending_share > 0 {
                h.pending_share = 0;
                self.repo
                    .get_mut(oid)
                    .as_proper_mut()
                    .awaiting_share
                    .retain(|w| !(w.session == sid && w.handle == hid));
            }
            let h = handle_mut(&mut self.sessions, (sid, hid));
            if h.pending_unique.take().is_some() {
                let po = self.repo.get_mut(oid).as_proper_mut();
                debug_assert_eq!(po.awaiting_unique, Some((sid, hid)));
                po.awaiting_unique = None;
            }
            self.reap_handle((sid, hid));
        }
    }

    /// Daemon quit: drop all pending requests first so nothing resumes into
    /// closed objects, then tear down every session, then drain the voucher
    /// queue.
    pub fn shutdown(&mut self) {
        let sids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for &sid in &sids {
            self.drop_pending_requests(sid);
        }
        for &sid in &sids {
            self.remove_session(sid);
        }
        for vid in self.repo.take_all_queued() {
            let target = self.repo.destroy_voucher(vid);
            self.voucher_dropped(target);
        }
        debug_assert!(self.repo.is_empty());
    }

    // ---------------------------------------------------------------------
    // Global requests
    // ---------------------------------------------------------------------

    pub fn hello(&mut self, sid: SessionId, name: &str, pid: u32) -> Result<u32, Status> {
        let result = self.session_mut(sid).hello(name, pid);
        if result.is_ok() {
            let sess = self.session(sid);
            info!("client {sid}: hello from \"{}\" (pid {})", sess.name(), sess.pid());
        }
        result
    }

    pub fn get_segment(&self, segment: u32) -> Result<SegmentSpec, Status> {
        // For now there is only one segment, id 0.
        if segment == 0 {
            Ok(self.segment_spec.clone())
        } else {
            Err(Status::NoSuchSegment)
        }
    }

    // ---------------------------------------------------------------------
    // Object operations
    // ---------------------------------------------------------------------

    pub fn alloc(&mut self, sid: SessionId, size: u64, policy: Policy) -> Result<Mapping, Status> {
        let size = usize::try_from(size).map_err(|_| Status::OutOfShmem)?;
        let resource = self.allocator.allocate(size).ok_or(Status::OutOfShmem)?;
        let oid = self.repo.create_object(policy, resource);
        let hid = self.create_handle(sid, oid);
        self.open_handle((sid, hid));
        if policy == Policy::Default {
            let po = self.repo.get_mut(oid).as_proper_mut();
            debug_assert_writer_allowed!(policy, po.is_shared(), po.open_handles);
            po.exclusive_writer = Some((sid, hid));
        }
        debug!("client {sid}: alloc {size} -> {}", self.repo.get(oid).token());
        Ok(self.mapping_of(oid))
    }

    /// Opens an object by key, possibly via a voucher. Returns `None` when
    /// the request is suspended awaiting share.
    pub fn open(
        &mut self,
        sid: SessionId,
        seqno: u64,
        key: Token,
        policy: Policy,
        wait: bool,
        now: Instant,
    ) -> Option<Result<Mapping, Status>> {
        let existing = self.session(sid).find_handle(key);
        let (oid, voucher) = match existing {
            Some(hid) => (Some(self.session(sid).handle(hid).object), None),
            None => self.find_target(key, now),
        };
        let Some(oid) = oid else {
            return Some(Err(Status::NoSuchObject));
        };
        if self.repo.get(oid).policy() != policy {
            return Some(Err(Status::NoSuchObject));
        }
        // A voucher can name an object this session already holds a handle
        // for; the handle table stays keyed by one token per object.
        let existing =
            existing.or_else(|| self.session(sid).find_handle(self.repo.get(oid).token()));

        let po = self.repo.get(oid).as_proper();
        let can_open_now = policy == Policy::Primitive || po.is_shared();

        if !can_open_now {
            // Edge case: the object was closed before sharing and lingers
            // only because a voucher (or idle handle) still references it;
            // it can never become openable. Claim the voucher anyway so it
            // does not linger.
            if !po.is_open() {
                if let Some(vid) = voucher {
                    let (_, dropped) = self.claim_voucher(vid, now);
                    if let Some(target) = dropped {
                        self.voucher_dropped(target);
                    }
                }
                return Some(Err(Status::NoSuchObject));
            }
            if !wait {
                return Some(Err(Status::ObjectBusy));
            }
        }

        let mut dropped_target = None;
        if let Some(vid) = voucher {
            let (claimed, dropped) = self.claim_voucher(vid, now);
            dropped_target = dropped;
            if !claimed {
                return Some(Err(Status::NoSuchObject));
            }
        }

        let hid = match existing {
            Some(hid) => hid,
            None => self.create_handle(sid, oid),
        };

        let result = if can_open_now {
            self.open_handle((sid, hid));
            Some(Ok(self.mapping_of(oid)))
        } else {
            let h = handle_mut(&mut self.sessions, (sid, hid));
            h.pending_share += 1;
            self.repo
                .get_mut(oid)
                .as_proper_mut()
                .awaiting_share
                .push_back(ShareWaiter {
                    session: sid,
                    handle: hid,
                    seqno,
                });
            None
        };

        // The exhausted-voucher fan-out runs only after this open's own
        // mutations, so the new open is visible to any resume check (and the
        // target cannot be destroyed out from under the new handle).
        if let Some(target) = dropped_target {
            self.voucher_dropped(target);
        }
        result
    }

    pub fn close(&mut self, sid: SessionId, key: Token) -> Result<(), Status> {
        let Some(hid) = self.session(sid).find_handle(key) else {
            return Err(Status::NoSuchObject);
        };
        if !self.session(sid).handle(hid).is_open() {
            return Err(Status::NoSuchObject);
        }
        debug!("client {sid}: close {key}");
        self.close_handle((sid, hid));
        self.reap_handle((sid, hid));
        Ok(())
    }

    pub fn share(&mut self, sid: SessionId, key: Token) -> Result<(), Status> {
        let Some(hid) = self.session(sid).find_handle(key) else {
            return Err(Status::NoSuchObject);
        };
        let oid = self.session(sid).handle(hid).object;
        if self.repo.get(oid).as_proper().exclusive_writer != Some((sid, hid)) {
            return Err(Status::NoSuchObject);
        }
        debug!("client {sid}: share {key}");
        self.repo.get_mut(oid).as_proper_mut().set_shared();
        self.resume_share_waiters(oid);
        Ok(())
    }

    /// Restores exclusive ownership, rekeying the object. Returns `None`
    /// when the request is suspended awaiting unique ownership.
    pub fn unshare(
        &mut self,
        sid: SessionId,
        seqno: u64,
        key: Token,
        wait: bool,
    ) -> Option<Result<Token, Status>> {
        let Some(hid) = self.session(sid).find_handle(key) else {
            return Some(Err(Status::NoSuchObject));
        };
        if !self.session(sid).handle(hid).is_open() {
            return Some(Err(Status::NoSuchObject));
        }
        let oid = self.session(sid).handle(hid).object;
        if !self.repo.get(oid).as_proper().is_shared() {
            return Some(Err(Status::NoSuchObject));
        }
        if self.repo.get(oid).as_proper().awaiting_unique.is_some() {
            return Some(Err(Status::ObjectReserved));
        }

        let can_unshare_now = self.handle_is_open_uniquely((sid, hid));
        if !can_unshare_now && !wait {
            return Some(Err(Status::ObjectBusy));
        }
        if can_unshare_now {
            return Some(Ok(self.do_unshare((sid, hid))));
        }

        let po = self.repo.get_mut(oid).as_proper_mut();
        debug_assert_no_unique_waiter!(po.awaiting_unique);
        po.awaiting_unique = Some((sid, hid));
        handle_mut(&mut self.sessions, (sid, hid)).pending_unique = Some(seqno);
        None
    }

    pub fn create_voucher(
        &mut self,
        sid: SessionId,
        key: Token,
        count: u32,
        now: Instant,
    ) -> Result<Token, Status> {
        if count == 0 {
            return Err(Status::InvalidRequest);
        }
        let target = match self.session(sid).find_handle(key) {
            Some(hid) => self.session(sid).handle(hid).object,
            // Resolving through a voucher names its target without claiming.
            None => self.find_target(key, now).0.ok_or(Status::NoSuchObject)?,
        };
        let expiration = now + self.voucher_ttl;
        let vid = self.repo.create_voucher(target, expiration, count);
        let token = self.repo.get(vid).token();
        debug!(
            "client {sid}: voucher {token} on {} (count {count})",
            self.repo.get(target).token()
        );
        Ok(token)
    }

    pub fn discard_voucher(
        &mut self,
        sid: SessionId,
        key: Token,
        now: Instant,
    ) -> Result<Token, Status> {
        let Some(oid) = self.repo.find(key) else {
            return Err(Status::NoSuchObject);
        };
        if self.repo.get(oid).is_proper() {
            // Idempotent no-op on proper objects: hand the key back.
            return Ok(key);
        }
        debug!("client {sid}: discard voucher {key}");
        let target_token = self.repo.get(self.repo.get(oid).as_voucher().target()).token();
        let (claimed, mut dropped) = self.claim_voucher(oid, now);
        if claimed && dropped.is_none() {
            // Discarding destroys the voucher outright, even with claims
            // remaining; only an already-invalid voucher survives to be
            // collected by the expiration pass.
            dropped = Some(self.repo.destroy_voucher(oid));
        }
        if let Some(target) = dropped {
            self.voucher_dropped(target);
        }
        if claimed {
            Ok(target_token)
        } else {
            Err(Status::NoSuchObject)
        }
    }

    // ---------------------------------------------------------------------
    // Voucher expiration
    // ---------------------------------------------------------------------

    pub fn earliest_expiration(&self) -> Option<Instant> {
        self.repo.earliest_expiration()
    }

    pub fn expire_vouchers(&mut self, now: Instant) {
        for vid in self.repo.take_expired(now) {
            debug!("voucher {} expired", self.repo.get(vid).token());
            let target = self.repo.destroy_voucher(vid);
            self.voucher_dropped(target);
        }
    }

    // ---------------------------------------------------------------------
    // Response plumbing and housekeeping
    // ---------------------------------------------------------------------

    /// Queues the batched responses for one inbound message.
    pub fn push_responses(&self, sid: SessionId, msg: ResponseMessage) {
        if let Some(sess) = self.sessions.get(&sid) {
            sess.push_response(msg);
        }
    }

    /// Table maintenance, once per inbound message, after responses are
    /// dispatched.
    pub fn housekeeping(&mut self, sid: SessionId) {
        if let Some(sess) = self.sessions.get_mut(&sid) {
            sess.housekeeping();
        }
        self.repo.housekeeping();
    }

    fn send_deferred(&self, sid: SessionId, response: Response) {
        if let Some(sess) = self.sessions.get(&sid) {
            sess.push_response(ResponseMessage {
                responses: vec![response],
            });
        }
    }

    // ---------------------------------------------------------------------
    // Internal state transitions
    // ---------------------------------------------------------------------

    fn session(&self, sid: SessionId) -> &Session {
        match self.sessions.get(&sid) {
            Some(sess) => sess,
            None => unreachable!("unknown session"),
        }
    }

    fn session_mut(&mut self, sid: SessionId) -> &mut Session {
        match self.sessions.get_mut(&sid) {
            Some(sess) => sess,
            None => unreachable!("unknown session"),
        }
    }

    fn mapping_of(&self, oid: ObjectId) -> Mapping {
        let obj = self.repo.get(oid);
        let resource = obj.as_proper().resource();
        Mapping {
            key: obj.token(),
            segment: resource.segment_id(),
            offset: resource.offset(),
            size: resource.size(),
        }
    }

    /// Resolves a key through the repository. Returns `(target, voucher)`;
    /// a valid voucher dereferences to its target and is remembered for an
    /// atomic claim later, an invalid one is treated as not found.
    fn find_target(&self, key: Token, now: Instant) -> (Option<ObjectId>, Option<ObjectId>) {
        let Some(oid) = self.repo.find(key) else {
            return (None, None);
        };
        let obj = self.repo.get(oid);
        if obj.is_proper() {
            return (Some(oid), None);
        }
        let voucher = obj.as_voucher();
        if voucher.is_valid(now) {
            (Some(voucher.target()), Some(oid))
        } else {
            (None, None)
        }
    }

    /// Claims one voucher use. Returns `(claimed, dropped_target)`; when the
    /// claim exhausts the voucher the caller must finish its own mutations
    /// and then run [`Self::voucher_dropped`] on the target.
    fn claim_voucher(&mut self, vid: ObjectId, now: Instant) -> (bool, Option<ObjectId>) {
        match self.repo.claim_voucher(vid, now) {
            Claim::Invalid => (false, None),
            Claim::Claimed => (true, None),
            Claim::ClaimedOut { target } => (true, Some(target)),
        }
    }

    fn create_handle(&mut self, sid: SessionId, oid: ObjectId) -> HandleId {
        let hid = self.next_handle_id;
        self.next_handle_id += 1;
        let token = self.repo.get(oid).token();
        self.repo.get_mut(oid).as_proper_mut().handle_refs += 1;
        let sess = self.session_mut(sid);
        sess.handles.insert(hid, Handle::new(oid));
        sess.tokens.insert(token, hid);
        hid
    }

    fn open_handle(&mut self, r: HandleRef) {
        let h = handle_mut(&mut self.sessions, r);
        h.open_count += 1;
        if h.open_count == 1 {
            self.repo.get_mut(h.object).as_proper_mut().open_handles += 1;
        }
    }

    fn handle_is_open_uniquely(&self, r: HandleRef) -> bool {
        let h = handle_of(&self.sessions, r);
        h.open_count == 1 && self.repo.get(h.object).as_proper().is_opened_by_unique_handle()
    }

    /// One close on a handle; drives the object-side fan-out when the handle
    /// transitions to fully closed.
    fn close_handle(&mut self, r: HandleRef) {
        let h = handle_mut(&mut self.sessions, r);
        debug_assert!(h.open_count > 0);
        h.open_count -= 1;
        let oid = h.object;
        if h.open_count == 0 {
            self.close_in_object(oid, r);
        } else if self.handle_is_open_uniquely(r) {
            // This handle went from two opens down to one and is now the
            // unique opener; only its own pending unshare can be waiting.
            let po = self.repo.get_mut(oid).as_proper_mut();
            if let Some(waiter) = po.awaiting_unique {
                debug_assert_eq!(waiter, r);
                po.awaiting_unique = None;
                self.resume_unique(waiter);
            }
        }
    }

    /// A handle fully closed: update the object and resume whatever that
    /// unblocks (or dooms).
    fn close_in_object(&mut self, oid: ObjectId, closer: HandleRef) {
        {
            let po = self.repo.get_mut(oid).as_proper_mut();
            debug_assert!(po.open_handles > 0);
            po.open_handles -= 1;
        }

        // Resume a pending unshare if the object is now uniquely opened.
        // Also resume (so that it can fail) if the waiter itself closed.
        let po = self.repo.get(oid).as_proper();
        let waiter = po.awaiting_unique;
        let counts_unique = po.open_handles == 1 && po.vouchers == 0;
        if let Some(w) = waiter {
            if (counts_unique && self.handle_is_open_uniquely(w)) || w == closer {
                self.repo.get_mut(oid).as_proper_mut().awaiting_unique = None;
                self.resume_unique(w);
            }
        }

        // Resume pending opens (so that they can fail) if the exclusive
        // writer closed: the awaited share can never happen.
        if self.repo.get(oid).as_proper().exclusive_writer == Some(closer) {
            let po = self.repo.get_mut(oid).as_proper_mut();
            po.exclusive_writer = None;
            debug_assert_eq!(po.open_handles, 0); // By definition of exclusive.
            self.resume_share_waiters(oid);
        }
    }

    /// Drains the object's awaiting-share FIFO, re-validating per waiter:
    /// opens and reports success if the object is shared, reports
    /// `NO_SUCH_OBJECT` otherwise.
    fn resume_share_waiters(&mut self, oid: ObjectId) {
        let mut waiters =
            std::mem::take(&mut self.repo.get_mut(oid).as_proper_mut().awaiting_share);
        for w in waiters.drain(..) {
            let h = handle_mut(&mut self.sessions, w.handle_ref());
            debug_assert!(h.pending_share > 0);
            h.pending_share -= 1;
            if self.repo.get(oid).as_proper().is_shared() {
                self.open_handle(w.handle_ref());
                let mapping = self.mapping_of(oid);
                self.send_deferred(
                    w.session,
                    Response::success(w.seqno, ResponseBody::Open { mapping }),
                );
            } else {
                self.send_deferred(w.session, Response::error(w.seqno, Status::NoSuchObject));
            }
            self.reap_handle(w.handle_ref());
        }
    }

    /// Resumes a suspended unshare, re-validating unique ownership.
    fn resume_unique(&mut self, r: HandleRef) {
        let Some(seqno) = handle_mut(&mut self.sessions, r).pending_unique.take() else {
            return;
        };
        if self.handle_is_open_uniquely(r) {
            let key = self.do_unshare(r);
            self.send_deferred(r.0, Response::success(seqno, ResponseBody::Unshare { key }));
        } else {
            self.send_deferred(r.0, Response::error(seqno, Status::NoSuchObject));
        }
        self.reap_handle(r);
    }

    fn do_unshare(&mut self, r: HandleRef) -> Token {
        let oid = handle_of(&self.sessions, r).object;
        let old_token = self.repo.get(oid).token();

        // Temporarily remove from the token index while the key changes.
        let removed = self.session_mut(r.0).tokens.remove(&old_token);
        debug_assert_eq!(removed, Some(r.1));
        self.repo.get_mut(oid).as_proper_mut().set_unshared(r);
        let new_token = self.repo.rekey_object(oid);
        self.session_mut(r.0).tokens.insert(new_token, r.1);
        debug!("client {}: unshare {old_token} -> {new_token}", r.0);
        new_token
    }

    /// Dropping a voucher can make a waiting unshare uniquely open, and can
    /// be the last reference keeping the target alive.
    fn voucher_dropped(&mut self, oid: ObjectId) {
        let po = self.repo.get(oid).as_proper();
        let waiter = po.awaiting_unique;
        let counts_unique = po.open_handles == 1 && po.vouchers == 0;
        if let Some(w) = waiter {
            if counts_unique && self.handle_is_open_uniquely(w) {
                self.repo.get_mut(oid).as_proper_mut().awaiting_unique = None;
                self.resume_unique(w);
            }
        }
        self.reap_object(oid);
    }

    /// Destroys a handle that holds no opens and no pending requests,
    /// releasing its object reference.
    fn reap_handle(&mut self, r: HandleRef) {
        let Some(sess) = self.sessions.get_mut(&r.0) else {
            return;
        };
        let Some(h) = sess.handles.get(&r.1) else {
            return;
        };
        if !h.is_idle() {
            return;
        }
        let oid = h.object;
        sess.handles.remove(&r.1);
        let token = self.repo.get(oid).token();
        let removed = sess.tokens.remove(&token);
        debug_assert_eq!(removed, Some(r.1));
        let po = self.repo.get_mut(oid).as_proper_mut();
        debug_assert!(po.handle_refs > 0);
        po.handle_refs -= 1;
        self.reap_object(oid);
    }

    /// Destroys a proper object once no handle and no voucher references it.
    fn reap_object(&mut self, oid: ObjectId) {
        let po = self.repo.get(oid).as_proper();
        if po.handle_refs == 0 && po.vouchers == 0 {
            self.repo.destroy_object(oid);
        }
    }

    // ---------------------------------------------------------------------
    // Whole-state validation (tests and debug builds)
    // ---------------------------------------------------------------------

    /// Checks every cross-structure invariant; panics on violation.
    #[cfg(debug_assertions)]
    pub fn validate(&self) {
        use crate::invariants::debug_assert_open_handles_consistent;
        use crate::object::Body;

        let mut handle_refs: HashMap<ObjectId, u32> = HashMap::new();
        let mut open_handles: HashMap<ObjectId, u32> = HashMap::new();
        for sess in self.sessions.values() {
            assert_eq!(sess.tokens.len(), sess.handles.len());
            for (hid, h) in &sess.handles {
                *handle_refs.entry(h.object).or_default() += 1;
                if h.open_count > 0 {
                    *open_handles.entry(h.object).or_default() += 1;
                }
                // The token index and handle table agree.
                let token = self.repo.get(h.object).token();
                assert_eq!(sess.tokens.get(&token), Some(hid));
                // Idle handles are destroyed eagerly.
                assert!(!h.is_idle(), "idle handle left in session table");
            }
        }

        let mut vouchers: HashMap<ObjectId, u32> = HashMap::new();
        let ids = self.repo.object_ids();
        for &oid in &ids {
            if let Body::Voucher(v) = &self.repo.get(oid).body {
                *vouchers.entry(v.target()).or_default() += 1;
            }
        }

        for &oid in &ids {
            let obj = self.repo.get(oid);
            // Token lookup round-trips.
            assert_eq!(self.repo.find(obj.token()), Some(oid));
            let Body::Proper(po) = &obj.body else {
                continue;
            };
            debug_assert_open_handles_consistent!(
                po.open_handles,
                open_handles.get(&oid).copied().unwrap_or(0)
            );
            assert_eq!(po.handle_refs, handle_refs.get(&oid).copied().unwrap_or(0));
            assert_eq!(po.vouchers, vouchers.get(&oid).copied().unwrap_or(0));

            // The exclusive writer exists iff the object is an open,
            // unshared DEFAULT object, and is one of its handles.
            let writer_expected =
                obj.policy() == Policy::Default && !po.is_shared() && po.open_handles > 0;
            assert_eq!(po.exclusive_writer.is_some(), writer_expected);
            if let Some(w) = po.exclusive_writer {
                let h = handle_of(&self.sessions, w);
                assert_eq!(h.object, oid);
                assert!(h.is_open());
            }

            // Awaiting-share entries reference live handles with matching
            // pending counts.
            let mut pending_by_handle: HashMap<HandleRef, u32> = HashMap::new();
            for w in &po.awaiting_share {
                *pending_by_handle.entry(w.handle_ref()).or_default() += 1;
            }
            for (r, count) in pending_by_handle {
                let h = handle_of(&self.sessions, r);
                assert_eq!(h.object, oid);
                assert_eq!(h.pending_share, count);
            }

            if let Some(w) = po.awaiting_unique {
                let h = handle_of(&self.sessions, w);
                assert_eq!(h.object, oid);
                assert!(h.pending_unique.is_some());
            }
        }

        self.allocator.arena().check_consistency();
    }
}
