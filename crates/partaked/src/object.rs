//! Daemon-side object descriptors.
//!
//! An object is either a proper object (a chunk of the segment plus its
//! sharing state) or a voucher (a time-limited delegated claim on a proper
//! object). Objects live in the repository under a stable [`ObjectId`];
//! tokens are looked up through the repository's key index so that rekeying
//! never invalidates a reference.
//!
//! References between objects and handles run in both directions: handles
//! reference objects by id, and objects reference handles by
//! `(session, handle)` id pairs. The id form keeps the back-references weak
//! by construction; the session's handle table controls handle lifetime and
//! removes handles from object-side lists before dropping them.

use crate::arena::Resource;
use partake_proto::Policy;
use std::collections::VecDeque;
use std::time::Instant;

/// Stable identity of an object within the repository, independent of its
/// current token. Ids are never reused within a daemon lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) u64);

pub type SessionId = u32;
pub type HandleId = u64;

/// Back-reference to a handle owned by some session's table.
pub type HandleRef = (SessionId, HandleId);

/// A suspended open waiting for the object to become shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareWaiter {
    pub session: SessionId,
    pub handle: HandleId,
    pub seqno: u64,
}

impl ShareWaiter {
    #[inline]
    pub fn handle_ref(&self) -> HandleRef {
        (self.session, self.handle)
    }
}

/// State of one shared chunk.
#[derive(Debug)]
pub struct ProperObject {
    resource: Resource,
    /// Always false for PRIMITIVE policy.
    shared: bool,
    /// Number of handles currently open on this object (not the sum of the
    /// per-handle open counts, and not counting handles waiting to open).
    pub(crate) open_handles: u32,
    pub(crate) vouchers: u32,
    /// Number of live handles referencing this object, open or not. The
    /// object is destroyed when this and `vouchers` both reach zero.
    pub(crate) handle_refs: u32,
    // The following are empty for PRIMITIVE policy. Referenced handles are
    // guaranteed live because sessions clear these before dropping handles.
    pub(crate) exclusive_writer: Option<HandleRef>,
    pub(crate) awaiting_share: VecDeque<ShareWaiter>,
    pub(crate) awaiting_unique: Option<HandleRef>,
}

impl ProperObject {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            shared: false,
            open_handles: 0,
            vouchers: 0,
            handle_refs: 0,
            exclusive_writer: None,
            awaiting_share: VecDeque::new(),
            awaiting_unique: None,
        }
    }

    #[inline]
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open_handles > 0
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// True when exactly one handle holds the object open and no voucher
    /// targets it: the precondition for restoring exclusive ownership.
    #[inline]
    pub fn is_opened_by_unique_handle(&self) -> bool {
        self.open_handles == 1 && self.vouchers == 0
    }

    pub(crate) fn set_shared(&mut self) {
        debug_assert!(!self.shared);
        debug_assert!(self.exclusive_writer.is_some());
        self.shared = true;
        self.exclusive_writer = None;
    }

    pub(crate) fn set_unshared(&mut self, new_exclusive_writer: HandleRef) {
        debug_assert!(self.shared);
        debug_assert_eq!(self.open_handles, 1);
        debug_assert!(self.exclusive_writer.is_none());
        self.shared = false;
        self.exclusive_writer = Some(new_exclusive_writer);
    }
}

impl Drop for ProperObject {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        // A destroyed object may not leave dangling back-references to
        // handles behind.
        debug_assert_eq!(self.open_handles, 0);
        debug_assert!(self.exclusive_writer.is_none());
        debug_assert!(self.awaiting_share.is_empty());
        debug_assert!(self.awaiting_unique.is_none());
    }
}

/// A reference-counted, time-limited claim on a proper object. Holding a
/// voucher keeps its target alive (`target.vouchers` is incremented for the
/// voucher's lifetime).
#[derive(Debug)]
pub struct Voucher {
    target: ObjectId,
    /// Only decremented after construction.
    remaining: u32,
    expiration: Instant,
}

impl Voucher {
    pub fn new(target: ObjectId, count: u32, expiration: Instant) -> Self {
        debug_assert!(count > 0);
        Self {
            target,
            remaining: count,
            expiration,
        }
    }

    #[inline]
    pub fn target(&self) -> ObjectId {
        self.target
    }

    #[inline]
    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    #[inline]
    pub fn is_valid(&self, now: Instant) -> bool {
        self.remaining > 0 && self.expiration >= now
    }

    /// Claims one use. Fails if the voucher is no longer valid at `now`.
    pub fn claim(&mut self, now: Instant) -> bool {
        if !self.is_valid(now) {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

#[derive(Debug)]
pub enum Body {
    Proper(ProperObject),
    Voucher(Voucher),
}

/// One repository entry: a token-named proper object or voucher.
#[derive(Debug)]
pub struct Object {
    pub(crate) token: partake_proto::Token,
    pub(crate) policy: Policy,
    pub(crate) body: Body,
}

impl Object {
    #[inline]
    pub fn token(&self) -> partake_proto::Token {
        self.token
    }

    #[inline]
    pub fn policy(&self) -> Policy {
        self.policy
    }

    #[inline]
    pub fn is_proper(&self) -> bool {
        matches!(self.body, Body::Proper(_))
    }

    pub fn as_proper(&self) -> &ProperObject {
        match &self.body {
            Body::Proper(po) => po,
            Body::Voucher(_) => unreachable!("voucher used as proper object"),
        }
    }

    pub fn as_proper_mut(&mut self) -> &mut ProperObject {
        match &mut self.body {
            Body::Proper(po) => po,
            Body::Voucher(_) => unreachable!("voucher used as proper object"),
        }
    }

    pub fn as_voucher(&self) -> &Voucher {
        match &self.body {
            Body::Voucher(v) => v,
            Body::Proper(_) => unreachable!("proper object used as voucher"),
        }
    }

    pub fn as_voucher_mut(&mut self) -> &mut Voucher {
        match &mut self.body {
            Body::Voucher(v) => v,
            Body::Proper(_) => unreachable!("proper object used as voucher"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn voucher_validity_and_claims() {
        let now = Instant::now();
        let mut v = Voucher::new(ObjectId(1), 2, now + Duration::from_secs(10));
        assert!(v.is_valid(now));
        assert!(v.claim(now));
        assert!(v.is_valid(now));
        assert!(v.claim(now));
        assert!(!v.is_valid(now));
        assert!(!v.claim(now));
    }

    #[test]
    fn voucher_expires_by_time() {
        let now = Instant::now();
        let mut v = Voucher::new(ObjectId(1), 5, now + Duration::from_secs(10));
        // Valid exactly at the expiration instant, invalid after.
        assert!(v.is_valid(now + Duration::from_secs(10)));
        assert!(!v.is_valid(now + Duration::from_secs(11)));
        assert!(!v.claim(now + Duration::from_secs(11)));
    }
}
