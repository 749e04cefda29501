//! Process-wide object registry.
//!
//! The repository owns every object (proper objects and vouchers) in a slab
//! keyed by [`ObjectId`], with a token index for wire-level lookups. Entries
//! do not keep themselves alive: proper objects are destroyed exactly when
//! the reference counts maintained by the broker (`handle_refs`,
//! `vouchers`) both reach zero, and vouchers when they are claimed out,
//! discarded, expired, or drained at shutdown.

use crate::arena::Resource;
use crate::object::{Body, Object, ObjectId, ProperObject, Voucher};
use crate::voucher_queue::{TimerHandle, VoucherQueue};
use log::debug;
use partake_proto::{KeySequence, Policy, Token};
use std::collections::HashMap;
use std::time::Instant;

/// Result of claiming a voucher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The voucher was no longer valid; nothing changed.
    Invalid,
    /// Claimed; the voucher remains valid.
    Claimed,
    /// Claimed, and the claim exhausted the voucher: it has been destroyed
    /// and the caller must run the dropped-voucher fan-out on the target.
    ClaimedOut { target: ObjectId },
}

pub struct Repository {
    objects: HashMap<ObjectId, Object>,
    tokens: HashMap<Token, ObjectId>,
    keys: KeySequence,
    next_id: u64,
    queue: VoucherQueue,
    timer: TimerHandle,
}

impl Repository {
    pub fn new(keys: KeySequence, timer: TimerHandle) -> Self {
        Self {
            objects: HashMap::new(),
            tokens: HashMap::new(),
            keys,
            next_id: 0,
            queue: VoucherQueue::new(),
            timer,
        }
    }

    fn fresh_id(&mut self) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: ObjectId) -> &Object {
        match self.objects.get(&id) {
            Some(obj) => obj,
            None => unreachable!("stale object reference"),
        }
    }

    pub fn get_mut(&mut self, id: ObjectId) -> &mut Object {
        match self.objects.get_mut(&id) {
            Some(obj) => obj,
            None => unreachable!("stale object reference"),
        }
    }

    /// Token lookup. May resolve to a voucher.
    pub fn find(&self, token: Token) -> Option<ObjectId> {
        self.tokens.get(&token).copied()
    }

    pub fn create_object(&mut self, policy: Policy, resource: Resource) -> ObjectId {
        let token = self.keys.generate();
        let id = self.fresh_id();
        self.objects.insert(
            id,
            Object {
                token,
                policy,
                body: Body::Proper(ProperObject::new(resource)),
            },
        );
        self.tokens.insert(token, id);
        id
    }

    /// Replaces a proper object's token with a fresh one; the old token
    /// becomes unresolvable. The caller updates any session-side token
    /// indexes.
    pub fn rekey_object(&mut self, id: ObjectId) -> Token {
        let token = self.keys.generate();
        let obj = match self.objects.get_mut(&id) {
            Some(obj) => obj,
            None => unreachable!("stale object reference"),
        };
        debug_assert!(obj.is_proper());
        let old = std::mem::replace(&mut obj.token, token);
        self.tokens.remove(&old);
        self.tokens.insert(token, id);
        debug!("object {old} rekeyed to {token}");
        token
    }

    /// Creates a voucher pinning `target` and enqueues its expiration.
    pub fn create_voucher(
        &mut self,
        target: ObjectId,
        expiration: Instant,
        count: u32,
    ) -> ObjectId {
        debug_assert!(count > 0);
        let token = self.keys.generate();
        let id = self.fresh_id();
        let policy = {
            let target_obj = self.get_mut(target);
            target_obj.as_proper_mut().vouchers += 1;
            target_obj.policy()
        };
        self.objects.insert(
            id,
            Object {
                token,
                policy,
                body: Body::Voucher(Voucher::new(target, count, expiration)),
            },
        );
        self.tokens.insert(token, id);
        self.queue.enqueue(id, expiration);
        self.timer.request_wake(expiration);
        id
    }

    /// Claims one use of a voucher. On [`Claim::ClaimedOut`] the voucher is
    /// gone and the caller owes the target a dropped-voucher fan-out.
    pub fn claim_voucher(&mut self, id: ObjectId, now: Instant) -> Claim {
        let voucher = self.get_mut(id).as_voucher_mut();
        if !voucher.claim(now) {
            return Claim::Invalid;
        }
        if voucher.is_valid(now) {
            Claim::Claimed
        } else {
            let target = self.destroy_voucher(id);
            Claim::ClaimedOut { target }
        }
    }

    /// Removes a voucher, decrementing the target's voucher count. Returns
    /// the target; the caller runs the dropped-voucher fan-out.
    pub fn destroy_voucher(&mut self, id: ObjectId) -> ObjectId {
        let obj = match self.objects.remove(&id) {
            Some(obj) => obj,
            None => unreachable!("stale voucher reference"),
        };
        self.tokens.remove(&obj.token());
        let target = obj.as_voucher().target();
        let po = self.get_mut(target).as_proper_mut();
        debug_assert!(po.vouchers > 0);
        po.vouchers -= 1;
        debug!("voucher {} dropped", obj.token());
        target
    }

    /// Destroys a proper object once nothing references it, releasing its
    /// chunk back to the arena.
    pub fn destroy_object(&mut self, id: ObjectId) {
        let obj = match self.objects.remove(&id) {
            Some(obj) => obj,
            None => unreachable!("stale object reference"),
        };
        self.tokens.remove(&obj.token());
        debug!("object {} destroyed", obj.token());
        // Dropping `obj` drops its Resource, returning the chunk.
    }

    /// All vouchers expiring at or before `now`, removed from the queue.
    /// Stale entries for already-dropped vouchers are skipped.
    pub fn take_expired(&mut self, now: Instant) -> Vec<ObjectId> {
        self.queue
            .pop_expired(now)
            .into_iter()
            .filter(|id| self.objects.contains_key(id))
            .collect()
    }

    /// All still-live queued vouchers; used by the shutdown drain.
    pub fn take_all_queued(&mut self) -> Vec<ObjectId> {
        self.queue
            .drain()
            .into_iter()
            .filter(|id| self.objects.contains_key(id))
            .collect()
    }

    /// Earliest queued expiration (possibly stale; a stale wake-up is
    /// harmless).
    pub fn earliest_expiration(&self) -> Option<Instant> {
        self.queue.earliest()
    }

    /// Table maintenance, invoked once per request message after responses
    /// are dispatched. Growth is the hash map's own; this implements the
    /// shrink side, releasing capacity when occupancy falls below 1/8.
    pub fn housekeeping(&mut self) {
        maybe_shrink(&mut self.objects);
        maybe_shrink(&mut self.tokens);
    }

    #[cfg(any(test, debug_assertions))]
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }
}

/// Shrinks a map whose occupancy has dropped below 1/8 of capacity, keeping
/// a floor of 8 entries' worth.
pub(crate) fn maybe_shrink<K, V>(map: &mut HashMap<K, V>)
where
    K: std::hash::Hash + Eq,
{
    if map.capacity() > 8 && map.len() < map.capacity() / 8 {
        map.shrink_to(map.len().max(4) * 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ShmemAllocator;
    use std::time::Duration;

    fn resource(alloc: &ShmemAllocator) -> Resource {
        alloc.allocate(64).unwrap()
    }

    #[test]
    fn create_find_rekey() {
        let alloc = ShmemAllocator::new(1 << 16, 9);
        let mut repo = Repository::new(KeySequence::new(), TimerHandle::new());

        let id = repo.create_object(Policy::Default, resource(&alloc));
        let token = repo.get(id).token();
        assert!(token.is_valid());
        assert_eq!(repo.find(token), Some(id));

        let new_token = repo.rekey_object(id);
        assert_ne!(new_token, token);
        // Key lookup is injective: the old token is unresolvable.
        assert_eq!(repo.find(token), None);
        assert_eq!(repo.find(new_token), Some(id));
        assert_eq!(repo.get(id).token(), new_token);
    }

    #[test]
    fn tokens_are_unique_across_objects() {
        let alloc = ShmemAllocator::new(1 << 16, 9);
        let mut repo = Repository::new(KeySequence::new(), TimerHandle::new());
        let a = repo.create_object(Policy::Default, resource(&alloc));
        let b = repo.create_object(Policy::Primitive, resource(&alloc));
        assert_ne!(repo.get(a).token(), repo.get(b).token());
    }

    #[test]
    fn voucher_claim_to_exhaustion() {
        let alloc = ShmemAllocator::new(1 << 16, 9);
        let mut repo = Repository::new(KeySequence::new(), TimerHandle::new());
        let target = repo.create_object(Policy::Default, resource(&alloc));
        // Keep the target alive through the voucher drop.
        repo.get_mut(target).as_proper_mut().handle_refs = 1;

        let now = Instant::now();
        let vid = repo.create_voucher(target, now + Duration::from_secs(100), 1);
        assert_eq!(repo.get(target).as_proper().vouchers, 1);
        let vtoken = repo.get(vid).token();
        assert_eq!(repo.find(vtoken), Some(vid));

        assert_eq!(repo.claim_voucher(vid, now), Claim::ClaimedOut { target });
        assert_eq!(repo.find(vtoken), None);
        assert_eq!(repo.get(target).as_proper().vouchers, 0);
    }

    #[test]
    fn voucher_claim_while_still_valid() {
        let alloc = ShmemAllocator::new(1 << 16, 9);
        let mut repo = Repository::new(KeySequence::new(), TimerHandle::new());
        let target = repo.create_object(Policy::Default, resource(&alloc));
        repo.get_mut(target).as_proper_mut().handle_refs = 1;

        let now = Instant::now();
        let vid = repo.create_voucher(target, now + Duration::from_secs(100), 2);
        assert_eq!(repo.claim_voucher(vid, now), Claim::Claimed);
        assert_eq!(repo.claim_voucher(vid, now), Claim::ClaimedOut { target });
    }

    #[test]
    fn expired_voucher_claim_is_invalid() {
        let alloc = ShmemAllocator::new(1 << 16, 9);
        let mut repo = Repository::new(KeySequence::new(), TimerHandle::new());
        let target = repo.create_object(Policy::Default, resource(&alloc));
        repo.get_mut(target).as_proper_mut().handle_refs = 1;

        let now = Instant::now();
        let vid = repo.create_voucher(target, now + Duration::from_secs(1), 1);
        assert_eq!(
            repo.claim_voucher(vid, now + Duration::from_secs(2)),
            Claim::Invalid
        );
        // Still present until the expiration pass removes it.
        let expired = repo.take_expired(now + Duration::from_secs(2));
        assert_eq!(expired, vec![vid]);
    }

    #[test]
    fn take_expired_skips_dropped_vouchers() {
        let alloc = ShmemAllocator::new(1 << 16, 9);
        let mut repo = Repository::new(KeySequence::new(), TimerHandle::new());
        let target = repo.create_object(Policy::Default, resource(&alloc));
        repo.get_mut(target).as_proper_mut().handle_refs = 1;

        let now = Instant::now();
        let vid = repo.create_voucher(target, now + Duration::from_secs(1), 1);
        assert_eq!(repo.claim_voucher(vid, now), Claim::ClaimedOut { target });
        // The heap entry is stale; the expiration pass must skip it.
        assert!(repo.take_expired(now + Duration::from_secs(2)).is_empty());
    }
}
