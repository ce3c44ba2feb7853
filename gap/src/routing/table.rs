use gap_common::{
    crypto::{Hash, PeerId},
    time::TimestampMillis,
};
use rand::Rng;
use tokio::sync::Mutex;

use crate::{
    config::{TIE_BREAKER_CHANCE, TTL_DECREMENT},
    packet::BlockType,
};

/// One in-flight query: what we are waiting for, who wants the answer,
/// and how long we keep looking. An array of these is most of the
/// router's memory, keep it small.
pub struct IteSlot {
    /// Occupancy generation, bumped whenever the key changes. I/O
    /// paths snapshot it, work unlocked, and re-validate on return.
    pub epoch: u64,
    pub primary_key: Hash,
    pub block_type: BlockType,
    /// Trust-adjusted worth of an answer, never the raw wire priority.
    pub priority: u32,
    /// Absolute time after which we can forget this entry.
    pub deadline: TimestampMillis,
    /// Peers waiting for an answer to this query.
    pub waiters: Vec<PeerId>,
    /// Fingerprints of the replies already relayed on this slot.
    pub seen: Vec<Hash>,
    /// Only meaningful while `seen.len() == 1`.
    pub seen_was_unique: bool,
    /// A locally found answer sits in the delay loop; do not look the
    /// content up again before it has been delivered.
    pub local_lookup_inflight: bool,
}

impl Default for IteSlot {
    fn default() -> Self {
        Self {
            epoch: 0,
            primary_key: Hash::zero(),
            block_type: BlockType::ANY,
            priority: 0,
            deadline: 0,
            waiters: Vec::new(),
            seen: Vec::new(),
            seen_was_unique: false,
            local_lookup_inflight: false,
        }
    }
}

/// What the slot state machine decided for an incoming query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// Replies for this key will be routed back (sender was recorded).
    pub routed: bool,
    /// The query should also be forwarded to other peers.
    pub forward: bool,
    /// Pending outbound record for this key should be cancelled: the
    /// slot was re-purposed away from it.
    pub displaced_key: Option<Hash>,
    /// Which of the numbered decision paths fired, for trace logs.
    pub case: u8,
}

impl RouteDecision {
    fn new(routed: bool, forward: bool, displaced_key: Option<Hash>, case: u8) -> Self {
        Self {
            routed,
            forward,
            displaced_key,
            case,
        }
    }
}

enum SlotMode {
    Replace,
    Grow,
}

/// Add `sender` to the slot, replacing or extending the current entry.
/// `Err(())` when the sender already waits on this exact query.
/// On success returns the key of a displaced, unrelated query (whose
/// pending record must be cancelled by the caller, outside this lock).
fn add_to_slot(
    mode: SlotMode,
    slot: &mut IteSlot,
    key: &Hash,
    block_type: BlockType,
    ttl: i64,
    priority: u32,
    sender: &PeerId,
    now: TimestampMillis,
) -> Result<Option<Hash>, ()> {
    let new_deadline = (now as i64 + ttl).max(0) as TimestampMillis;
    let mut displaced = None;

    match mode {
        SlotMode::Replace => {
            slot.seen.clear();
            slot.seen_was_unique = false;
            if slot.primary_key == *key {
                slot.deadline = new_deadline;
                slot.priority = slot.priority.saturating_add(priority);
                if slot.waiters.contains(sender) {
                    return Err(());
                }
            } else {
                // different request: flush its pending queue and start over
                slot.local_lookup_inflight = false;
                displaced = Some(std::mem::replace(&mut slot.primary_key, key.clone()));
                slot.waiters.clear();
                slot.deadline = new_deadline;
                slot.priority = priority;
                slot.epoch += 1;
            }
            slot.block_type = block_type;
        }
        SlotMode::Grow => {
            debug_assert_eq!(slot.primary_key, *key);
            if slot.waiters.contains(sender) {
                return Err(());
            }
            if slot.deadline < new_deadline {
                slot.deadline = new_deadline;
            }
            slot.priority = slot.priority.saturating_add(priority);
        }
    }
    slot.waiters.push(sender.clone());
    // new listener: flush the seen list so it is not starved of
    // replies its co-waiters already received
    slot.seen.clear();
    slot.seen_was_unique = false;
    Ok(displaced)
}

/// Decide whether an incoming query claims this slot, piggybacks on it,
/// or is dropped. The decision paths are numbered for trace logs; the
/// comments state what each path means.
///
/// Called with the slot lock held; does not block.
#[allow(clippy::too_many_arguments)]
pub fn decide_route<R: Rng>(
    slot: &mut IteSlot,
    key: &Hash,
    block_type: BlockType,
    ttl: i64,
    priority: u32,
    sender: &PeerId,
    now: TimestampMillis,
    network_size: u32,
    rng: &mut R,
) -> RouteDecision {
    let now_i = now as i64;
    let deadline = slot.deadline as i64;
    let ttl_dec = TTL_DECREMENT as i64;

    // slot long dead and the new query is not hopeless itself: take it
    if deadline < now_i - 10 * ttl_dec && ttl > -5 * ttl_dec {
        let displaced = add_to_slot(SlotMode::Replace, slot, key, block_type, ttl, priority, sender, now)
            .unwrap_or(None);
        return RouteDecision::new(true, true, displaced, 21);
    }

    // expired retransmit of the exact query we hold: route replies to
    // the sender too, but do not ask again (the seen list would block
    // any reply a fresh lookup could produce anyway)
    if ttl < 0 && slot.primary_key == *key {
        let _ = add_to_slot(SlotMode::Grow, slot, key, block_type, ttl, priority, sender, now);
        return RouteDecision::new(false, false, None, 0);
    }

    // slot expired and the newcomer outlives it by more than the time
    // a query needs to cross the network: the occupant lost its claim
    if deadline + ttl_dec * (network_size as i64) < now_i + ttl && deadline < now_i {
        slot.seen.clear();
        slot.seen_was_unique = false;
        if slot.primary_key == *key && slot.local_lookup_inflight {
            let _ = add_to_slot(SlotMode::Grow, slot, key, block_type, ttl, priority, sender, now);
            return RouteDecision::new(false, false, None, 1);
        }
        let displaced = add_to_slot(SlotMode::Replace, slot, key, block_type, ttl, priority, sender, now)
            .unwrap_or(None);
        return RouteDecision::new(true, true, displaced, 2);
    }

    if slot.primary_key == *key {
        if slot.seen.is_empty() {
            if deadline + ttl_dec < now_i + ttl {
                // significantly longer ttl: re-ask with a fresh record
                let _ = add_to_slot(SlotMode::Replace, slot, key, block_type, ttl, priority, sender, now);
                return if slot.local_lookup_inflight {
                    RouteDecision::new(false, false, None, 3)
                } else {
                    RouteDecision::new(true, true, None, 4)
                };
            }
            // new ttl is lower, just wait for the reply that may come
            return match add_to_slot(SlotMode::Grow, slot, key, block_type, ttl, priority, sender, now) {
                Ok(_) => {
                    if slot.local_lookup_inflight {
                        RouteDecision::new(false, false, None, 5)
                    } else {
                        RouteDecision::new(true, false, None, 6)
                    }
                }
                // same query with higher ttl already processed for
                // this very sender, do not even look up again
                Err(()) => RouteDecision::new(false, false, None, 7),
            };
        }

        if slot.seen_was_unique {
            // the unique answer came and went; a longer-lived repeat
            // makes the slot as good as empty
            if deadline < now_i + ttl {
                let significantly_longer = deadline + ttl_dec < now_i + ttl;
                let _ = add_to_slot(SlotMode::Replace, slot, key, block_type, ttl, priority, sender, now);
                return if slot.local_lookup_inflight {
                    RouteDecision::new(false, false, None, 8)
                } else {
                    RouteDecision::new(true, significantly_longer, None, 9)
                };
            }
            return match add_to_slot(SlotMode::Grow, slot, key, block_type, ttl, priority, sender, now) {
                Ok(_) => {
                    if slot.local_lookup_inflight {
                        RouteDecision::new(false, false, None, 10)
                    } else {
                        RouteDecision::new(true, false, None, 11)
                    }
                }
                Err(()) => RouteDecision::new(false, false, None, 12),
            };
        }

        // pending query of a multiple-reply type: never re-send, just
        // forward the answers that arrive from now on to the newcomer
        let existing_ttl_higher = deadline >= now_i + ttl;
        return match add_to_slot(SlotMode::Grow, slot, key, block_type, ttl, priority, sender, now) {
            Ok(_) => RouteDecision::new(true, false, None, 13),
            Err(()) => RouteDecision::new(existing_ttl_higher, false, None, 14),
        };
    }

    // different key, but the occupant already saw its unique answer:
    // the request is fully satisfied, throw it out early
    if deadline + ttl_dec < now_i + ttl && deadline < now_i && slot.seen_was_unique {
        let displaced = add_to_slot(SlotMode::Replace, slot, key, block_type, ttl, priority, sender, now)
            .unwrap_or(None);
        return RouteDecision::new(true, true, displaced, 15);
    }

    // an expired newcomer cannot evict a still valid query
    if ttl < 0 {
        return RouteDecision::new(false, false, None, 16);
    }

    // cross-multiplication: a short ttl with high priority beats a long
    // ttl with low priority, with a magic resilience factor of 10 so
    // the table does not thrash (A replacing B replacing A so fast
    // that no response to either ever makes it through)
    if (deadline - now_i) as i128 * priority as i128 > 10 * (ttl as i128 * slot.priority as i128) {
        let displaced = add_to_slot(SlotMode::Replace, slot, key, block_type, ttl, priority, sender, now)
            .unwrap_or(None);
        return RouteDecision::new(true, true, displaced, 17);
    }

    // two peers can block each other's slot exactly until the other
    // frees it; a biased coin breaks the deadlock
    if rng.gen_range(0..TIE_BREAKER_CHANCE) == 0 {
        let displaced = add_to_slot(SlotMode::Replace, slot, key, block_type, ttl, priority, sender, now)
            .unwrap_or(None);
        return RouteDecision::new(true, true, displaced, 20);
    }

    // the slot is busy with something more valuable
    RouteDecision::new(false, false, None, 18)
}

/// The routing table: a fixed, power-of-two sized array of slots with
/// no collision chaining. The index mix-in constant is drawn once per
/// process so two peers do not collide on the same keys.
pub struct IndirectionTable {
    slots: Vec<Mutex<IteSlot>>,
    mask: usize,
    random_qsel: u32,
}

impl IndirectionTable {
    pub fn new(size: usize, random_qsel: u32) -> Self {
        assert!(size.is_power_of_two());
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || Mutex::new(IteSlot::default()));
        Self {
            slots,
            mask: size - 1,
            random_qsel,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn routing_index(&self, key: &Hash) -> usize {
        (key.word(0).wrapping_add(key.word(1).wrapping_mul(self.random_qsel))) as usize & self.mask
    }

    pub fn slot(&self, index: usize) -> &Mutex<IteSlot> {
        &self.slots[index]
    }

    pub fn slot_for(&self, key: &Hash) -> &Mutex<IteSlot> {
        self.slot(self.routing_index(key))
    }

    /// Mean trust-adjusted priority over slots that still wait for
    /// their first reply. Hosts use it to price their own queries.
    pub async fn avg_priority(&self) -> u32 {
        let mut total: u64 = 0;
        let mut active: u64 = 0;
        for slot in &self.slots {
            let slot = slot.lock().await;
            if !slot.waiters.is_empty() && slot.seen.is_empty() {
                total += slot.priority as u64;
                active += 1;
            }
        }
        if active == 0 {
            0
        } else {
            (total / active) as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gap_common::crypto::hash;
    use rand::{rngs::StdRng, SeedableRng};

    const NET_SIZE: u32 = 4;

    fn peer(tag: &[u8]) -> PeerId {
        PeerId::new(hash(tag))
    }

    fn decide(
        slot: &mut IteSlot,
        key: &Hash,
        ttl: i64,
        priority: u32,
        sender: &PeerId,
        now: TimestampMillis,
        seed: u64,
    ) -> RouteDecision {
        let mut rng = StdRng::seed_from_u64(seed);
        decide_route(slot, key, BlockType::ANY, ttl, priority, sender, now, NET_SIZE, &mut rng)
    }

    fn occupied(key: &Hash, deadline: TimestampMillis, priority: u32, waiter: &PeerId) -> IteSlot {
        let mut slot = IteSlot::default();
        slot.primary_key = key.clone();
        slot.deadline = deadline;
        slot.priority = priority;
        slot.waiters.push(waiter.clone());
        slot
    }

    #[test]
    fn test_stale_slot_is_replaced() {
        let now: TimestampMillis = 200_000;
        let key_a = hash(b"a");
        let key_b = hash(b"b");
        let mut slot = occupied(&key_a, now - 60_000, 10, &peer(b"old"));
        slot.seen.push(hash(b"fp"));

        let decision = decide(&mut slot, &key_b, 5000, 3, &peer(b"m"), now, 1);
        assert_eq!(decision.case, 21);
        assert!(decision.routed && decision.forward);
        assert_eq!(decision.displaced_key, Some(key_a));
        assert_eq!(slot.primary_key, key_b);
        assert_eq!(slot.waiters, vec![peer(b"m")]);
        assert!(slot.seen.is_empty());
        assert_eq!(slot.epoch, 1);
    }

    #[test]
    fn test_expired_retransmit_piggybacks() {
        let now: TimestampMillis = 200_000;
        let key = hash(b"a");
        let mut slot = occupied(&key, now + 5_000, 10, &peer(b"n1"));

        let decision = decide(&mut slot, &key, -1000, 2, &peer(b"n2"), now, 1);
        assert_eq!(decision.case, 0);
        assert!(!decision.routed && !decision.forward);
        assert_eq!(slot.waiters.len(), 2);
        assert_eq!(slot.epoch, 0);
    }

    #[test]
    fn test_same_key_longer_ttl_reasks() {
        let now: TimestampMillis = 200_000;
        let key = hash(b"a");
        let mut slot = occupied(&key, now + 1_000, 10, &peer(b"n1"));

        let decision = decide(&mut slot, &key, 20_000, 2, &peer(b"n2"), now, 1);
        assert_eq!(decision.case, 4);
        assert!(decision.routed && decision.forward);
        assert_eq!(slot.deadline, now + 20_000);
    }

    #[test]
    fn test_same_key_shorter_ttl_grows() {
        let now: TimestampMillis = 200_000;
        let key = hash(b"a");
        let mut slot = occupied(&key, now + 30_000, 10, &peer(b"n1"));

        let decision = decide(&mut slot, &key, 10_000, 2, &peer(b"n2"), now, 1);
        assert_eq!(decision.case, 6);
        assert!(decision.routed && !decision.forward);
        assert_eq!(slot.waiters.len(), 2);
        // growing never shortens the deadline
        assert_eq!(slot.deadline, now + 30_000);
        assert_eq!(slot.priority, 12);
    }

    #[test]
    fn test_duplicate_sender_collapses() {
        let now: TimestampMillis = 200_000;
        let key = hash(b"a");
        let sender = peer(b"n1");
        let mut slot = occupied(&key, now + 30_000, 10, &sender);

        let decision = decide(&mut slot, &key, 10_000, 2, &sender, now, 1);
        assert_eq!(decision.case, 7);
        assert!(!decision.routed && !decision.forward);
        assert_eq!(slot.waiters.len(), 1);
    }

    #[test]
    fn test_inflight_lookup_suppresses_reroute() {
        let now: TimestampMillis = 200_000;
        let key = hash(b"a");
        let mut slot = occupied(&key, now + 1_000, 10, &peer(b"n1"));
        slot.local_lookup_inflight = true;

        let decision = decide(&mut slot, &key, 20_000, 2, &peer(b"n2"), now, 1);
        assert_eq!(decision.case, 3);
        assert!(!decision.routed && !decision.forward);
    }

    #[test]
    fn test_unique_reply_makes_slot_replaceable() {
        let now: TimestampMillis = 200_000;
        let key = hash(b"a");
        let mut slot = occupied(&key, now + 1_000, 10, &peer(b"n1"));
        slot.seen.push(hash(b"fp"));
        slot.seen_was_unique = true;

        // significantly longer ttl: replace and forward again
        let decision = decide(&mut slot, &key, 20_000, 2, &peer(b"n2"), now, 1);
        assert_eq!(decision.case, 9);
        assert!(decision.routed && decision.forward);
        assert!(slot.seen.is_empty());

        // barely longer ttl: replace but do not re-send
        let mut slot = occupied(&key, now + 1_000, 10, &peer(b"n1"));
        slot.seen.push(hash(b"fp"));
        slot.seen_was_unique = true;
        let decision = decide(&mut slot, &key, 2_000, 2, &peer(b"n2"), now, 1);
        assert_eq!(decision.case, 9);
        assert!(decision.routed && !decision.forward);
    }

    #[test]
    fn test_multi_reply_grows_without_resend() {
        let now: TimestampMillis = 200_000;
        let key = hash(b"a");
        let mut slot = occupied(&key, now + 30_000, 10, &peer(b"n1"));
        slot.seen.push(hash(b"fp1"));
        slot.seen.push(hash(b"fp2"));

        let decision = decide(&mut slot, &key, 10_000, 2, &peer(b"n2"), now, 1);
        assert_eq!(decision.case, 13);
        assert!(decision.routed && !decision.forward);
        // the newcomer must see future replies even if others already
        // got some
        assert!(slot.seen.is_empty());
    }

    #[test]
    fn test_priority_cross_multiplication_wins_slot() {
        let now: TimestampMillis = 200_000;
        let key_a = hash(b"a");
        let key_b = hash(b"b");
        // low-value occupant with a short remaining life
        let mut slot = occupied(&key_a, now + 1_000, 1, &peer(b"n1"));

        let decision = decide(&mut slot, &key_b, 2_000, 10_000, &peer(b"n2"), now, 1);
        assert_eq!(decision.case, 17);
        assert!(decision.routed && decision.forward);
        assert_eq!(decision.displaced_key, Some(key_a));
    }

    #[test]
    fn test_tie_breaker_observes_both_outcomes() {
        let now: TimestampMillis = 200_000;
        let key_a = hash(b"a");
        let key_b = hash(b"b");

        let mut replaced = false;
        let mut dropped = false;
        for seed in 0..64 {
            // evenly matched: deadline*prio == 10*ttl*prio fails the
            // strict comparison, leaving it to the biased coin
            let mut slot = occupied(&key_a, now + 10_000, 10, &peer(b"n1"));
            let decision = decide(&mut slot, &key_b, 10_000, 10, &peer(b"n2"), now, seed);
            match decision.case {
                20 => replaced = true,
                18 => dropped = true,
                case => panic!("unexpected case {}", case),
            }
        }
        assert!(replaced && dropped);
    }

    #[test]
    fn test_expired_newcomer_cannot_evict() {
        let now: TimestampMillis = 200_000;
        let mut slot = occupied(&hash(b"a"), now + 10_000, 10, &peer(b"n1"));

        let decision = decide(&mut slot, &hash(b"b"), -100, 10, &peer(b"n2"), now, 1);
        assert_eq!(decision.case, 16);
        assert!(!decision.routed && !decision.forward);
    }

    #[test]
    fn test_routing_index_is_stable_and_masked() {
        let table = IndirectionTable::new(1024, 0xBEEF);
        let key = hash(b"key");
        let index = table.routing_index(&key);
        assert!(index < table.len());
        assert_eq!(index, table.routing_index(&key));

        // a different mix-in constant shuffles collisions
        let other = IndirectionTable::new(1024, 0xCAFE);
        let _ = other.routing_index(&key);
    }

    #[tokio::test]
    async fn test_avg_priority_counts_only_unanswered() {
        let table = IndirectionTable::new(1024, 7);
        {
            let mut slot = table.slot(0).lock().await;
            slot.waiters.push(peer(b"n1"));
            slot.priority = 10;
        }
        {
            let mut slot = table.slot(1).lock().await;
            slot.waiters.push(peer(b"n2"));
            slot.priority = 20;
        }
        {
            // answered slots do not count
            let mut slot = table.slot(2).lock().await;
            slot.waiters.push(peer(b"n3"));
            slot.priority = 1000;
            slot.seen.push(hash(b"fp"));
        }
        assert_eq!(table.avg_priority().await, 15);
    }
}
