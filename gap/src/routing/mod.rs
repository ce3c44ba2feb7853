//! The routing engine: ties the indirection table, the pending-query
//! ring, the reply-path tracker and the reward ledger together.
//!
//! Lock order: the core lock (pending ring + trackers) and the slot
//! locks are never held at the same time, and no blockstore or
//! transport call happens under either. Slot identity is re-validated
//! by primary key after every unlocked stretch.

mod pending;
mod policy;
mod reply_track;
mod reward;
mod table;

pub use pending::{bitmap_index, Installed, PendingQueries, QueryRecord};
pub use policy::{evaluate_query, QueryPolicy};
pub use reply_track::ReplyPathTracker;
pub use reward::RewardLedger;
pub use table::{decide_route, IndirectionTable, IteSlot, RouteDecision};

use bytes::Bytes;
use metrics::counter;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::{sync::Mutex, task::JoinHandle};

use gap_common::{
    crypto::{Hash, PeerId},
    serializer::Serializer,
    time::{get_current_time_in_millis, TimestampMillis},
};

use crate::{
    config::{
        GapConfig, BASE_QUERY_PRIORITY, BASE_REPLY_PRIORITY, BITMAP_BITS,
        CONTENT_BANDWIDTH_VALUE, ENTRY_SELECTION_COUNT, MAX_BUFFER_SIZE,
        QUERY_BANDWIDTH_VALUE, REPLY_TRACK_AGE_INTERVAL, TTL_DECREMENT,
    },
    env::{GapEnvironment, IterFlow},
    error::{GapError, GetStatus},
    packet::{
        BlockType, Packet, QueryPacket, ReplyPacket, MAX_QUERY_KEYS, REPLY_BASE_SIZE,
    },
};

// Everything behind the core lock. The components are plain structs so
// they stay unit-testable without any locking.
struct CoreState {
    pending: PendingQueries,
    reply_tracks: ReplyPathTracker,
    rewards: RewardLedger,
}

struct GapInner {
    env: GapEnvironment,
    table: IndirectionTable,
    state: Mutex<CoreState>,
    // leaf lock, taken only for a draw and never across an await
    rng: StdMutex<StdRng>,
}

/// The anonymous query routing core. One per process; the handle is
/// cheap to clone and entry points are invoked concurrently by the
/// host's network and timer tasks.
#[derive(Clone)]
pub struct GapCore {
    inner: Arc<GapInner>,
}

/// Bound a positive TTL by the query's worth so cheap queries cannot
/// ask to be remembered forever.
fn adjust_ttl(ttl: i64, priority: u32) -> i64 {
    let bound = (priority as i64 + 3) * TTL_DECREMENT as i64;
    if ttl > 0 && ttl > bound {
        bound
    } else {
        ttl
    }
}

/// How many local results we return per query: one per 10% of free
/// download capacity, at least one.
fn reply_pick_rate(load: Option<u8>) -> usize {
    let load = load.map(|value| value.min(100)).unwrap_or(50) as usize;
    (10 - load / 10).max(1)
}

impl GapCore {
    pub fn new(config: GapConfig, env: GapEnvironment) -> Self {
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        // randomizes slot collisions so peers disagree on which keys
        // collide
        let random_qsel = rng.gen_range(0..0xFFFF);
        let table_size = config.effective_table_size();
        info!(
            "routing core starting with {} indirection slots",
            table_size
        );

        Self {
            inner: Arc::new(GapInner {
                env,
                table: IndirectionTable::new(table_size, random_qsel),
                state: Mutex::new(CoreState {
                    pending: PendingQueries::new(),
                    reply_tracks: ReplyPathTracker::new(),
                    rewards: RewardLedger::new(),
                }),
                rng: StdMutex::new(rng),
            }),
        }
    }

    fn draw<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.inner.rng.lock().expect("routing rng poisoned");
        f(&mut rng)
    }

    /// Dispatch a raw frame received from a neighbour. Malformed
    /// frames are dropped silently; peers get no parser oracle.
    pub async fn handle_incoming(&self, sender: &PeerId, frame: &[u8]) {
        match Packet::from_bytes(frame) {
            Ok(Packet::Query(query)) => self.handle_query_message(sender, query).await,
            Ok(Packet::Reply(reply)) => self.handle_reply_message(Some(sender), reply).await,
            Err(e) => {
                counter!("gap_frames_malformed").increment(1);
                debug!("dropping malformed frame from {}: {}", sender, e);
            }
        }
    }

    /// A query arrived from a neighbour: evaluate, maybe answer from
    /// the local store, maybe forward, maybe take over as relay.
    pub async fn handle_query_message(&self, sender: &PeerId, mut query: QueryPacket) {
        if query.return_to == self.inner.env.my_id {
            // somebody routed our own indirection back at us
            counter!("gap_queries_looped").increment(1);
            debug!("dropping looped query from {}", sender);
            return;
        }

        // decrement the ttl with some jitter so hop counts cannot be
        // read off round values
        let decrement = self.draw(|rng| 2 * TTL_DECREMENT + rng.gen_range(0..TTL_DECREMENT)) as i64;
        let ttl = query.ttl as i64 - decrement;

        let (policy, priority) =
            evaluate_query(&*self.inner.env.load, &*self.inner.env.identity, sender, query.priority);
        if policy.is_drop() {
            counter!("gap_queries_dropped_policy").increment(1);
            info!("dropping query from {}, we are too busy", sender);
            return;
        }

        let preference = (priority as f64).max(QUERY_BANDWIDTH_VALUE);
        self.inner.env.transport.prefer_traffic_from(sender, preference);

        let priority = if policy.indirect {
            // we take responsibility for relaying the replies; the
            // requester behind us stays invisible downstream
            query.return_to = self.inner.env.my_id.clone();
            priority
        } else {
            // original sender stays visible and we cannot benefit
            0
        };
        query.priority = priority;
        query.ttl = adjust_ttl(ttl, priority).clamp(i32::MIN as i64, i32::MAX as i64) as i32;

        let exec_ttl = (query.ttl as i64).max(0);
        self.exec_query(Some(sender), priority, policy, exec_ttl, query)
            .await;
    }

    /// Start a local GET. `timeout` is absolute; results are delivered
    /// through blockstore puts, which the caller is listening for.
    pub async fn get_start(
        &self,
        block_type: BlockType,
        anonymity_level: u32,
        keys: Vec<Hash>,
        timeout: TimestampMillis,
        priority: u32,
    ) -> Result<GetStatus, GapError> {
        if keys.is_empty() || keys.len() > MAX_QUERY_KEYS {
            return Err(GapError::TooManyKeys);
        }
        let now = get_current_time_in_millis();
        self.check_anonymity(anonymity_level, timeout, now)?;

        let ttl = timeout as i64 - now as i64;
        let query = QueryPacket {
            block_type,
            priority,
            ttl: adjust_ttl(ttl, priority).clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            return_to: self.inner.env.my_id.clone(),
            keys,
        };

        {
            let slot = self.inner.table.slot_for(query.primary_key()).lock().await;
            if slot.primary_key == *query.primary_key() && slot.seen_was_unique {
                return Ok(GetStatus::AlreadyAnswered);
            }
        }

        let admitted = self
            .exec_query(None, priority, QueryPolicy::FULL, ttl.max(0), query)
            .await;
        if admitted {
            Ok(GetStatus::Started)
        } else {
            Err(GapError::OutOfResources)
        }
    }

    /// Stop forwarding queries for a key earlier than its timeout.
    /// Replies already in flight are still routed until the slot is
    /// overwritten.
    pub async fn get_stop(&self, keys: &[Hash]) -> bool {
        let Some(key) = keys.first() else {
            return false;
        };
        self.inner.state.lock().await.pending.dequeue(key)
    }

    /// Cover-traffic availability check for anonymous local queries.
    /// Level 0 skips the check, level 1 requires the routing layer but
    /// no cover traffic; above that the recent window must contain
    /// enough foreign queries (and, for levels over 1000, peers) to
    /// hide ours among.
    fn check_anonymity(
        &self,
        anonymity_level: u32,
        timeout: TimestampMillis,
        now: TimestampMillis,
    ) -> Result<(), GapError> {
        if anonymity_level == 0 {
            return Ok(());
        }
        let Some(traffic) = &self.inner.env.traffic else {
            error!("cover traffic requested but no traffic monitor available, rejecting request");
            return Err(GapError::OutOfResources);
        };
        let level = anonymity_level - 1;
        if level == 0 {
            return Ok(());
        }
        let window = TTL_DECREMENT + timeout.saturating_sub(now);
        let Some(summary) = traffic.query_traffic(window) else {
            warn!("failed to get traffic stats, rejecting anonymous request");
            return Err(GapError::OutOfResources);
        };
        let (needed_peers, needed_queries) = if level > 1000 {
            (level / 1000, level % 1000)
        } else {
            (0, level)
        };
        if summary.distinct_peers < needed_peers || summary.query_count < needed_queries {
            info!(
                "cannot satisfy desired level of anonymity ({} queries / {} peers seen), ignoring request",
                summary.query_count, summary.distinct_peers
            );
            return Err(GapError::OutOfResources);
        }
        Ok(())
    }

    /// Route one query: claim or join a table slot, look up local
    /// content, and forward to selected peers. Returns whether the
    /// query was admitted (a slot tracks it, or it was forwarded).
    async fn exec_query(
        &self,
        sender: Option<&PeerId>,
        priority: u32,
        policy: QueryPolicy,
        ttl: i64,
        query: QueryPacket,
    ) -> bool {
        let key = query.primary_key().clone();
        let waiter = sender.unwrap_or(&self.inner.env.my_id).clone();

        let (routed, mut forward, admitted) = if sender.is_some() && !policy.indirect {
            // without indirection we must not track the query: replies
            // are none of our business
            (false, true, true)
        } else {
            if sender.is_none() {
                // only our own queries earn rewards on replies
                self.inner.state.lock().await.rewards.record(&key, priority);
            }
            let network_size = self.inner.env.peers.estimated_network_size();
            let now = get_current_time_in_millis();
            let decision = {
                let mut slot = self.inner.table.slot_for(&key).lock().await;
                self.draw(|rng| {
                    decide_route(
                        &mut slot,
                        &key,
                        query.block_type,
                        ttl,
                        priority,
                        &waiter,
                        now,
                        network_size,
                        rng,
                    )
                })
            };
            if log::log_enabled!(log::Level::Trace) {
                trace!(
                    "slot decision {} for {} (routed: {}, forward: {})",
                    decision.case,
                    key,
                    decision.routed,
                    decision.forward
                );
            }
            if let Some(old_key) = decision.displaced_key {
                self.inner.state.lock().await.pending.dequeue(&old_key);
            }
            let admitted = !matches!(decision.case, 16 | 18);
            (decision.routed, decision.forward, admitted)
        };

        if !policy.forward {
            forward = false;
        }

        // if we can't route the replies back, looking up is useless
        if routed && policy.answer && self.local_lookup(&query, &key).await {
            // the one and only answer was found here
            forward = false;
        }

        if forward {
            self.forward_query(&query, sender).await;
        }
        admitted
    }

    /// Look up the query in the local store. Found values are re-put
    /// with the slot's priority (hot content is promoted) and a share
    /// of them is routed to the waiters through the delay loop.
    /// Returns true when a value was the unique answer.
    async fn local_lookup(&self, query: &QueryPacket, key: &Hash) -> bool {
        // snapshot the dedup state; the lookup itself runs unlocked
        let (seen_snapshot, slot_priority, slot_type) = {
            let slot = self.inner.table.slot_for(key).lock().await;
            if slot.primary_key != *key {
                // slot was stolen since the routing decision
                return false;
            }
            (slot.seen.clone(), slot.priority, slot.block_type)
        };

        let blockstore = self.inner.env.blockstore.clone();
        let mut values: Vec<Bytes> = Vec::new();
        let mut fingerprints: Vec<Hash> = Vec::new();
        {
            let mut collect = |_key: &Hash, value: &Bytes| {
                let fingerprint = blockstore.reply_fingerprint(value);
                // already relayed on this slot, or a duplicate row
                if seen_snapshot.contains(&fingerprint) || fingerprints.contains(&fingerprint) {
                    return IterFlow::Continue;
                }
                fingerprints.push(fingerprint);
                values.push(value.clone());
                IterFlow::Continue
            };
            self.inner.env
                .blockstore
                .get(query.block_type, &query.keys, &mut collect)
                .await;
        }
        if values.is_empty() {
            return false;
        }

        let mut order: Vec<usize> = (0..values.len()).collect();
        self.draw(|rng| order.shuffle(rng));
        let max = reply_pick_rate(self.inner.env.load.net_upload_percent()).min(values.len());

        let mut unique = false;
        for (position, &index) in order.iter().enumerate() {
            let value = &values[index];
            if position < max {
                self.queue_local_reply(key, value.clone()).await;
            }
            // always re-put: gives the result to the local client and
            // bumps the priority of content that keeps being asked for
            if let Err(e) = self.inner.env.blockstore.put(key, value, slot_priority).await {
                debug!("re-put of local result for {} failed: {}", key, e);
            }
            if self.inner.env.blockstore.is_unique_reply(value, slot_type, key) {
                unique = true;
            }
        }
        unique
    }

    /// Hand a locally found value to the reply path after a random
    /// delay, as if it had just arrived from nowhere. Levels the
    /// timing so an observer cannot tell local disk from network.
    async fn queue_local_reply(&self, key: &Hash, value: Bytes) {
        if REPLY_BASE_SIZE + value.len() >= MAX_BUFFER_SIZE {
            warn!("local result for {} exceeds the frame limit, not routed", key);
            return;
        }
        let epoch = {
            let mut slot = self.inner.table.slot_for(key).lock().await;
            if slot.primary_key != *key {
                return; // nobody waits for this anymore
            }
            if slot.local_lookup_inflight {
                // an answer is already in the delay loop; do not queue
                // the same content twice
                return;
            }
            slot.local_lookup_inflight = true;
            slot.epoch
        };

        let delay = self.draw(|rng| rng.gen_range(0..TTL_DECREMENT));
        let core = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            {
                let mut slot = core.inner.table.slot_for(&key).lock().await;
                if slot.epoch == epoch {
                    slot.local_lookup_inflight = false;
                }
            }
            let reply = ReplyPacket {
                primary_key: key,
                payload: value,
            };
            core.handle_reply_message(None, reply).await;
        });
    }

    /// A reply arrived (`sender` is `None` for content we found
    /// ourselves). Validate, store, credit the responder and route it
    /// to everyone recorded as waiting.
    pub async fn handle_reply_message(&self, sender: Option<&PeerId>, reply: ReplyPacket) {
        let key = reply.primary_key.clone();
        let fingerprint = self.inner.env.blockstore.reply_fingerprint(&reply.payload);

        {
            let slot = self.inner.table.slot_for(&key).lock().await;
            if slot.primary_key != key {
                // routing table has moved on, nobody cares anymore
                counter!("gap_replies_unroutable").increment(1);
                trace!("dropping reply for {}, no matching slot", key);
                return;
            }
            if slot.local_lookup_inflight {
                // a local answer is already in the delay loop
                counter!("gap_replies_duplicate").increment(1);
                return;
            }
            if slot.seen.contains(&fingerprint) {
                counter!("gap_replies_duplicate").increment(1);
                trace!("dropping duplicate reply for {}", key);
                return;
            }
        }

        // validity check is the store's: an invalid value is rejected
        // here and goes no further
        if let Err(e) = self.inner.env.blockstore.put(&key, &reply.payload, 0).await {
            debug!("dropping reply for {}: {}", key, e);
            return;
        }

        let mut credit: u32 = 0;
        let mut unique = false;
        let mut recipients: Vec<PeerId> = Vec::new();
        let mut max_delay = TTL_DECREMENT;
        {
            // the slot may have been overwritten while we hit the disk
            let mut slot = self.inner.table.slot_for(&key).lock().await;
            if slot.primary_key == key {
                credit = slot.priority;
                slot.priority = 0;
                if let Some(sender) = sender {
                    // the requester is satisfied from another direction
                    slot.waiters.retain(|waiter| waiter != sender);
                }
                slot.seen.push(fingerprint);
                slot.seen_was_unique = slot.seen.len() == 1
                    && self
                        .inner
                        .env
                        .blockstore
                        .is_unique_reply(&reply.payload, slot.block_type, &key);
                unique = slot.seen_was_unique;

                let now = get_current_time_in_millis();
                if now < slot.deadline {
                    max_delay = slot.deadline - now;
                }
                recipients = slot.waiters.clone();
            }
        }

        if !recipients.is_empty() {
            let frame = Bytes::from(Packet::Reply(reply.clone()).to_bytes());
            let reply_priority = BASE_REPLY_PRIORITY.saturating_mul(credit.saturating_add(1));
            for waiter in &recipients {
                // the local client reads the store, not the wire
                if *waiter != self.inner.env.my_id {
                    self.inner.env
                        .transport
                        .unicast(waiter, frame.clone(), reply_priority, max_delay)
                        .await;
                }
            }
        }

        credit = credit.saturating_add(self.inner.state.lock().await.rewards.claim(&key));
        if credit > 0 {
            // the value proved itself; let the store retain it harder
            if let Err(e) = self.inner.env.blockstore.put(&key, &reply.payload, credit).await {
                debug!("priority re-put for {} failed: {}", key, e);
            }
        }

        if unique {
            // the one and only answer is here, stop asking the network
            self.inner.state.lock().await.pending.dequeue(&key);
        }

        if let Some(sender) = sender {
            self.inner.env
                .identity
                .change_trust(sender, credit.min(i32::MAX as u32) as i32);
            let now = get_current_time_in_millis();
            {
                let mut state = self.inner.state.lock().await;
                for waiter in &recipients {
                    state.reply_tracks.note_response(waiter, sender, now);
                }
            }
            self.inner.env
                .transport
                .prefer_traffic_from(sender, (credit as f64).max(CONTENT_BANDWIDTH_VALUE));
        }
    }

    /// Pick peers for a query and send it, remembering the record for
    /// piggybacking. Selection is weighted by the hot-path score,
    /// closeness to the key, and a little noise so everybody gets an
    /// occasional chance.
    async fn forward_query(&self, query: &QueryPacket, exclude: Option<&PeerId>) {
        let now = get_current_time_in_millis();
        let expires = (now as i64 + query.ttl as i64).max(0) as TimestampMillis;
        let no_target = exclude.cloned().unwrap_or_else(|| self.inner.env.my_id.clone());
        let record = QueryRecord::new(query.clone(), expires, no_target.clone());

        let mut peers: Vec<PeerId> = Vec::new();
        self.inner.env
            .peers
            .for_each_connected(&mut |peer| peers.push(peer.clone()));

        let targets: Vec<(PeerId, Bytes)> = {
            let mut state = self.inner.state.lock().await;

            let mut rankings = [0u64; BITMAP_BITS];
            for peer in &peers {
                let index = bitmap_index(self.inner.env.peers.index_of(peer)) as usize;
                if *peer == no_target || *peer == query.return_to {
                    // no chance for the peers the reply must not reach
                    rankings[index] = 0;
                    continue;
                }
                let mut ranking = state.reply_tracks.score(&no_target, peer) as u64;
                let distance = query.primary_key().distance(peer.as_hash());
                ranking += self.draw(|rng| {
                    0xFFFF / (1 + rng.gen_range(0..distance) as u64)
                        + 1
                        + rng.gen_range(0..0xFFu64)
                });
                rankings[index] = ranking;
            }

            let mut installed = self.draw(|rng| state.pending.install(record, now, rng));
            let record = match installed {
                // recent retransmit: the record was refreshed but the
                // peers it already reached keep their bits, nothing to
                // send right now
                Installed::Kept(_) => return,
                Installed::Fresh(index) => {
                    let record = state
                        .pending
                        .record_mut(index)
                        .expect("freshly installed record");
                    self.draw(|rng| select_targets(&mut *record, &mut rankings, rng));
                    &*record
                }
                Installed::Transient(ref mut record) => {
                    self.draw(|rng| select_targets(&mut *record, &mut rankings, rng));
                    &*record
                }
            };

            peers
                .iter()
                .filter(|peer| {
                    **peer != no_target
                        && **peer != query.return_to
                        && record.was_sent_to(self.inner.env.peers.index_of(peer))
                })
                .map(|peer| (peer.clone(), record.frame().clone()))
                .collect()
        };

        let priority = BASE_QUERY_PRIORITY
            .saturating_mul(query.priority)
            .saturating_mul(2);
        for (peer, frame) in targets {
            if log::log_enabled!(log::Level::Trace) {
                trace!("forwarding query {} to {}", query.primary_key(), peer);
            }
            self.inner.env
                .transport
                .unicast(&peer, frame, priority, TTL_DECREMENT)
                .await;
        }
    }

    /// Piggyback callback for the transport layer: copy pending
    /// queries into an outgoing frame for `receiver`. Returns the
    /// bytes appended to `buf`.
    pub async fn fill_query_frame(
        &self,
        receiver: &PeerId,
        buf: &mut Vec<u8>,
        space: usize,
    ) -> usize {
        let index = bitmap_index(self.inner.env.peers.index_of(receiver));
        let now = get_current_time_in_millis();
        self.inner.state
            .lock()
            .await
            .pending
            .fill_frame(receiver, index, buf, space, now)
    }

    /// Serialize an unsolicited reply for active content into spare
    /// frame space, so hot content drifts through the network.
    pub fn try_migrate(&self, key: &Hash, value: &Bytes, space: usize) -> Option<Bytes> {
        let size = REPLY_BASE_SIZE + value.len();
        if size > space || size >= MAX_BUFFER_SIZE {
            return None;
        }
        let packet = Packet::Reply(ReplyPacket {
            primary_key: key.clone(),
            payload: value.clone(),
        });
        Some(Bytes::from(packet.to_bytes()))
    }

    /// Mean priority of the queries we are still waiting on; hosts use
    /// it to price their own requests competitively.
    pub async fn avg_priority(&self) -> u32 {
        self.inner.table.avg_priority().await
    }

    /// Is a query for this key still scheduled for transmission?
    pub async fn is_query_pending(&self, key: &Hash) -> bool {
        let now = get_current_time_in_millis();
        self.inner.state.lock().await.pending.is_pending(key, now)
    }

    /// Periodic decay of the reply-path statistics. Runs until the
    /// returned handle is aborted.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let core = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(REPLY_TRACK_AGE_INTERVAL));
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                let now = get_current_time_in_millis();
                core.inner.state.lock().await.reply_tracks.age(now);
                trace!("reply-path tracker aged");
            }
        })
    }
}

/// Weighted sampling without replacement: draw from the cumulative
/// ranking mass, zero out the winner, repeat.
fn select_targets<R: Rng>(record: &mut QueryRecord, rankings: &mut [u64; BITMAP_BITS], rng: &mut R) {
    let mut ranking_sum: u64 = rankings.iter().sum();
    for _ in 0..ENTRY_SELECTION_COUNT {
        if ranking_sum == 0 {
            break;
        }
        let target = rng.gen_range(0..ranking_sum);
        let mut position = 0u64;
        for (index, ranking) in rankings.iter_mut().enumerate() {
            position += *ranking;
            if position > target {
                record.mark_sent_to(index as u32);
                ranking_sum -= *ranking;
                *ranking = 0;
                break;
            }
        }
    }
}
