use bytes::Bytes;
use gap_common::{
    crypto::{Hash, PeerId},
    serializer::Serializer,
    time::TimestampMillis,
};
use rand::Rng;

use crate::{
    config::{BITMAP_BITS, QUERY_RECORD_COUNT, TTL_DECREMENT},
    packet::{Packet, QueryPacket, QUERY_BASE_SIZE},
};

// Keep the bitmap once a retransmit reuses a record, unless the record
// is long expired. High probability: initiators back off exponentially,
// so the eventual re-forward must still be likely.
const KEEP_BITMAP_CHANCE: u32 = 4;

/// Smallest frame a query can occupy; the scan stops once less than
/// this is left.
pub const MIN_QUERY_FRAME: usize = QUERY_BASE_SIZE;

/// An outbound query waiting for space in outgoing frames.
pub struct QueryRecord {
    msg: QueryPacket,
    /// Serialized frame, built once and copied into every carrier.
    frame: Bytes,
    /// When we stop forwarding this query.
    expires: TimestampMillis,
    send_count: u32,
    /// Peer this query must never be sent to (who asked us), or our
    /// own identity for locally originated queries.
    no_target: PeerId,
    /// Peer-index bits of the neighbours that already got this query.
    /// Only grows for the lifetime of the record.
    bitmap: u128,
}

impl QueryRecord {
    pub fn new(msg: QueryPacket, expires: TimestampMillis, no_target: PeerId) -> Self {
        let frame = Bytes::from(Packet::Query(msg.clone()).to_bytes());
        Self {
            msg,
            frame,
            expires,
            send_count: 0,
            no_target,
            bitmap: 0,
        }
    }

    pub fn primary_key(&self) -> &Hash {
        self.msg.primary_key()
    }

    pub fn no_target(&self) -> &PeerId {
        &self.no_target
    }

    pub fn return_to(&self) -> &PeerId {
        &self.msg.return_to
    }

    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    pub fn wire_size(&self) -> usize {
        self.frame.len()
    }

    pub fn expires(&self) -> TimestampMillis {
        self.expires
    }

    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    pub fn priority(&self) -> u32 {
        self.msg.priority
    }

    pub fn bitmap(&self) -> u128 {
        self.bitmap
    }

    pub fn mark_sent_to(&mut self, peer_index: u32) {
        self.bitmap |= bit(peer_index);
    }

    pub fn was_sent_to(&self, peer_index: u32) -> bool {
        self.bitmap & bit(peer_index) != 0
    }
}

/// Where a new outbound record ended up.
pub enum Installed {
    /// Retransmit of a pending query; the old bitmap was carried over,
    /// do not select targets or send again.
    Kept(usize),
    /// Stored with a cleared bitmap; select targets and send.
    Fresh(usize),
    /// Ring full of longer-lived records; send once, remember nothing.
    Transient(QueryRecord),
}

/// Map a peer index into the bitmap range.
pub fn bitmap_index(raw_index: u32) -> u32 {
    raw_index & (BITMAP_BITS as u32 - 1)
}

fn bit(peer_index: u32) -> u128 {
    1u128 << bitmap_index(peer_index)
}

/// Fixed ring of outbound queries scanned by the transport layer to
/// piggyback pending queries onto frames that are going out anyway.
pub struct PendingQueries {
    records: Vec<Option<QueryRecord>>,
    /// Rotating scan position so no receiver starves the tail.
    cursor: usize,
}

impl PendingQueries {
    pub fn new() -> Self {
        let mut records = Vec::with_capacity(QUERY_RECORD_COUNT);
        records.resize_with(QUERY_RECORD_COUNT, || None);
        Self { records, cursor: 0 }
    }

    /// Install a fresh record, replacing a pending record for the same
    /// key set if one exists, otherwise the entry with the oldest
    /// expiry — but only if that is older than the new record itself.
    ///
    /// A retransmit usually keeps the old bitmap so we do not hammer
    /// the same peers again right away (`Kept`: no re-selection, no
    /// immediate send — the refreshed record just stays eligible for
    /// piggybacking). When every slot outlives the newcomer the record
    /// is handed back (`Transient`): send it once, remember nothing.
    pub fn install<R: Rng>(
        &mut self,
        mut record: QueryRecord,
        now: TimestampMillis,
        rng: &mut R,
    ) -> Installed {
        let mut oldest_index: Option<usize> = None;
        let mut oldest_time = record.expires;
        let mut identical: Option<usize> = None;

        for (i, slot) in self.records.iter().enumerate() {
            let expires = slot.as_ref().map(|r| r.expires).unwrap_or(0);
            if expires < oldest_time {
                oldest_time = expires;
                oldest_index = Some(i);
            }
            if let Some(existing) = slot {
                if existing.msg.keys == record.msg.keys {
                    identical = Some(i);
                    break;
                }
            }
        }

        match identical {
            Some(i) => {
                let existing = self.records[i].as_ref().unwrap();
                let recently_live = existing.expires + 4 * TTL_DECREMENT > now;
                if recently_live && rng.gen_range(0..KEEP_BITMAP_CHANCE) != 0 {
                    record.bitmap = existing.bitmap;
                    self.records[i] = Some(record);
                    Installed::Kept(i)
                } else {
                    self.records[i] = Some(record);
                    Installed::Fresh(i)
                }
            }
            None => match oldest_index {
                Some(i) => {
                    self.records[i] = Some(record);
                    Installed::Fresh(i)
                }
                None => Installed::Transient(record),
            },
        }
    }

    pub fn record_mut(&mut self, index: usize) -> Option<&mut QueryRecord> {
        self.records[index].as_mut()
    }

    /// Stop transmitting a query: expire its record immediately.
    pub fn dequeue(&mut self, key: &Hash) -> bool {
        for slot in self.records.iter_mut().flatten() {
            if slot.primary_key() == key {
                slot.expires = 0;
                return true;
            }
        }
        false
    }

    /// Copy pending queries into an outgoing frame for `receiver`.
    /// A record is taken when it is live, has not been sent to this
    /// receiver's index yet, does not point back at the receiver, and
    /// still fits. Returns the bytes written.
    pub fn fill_frame(
        &mut self,
        receiver: &PeerId,
        receiver_index: u32,
        buf: &mut Vec<u8>,
        space: usize,
        now: TimestampMillis,
    ) -> usize {
        let start = self.cursor;
        let mut written = 0;

        while space - written > MIN_QUERY_FRAME {
            if let Some(record) = self.records[self.cursor].as_mut() {
                if record.expires > now
                    && !record.was_sent_to(receiver_index)
                    && record.no_target != *receiver
                    && record.msg.return_to != *receiver
                    && space - written >= record.wire_size()
                {
                    record.mark_sent_to(receiver_index);
                    record.send_count += 1;
                    buf.extend_from_slice(record.frame());
                    written += record.wire_size();
                }
            }
            self.cursor += 1;
            if self.cursor >= QUERY_RECORD_COUNT {
                self.cursor = 0;
            }
            if self.cursor == start {
                break;
            }
        }
        written
    }

    /// Is there a live record for this key? Used by tests and probes.
    pub fn is_pending(&self, key: &Hash, now: TimestampMillis) -> bool {
        self.records
            .iter()
            .flatten()
            .any(|record| record.primary_key() == key && record.expires > now)
    }
}

impl Default for PendingQueries {
    fn default() -> Self {
        Self::new()
    }
}
