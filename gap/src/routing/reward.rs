use gap_common::crypto::Hash;

use crate::config::MAX_REWARD_TRACKS;

#[derive(Clone)]
struct RewardEntry {
    query: Hash,
    priority: u32,
}

/// Bounded ring remembering how much a reply to one of our own recent
/// queries is worth. Claiming pays at most once: matched slots are
/// zeroed as they are summed.
pub struct RewardLedger {
    entries: Vec<RewardEntry>,
    cursor: usize,
}

impl RewardLedger {
    pub fn new() -> Self {
        Self {
            entries: vec![
                RewardEntry {
                    query: Hash::zero(),
                    priority: 0,
                };
                MAX_REWARD_TRACKS
            ],
            cursor: 0,
        }
    }

    /// Remember that an answer to `query` is worth `priority` trust,
    /// overwriting the oldest slot.
    pub fn record(&mut self, query: &Hash, priority: u32) {
        if priority == 0 {
            return;
        }
        self.entries[self.cursor] = RewardEntry {
            query: query.clone(),
            priority,
        };
        self.cursor += 1;
        if self.cursor == self.entries.len() {
            self.cursor = 0;
        }
    }

    /// Sum and consume every pending reward for `query`.
    pub fn claim(&mut self, query: &Hash) -> u32 {
        let mut total: u32 = 0;
        for entry in self.entries.iter_mut() {
            if entry.query == *query {
                total = total.saturating_add(entry.priority);
                entry.priority = 0;
            }
        }
        total
    }
}

impl Default for RewardLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gap_common::crypto::hash;

    #[test]
    fn test_claim_is_paid_once() {
        let mut ledger = RewardLedger::new();
        let query = hash(b"query");
        ledger.record(&query, 10);
        ledger.record(&query, 5);
        assert_eq!(ledger.claim(&query), 15);
        assert_eq!(ledger.claim(&query), 0);
    }

    #[test]
    fn test_zero_priority_not_recorded() {
        let mut ledger = RewardLedger::new();
        let query = hash(b"query");
        ledger.record(&query, 0);
        assert_eq!(ledger.claim(&query), 0);
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut ledger = RewardLedger::new();
        let old = hash(b"old");
        ledger.record(&old, 7);
        for i in 0..MAX_REWARD_TRACKS {
            ledger.record(&hash(&i.to_be_bytes()), 1);
        }
        // the full wrap evicted the original entry
        assert_eq!(ledger.claim(&old), 0);
    }

    #[test]
    fn test_unrelated_queries_untouched() {
        let mut ledger = RewardLedger::new();
        let a = hash(b"a");
        let b = hash(b"b");
        ledger.record(&a, 3);
        ledger.record(&b, 4);
        assert_eq!(ledger.claim(&a), 3);
        assert_eq!(ledger.claim(&b), 4);
    }
}
