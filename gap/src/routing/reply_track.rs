use std::collections::HashMap;

use gap_common::{crypto::PeerId, time::TimestampMillis};

use crate::config::REPLY_TRACK_EXPIRY;

// Score cap and per-response weight, tuned so that a single fruitful
// answer already dominates the distance term of the peer selection.
const RESPONSE_WEIGHT: u32 = 0x7FFF;
const SCORE_CAP: u32 = 0x7FF_FFFF;

struct ResponseCount {
    responder: PeerId,
    count: u32,
}

struct ReplyTrackData {
    last_reply: TimestampMillis,
    responses: Vec<ResponseCount>,
}

/// Remembers which neighbours produced useful replies for queries from
/// a given origin. Forwarding biases towards those peers, so fruitful
/// sources organically attract more traffic for that origin without
/// any explicit routing-table protocol.
pub struct ReplyPathTracker {
    origins: HashMap<PeerId, ReplyTrackData>,
}

impl ReplyPathTracker {
    pub fn new() -> Self {
        Self {
            origins: HashMap::new(),
        }
    }

    /// A reply from `responder` was used for a query whose origin was
    /// `origin`. Local responses are not tracked.
    pub fn note_response(&mut self, origin: &PeerId, responder: &PeerId, now: TimestampMillis) {
        let data = self
            .origins
            .entry(origin.clone())
            .or_insert_with(|| ReplyTrackData {
                last_reply: now,
                responses: Vec::new(),
            });
        data.last_reply = now;
        if let Some(entry) = data
            .responses
            .iter_mut()
            .find(|entry| entry.responder == *responder)
        {
            entry.count += 1;
        } else {
            data.responses.push(ResponseCount {
                responder: responder.clone(),
                count: 1,
            });
        }
    }

    /// Ranking bonus for forwarding a query from `origin` to
    /// `candidate`: proportional to how often the candidate answered
    /// this origin before, zero for strangers.
    pub fn score(&self, origin: &PeerId, candidate: &PeerId) -> u32 {
        let Some(data) = self.origins.get(origin) else {
            return 0;
        };
        let Some(entry) = data
            .responses
            .iter()
            .find(|entry| entry.responder == *candidate)
        else {
            return 0;
        };
        if entry.count < 0xFFFF {
            RESPONSE_WEIGHT * entry.count
        } else {
            SCORE_CAP
        }
    }

    /// Ageing tick: halve every count, drop responders that reach zero
    /// and origins that are empty or silent for the expiry window.
    pub fn age(&mut self, now: TimestampMillis) {
        self.origins.retain(|_, data| {
            if data.last_reply + REPLY_TRACK_EXPIRY < now {
                return false;
            }
            data.responses.retain_mut(|entry| {
                entry.count /= 2;
                entry.count > 0
            });
            !data.responses.is_empty()
        });
    }

    #[cfg(test)]
    pub fn tracked_origins(&self) -> usize {
        self.origins.len()
    }
}

impl Default for ReplyPathTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gap_common::crypto::hash;

    fn peer(tag: &[u8]) -> PeerId {
        PeerId::new(hash(tag))
    }

    #[test]
    fn test_score_grows_with_responses() {
        let mut tracker = ReplyPathTracker::new();
        let origin = peer(b"origin");
        let responder = peer(b"responder");

        assert_eq!(tracker.score(&origin, &responder), 0);
        tracker.note_response(&origin, &responder, 1000);
        assert_eq!(tracker.score(&origin, &responder), RESPONSE_WEIGHT);
        tracker.note_response(&origin, &responder, 2000);
        assert_eq!(tracker.score(&origin, &responder), 2 * RESPONSE_WEIGHT);
    }

    #[test]
    fn test_score_is_per_origin() {
        let mut tracker = ReplyPathTracker::new();
        let responder = peer(b"responder");
        tracker.note_response(&peer(b"a"), &responder, 1000);
        assert_eq!(tracker.score(&peer(b"b"), &responder), 0);
    }

    #[test]
    fn test_age_halves_and_collects() {
        let mut tracker = ReplyPathTracker::new();
        let origin = peer(b"origin");
        let responder = peer(b"responder");
        tracker.note_response(&origin, &responder, 1000);
        tracker.note_response(&origin, &responder, 1000);

        tracker.age(2000);
        assert_eq!(tracker.score(&origin, &responder), RESPONSE_WEIGHT);
        // second halving reaches zero and the origin disappears
        tracker.age(3000);
        assert_eq!(tracker.score(&origin, &responder), 0);
        assert_eq!(tracker.tracked_origins(), 0);
    }

    #[test]
    fn test_silent_origin_expires_wholesale() {
        let mut tracker = ReplyPathTracker::new();
        let origin = peer(b"origin");
        for _ in 0..10 {
            tracker.note_response(&origin, &peer(b"responder"), 1000);
        }
        tracker.age(1000 + REPLY_TRACK_EXPIRY + 1);
        assert_eq!(tracker.tracked_origins(), 0);
    }
}
