use gap_common::crypto::PeerId;

use crate::{
    config::IDLE_LOAD_THRESHOLD,
    env::{Identity, LoadMonitor},
};

/// What we are willing to do for an incoming query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPolicy {
    /// Answer from the local store if we have the content.
    pub answer: bool,
    /// Pass the query on to other peers.
    pub forward: bool,
    /// Take responsibility for relaying replies: rewrite `return_to`
    /// to ourselves before forwarding.
    pub indirect: bool,
}

impl QueryPolicy {
    pub const DROP: QueryPolicy = QueryPolicy {
        answer: false,
        forward: false,
        indirect: false,
    };

    pub const FULL: QueryPolicy = QueryPolicy {
        answer: true,
        forward: true,
        indirect: true,
    };

    pub fn is_drop(&self) -> bool {
        !self.answer && !self.forward && !self.indirect
    }
}

/// Load- and trust-driven admission decision.
///
/// An idle peer routes everything anonymously for free. Under load the
/// sender is charged: its declared priority is capped by the trust it
/// actually has, and the effective priority buys back capabilities —
/// first indirection goes, then forwarding, then even local answering.
/// Returns the policy and the effective (trust-adjusted) priority.
pub fn evaluate_query(
    load: &dyn LoadMonitor,
    identity: &dyn Identity,
    sender: &PeerId,
    declared_priority: u32,
) -> (QueryPolicy, u32) {
    let net_load = match load.net_upload_percent() {
        Some(load) if load >= IDLE_LOAD_THRESHOLD => load as u32,
        // unknown or idle: minimum priority, no charge
        _ => return (QueryPolicy::FULL, 0),
    };

    // charge! the debit actually applied is what the query is worth
    let charged = -identity.change_trust(sender, -(declared_priority.min(i32::MAX as u32) as i32));
    let priority = charged.max(0) as u32;

    let policy = if net_load < (IDLE_LOAD_THRESHOLD as u32).saturating_add(priority) {
        QueryPolicy::FULL
    } else if net_load < priority.saturating_mul(10).saturating_add(90) {
        QueryPolicy {
            answer: true,
            forward: true,
            indirect: false,
        }
    } else if net_load < 100 {
        QueryPolicy {
            answer: true,
            forward: false,
            indirect: false,
        }
    } else {
        QueryPolicy::DROP
    };
    (policy, priority)
}
