use gap_common::time::TimestampMillis;

// Millis per second, it is used to prevent having random 1000 values anywhere
pub const MILLIS_PER_SECOND: u64 = 1000;

// Until which upload load (in percent) do we consider the peer idle
// and do not charge senders for their queries at all?
pub const IDLE_LOAD_THRESHOLD: u8 = 50;

// By which amount do we decrement the TTL for simple forwarding /
// indirection of a query, in milliseconds. Set somewhat in accordance
// with network latency (above the time it takes to send a packet and
// get a reply). Also the unit of a "significant" TTL difference.
pub const TTL_DECREMENT: TimestampMillis = 5 * MILLIS_PER_SECOND;

// Bandwidth value of an (effectively) 0-priority query.
pub const QUERY_BANDWIDTH_VALUE: f64 = 0.01;

// Bandwidth value of a 0-priority reply. Must be fairly high compared
// to queries since content is much larger and it can take many queries
// to obtain one piece of content.
pub const CONTENT_BANDWIDTH_VALUE: f64 = 0.8;

// Bits in the per-record bitmap marking the peers a query has already
// been sent to. Peer indices out of range wrap by mask, so two peers
// may share a bit; in that case only one of them gets the query.
pub const BITMAP_BITS: usize = 128;

// Of how many outbound queries do we simultaneously keep track?
pub const QUERY_RECORD_COUNT: usize = 512;

// How much is a query worth "in general", even without any trust
// relationship between the peers. 20 is for '20 bytes / hash', kind of
// the base unit.
pub const BASE_QUERY_PRIORITY: u32 = 20;

// How much is a reply worth "in general". Replies are roughly 1k and
// should be strongly preferred over queries, hence the large factor.
pub const BASE_REPLY_PRIORITY: u32 = 4092;

// Minimum indirection table size. The larger the table, the greater the
// achievable anonymity and the better the download speed, at the cost
// of memory. MUST be a power of two.
pub const MIN_INDIRECTION_TABLE_SIZE: usize = 1024;

// Two peers can interlock such that each has a slot blocked exactly
// until the other frees it. 1/N probability that one gives in.
pub const TIE_BREAKER_CHANCE: u32 = 4;

// For how many local requests do we track non-zero request priorities
// to reward peers that send replies? Too low and we forget to reward
// good replies; too high and every reply scans a large ring.
pub const MAX_REWARD_TRACKS: usize = 128;

// How many peers are picked per forwarded query.
pub const ENTRY_SELECTION_COUNT: usize = 4;

// Reply-path tracker ageing: counts are halved on every tick and an
// origin that stayed silent for the expiry window is discarded.
pub const REPLY_TRACK_AGE_INTERVAL: TimestampMillis = 30 * MILLIS_PER_SECOND;
pub const REPLY_TRACK_EXPIRY: TimestampMillis = 600 * MILLIS_PER_SECOND;

// Largest frame we accept or build.
pub const MAX_BUFFER_SIZE: usize = 65536;

const _: () = assert!(
    MIN_INDIRECTION_TABLE_SIZE.is_power_of_two(),
    "MIN_INDIRECTION_TABLE_SIZE must be a power of two"
);
const _: () = assert!(BITMAP_BITS.is_power_of_two(), "BITMAP_BITS must be a power of two");

/// Runtime knobs of the routing core. Everything else is normative.
#[derive(Debug, Clone)]
pub struct GapConfig {
    /// Number of indirection table slots, rounded up to a power of two
    /// and never below [`MIN_INDIRECTION_TABLE_SIZE`].
    pub table_size: usize,
    /// Seed for the routing RNG. `None` draws from OS entropy; tests
    /// pin it to make tie-breaker decisions reproducible.
    pub rng_seed: Option<u64>,
}

impl GapConfig {
    pub fn new(table_size: usize) -> Self {
        Self {
            table_size,
            rng_seed: None,
        }
    }

    /// Effective table size honoring the power-of-two requirement.
    pub fn effective_table_size(&self) -> usize {
        self.table_size
            .next_power_of_two()
            .max(MIN_INDIRECTION_TABLE_SIZE)
    }
}

impl Default for GapConfig {
    fn default() -> Self {
        Self::new(MIN_INDIRECTION_TABLE_SIZE)
    }
}
