//! Capabilities the host process provides to the routing core.
//!
//! The core never talks to sockets or disks itself: link-layer
//! transports, the content store, trust accounting and load estimation
//! all live outside and are handed in once at initialisation.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use gap_common::{
    crypto::{Hash, PeerId},
    time::TimestampMillis,
};

use crate::{error::StoreError, packet::BlockType};

/// Verdict of a blockstore iteration callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterFlow {
    Continue,
    Stop,
}

/// Content store. Externally synchronised; `get`/`put` may block on
/// disk I/O and must therefore never be invoked with a core lock held.
#[async_trait]
pub trait Blockstore: Send + Sync {
    /// Look up candidate values for a query. `keys[0]` is the primary
    /// key, further keys are query disjuncts the store interprets by
    /// type. Returns the number of values offered to `iter`.
    async fn get(
        &self,
        block_type: BlockType,
        keys: &[Hash],
        iter: &mut (dyn for<'a, 'b> FnMut(&'a Hash, &'b Bytes) -> IterFlow + Send),
    ) -> u32;

    async fn put(&self, key: &Hash, value: &Bytes, priority: u32) -> Result<(), StoreError>;

    /// Is this value the canonical, sole correct answer for type+key?
    fn is_unique_reply(&self, value: &Bytes, block_type: BlockType, key: &Hash) -> bool;

    /// Content-derived digest used for reply de-duplication.
    fn reply_fingerprint(&self, value: &Bytes) -> Hash;
}

/// Framed message delivery to a connected neighbour.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Non-blocking; may drop the frame under load. `max_delay` tells
    /// the scheduler how long the frame may be held back for batching.
    async fn unicast(&self, peer: &PeerId, frame: Bytes, priority: u32, max_delay: TimestampMillis);

    /// Raise the bandwidth share allotted to this peer.
    fn prefer_traffic_from(&self, peer: &PeerId, preference: f64);
}

/// Trust accounting from the peer-book.
pub trait Identity: Send + Sync {
    /// Apply a trust delta, returns the delta actually applied after
    /// clamping (a peer without credit cannot be charged).
    fn change_trust(&self, peer: &PeerId, delta: i32) -> i32;
}

pub trait LoadMonitor: Send + Sync {
    /// Upload utilisation in percent, `None` when unknown.
    fn net_upload_percent(&self) -> Option<u8>;

    /// Download utilisation in percent, `None` when unknown.
    fn net_download_percent(&self) -> Option<u8>;
}

/// View of the currently connected neighbours.
pub trait PeerDirectory: Send + Sync {
    fn for_each_connected(&self, f: &mut dyn FnMut(&PeerId));

    /// Stable small index of a peer, used for bitmap and ranking
    /// positions. The core wraps it into the bitmap range by mask.
    fn index_of(&self, peer: &PeerId) -> u32;

    fn estimated_network_size(&self) -> u32;
}

/// Recent inbound traffic counts, used to judge whether enough cover
/// traffic exists to hide a local query.
#[derive(Debug, Clone, Copy)]
pub struct TrafficSummary {
    /// QUERY messages received in the window.
    pub query_count: u32,
    /// Distinct peers they came from.
    pub distinct_peers: u32,
}

pub trait TrafficMonitor: Send + Sync {
    fn query_traffic(&self, window: TimestampMillis) -> Option<TrafficSummary>;
}

/// Everything the core consumes, built once by the host.
#[derive(Clone)]
pub struct GapEnvironment {
    /// Our own identity; `return_to` of indirected queries.
    pub my_id: PeerId,
    pub blockstore: Arc<dyn Blockstore>,
    pub transport: Arc<dyn Transport>,
    pub identity: Arc<dyn Identity>,
    pub load: Arc<dyn LoadMonitor>,
    pub peers: Arc<dyn PeerDirectory>,
    /// Absent when the host runs without a traffic service; local GETs
    /// that request anonymity are then rejected.
    pub traffic: Option<Arc<dyn TrafficMonitor>>,
}
