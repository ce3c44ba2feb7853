//! Shared mock environment for the routing scenarios.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use gap_common::{
    crypto::{hash, Hash, PeerId},
    time::TimestampMillis,
};

use gap_core::{
    env::{
        Blockstore, GapEnvironment, Identity, IterFlow, LoadMonitor, PeerDirectory,
        TrafficMonitor, TrafficSummary, Transport,
    },
    error::StoreError,
    packet::BlockType,
    GapConfig, GapCore,
};

pub fn peer(tag: &str) -> PeerId {
    PeerId::new(hash(tag.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct SentFrame {
    pub peer: PeerId,
    pub frame: Vec<u8>,
    pub priority: u32,
    pub max_delay: TimestampMillis,
}

#[derive(Default)]
pub struct MockTransport {
    pub sent: Mutex<Vec<SentFrame>>,
    pub preferences: Mutex<Vec<(PeerId, f64)>>,
}

impl MockTransport {
    pub fn sent_to(&self, peer: &PeerId) -> Vec<SentFrame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.peer == *peer)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn unicast(&self, peer: &PeerId, frame: Bytes, priority: u32, max_delay: TimestampMillis) {
        self.sent.lock().unwrap().push(SentFrame {
            peer: peer.clone(),
            frame: frame.to_vec(),
            priority,
            max_delay,
        });
    }

    fn prefer_traffic_from(&self, peer: &PeerId, preference: f64) {
        self.preferences
            .lock()
            .unwrap()
            .push((peer.clone(), preference));
    }
}

#[derive(Default)]
pub struct MockStore {
    /// Values served by `get`, keyed by primary key.
    pub blocks: Mutex<HashMap<Hash, Vec<Bytes>>>,
    /// Keys whose content is the one and only correct answer.
    pub unique_keys: Mutex<HashSet<Hash>>,
    /// Every accepted put, in order.
    pub puts: Mutex<Vec<(Hash, Bytes, u32)>>,
    /// When set, every put is rejected as invalid.
    pub reject_puts: Mutex<bool>,
}

impl MockStore {
    pub fn insert(&self, key: &Hash, value: &[u8]) {
        self.blocks
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push(Bytes::copy_from_slice(value));
    }

    pub fn mark_unique(&self, key: &Hash) {
        self.unique_keys.lock().unwrap().insert(key.clone());
    }

    pub fn puts_for(&self, key: &Hash) -> Vec<(Bytes, u32)> {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, _)| k == key)
            .map(|(_, value, priority)| (value.clone(), *priority))
            .collect()
    }
}

#[async_trait]
impl Blockstore for MockStore {
    async fn get(
        &self,
        _block_type: BlockType,
        keys: &[Hash],
        iter: &mut (dyn for<'a, 'b> FnMut(&'a Hash, &'b Bytes) -> IterFlow + Send),
    ) -> u32 {
        let values = self.blocks.lock().unwrap().get(&keys[0]).cloned();
        let mut count = 0;
        if let Some(values) = values {
            for value in &values {
                count += 1;
                if iter(&keys[0], value) == IterFlow::Stop {
                    break;
                }
            }
        }
        count
    }

    async fn put(&self, key: &Hash, value: &Bytes, priority: u32) -> Result<(), StoreError> {
        if *self.reject_puts.lock().unwrap() {
            return Err(StoreError::Invalid);
        }
        self.puts
            .lock()
            .unwrap()
            .push((key.clone(), value.clone(), priority));
        Ok(())
    }

    fn is_unique_reply(&self, _value: &Bytes, _block_type: BlockType, key: &Hash) -> bool {
        self.unique_keys.lock().unwrap().contains(key)
    }

    fn reply_fingerprint(&self, value: &Bytes) -> Hash {
        hash(value)
    }
}

/// Peer-book with no trust on file: debits clamp to zero, credits are
/// applied in full. Every call is recorded.
#[derive(Default)]
pub struct MockIdentity {
    pub changes: Mutex<Vec<(PeerId, i32)>>,
}

impl Identity for MockIdentity {
    fn change_trust(&self, peer: &PeerId, delta: i32) -> i32 {
        self.changes.lock().unwrap().push((peer.clone(), delta));
        if delta < 0 {
            0
        } else {
            delta
        }
    }
}

#[derive(Default)]
pub struct MockLoad {
    pub upload: Mutex<Option<u8>>,
    pub download: Mutex<Option<u8>>,
}

impl LoadMonitor for MockLoad {
    fn net_upload_percent(&self) -> Option<u8> {
        *self.upload.lock().unwrap()
    }

    fn net_download_percent(&self) -> Option<u8> {
        *self.download.lock().unwrap()
    }
}

#[derive(Default)]
pub struct MockPeers {
    pub connected: Mutex<Vec<PeerId>>,
}

impl MockPeers {
    pub fn connect(&self, peer: PeerId) {
        self.connected.lock().unwrap().push(peer);
    }
}

impl PeerDirectory for MockPeers {
    fn for_each_connected(&self, f: &mut dyn FnMut(&PeerId)) {
        for peer in self.connected.lock().unwrap().iter() {
            f(peer);
        }
    }

    fn index_of(&self, peer: &PeerId) -> u32 {
        self.connected
            .lock()
            .unwrap()
            .iter()
            .position(|p| p == peer)
            .map(|index| index as u32)
            // strangers land on a shared overflow index
            .unwrap_or(127)
    }

    fn estimated_network_size(&self) -> u32 {
        self.connected.lock().unwrap().len() as u32
    }
}

pub struct MockTraffic(pub Option<TrafficSummary>);

impl TrafficMonitor for MockTraffic {
    fn query_traffic(&self, _window: TimestampMillis) -> Option<TrafficSummary> {
        self.0
    }
}

pub struct TestBed {
    pub core: GapCore,
    pub my_id: PeerId,
    pub transport: Arc<MockTransport>,
    pub store: Arc<MockStore>,
    pub identity: Arc<MockIdentity>,
    pub load: Arc<MockLoad>,
    pub peers: Arc<MockPeers>,
}

pub fn test_bed(seed: u64) -> TestBed {
    test_bed_with_traffic(seed, None)
}

pub fn test_bed_with_traffic(seed: u64, traffic: Option<TrafficSummary>) -> TestBed {
    let _ = env_logger::builder().is_test(true).try_init();

    let my_id = peer("local-peer");
    let transport = Arc::new(MockTransport::default());
    let store = Arc::new(MockStore::default());
    let identity = Arc::new(MockIdentity::default());
    let load = Arc::new(MockLoad::default());
    let peers = Arc::new(MockPeers::default());

    let env = GapEnvironment {
        my_id: my_id.clone(),
        blockstore: store.clone(),
        transport: transport.clone(),
        identity: identity.clone(),
        load: load.clone(),
        peers: peers.clone(),
        traffic: Some(Arc::new(MockTraffic(traffic))),
    };

    let mut config = GapConfig::default();
    config.rng_seed = Some(seed);

    TestBed {
        core: GapCore::new(config, env),
        my_id,
        transport,
        store,
        identity,
        load,
        peers,
    }
}
