//! # Peer records and the persistence seam
//!
//! A [`PeerRecord`] is the durable knowledge about one remote peer:
//! endpoint, key material, NAT flag and the credit/liveness counters the
//! routing table's priority score is computed from. Connections write a
//! record on every successful authentication and flush it again on reset
//! or teardown.
//!
//! Actual persistence is an external collaborator behind the
//! [`PeerStore`] trait; this crate only ships [`MemoryPeerStore`], used
//! by tests and the demo binary. The store is called from the node's
//! context but must itself tolerate concurrent callers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::crypto::DH_LEN;
use crate::identity::NodeId;

/// Milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Durable knowledge about one remote peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: NodeId,
    pub endpoint: SocketAddr,
    pub public_key: [u8; 32],
    /// Last derived symmetric session key, if any.
    pub session_key: Option<[u8; DH_LEN]>,
    /// NAT hint from the auth endpoint comparison. Best effort only.
    pub behind_nat: bool,
    pub rank: u32,
    pub data_provided: u64,
    pub payment_received: u64,
    pub uptime_secs: u64,
    pub latency_ms: u32,
    pub bandwidth: u64,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

impl PeerRecord {
    pub fn new(id: NodeId, endpoint: SocketAddr, public_key: [u8; 32]) -> Self {
        let now = now_ms();
        Self {
            id,
            endpoint,
            public_key,
            session_key: None,
            behind_nat: false,
            rank: 0,
            data_provided: 0,
            payment_received: 0,
            uptime_secs: 0,
            latency_ms: 0,
            bandwidth: 0,
            first_seen_ms: now,
            last_seen_ms: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen_ms = now_ms();
    }
}

/// A node discovered through the overlay: where it is and, for
/// NAT-restricted peers, which relays can introduce us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub id: NodeId,
    pub endpoint: SocketAddr,
    pub relays: Vec<SocketAddr>,
}

impl Host {
    pub fn new(id: NodeId, endpoint: SocketAddr) -> Self {
        Self {
            id,
            endpoint,
            relays: Vec::new(),
        }
    }
}

/// Persistence collaborator for peer records. Implemented outside this
/// crate for real database backends.
#[async_trait]
pub trait PeerStore: Send + Sync + 'static {
    async fn store(&self, record: PeerRecord);
    async fn fetch(&self, id: &NodeId) -> Option<PeerRecord>;
    async fn fetch_by_endpoint(&self, endpoint: &SocketAddr) -> Option<PeerRecord>;
}

/// In-memory store for tests and the demo binary.
#[derive(Default)]
pub struct MemoryPeerStore {
    records: Mutex<HashMap<NodeId, PeerRecord>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn store(&self, record: PeerRecord) {
        self.records.lock().await.insert(record.id, record);
    }

    async fn fetch(&self, id: &NodeId) -> Option<PeerRecord> {
        self.records.lock().await.get(id).cloned()
    }

    async fn fetch_by_endpoint(&self, endpoint: &SocketAddr) -> Option<PeerRecord> {
        self.records
            .lock()
            .await
            .values()
            .find(|r| r.endpoint == *endpoint)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ID_LEN;

    fn record(byte: u8, port: u16) -> PeerRecord {
        PeerRecord::new(
            NodeId::from_bytes([byte; ID_LEN]),
            format!("127.0.0.1:{port}").parse().unwrap(),
            [byte; 32],
        )
    }

    #[tokio::test]
    async fn store_and_fetch_by_id_and_endpoint() {
        let store = MemoryPeerStore::new();
        let rec = record(1, 9001);
        store.store(rec.clone()).await;

        let by_id = store.fetch(&rec.id).await.expect("by id");
        assert_eq!(by_id.endpoint, rec.endpoint);

        let by_ep = store
            .fetch_by_endpoint(&rec.endpoint)
            .await
            .expect("by endpoint");
        assert_eq!(by_ep.id, rec.id);

        assert!(store.fetch(&record(2, 9002).id).await.is_none());
    }

    #[tokio::test]
    async fn store_overwrites_existing_record() {
        let store = MemoryPeerStore::new();
        let mut rec = record(3, 9003);
        store.store(rec.clone()).await;
        rec.data_provided = 4096;
        store.store(rec.clone()).await;
        assert_eq!(store.fetch(&rec.id).await.unwrap().data_provided, 4096);
    }
}
