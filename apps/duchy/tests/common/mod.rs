//! In-process fakes of the duchy's collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use duchy::clients::{
    ActiveComputation, ActiveComputationStream, BlindLastLayerIndexThenJoinRegistersRequest,
    BlindOneLayerRegisterIndexRequest, ChunkStream, ClientError, ComputationChunk,
    ComputationControl, CryptoKeySet, CryptoWorker, DecryptOneLayerFlagAndCountRequest,
    GlobalComputations, GlobalState, MetricValues,
};
use duchy::mill::{Mill, MillContext};
use duchy_core::{
    CompletedReason, ComputationStorage, RedbComputationStorage, RequisitionKey, StorageConfig,
};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const OTHER_DUCHIES: [&str; 2] = ["Bavaria", "Carinthia"];
pub const NEXT_DUCHY: &str = "Bavaria";

pub fn storage() -> Arc<RedbComputationStorage> {
    Arc::new(
        RedbComputationStorage::in_memory(StorageConfig::new(
            OTHER_DUCHIES.iter().map(|d| d.to_string()).collect(),
        ))
        .expect("open"),
    )
}

pub fn key(text: &str) -> RequisitionKey {
    let parts: Vec<&str> = text.split('/').collect();
    RequisitionKey::new(parts[0], parts[1], parts[2])
}

// =============================================================================
// KINGDOM
// =============================================================================

#[derive(Default)]
pub struct FakeKingdom {
    pub active: Mutex<Vec<ActiveComputation>>,
    pub confirmed: Mutex<Vec<(String, Vec<RequisitionKey>)>>,
    pub outcomes: Mutex<Vec<(String, CompletedReason)>>,
    pub stream_calls: Mutex<Vec<String>>,
    /// Number of upcoming `report_outcome` calls that fail.
    pub failing_reports: AtomicUsize,
}

impl FakeKingdom {
    pub fn with_active(active: Vec<ActiveComputation>) -> Self {
        Self {
            active: Mutex::new(active),
            ..Self::default()
        }
    }

    pub fn failing_reports(count: usize) -> Self {
        Self {
            failing_reports: AtomicUsize::new(count),
            ..Self::default()
        }
    }
}

pub fn active(global_id: &str, state: GlobalState, requisitions: &[&str]) -> ActiveComputation {
    ActiveComputation {
        global_id: global_id.to_string(),
        state,
        requisitions: requisitions.iter().map(|k| key(k)).collect(),
        continuation_token: format!("token_for_{}", global_id),
    }
}

#[async_trait]
impl GlobalComputations for FakeKingdom {
    async fn stream_active_computations(
        &self,
        continuation_token: &str,
    ) -> Result<ActiveComputationStream, ClientError> {
        self.stream_calls
            .lock()
            .expect("lock")
            .push(continuation_token.to_string());
        let items = self.active.lock().expect("lock").clone();
        Ok(futures::stream::iter(items.into_iter().map(Ok)).boxed())
    }

    async fn confirm_requisitions(
        &self,
        global_id: &str,
        ready: &[RequisitionKey],
    ) -> Result<(), ClientError> {
        self.confirmed
            .lock()
            .expect("lock")
            .push((global_id.to_string(), ready.to_vec()));
        Ok(())
    }

    async fn report_outcome(
        &self,
        global_id: &str,
        reason: CompletedReason,
    ) -> Result<(), ClientError> {
        let failing = self
            .failing_reports
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClientError::ConnectionFailed("kingdom".to_string()));
        }
        self.outcomes
            .lock()
            .expect("lock")
            .push((global_id.to_string(), reason));
        Ok(())
    }
}

// =============================================================================
// METRIC VALUES
// =============================================================================

/// Serves stored payloads; listed keys fail with the given error kind.
#[derive(Default)]
pub struct FakeMetricValues {
    pub values: BTreeMap<String, Vec<u8>>,
    pub lost: Vec<String>,
    pub broken: Vec<String>,
}

#[async_trait]
impl MetricValues for FakeMetricValues {
    async fn fetch(&self, key: &RequisitionKey) -> Result<Vec<u8>, ClientError> {
        let name = key.to_string();
        if self.lost.contains(&name) {
            return Err(ClientError::DataLoss(name));
        }
        if self.broken.contains(&name) {
            return Err(ClientError::ServerError(500, name));
        }
        self.values
            .get(&name)
            .cloned()
            .ok_or(ClientError::NotFound(name))
    }
}

// =============================================================================
// PEERS
// =============================================================================

/// Records every chunk it receives, per stream kind.
#[derive(Default)]
pub struct FakePeer {
    pub sketches: Mutex<Vec<ComputationChunk>>,
    pub flag_counts: Mutex<Vec<ComputationChunk>>,
}

impl FakePeer {
    pub fn received_sketch(&self) -> Vec<u8> {
        join(&self.sketches.lock().expect("lock"))
    }

    pub fn received_flag_counts(&self) -> Vec<u8> {
        join(&self.flag_counts.lock().expect("lock"))
    }
}

fn join(chunks: &[ComputationChunk]) -> Vec<u8> {
    chunks.iter().flat_map(|c| c.data.iter().copied()).collect()
}

#[async_trait]
impl ComputationControl for FakePeer {
    async fn handle_concatenated_sketch(&self, chunks: ChunkStream) -> Result<(), ClientError> {
        let received: Vec<ComputationChunk> = chunks.collect().await;
        self.sketches.lock().expect("lock").extend(received);
        Ok(())
    }

    async fn handle_encrypted_flags_and_counts(
        &self,
        chunks: ChunkStream,
    ) -> Result<(), ClientError> {
        let received: Vec<ComputationChunk> = chunks.collect().await;
        self.flag_counts.lock().expect("lock").extend(received);
        Ok(())
    }
}

// =============================================================================
// CRYPTO
// =============================================================================

/// Tags its input with the operation so tests can see what ran.
#[derive(Default)]
pub struct FakeCrypto {
    pub calls: AtomicUsize,
    pub last_curve_id: Mutex<Option<i64>>,
}

impl FakeCrypto {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn tag(&self, prefix: &[u8], payload: &[u8], curve_id: i64) -> Vec<u8> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_curve_id.lock().expect("lock") = Some(curve_id);
        let mut out = prefix.to_vec();
        out.extend_from_slice(payload);
        out
    }
}

impl CryptoWorker for FakeCrypto {
    fn blind_one_layer_register_index(
        &self,
        request: &BlindOneLayerRegisterIndexRequest,
    ) -> Result<Vec<u8>, ClientError> {
        Ok(self.tag(b"blinded:", &request.sketch, request.curve_id))
    }

    fn blind_last_layer_index_then_join_registers(
        &self,
        request: &BlindLastLayerIndexThenJoinRegistersRequest,
    ) -> Result<Vec<u8>, ClientError> {
        Ok(self.tag(b"joined:", &request.sketch, request.curve_id))
    }

    fn decrypt_one_layer_flag_and_count(
        &self,
        request: &DecryptOneLayerFlagAndCountRequest,
    ) -> Result<Vec<u8>, ClientError> {
        Ok(self.tag(b"decrypted:", &request.flag_counts, request.curve_id))
    }
}

// =============================================================================
// HARNESS
// =============================================================================

pub struct Harness {
    pub storage: Arc<RedbComputationStorage>,
    pub kingdom: Arc<FakeKingdom>,
    pub peer: Arc<FakePeer>,
    pub crypto: Arc<FakeCrypto>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            storage: storage(),
            kingdom: Arc::new(FakeKingdom::default()),
            peer: Arc::new(FakePeer::default()),
            crypto: Arc::new(FakeCrypto::default()),
        }
    }

    pub fn context(&self, metric_values: FakeMetricValues, chunk_size: usize) -> MillContext {
        let peer: Arc<dyn ComputationControl> = Arc::clone(&self.peer) as _;
        let mut peers = BTreeMap::new();
        peers.insert(NEXT_DUCHY.to_string(), peer);
        MillContext {
            storage: Arc::clone(&self.storage) as Arc<dyn ComputationStorage>,
            kingdom: Arc::clone(&self.kingdom) as _,
            metric_values: Arc::new(metric_values),
            peers,
            crypto: Arc::clone(&self.crypto) as _,
            keys: CryptoKeySet {
                curve_id: 415,
                ..CryptoKeySet::default()
            },
            chunk_size,
        }
    }

    pub fn mill(&self, id: &str, metric_values: FakeMetricValues) -> Mill {
        Mill::new(id, self.context(metric_values, 4), Duration::from_millis(10))
    }
}
