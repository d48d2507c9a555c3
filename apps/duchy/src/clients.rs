//! # Collaborator Contracts
//!
//! The mill and the herald talk to four parties they do not own:
//!
//! - the kingdom (`GlobalComputations`): active computations, requisition
//!   confirmation and outcome reports
//! - this duchy's metric-value store (`MetricValues`)
//! - peer duchies (`ComputationControl`): one-way chunk streams
//! - the crypto engine (`CryptoWorker`): synchronous sketch transforms
//!
//! Network-facing implementations live in [`crate::remote`]; tests plug in
//! in-process fakes.

use async_trait::async_trait;
use bytes::Bytes;
use duchy_core::{CompletedReason, RequisitionKey};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

/// Errors from the collaborator layer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The requested item does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The item existed but its data is lost.
    #[error("Data loss: {0}")]
    DataLoss(String),

    /// Cannot reach the remote service.
    #[error("Cannot connect to {0}")]
    ConnectionFailed(String),

    /// The remote service answered with an error status.
    #[error("Server error ({0}): {1}")]
    ServerError(u16, String),

    /// Failed to parse a response body.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// The crypto engine failed.
    #[error("Crypto error: {0}")]
    Crypto(String),
}

impl ClientError {
    /// Check whether this error means a requisition's data is unavailable
    /// rather than a transport or service failure.
    #[must_use]
    pub fn is_missing_data(&self) -> bool {
        matches!(self, ClientError::NotFound(_) | ClientError::DataLoss(_))
    }
}

// =============================================================================
// KINGDOM
// =============================================================================

/// A computation's state as the kingdom reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalState {
    Confirming,
    Running,
    Suspended,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

/// One entry of the kingdom's active-computation stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveComputation {
    pub global_id: String,
    pub state: GlobalState,
    #[serde(default)]
    pub requisitions: Vec<RequisitionKey>,
    /// Resume point for the next stream request.
    pub continuation_token: String,
}

/// Stream of active computations, ending when the kingdom has nothing newer.
pub type ActiveComputationStream = BoxStream<'static, Result<ActiveComputation, ClientError>>;

/// The kingdom's global computations service.
#[async_trait]
pub trait GlobalComputations: Send + Sync {
    /// Stream the active computations after `continuation_token` (empty for
    /// the beginning).
    async fn stream_active_computations(
        &self,
        continuation_token: &str,
    ) -> Result<ActiveComputationStream, ClientError>;

    /// Report which requisitions this duchy can provide data for.
    async fn confirm_requisitions(
        &self,
        global_id: &str,
        ready: &[RequisitionKey],
    ) -> Result<(), ClientError>;

    /// Report how this duchy's part of a computation ended.
    async fn report_outcome(
        &self,
        global_id: &str,
        reason: CompletedReason,
    ) -> Result<(), ClientError>;
}

// =============================================================================
// METRIC VALUES
// =============================================================================

/// This duchy's store of encrypted sketches, keyed by requisition.
#[async_trait]
pub trait MetricValues: Send + Sync {
    /// Fetch the full payload of one requisition.
    ///
    /// Returns `ClientError::NotFound` or `ClientError::DataLoss` when the
    /// data is unavailable.
    async fn fetch(&self, key: &RequisitionKey) -> Result<Vec<u8>, ClientError>;
}

// =============================================================================
// PEER DUCHIES
// =============================================================================

/// A slice of a forwarded payload, tagged with its computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationChunk {
    pub global_id: String,
    pub data: Bytes,
}

/// A one-way stream of chunks sent to a peer.
pub type ChunkStream = BoxStream<'static, ComputationChunk>;

/// Inbound control surface of a peer duchy.
#[async_trait]
pub trait ComputationControl: Send + Sync {
    /// Deliver a concatenated (blinded) sketch.
    async fn handle_concatenated_sketch(&self, chunks: ChunkStream) -> Result<(), ClientError>;

    /// Deliver encrypted flags and counts.
    async fn handle_encrypted_flags_and_counts(
        &self,
        chunks: ChunkStream,
    ) -> Result<(), ClientError>;
}

// =============================================================================
// CRYPTO
// =============================================================================

/// Key material used by every crypto transform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoKeySet {
    /// This duchy's ElGamal public key.
    pub own_public_key: Vec<u8>,
    /// This duchy's ElGamal private key.
    pub own_private_key: Vec<u8>,
    /// The composite public key the data providers encrypted with.
    pub client_public_key: Vec<u8>,
    pub curve_id: i64,
}

/// Strip one layer of encryption from register indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlindOneLayerRegisterIndexRequest {
    pub local_el_gamal_public_key: Vec<u8>,
    pub local_el_gamal_private_key: Vec<u8>,
    pub composite_el_gamal_public_key: Vec<u8>,
    pub curve_id: i64,
    pub sketch: Vec<u8>,
}

/// Strip the last index layer and join registers into flags and counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlindLastLayerIndexThenJoinRegistersRequest {
    pub local_el_gamal_public_key: Vec<u8>,
    pub local_el_gamal_private_key: Vec<u8>,
    pub composite_el_gamal_public_key: Vec<u8>,
    pub curve_id: i64,
    pub sketch: Vec<u8>,
}

/// Strip one layer of encryption from flags and counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptOneLayerFlagAndCountRequest {
    pub local_el_gamal_public_key: Vec<u8>,
    pub local_el_gamal_private_key: Vec<u8>,
    pub curve_id: i64,
    pub flag_counts: Vec<u8>,
}

impl CryptoKeySet {
    /// Build a blind-one-layer request for `sketch`.
    #[must_use]
    pub fn blind_one_layer(&self, sketch: Vec<u8>) -> BlindOneLayerRegisterIndexRequest {
        BlindOneLayerRegisterIndexRequest {
            local_el_gamal_public_key: self.own_public_key.clone(),
            local_el_gamal_private_key: self.own_private_key.clone(),
            composite_el_gamal_public_key: self.client_public_key.clone(),
            curve_id: self.curve_id,
            sketch,
        }
    }

    /// Build a blind-last-layer-and-join request for `sketch`.
    #[must_use]
    pub fn blind_last_layer(&self, sketch: Vec<u8>) -> BlindLastLayerIndexThenJoinRegistersRequest {
        BlindLastLayerIndexThenJoinRegistersRequest {
            local_el_gamal_public_key: self.own_public_key.clone(),
            local_el_gamal_private_key: self.own_private_key.clone(),
            composite_el_gamal_public_key: self.client_public_key.clone(),
            curve_id: self.curve_id,
            sketch,
        }
    }

    /// Build a decrypt-one-layer request for `flag_counts`.
    #[must_use]
    pub fn decrypt_one_layer(&self, flag_counts: Vec<u8>) -> DecryptOneLayerFlagAndCountRequest {
        DecryptOneLayerFlagAndCountRequest {
            local_el_gamal_public_key: self.own_public_key.clone(),
            local_el_gamal_private_key: self.own_private_key.clone(),
            curve_id: self.curve_id,
            flag_counts,
        }
    }
}

/// The synchronous crypto engine.
///
/// Calls are CPU-bound and may take a long time; the mill runs them on the
/// blocking pool.
pub trait CryptoWorker: Send + Sync {
    fn blind_one_layer_register_index(
        &self,
        request: &BlindOneLayerRegisterIndexRequest,
    ) -> Result<Vec<u8>, ClientError>;

    fn blind_last_layer_index_then_join_registers(
        &self,
        request: &BlindLastLayerIndexThenJoinRegistersRequest,
    ) -> Result<Vec<u8>, ClientError>;

    fn decrypt_one_layer_flag_and_count(
        &self,
        request: &DecryptOneLayerFlagAndCountRequest,
    ) -> Result<Vec<u8>, ClientError>;
}

// =============================================================================
// TESTS
// =============================================================================
