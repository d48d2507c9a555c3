//! # Record Format
//!
//! Binary serialization for persisted computations.
//!
//! Format: 1 byte format version + postcard-serialized record.
//!
//! The stage is stored as its integer code (see [`crate::stage::encode`]) and
//! the stage details as their own postcard blob, so both remain readable
//! independently of how the Rust enums evolve. A record whose stored code
//! decodes to `Unrecognized` is refused rather than turned into a token.

use crate::stage::{self, Stage};
use crate::types::{
    BlobMetadata, CompletedReason, ComputationToken, ComputationType, DuchyError, Role,
    StageDetails,
};
use serde::{Deserialize, Serialize};

/// Current record format version.
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Maximum accepted size of an encoded record.
///
/// Records only carry metadata; blob bytes live in their own table.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024; // 16 MB

// =============================================================================
// STAGE DETAILS
// =============================================================================

/// Encode stage details for storage.
pub fn stage_details_to_bytes(details: &StageDetails) -> Result<Vec<u8>, DuchyError> {
    postcard::to_allocvec(details).map_err(|e| DuchyError::Serialization(e.to_string()))
}

/// Decode stage details written by [`stage_details_to_bytes`].
pub fn stage_details_from_bytes(bytes: &[u8]) -> Result<StageDetails, DuchyError> {
    postcard::from_bytes(bytes).map_err(|e| DuchyError::Serialization(e.to_string()))
}

// =============================================================================
// COMPUTATION RECORD
// =============================================================================

/// A computation as stored in the `computations` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationRecord {
    pub local_id: u64,
    pub global_id: String,
    pub computation_type: ComputationType,
    /// Durable stage code.
    pub stage_code: i64,
    pub role: Role,
    pub version: u64,
    pub next_duchy: String,
    pub blobs: Vec<BlobMetadata>,
    /// Encoded [`StageDetails`].
    pub details: Vec<u8>,
    pub completed_reason: Option<CompletedReason>,
    /// Mill currently holding the computation.
    pub owner: Option<String>,
    /// Unix millis after which another mill may take over the claim.
    pub lock_expires_at_ms: u64,
    /// Unix millis of the last write.
    pub updated_at_ms: u64,
}

impl ComputationRecord {
    /// The decoded stage, refusing codes without a mapping.
    pub fn stage(&self) -> Result<Stage, DuchyError> {
        match stage::decode(self.stage_code) {
            Stage::Unrecognized => Err(DuchyError::UnrecognizedStage(Some(self.stage_code))),
            stage => Ok(stage),
        }
    }

    /// Build the token handed to callers for this record.
    pub fn to_token(&self) -> Result<ComputationToken, DuchyError> {
        Ok(ComputationToken {
            local_id: self.local_id,
            global_id: self.global_id.clone(),
            computation_type: self.computation_type,
            stage: self.stage()?,
            role: self.role,
            version: self.version,
            next_duchy: self.next_duchy.clone(),
            blobs: self.blobs.clone(),
            details: stage_details_from_bytes(&self.details)?,
            completed_reason: self.completed_reason,
        })
    }

    /// Check whether the record is held by a mill other than `owner` at `now_ms`.
    #[must_use]
    pub fn is_locked_against(&self, owner: &str, now_ms: u64) -> bool {
        match &self.owner {
            Some(current) => current != owner && self.lock_expires_at_ms > now_ms,
            None => false,
        }
    }

    /// Release any claim on the record.
    pub fn release_claim(&mut self) {
        self.owner = None;
        self.lock_expires_at_ms = 0;
    }
}

/// Serialize a record with its format version prefix.
pub fn record_to_bytes(record: &ComputationRecord) -> Result<Vec<u8>, DuchyError> {
    let payload =
        postcard::to_allocvec(record).map_err(|e| DuchyError::Serialization(e.to_string()))?;
    let mut bytes = Vec::with_capacity(payload.len().saturating_add(1));
    bytes.push(RECORD_FORMAT_VERSION);
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Deserialize a record, validating its version and size first.
pub fn record_from_bytes(bytes: &[u8]) -> Result<ComputationRecord, DuchyError> {
    if bytes.len() > MAX_RECORD_SIZE {
        return Err(DuchyError::Serialization(format!(
            "Record size {} exceeds maximum {}",
            bytes.len(),
            MAX_RECORD_SIZE
        )));
    }
    let (version, payload) = bytes
        .split_first()
        .ok_or_else(|| DuchyError::Serialization("Empty record".to_string()))?;
    if *version != RECORD_FORMAT_VERSION {
        return Err(DuchyError::Serialization(format!(
            "Unsupported record version: {} (expected {})",
            version, RECORD_FORMAT_VERSION
        )));
    }
    postcard::from_bytes(payload).map_err(|e| DuchyError::Serialization(e.to_string()))
}

// =============================================================================
// TESTS
// =============================================================================
