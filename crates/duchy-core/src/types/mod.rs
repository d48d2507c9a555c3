//! # Core Type Definitions
//!
//! This module contains the value types shared by the stage machine, the
//! storage layer and the workers that drive computations:
//! - Computation handles (`ComputationToken`, `Role`, `ComputationType`)
//! - Blob slots (`BlobMetadata`, `BlobDependency`)
//! - Stage-specific payloads (`StageDetails`, `RequisitionKey`)
//! - Error types (`DuchyError`)
//!
//! ## Token Discipline
//!
//! A `ComputationToken` is never mutated in place by storage. Every
//! successful write hands back a fresh token carrying the next edit version;
//! the old token becomes stale and any further write through it fails.

use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

// =============================================================================
// COMPUTATION IDENTITY
// =============================================================================

/// The protocol a computation runs. Claims are scoped to one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ComputationType {
    /// Liquid Legions sketch aggregation, version 1.
    LiquidLegionsSketchAggregationV1,
}

/// The part a duchy plays in one computation.
///
/// Primary and secondary duchies run different stages at several points of
/// the protocol (see [`Stage::successor_for`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The coordinating duchy: joins sketches and computes the final metrics.
    Primary,
    /// A non-coordinating duchy.
    Secondary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Secondary => write!(f, "secondary"),
        }
    }
}

/// Why a computation reached its terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedReason {
    Succeeded,
    Failed,
    Canceled,
}

impl std::fmt::Display for CompletedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletedReason::Succeeded => write!(f, "succeeded"),
            CompletedReason::Failed => write!(f, "failed"),
            CompletedReason::Canceled => write!(f, "canceled"),
        }
    }
}

// =============================================================================
// BLOB METADATA
// =============================================================================

/// Whether a blob slot feeds the current stage or is produced by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobDependency {
    Input,
    Output,
}

/// One input or output slot of the current stage.
///
/// Input slots always reference a stored blob. Output slots are empty until
/// the stage (or, for wait stages, a peer duchy) writes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub blob_id: u64,
    pub dependency: BlobDependency,
    pub path: Option<String>,
}

impl BlobMetadata {
    /// An input slot referencing an already stored blob.
    #[must_use]
    pub fn input(blob_id: u64, path: impl Into<String>) -> Self {
        Self {
            blob_id,
            dependency: BlobDependency::Input,
            path: Some(path.into()),
        }
    }

    /// An output slot that has not been written yet.
    #[must_use]
    pub fn empty_output(blob_id: u64) -> Self {
        Self {
            blob_id,
            dependency: BlobDependency::Output,
            path: None,
        }
    }

    /// Check whether this is an output slot.
    #[must_use]
    pub fn is_output(&self) -> bool {
        self.dependency == BlobDependency::Output
    }
}

// =============================================================================
// STAGE DETAILS
// =============================================================================

/// A data provider's commitment to supply a sketch for a campaign.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequisitionKey {
    pub data_provider_id: String,
    pub campaign_id: String,
    pub metric_requisition_id: String,
}

impl RequisitionKey {
    /// Create a new requisition key.
    #[must_use]
    pub fn new(
        data_provider_id: impl Into<String>,
        campaign_id: impl Into<String>,
        metric_requisition_id: impl Into<String>,
    ) -> Self {
        Self {
            data_provider_id: data_provider_id.into(),
            campaign_id: campaign_id.into(),
            metric_requisition_id: metric_requisition_id.into(),
        }
    }
}

impl std::fmt::Display for RequisitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.data_provider_id, self.campaign_id, self.metric_requisition_id
        )
    }
}

/// Stage-specific payload carried by a token.
///
/// The encoded form (see [`crate::formats`]) is a durable contract: a stored
/// value must decode to exactly what was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StageDetails {
    /// No payload for this stage.
    #[default]
    None,
    /// Requisitions that must be confirmed before the computation starts.
    ToConfirmRequisitions { keys: Vec<RequisitionKey> },
    /// Which output slot receives each other duchy's sketch.
    WaitSketches {
        external_duchy_local_blob_ids: BTreeMap<String, u64>,
    },
}

impl StageDetails {
    /// The requisition keys of a confirm-requisitions payload (empty otherwise).
    #[must_use]
    pub fn requisition_keys(&self) -> &[RequisitionKey] {
        match self {
            StageDetails::ToConfirmRequisitions { keys } => keys,
            _ => &[],
        }
    }
}

// =============================================================================
// COMPUTATION TOKEN
// =============================================================================

/// Versioned handle on a computation's persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationToken {
    /// Storage-local identifier.
    pub local_id: u64,
    /// Kingdom-side identifier, shared by every duchy.
    pub global_id: String,
    pub computation_type: ComputationType,
    pub stage: Stage,
    pub role: Role,
    /// Edit version for optimistic concurrency.
    pub version: u64,
    /// The duchy that receives this duchy's partial results.
    pub next_duchy: String,
    pub blobs: Vec<BlobMetadata>,
    pub details: StageDetails,
    /// Set once the computation is finished.
    pub completed_reason: Option<CompletedReason>,
}

impl ComputationToken {
    /// Input slots, in blob-id order.
    pub fn inputs(&self) -> impl Iterator<Item = &BlobMetadata> {
        self.blobs.iter().filter(|b| !b.is_output())
    }

    /// Output slots, in blob-id order.
    pub fn outputs(&self) -> impl Iterator<Item = &BlobMetadata> {
        self.blobs.iter().filter(|b| b.is_output())
    }

    /// Paths of every input slot.
    #[must_use]
    pub fn input_paths(&self) -> Vec<String> {
        self.inputs().filter_map(|b| b.path.clone()).collect()
    }

    /// Paths of every written output slot.
    #[must_use]
    pub fn output_paths(&self) -> Vec<String> {
        self.outputs().filter_map(|b| b.path.clone()).collect()
    }

    /// The single output slot of a single-output stage.
    ///
    /// Returns `DuchyError::BlobLayout` if the token has zero or several
    /// output slots.
    pub fn single_output(&self) -> Result<&BlobMetadata, DuchyError> {
        let mut outputs = self.outputs();
        match (outputs.next(), outputs.next()) {
            (Some(output), None) => Ok(output),
            _ => Err(DuchyError::BlobLayout(format!(
                "stage {:?} of computation {} does not have a single output blob",
                self.stage, self.global_id
            ))),
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors raised by the stage machine and computation storage.
///
/// - No silent failures
/// - The core never panics; every failure is returned to the caller
#[derive(Debug, Error)]
pub enum DuchyError {
    /// The token's edit version no longer matches the stored computation.
    #[error("Stale token for computation {local_id}: token version {token_version}, stored version {stored_version}")]
    StaleToken {
        local_id: u64,
        token_version: u64,
        stored_version: u64,
    },

    /// The stage machine rejected a transition.
    #[error("Illegal transition: {from:?} -> {to:?}")]
    IllegalTransition { from: Stage, to: Stage },

    /// The unrecognized sentinel reached a place that needs a real stage.
    #[error("Unrecognized stage (code {0:?})")]
    UnrecognizedStage(Option<i64>),

    /// The requested computation or blob does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A computation with this global id already exists.
    #[error("Computation already exists: {0}")]
    AlreadyExists(String),

    /// The token's blob slots do not match what the operation needs.
    #[error("Blob layout error: {0}")]
    BlobLayout(String),

    /// `finish_computation` was asked to end in a non-terminal stage.
    #[error("Stage {0:?} is not terminal")]
    NotTerminal(Stage),

    /// The computation has already been finished.
    #[error("Computation already finished: {0}")]
    AlreadyFinished(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The storage engine reported an error.
    #[error("Storage error: {0}")]
    Storage(String),
}

// =============================================================================
// TESTS
// =============================================================================
