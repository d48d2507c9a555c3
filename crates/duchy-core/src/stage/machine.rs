//! # Stage Machine
//!
//! ## Stage Graph
//!
//! | Code | Stage | Kind | Successors |
//! |------|-------|------|------------|
//! | 1 | ToConfirmRequisitions | work | WaitToStart (secondary), WaitSketches (primary) |
//! | 2 | WaitToStart | wait | ToAddNoise |
//! | 3 | WaitSketches | wait | ToAppendSketchesAndAddNoise |
//! | 4 | ToAddNoise | work | WaitConcatenated |
//! | 5 | ToAppendSketchesAndAddNoise | work | WaitConcatenated |
//! | 6 | WaitConcatenated | wait | ToBlindPositions (secondary), ToBlindPositionsAndJoinRegisters (primary) |
//! | 7 | ToBlindPositions | work | WaitFlagCounts |
//! | 8 | ToBlindPositionsAndJoinRegisters | work | WaitFlagCounts |
//! | 9 | WaitFlagCounts | wait | ToDecryptFlagCounts (secondary), ToDecryptFlagCountsAndComputeMetrics (primary) |
//! | 10 | ToDecryptFlagCounts | work | Completed |
//! | 11 | ToDecryptFlagCountsAndComputeMetrics | work | Completed |
//! | 12 | Completed | terminal | - |
//!
//! `Unknown` (code 0) and `Unrecognized` (no code) are sentinels. Neither is
//! ever the source or destination of a transition, and `Unrecognized` is
//! never persisted.

use crate::types::{DuchyError, Role};
use serde::{Deserialize, Serialize};

// =============================================================================
// STAGE ENUM
// =============================================================================

/// Stages of a Liquid Legions sketch aggregation computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Default value of an unset stage.
    Unknown,
    ToConfirmRequisitions,
    WaitToStart,
    WaitSketches,
    ToAddNoise,
    ToAppendSketchesAndAddNoise,
    WaitConcatenated,
    ToBlindPositions,
    ToBlindPositionsAndJoinRegisters,
    WaitFlagCounts,
    ToDecryptFlagCounts,
    ToDecryptFlagCountsAndComputeMetrics,
    Completed,
    /// A stored code with no known mapping.
    Unrecognized,
}

/// Every stage that has a durable code, in code order.
pub const ENCODABLE_STAGES: [Stage; 13] = [
    Stage::Unknown,
    Stage::ToConfirmRequisitions,
    Stage::WaitToStart,
    Stage::WaitSketches,
    Stage::ToAddNoise,
    Stage::ToAppendSketchesAndAddNoise,
    Stage::WaitConcatenated,
    Stage::ToBlindPositions,
    Stage::ToBlindPositionsAndJoinRegisters,
    Stage::WaitFlagCounts,
    Stage::ToDecryptFlagCounts,
    Stage::ToDecryptFlagCountsAndComputeMetrics,
    Stage::Completed,
];

/// Number of input and output blob slots a stage declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobLayout {
    pub inputs: usize,
    pub outputs: usize,
}

impl BlobLayout {
    const fn new(inputs: usize, outputs: usize) -> Self {
        Self { inputs, outputs }
    }

    /// Check whether the stage produces exactly one output blob.
    #[must_use]
    pub fn has_single_output(&self) -> bool {
        self.outputs == 1
    }
}

impl Stage {
    /// Get the stage name as used in logs and blob paths.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Unknown => "UNKNOWN",
            Stage::ToConfirmRequisitions => "TO_CONFIRM_REQUISITIONS",
            Stage::WaitToStart => "WAIT_TO_START",
            Stage::WaitSketches => "WAIT_SKETCHES",
            Stage::ToAddNoise => "TO_ADD_NOISE",
            Stage::ToAppendSketchesAndAddNoise => "TO_APPEND_SKETCHES_AND_ADD_NOISE",
            Stage::WaitConcatenated => "WAIT_CONCATENATED",
            Stage::ToBlindPositions => "TO_BLIND_POSITIONS",
            Stage::ToBlindPositionsAndJoinRegisters => "TO_BLIND_POSITIONS_AND_JOIN_REGISTERS",
            Stage::WaitFlagCounts => "WAIT_FLAG_COUNTS",
            Stage::ToDecryptFlagCounts => "TO_DECRYPT_FLAG_COUNTS",
            Stage::ToDecryptFlagCountsAndComputeMetrics => {
                "TO_DECRYPT_FLAG_COUNTS_AND_COMPUTE_METRICS"
            }
            Stage::Completed => "COMPLETED",
            Stage::Unrecognized => "UNRECOGNIZED",
        }
    }

    /// Check if this is one of the two sentinel values.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Stage::Unknown | Stage::Unrecognized)
    }

    /// Check if the computation is parked waiting on another party.
    ///
    /// Wait stages are never handed out by `claim_work`.
    #[must_use]
    pub fn is_wait_stage(&self) -> bool {
        matches!(
            self,
            Stage::WaitToStart | Stage::WaitSketches | Stage::WaitConcatenated | Stage::WaitFlagCounts
        )
    }

    /// Check if this stage is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed)
    }

    /// Check if a mill may claim a computation in this stage.
    #[must_use]
    pub fn is_workable(&self) -> bool {
        !self.is_sentinel() && !self.is_wait_stage() && !self.is_terminal()
    }

    /// Legal destinations from this stage, across both roles.
    #[must_use]
    pub fn successors(&self) -> &'static [Stage] {
        match self {
            Stage::ToConfirmRequisitions => &[Stage::WaitToStart, Stage::WaitSketches],
            Stage::WaitToStart => &[Stage::ToAddNoise],
            Stage::WaitSketches => &[Stage::ToAppendSketchesAndAddNoise],
            Stage::ToAddNoise | Stage::ToAppendSketchesAndAddNoise => &[Stage::WaitConcatenated],
            Stage::WaitConcatenated => &[
                Stage::ToBlindPositions,
                Stage::ToBlindPositionsAndJoinRegisters,
            ],
            Stage::ToBlindPositions | Stage::ToBlindPositionsAndJoinRegisters => {
                &[Stage::WaitFlagCounts]
            }
            Stage::WaitFlagCounts => &[
                Stage::ToDecryptFlagCounts,
                Stage::ToDecryptFlagCountsAndComputeMetrics,
            ],
            Stage::ToDecryptFlagCounts | Stage::ToDecryptFlagCountsAndComputeMetrics => {
                &[Stage::Completed]
            }
            Stage::Completed | Stage::Unknown | Stage::Unrecognized => &[],
        }
    }

    /// The successor a duchy playing `role` moves to from this stage.
    ///
    /// Primary and secondary duchies diverge after requisition confirmation,
    /// after the concatenated sketch arrives and after the flag counts arrive.
    #[must_use]
    pub fn successor_for(&self, role: Role) -> Option<Stage> {
        match (self, role) {
            (Stage::ToConfirmRequisitions, Role::Primary) => Some(Stage::WaitSketches),
            (Stage::ToConfirmRequisitions, Role::Secondary) => Some(Stage::WaitToStart),
            (Stage::WaitConcatenated, Role::Primary) => {
                Some(Stage::ToBlindPositionsAndJoinRegisters)
            }
            (Stage::WaitConcatenated, Role::Secondary) => Some(Stage::ToBlindPositions),
            (Stage::WaitFlagCounts, Role::Primary) => {
                Some(Stage::ToDecryptFlagCountsAndComputeMetrics)
            }
            (Stage::WaitFlagCounts, Role::Secondary) => Some(Stage::ToDecryptFlagCounts),
            (stage, _) => stage.successors().first().copied(),
        }
    }

    /// Blob slots declared by this stage, given the number of other duchies
    /// taking part in the computation.
    #[must_use]
    pub fn blob_layout(&self, other_duchies: usize) -> BlobLayout {
        match self {
            Stage::ToConfirmRequisitions => BlobLayout::new(0, 1),
            Stage::WaitToStart => BlobLayout::new(1, 0),
            Stage::WaitSketches => BlobLayout::new(1, other_duchies),
            Stage::ToAppendSketchesAndAddNoise => {
                BlobLayout::new(other_duchies.saturating_add(1), 1)
            }
            Stage::ToAddNoise
            | Stage::WaitConcatenated
            | Stage::ToBlindPositions
            | Stage::ToBlindPositionsAndJoinRegisters
            | Stage::WaitFlagCounts
            | Stage::ToDecryptFlagCounts
            | Stage::ToDecryptFlagCountsAndComputeMetrics => BlobLayout::new(1, 1),
            Stage::Completed | Stage::Unknown | Stage::Unrecognized => BlobLayout::new(0, 0),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// STAGE MACHINE OPERATIONS
// =============================================================================

/// Check whether a computation may be created in `stage`.
#[must_use]
pub fn valid_initial_state(stage: Stage) -> bool {
    stage == Stage::ToConfirmRequisitions
}

/// Check whether `from -> to` is a legal transition.
#[must_use]
pub fn valid_transition(from: Stage, to: Stage) -> bool {
    if from.is_sentinel() || to.is_sentinel() {
        return false;
    }
    from.successors().contains(&to)
}

/// Encode a stage as its durable integer code.
///
/// # Errors
///
/// Returns `DuchyError::UnrecognizedStage` for [`Stage::Unrecognized`], which
/// must never be persisted.
pub fn encode(stage: Stage) -> Result<i64, DuchyError> {
    let code = match stage {
        Stage::Unknown => 0,
        Stage::ToConfirmRequisitions => 1,
        Stage::WaitToStart => 2,
        Stage::WaitSketches => 3,
        Stage::ToAddNoise => 4,
        Stage::ToAppendSketchesAndAddNoise => 5,
        Stage::WaitConcatenated => 6,
        Stage::ToBlindPositions => 7,
        Stage::ToBlindPositionsAndJoinRegisters => 8,
        Stage::WaitFlagCounts => 9,
        Stage::ToDecryptFlagCounts => 10,
        Stage::ToDecryptFlagCountsAndComputeMetrics => 11,
        Stage::Completed => 12,
        Stage::Unrecognized => return Err(DuchyError::UnrecognizedStage(None)),
    };
    Ok(code)
}

/// Decode a durable integer code.
///
/// Never fails: any code without a mapping (negative, out of range) decodes
/// to [`Stage::Unrecognized`].
#[must_use]
pub fn decode(code: i64) -> Stage {
    usize::try_from(code)
        .ok()
        .and_then(|index| ENCODABLE_STAGES.get(index).copied())
        .unwrap_or(Stage::Unrecognized)
}

// =============================================================================
// TESTS
// =============================================================================
