//! # Computation Storage
//!
//! The contract every worker uses to read and advance computations, and its
//! redb-backed implementation.
//!
//! ## Concurrency
//!
//! Storage is the only synchronization point between mills and the herald.
//! Each operation runs in one transaction, and every write checks the
//! token's edit version first: a write through a stale token fails instead
//! of overwriting newer state. `claim_work` selects and assigns in the same
//! transaction, so no two mills ever hold the same computation.

mod redb_store;

pub use redb_store::RedbComputationStorage;

use crate::stage::Stage;
use crate::types::{
    CompletedReason, ComputationToken, ComputationType, DuchyError, Role, StageDetails,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default time a claim stays exclusive to its mill.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(300);

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Order in which `claim_work` picks among several eligible computations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOrder {
    /// Oldest computation first.
    #[default]
    Fifo,
    /// Computation written longest ago first.
    LeastRecentlyUpdated,
}

/// Settings shared by every storage implementation.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// The other duchies of the computation, in protocol order. Sizes the
    /// sketch-collection stages and names their output slots.
    pub other_duchies: Vec<String>,
    /// How long a claim stays exclusive before another mill may take over.
    pub lock_duration: Duration,
    pub claim_order: ClaimOrder,
}

impl StorageConfig {
    /// Config with the default lock duration and FIFO claims.
    #[must_use]
    pub fn new(other_duchies: Vec<String>) -> Self {
        Self {
            other_duchies,
            lock_duration: DEFAULT_LOCK_DURATION,
            claim_order: ClaimOrder::default(),
        }
    }

    /// Details stored alongside a computation entering `stage`.
    #[must_use]
    pub fn details_for(&self, stage: Stage) -> StageDetails {
        match stage {
            // Output slot 0 is never used here: slot 0 is the local input.
            Stage::WaitSketches => StageDetails::WaitSketches {
                external_duchy_local_blob_ids: self
                    .other_duchies
                    .iter()
                    .enumerate()
                    .map(|(idx, duchy)| (duchy.clone(), (idx as u64).saturating_add(1)))
                    .collect::<BTreeMap<_, _>>(),
            },
            _ => StageDetails::None,
        }
    }
}

// =============================================================================
// STORAGE TRAIT
// =============================================================================

/// Transactional storage of computations and their blobs.
///
/// Every method returning a token returns a fresh one; the token passed in
/// is stale afterwards.
pub trait ComputationStorage: Send + Sync {
    /// Create a computation in the initial stage.
    ///
    /// Returns `DuchyError::AlreadyExists` if `global_id` is already known.
    fn create_computation(
        &self,
        global_id: &str,
        role: Role,
        next_duchy: &str,
        details: StageDetails,
    ) -> Result<ComputationToken, DuchyError>;

    /// Look up a computation by its global id.
    fn read_computation_token(&self, global_id: &str)
    -> Result<Option<ComputationToken>, DuchyError>;

    /// Every computation, in creation order.
    fn list_computations(&self) -> Result<Vec<ComputationToken>, DuchyError>;

    /// Claim one workable computation for `owner`.
    ///
    /// `Ok(None)` means there is no work, not an error.
    fn claim_work(
        &self,
        computation_type: ComputationType,
        owner: &str,
    ) -> Result<Option<ComputationToken>, DuchyError>;

    /// Read every input blob of the current stage, keyed by blob id.
    fn read_input_blobs(&self, token: &ComputationToken)
    -> Result<BTreeMap<u64, Vec<u8>>, DuchyError>;

    /// Store the output of a single-output stage.
    fn write_single_output_blob(
        &self,
        token: &ComputationToken,
        bytes: &[u8],
    ) -> Result<ComputationToken, DuchyError>;

    /// Store the bytes of output slot `blob_id`, e.g. a sketch received from
    /// a peer while waiting.
    fn write_output_blob(
        &self,
        token: &ComputationToken,
        blob_id: u64,
        bytes: &[u8],
    ) -> Result<ComputationToken, DuchyError>;

    /// Read the stored output of a single-output stage.
    fn read_single_output_blob(&self, token: &ComputationToken) -> Result<Vec<u8>, DuchyError>;

    /// Move a computation to `stage`, feeding it `inputs_to_next_stage`.
    ///
    /// Validated by the stage machine; releases the claim.
    fn transition_computation_to_stage(
        &self,
        token: &ComputationToken,
        inputs_to_next_stage: Vec<String>,
        stage: Stage,
    ) -> Result<ComputationToken, DuchyError>;

    /// End a computation in a terminal stage.
    fn finish_computation(
        &self,
        token: &ComputationToken,
        stage: Stage,
        reason: CompletedReason,
    ) -> Result<ComputationToken, DuchyError>;
}
