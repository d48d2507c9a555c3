//! # duchy-core
//!
//! The staged-computation core of a Liquid Legions duchy - THE LOGIC.
//!
//! A duchy takes part in a multi-party sketch aggregation. Every computation
//! it holds walks a fixed DAG of stages; this crate owns that DAG and the
//! transactional storage that moves computations along it.
//!
//! ## Layout
//!
//! - `stage` → stage machine (legal stages, transitions, durable codes)
//! - `types` → tokens, blob metadata, stage details, errors
//! - `storage` → `ComputationStorage` contract and its redb implementation
//! - `formats` → durable encoding of persisted records
//!
//! ## Architectural Constraints
//!
//! - No async, no network dependencies (pure Rust)
//! - Every write is validated by the stage machine before it commits
//! - Writes against a stale token fail; nothing is silently overwritten

// =============================================================================
// MODULES
// =============================================================================

pub mod formats;
pub mod stage;
pub mod storage;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    BlobDependency, BlobMetadata, CompletedReason, ComputationToken, ComputationType, DuchyError,
    RequisitionKey, Role, StageDetails,
};

// =============================================================================
// RE-EXPORTS: Stage Machine
// =============================================================================

pub use stage::{BlobLayout, Stage, decode, encode, valid_initial_state, valid_transition};

// =============================================================================
// RE-EXPORTS: Storage
// =============================================================================

pub use storage::{ClaimOrder, ComputationStorage, RedbComputationStorage, StorageConfig};
