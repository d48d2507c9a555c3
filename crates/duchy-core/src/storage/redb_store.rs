//! # redb-backed Computation Storage
//!
//! A transactional computation store using the redb embedded database.
//!
//! redb provides what the storage contract needs:
//! - ACID transactions (one per operation)
//! - Crash safety (copy-on-write B-trees)
//! - A single writer at a time, which makes claim-work atomic
//!
//! The same implementation runs on disk ([`RedbComputationStorage::open`])
//! or in memory ([`RedbComputationStorage::in_memory`]).
//!
//! ## Tables
//!
//! | Table | Key | Value |
//! |-------|-----|-------|
//! | `computations` | local id | encoded `ComputationRecord` |
//! | `global_index` | global id | local id |
//! | `blobs` | blob path | blob bytes |
//! | `metadata` | key | counter |

use super::{ClaimOrder, ComputationStorage, StorageConfig};
use crate::formats::{
    ComputationRecord, record_from_bytes, record_to_bytes, stage_details_to_bytes,
};
use crate::stage::{self, BlobLayout, Stage};
use crate::types::{
    BlobMetadata, CompletedReason, ComputationToken, ComputationType, DuchyError, Role,
    StageDetails,
};
use redb::{
    Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction,
    backends::InMemoryBackend,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Table for computations: local id -> encoded record
const COMPUTATIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("computations");

/// Table for the global id index: global id -> local id
const GLOBAL_INDEX: TableDefinition<&str, u64> = TableDefinition::new("global_index");

/// Table for blobs: path -> bytes
const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const NEXT_LOCAL_ID: &str = "next_local_id";

fn storage_err(e: impl std::fmt::Display) -> DuchyError {
    DuchyError::Storage(e.to_string())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Deterministic path of a blob slot, so a rewritten output lands in place.
fn blob_path(local_id: u64, stage: Stage, blob_id: u64) -> String {
    format!(
        "computations/{}/{}/{}",
        local_id,
        stage.name().to_ascii_lowercase(),
        blob_id
    )
}

/// Blob slots for a stage: inputs first, then empty outputs.
fn blob_slots(inputs: Vec<String>, layout: BlobLayout) -> Vec<BlobMetadata> {
    let input_count = inputs.len() as u64;
    let mut slots: Vec<BlobMetadata> = inputs
        .into_iter()
        .enumerate()
        .map(|(idx, path)| BlobMetadata::input(idx as u64, path))
        .collect();
    slots.extend(
        (0..layout.outputs as u64).map(|idx| BlobMetadata::empty_output(input_count + idx)),
    );
    slots
}

fn load_record<T>(table: &T, local_id: u64) -> Result<ComputationRecord, DuchyError>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    let bytes = table
        .get(local_id)
        .map_err(storage_err)?
        .map(|guard| guard.value().to_vec())
        .ok_or_else(|| DuchyError::NotFound(format!("computation {}", local_id)))?;
    record_from_bytes(&bytes)
}

/// Load the record behind `token`, failing if the token is stale.
fn current_record<T>(table: &T, token: &ComputationToken) -> Result<ComputationRecord, DuchyError>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    let record = load_record(table, token.local_id)?;
    if record.version != token.version {
        return Err(DuchyError::StaleToken {
            local_id: token.local_id,
            token_version: token.version,
            stored_version: record.version,
        });
    }
    Ok(record)
}

fn load_blob<T>(table: &T, path: &str) -> Result<Vec<u8>, DuchyError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    table
        .get(path)
        .map_err(storage_err)?
        .map(|guard| guard.value().to_vec())
        .ok_or_else(|| DuchyError::NotFound(format!("blob {}", path)))
}

/// A computation store backed by redb.
pub struct RedbComputationStorage {
    db: Database,
    config: StorageConfig,
}

impl std::fmt::Debug for RedbComputationStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbComputationStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedbComputationStorage {
    /// Open or create a computation database at the given path.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self, DuchyError> {
        let db = Database::create(path.as_ref()).map_err(storage_err)?;
        Self::with_database(db, config)
    }

    /// Create a computation database that lives only in memory.
    pub fn in_memory(config: StorageConfig) -> Result<Self, DuchyError> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(storage_err)?;
        Self::with_database(db, config)
    }

    fn with_database(db: Database, config: StorageConfig) -> Result<Self, DuchyError> {
        // Initialize tables if they don't exist
        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            let _ = write_txn.open_table(COMPUTATIONS).map_err(storage_err)?;
            let _ = write_txn.open_table(GLOBAL_INDEX).map_err(storage_err)?;
            let _ = write_txn.open_table(BLOBS).map_err(storage_err)?;
            let _ = write_txn.open_table(METADATA).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(Self { db, config })
    }

    /// The configuration this store was opened with.
    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Compact the database (optional optimization).
    pub fn compact(&mut self) -> Result<(), DuchyError> {
        self.db.compact().map_err(storage_err)?;
        Ok(())
    }

    /// Run `f` in a write transaction, committing only if it succeeds.
    fn write<R>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> Result<R, DuchyError>,
    ) -> Result<R, DuchyError> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        match f(&write_txn) {
            Ok(result) => {
                write_txn.commit().map_err(storage_err)?;
                Ok(result)
            }
            Err(e) => {
                write_txn.abort().map_err(storage_err)?;
                Err(e)
            }
        }
    }

    /// Bump the version, stamp the write time and store the record.
    fn save(
        write_txn: &WriteTransaction,
        record: &mut ComputationRecord,
    ) -> Result<ComputationToken, DuchyError> {
        record.version = record.version.saturating_add(1);
        record.updated_at_ms = now_ms();
        let bytes = record_to_bytes(record)?;
        let mut table = write_txn.open_table(COMPUTATIONS).map_err(storage_err)?;
        table
            .insert(record.local_id, bytes.as_slice())
            .map_err(storage_err)?;
        record.to_token()
    }

    fn ensure_not_finished(record: &ComputationRecord) -> Result<(), DuchyError> {
        if record.completed_reason.is_some() {
            return Err(DuchyError::AlreadyFinished(record.global_id.clone()));
        }
        Ok(())
    }
}

impl ComputationStorage for RedbComputationStorage {
    fn create_computation(
        &self,
        global_id: &str,
        role: Role,
        next_duchy: &str,
        details: StageDetails,
    ) -> Result<ComputationToken, DuchyError> {
        let initial = Stage::ToConfirmRequisitions;
        debug_assert!(stage::valid_initial_state(initial));

        self.write(|write_txn| {
            let local_id = {
                let mut index = write_txn.open_table(GLOBAL_INDEX).map_err(storage_err)?;
                if index.get(global_id).map_err(storage_err)?.is_some() {
                    return Err(DuchyError::AlreadyExists(global_id.to_string()));
                }
                let mut meta = write_txn.open_table(METADATA).map_err(storage_err)?;
                let local_id = meta
                    .get(NEXT_LOCAL_ID)
                    .map_err(storage_err)?
                    .map(|v| v.value())
                    .unwrap_or(0);
                meta.insert(NEXT_LOCAL_ID, local_id.saturating_add(1))
                    .map_err(storage_err)?;
                index.insert(global_id, local_id).map_err(storage_err)?;
                local_id
            };

            let layout = initial.blob_layout(self.config.other_duchies.len());
            let mut record = ComputationRecord {
                local_id,
                global_id: global_id.to_string(),
                computation_type: ComputationType::LiquidLegionsSketchAggregationV1,
                stage_code: stage::encode(initial)?,
                role,
                version: 0,
                next_duchy: next_duchy.to_string(),
                blobs: blob_slots(Vec::new(), layout),
                details: stage_details_to_bytes(&details)?,
                completed_reason: None,
                owner: None,
                lock_expires_at_ms: 0,
                updated_at_ms: 0,
            };
            Self::save(write_txn, &mut record)
        })
    }

    fn read_computation_token(
        &self,
        global_id: &str,
    ) -> Result<Option<ComputationToken>, DuchyError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let index = read_txn.open_table(GLOBAL_INDEX).map_err(storage_err)?;
        let Some(local_id) = index.get(global_id).map_err(storage_err)?.map(|v| v.value())
        else {
            return Ok(None);
        };
        let table = read_txn.open_table(COMPUTATIONS).map_err(storage_err)?;
        load_record(&table, local_id)?.to_token().map(Some)
    }

    fn list_computations(&self) -> Result<Vec<ComputationToken>, DuchyError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(COMPUTATIONS).map_err(storage_err)?;
        let mut tokens = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let (_, value) = entry.map_err(storage_err)?;
            tokens.push(record_from_bytes(value.value())?.to_token()?);
        }
        Ok(tokens)
    }

    fn claim_work(
        &self,
        computation_type: ComputationType,
        owner: &str,
    ) -> Result<Option<ComputationToken>, DuchyError> {
        let now = now_ms();
        let lock_ms = self.config.lock_duration.as_millis() as u64;

        self.write(|write_txn| {
            let candidate = {
                let table = write_txn.open_table(COMPUTATIONS).map_err(storage_err)?;
                let mut eligible = Vec::new();
                for entry in table.iter().map_err(storage_err)? {
                    let (_, value) = entry.map_err(storage_err)?;
                    let record = record_from_bytes(value.value())?;
                    let workable = record
                        .stage()
                        .map(|stage| stage.is_workable())
                        .unwrap_or(false);
                    if record.computation_type == computation_type
                        && record.completed_reason.is_none()
                        && workable
                        && !record.is_locked_against(owner, now)
                    {
                        eligible.push(record);
                    }
                }
                match self.config.claim_order {
                    ClaimOrder::Fifo => eligible.into_iter().min_by_key(|r| r.local_id),
                    ClaimOrder::LeastRecentlyUpdated => eligible
                        .into_iter()
                        .min_by_key(|r| (r.updated_at_ms, r.local_id)),
                }
            };

            match candidate {
                Some(mut record) => {
                    record.owner = Some(owner.to_string());
                    record.lock_expires_at_ms = now.saturating_add(lock_ms);
                    Self::save(write_txn, &mut record).map(Some)
                }
                None => Ok(None),
            }
        })
    }

    fn read_input_blobs(
        &self,
        token: &ComputationToken,
    ) -> Result<BTreeMap<u64, Vec<u8>>, DuchyError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(COMPUTATIONS).map_err(storage_err)?;
        let record = current_record(&table, token)?;
        let blobs = read_txn.open_table(BLOBS).map_err(storage_err)?;

        let mut inputs = BTreeMap::new();
        for slot in record.blobs.iter().filter(|b| !b.is_output()) {
            let path = slot.path.as_deref().ok_or_else(|| {
                DuchyError::BlobLayout(format!(
                    "input blob {} of {} has no path",
                    slot.blob_id, record.global_id
                ))
            })?;
            inputs.insert(slot.blob_id, load_blob(&blobs, path)?);
        }
        Ok(inputs)
    }

    fn write_single_output_blob(
        &self,
        token: &ComputationToken,
        bytes: &[u8],
    ) -> Result<ComputationToken, DuchyError> {
        let layout = token
            .stage
            .blob_layout(self.config.other_duchies.len());
        if !layout.has_single_output() {
            return Err(DuchyError::BlobLayout(format!(
                "stage {} does not produce a single output blob",
                token.stage
            )));
        }
        let blob_id = token.single_output()?.blob_id;
        self.write_output_blob(token, blob_id, bytes)
    }

    fn write_output_blob(
        &self,
        token: &ComputationToken,
        blob_id: u64,
        bytes: &[u8],
    ) -> Result<ComputationToken, DuchyError> {
        self.write(|write_txn| {
            let mut record = {
                let table = write_txn.open_table(COMPUTATIONS).map_err(storage_err)?;
                current_record(&table, token)?
            };
            Self::ensure_not_finished(&record)?;
            let stage = record.stage()?;

            let slot = record
                .blobs
                .iter_mut()
                .find(|b| b.is_output() && b.blob_id == blob_id)
                .ok_or_else(|| {
                    DuchyError::BlobLayout(format!(
                        "{} has no output slot {} at {}",
                        token.global_id, blob_id, stage
                    ))
                })?;
            let path = blob_path(record.local_id, stage, blob_id);
            {
                let mut blobs = write_txn.open_table(BLOBS).map_err(storage_err)?;
                blobs.insert(path.as_str(), bytes).map_err(storage_err)?;
            }
            slot.path = Some(path);
            Self::save(write_txn, &mut record)
        })
    }

    fn read_single_output_blob(&self, token: &ComputationToken) -> Result<Vec<u8>, DuchyError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(COMPUTATIONS).map_err(storage_err)?;
        let record = current_record(&table, token)?;
        let token = record.to_token()?;
        let path = token.single_output()?.path.clone().ok_or_else(|| {
            DuchyError::BlobLayout(format!(
                "output of {} at {} has not been written",
                token.global_id, token.stage
            ))
        })?;
        let blobs = read_txn.open_table(BLOBS).map_err(storage_err)?;
        load_blob(&blobs, &path)
    }

    fn transition_computation_to_stage(
        &self,
        token: &ComputationToken,
        inputs_to_next_stage: Vec<String>,
        stage: Stage,
    ) -> Result<ComputationToken, DuchyError> {
        self.write(|write_txn| {
            let mut record = {
                let table = write_txn.open_table(COMPUTATIONS).map_err(storage_err)?;
                current_record(&table, token)?
            };
            Self::ensure_not_finished(&record)?;
            let from = record.stage()?;
            if !stage::valid_transition(from, stage) {
                return Err(DuchyError::IllegalTransition { from, to: stage });
            }

            let layout = stage.blob_layout(self.config.other_duchies.len());
            if inputs_to_next_stage.len() != layout.inputs {
                return Err(DuchyError::BlobLayout(format!(
                    "stage {} expects {} inputs, got {}",
                    stage,
                    layout.inputs,
                    inputs_to_next_stage.len()
                )));
            }
            {
                let blobs = write_txn.open_table(BLOBS).map_err(storage_err)?;
                for path in &inputs_to_next_stage {
                    if blobs.get(path.as_str()).map_err(storage_err)?.is_none() {
                        return Err(DuchyError::NotFound(format!("blob {}", path)));
                    }
                }
            }

            record.stage_code = stage::encode(stage)?;
            record.blobs = blob_slots(inputs_to_next_stage, layout);
            record.details = stage_details_to_bytes(&self.config.details_for(stage))?;
            record.release_claim();
            Self::save(write_txn, &mut record)
        })
    }

    fn finish_computation(
        &self,
        token: &ComputationToken,
        stage: Stage,
        reason: CompletedReason,
    ) -> Result<ComputationToken, DuchyError> {
        if !stage.is_terminal() {
            return Err(DuchyError::NotTerminal(stage));
        }
        self.write(|write_txn| {
            let mut record = {
                let table = write_txn.open_table(COMPUTATIONS).map_err(storage_err)?;
                current_record(&table, token)?
            };
            Self::ensure_not_finished(&record)?;
            if record.stage()?.is_terminal() {
                return Err(DuchyError::AlreadyFinished(record.global_id.clone()));
            }

            record.stage_code = stage::encode(stage)?;
            record.blobs = Vec::new();
            record.details = stage_details_to_bytes(&StageDetails::None)?;
            record.completed_reason = Some(reason);
            record.release_claim();
            Self::save(write_txn, &mut record)
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
