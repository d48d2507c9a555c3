//! # Mill
//!
//! A mill is one worker of a duchy. Each cycle it claims a computation from
//! storage, runs the work of that computation's current stage and commits
//! the result by advancing the computation.
//!
//! ```text
//! Idle ──throttle──▶ claim_work ──none──▶ Idle
//!                        │
//!                        ▼
//!                    dispatch(stage) ──▶ transition / finish ──▶ Idle
//! ```
//!
//! ## Failure Semantics
//!
//! An error aborts the cycle and leaves committed state alone. The claim
//! stays with this mill, so the next poll picks the computation up again
//! and the cached output blob avoids redoing crypto work. Only errors
//! that signal a defect ([`MillError::is_fatal`]) stop the loop.

use crate::chunk::chunk_stream;
use crate::clients::{
    ClientError, ComputationControl, CryptoKeySet, CryptoWorker, GlobalComputations, MetricValues,
};
use crate::throttle::MinimumIntervalThrottler;
use async_trait::async_trait;
use bytes::Bytes;
use duchy_core::{
    CompletedReason, ComputationStorage, ComputationToken, ComputationType, DuchyError, Stage,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// ERRORS
// =============================================================================

/// Errors raised while processing a claimed computation.
#[derive(Debug, Error)]
pub enum MillError {
    #[error(transparent)]
    Storage(#[from] DuchyError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Unexpected number of input blobs for {global_id}: expected {expected}, actual {actual}")]
    InputCount {
        global_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("No peer configured for next duchy {0}")]
    MissingPeer(String),

    #[error("Crypto task failed: {0}")]
    Worker(String),

    /// Claim returned a stage no mill works on.
    #[error("Unexpected stage {stage} for mill to process: {global_id}")]
    UnexpectedStage { global_id: String, stage: Stage },

    /// The stage needs a handler that was never registered.
    #[error("No handler registered for stage {0}")]
    NoHandler(Stage),
}

impl MillError {
    /// Check whether the error is a defect that must stop the mill.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MillError::UnexpectedStage { .. } | MillError::NoHandler(_)
        )
    }
}

// =============================================================================
// MILL CONTEXT
// =============================================================================

/// Which one-way stream a payload is forwarded on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    ConcatenatedSketch,
    EncryptedFlagsAndCounts,
}

/// Everything a stage procedure needs: storage, collaborators and keys.
///
/// Also handed to plugged [`StageHandler`]s so they can reuse the shared
/// cached-compute-forward-advance steps.
pub struct MillContext {
    pub storage: Arc<dyn ComputationStorage>,
    pub kingdom: Arc<dyn GlobalComputations>,
    pub metric_values: Arc<dyn MetricValues>,
    /// Control clients of the other duchies, by name.
    pub peers: BTreeMap<String, Arc<dyn ComputationControl>>,
    pub crypto: Arc<dyn CryptoWorker>,
    pub keys: CryptoKeySet,
    pub chunk_size: usize,
}

impl MillContext {
    /// Read every input blob and concatenate them in blob-id order.
    pub fn read_and_combine_inputs(
        &self,
        token: &ComputationToken,
        expected: usize,
    ) -> Result<Vec<u8>, MillError> {
        let blobs = self.storage.read_input_blobs(token)?;
        if blobs.len() != expected {
            return Err(MillError::InputCount {
                global_id: token.global_id.clone(),
                expected,
                actual: blobs.len(),
            });
        }
        Ok(blobs.into_values().flatten().collect())
    }

    /// Reuse the stage's stored output, or compute and store it.
    ///
    /// `compute` receives the combined input blobs and runs on the blocking
    /// pool.
    pub async fn cached_or_compute<F>(
        &self,
        token: ComputationToken,
        expected_inputs: usize,
        compute: F,
    ) -> Result<(Bytes, ComputationToken), MillError>
    where
        F: FnOnce(&dyn CryptoWorker, Vec<u8>) -> Result<Vec<u8>, ClientError> + Send + 'static,
    {
        if token.single_output()?.path.is_some() {
            debug!(global_id = %token.global_id, stage = %token.stage, "reusing cached result");
            let bytes = self.storage.read_single_output_blob(&token)?;
            return Ok((Bytes::from(bytes), token));
        }

        let input = self.read_and_combine_inputs(&token, expected_inputs)?;
        let crypto = Arc::clone(&self.crypto);
        let output = tokio::task::spawn_blocking(move || compute(crypto.as_ref(), input))
            .await
            .map_err(|e| MillError::Worker(e.to_string()))??;
        let token = self.storage.write_single_output_blob(&token, &output)?;
        Ok((Bytes::from(output), token))
    }

    /// Send `payload` to the token's next duchy, chunked.
    pub async fn forward(
        &self,
        token: &ComputationToken,
        outbound: Outbound,
        payload: Bytes,
    ) -> Result<(), MillError> {
        let peer = self
            .peers
            .get(&token.next_duchy)
            .ok_or_else(|| MillError::MissingPeer(token.next_duchy.clone()))?;
        let chunks = chunk_stream(&token.global_id, payload, self.chunk_size);
        match outbound {
            Outbound::ConcatenatedSketch => peer.handle_concatenated_sketch(chunks).await?,
            Outbound::EncryptedFlagsAndCounts => {
                peer.handle_encrypted_flags_and_counts(chunks).await?
            }
        }
        Ok(())
    }

    /// Move the computation to the next stage for its role, feeding it this
    /// stage's outputs.
    pub fn advance(&self, token: &ComputationToken) -> Result<ComputationToken, MillError> {
        let next = token
            .stage
            .successor_for(token.role)
            .ok_or_else(|| MillError::UnexpectedStage {
                global_id: token.global_id.clone(),
                stage: token.stage,
            })?;
        Ok(self
            .storage
            .transition_computation_to_stage(token, token.output_paths(), next)?)
    }

    /// Tell the kingdom how the computation ended, then finish it locally.
    ///
    /// The report goes first: a failed report leaves the computation
    /// claimable, so the next cycle reports again. The kingdom may therefore
    /// see the same outcome more than once.
    pub async fn complete(
        &self,
        token: &ComputationToken,
        reason: CompletedReason,
    ) -> Result<ComputationToken, MillError> {
        self.kingdom.report_outcome(&token.global_id, reason).await?;
        let done = self
            .storage
            .finish_computation(token, Stage::Completed, reason)?;
        info!(global_id = %done.global_id, reason = %reason, "computation completed");
        Ok(done)
    }
}

// =============================================================================
// STAGE HANDLERS
// =============================================================================

/// Work for a stage the mill has no built-in procedure for.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Process a claimed computation and return its token after the commit.
    async fn process(
        &self,
        ctx: &MillContext,
        token: ComputationToken,
    ) -> Result<ComputationToken, MillError>;
}

/// Stages whose work comes from a registered [`StageHandler`].
pub const PLUGGABLE_STAGES: [Stage; 3] = [
    Stage::ToAddNoise,
    Stage::ToAppendSketchesAndAddNoise,
    Stage::ToDecryptFlagCountsAndComputeMetrics,
];

// =============================================================================
// MILL
// =============================================================================

/// One worker polling storage for Liquid Legions computations.
pub struct Mill {
    id: String,
    ctx: MillContext,
    handlers: BTreeMap<Stage, Arc<dyn StageHandler>>,
    poll_interval: Duration,
}

impl Mill {
    pub fn new(id: impl Into<String>, ctx: MillContext, poll_interval: Duration) -> Self {
        Self {
            id: id.into(),
            ctx,
            handlers: BTreeMap::new(),
            poll_interval,
        }
    }

    /// Register the handler for a stage without a built-in procedure
    /// (noise addition, sketch append, final metric computation).
    #[must_use]
    pub fn with_handler(mut self, stage: Stage, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(stage, handler);
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pluggable stages this mill has no handler for. Claiming a computation
    /// in one of them stops the mill.
    #[must_use]
    pub fn unhandled_stages(&self) -> Vec<Stage> {
        PLUGGABLE_STAGES
            .into_iter()
            .filter(|stage| !self.handlers.contains_key(stage))
            .collect()
    }

    /// Run cycles until cancelled or a fatal error occurs.
    pub async fn continually_process_computation_queue(
        &self,
        cancel: CancellationToken,
    ) -> Result<(), MillError> {
        info!(mill_id = %self.id, "starting mill");
        for stage in self.unhandled_stages() {
            warn!(mill_id = %self.id, stage = %stage, "no handler registered");
        }
        let mut throttler = MinimumIntervalThrottler::new(self.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(mill_id = %self.id, "mill cancelled");
                    return Ok(());
                }
                result = async {
                    throttler.ready().await;
                    self.poll_and_process_next_computation().await
                } => {
                    match result {
                        Ok(Some(token)) => {
                            debug!(
                                mill_id = %self.id,
                                global_id = %token.global_id,
                                stage = %token.stage,
                                "cycle committed"
                            );
                        }
                        Ok(None) => {}
                        Err(e) if e.is_fatal() => {
                            error!(mill_id = %self.id, error = %e, "mill stopped");
                            return Err(e);
                        }
                        Err(e) => {
                            warn!(mill_id = %self.id, error = %e, "cycle failed");
                        }
                    }
                }
            }
        }
    }

    /// Run one cycle. `Ok(None)` means there was no work.
    pub async fn poll_and_process_next_computation(
        &self,
    ) -> Result<Option<ComputationToken>, MillError> {
        let claimed = self
            .ctx
            .storage
            .claim_work(ComputationType::LiquidLegionsSketchAggregationV1, &self.id)?;
        let Some(token) = claimed else {
            return Ok(None);
        };
        info!(
            mill_id = %self.id,
            global_id = %token.global_id,
            stage = %token.stage,
            "processing computation"
        );
        self.dispatch(token).await.map(Some)
    }

    async fn dispatch(&self, token: ComputationToken) -> Result<ComputationToken, MillError> {
        match token.stage {
            Stage::ToConfirmRequisitions => self.confirm_requisitions(token).await,
            Stage::ToBlindPositions => self.blind_positions(token).await,
            Stage::ToBlindPositionsAndJoinRegisters => {
                self.blind_positions_and_join_registers(token).await
            }
            Stage::ToDecryptFlagCounts => self.decrypt_flag_counts(token).await,
            Stage::ToAddNoise
            | Stage::ToAppendSketchesAndAddNoise
            | Stage::ToDecryptFlagCountsAndComputeMetrics => {
                let handler = self
                    .handlers
                    .get(&token.stage)
                    .ok_or(MillError::NoHandler(token.stage))?;
                handler.process(&self.ctx, token).await
            }
            Stage::Unknown
            | Stage::WaitToStart
            | Stage::WaitSketches
            | Stage::WaitConcatenated
            | Stage::WaitFlagCounts
            | Stage::Completed
            | Stage::Unrecognized => Err(MillError::UnexpectedStage {
                global_id: token.global_id,
                stage: token.stage,
            }),
        }
    }

    // =========================================================================
    // STAGE PROCEDURES
    // =========================================================================

    async fn confirm_requisitions(
        &self,
        token: ComputationToken,
    ) -> Result<ComputationToken, MillError> {
        let requested = token.details.requisition_keys();
        let mut available = Vec::with_capacity(requested.len());
        let mut combined = Vec::new();

        for key in requested {
            match self.ctx.metric_values.fetch(key).await {
                Ok(bytes) => {
                    combined.extend_from_slice(&bytes);
                    available.push(key.clone());
                }
                Err(e) if e.is_missing_data() => {
                    warn!(
                        global_id = %token.global_id,
                        requisition = %key,
                        error = %e,
                        "requisition unavailable"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.ctx
            .kingdom
            .confirm_requisitions(&token.global_id, &available)
            .await?;

        if available.len() != requested.len() {
            warn!(
                global_id = %token.global_id,
                requested = requested.len(),
                available = available.len(),
                "computation failed due to missing requisitions"
            );
            return self.ctx.complete(&token, CompletedReason::Failed).await;
        }

        let token = self
            .ctx
            .storage
            .write_single_output_blob(&token, &combined)?;
        self.ctx.advance(&token)
    }

    async fn blind_positions(&self, token: ComputationToken) -> Result<ComputationToken, MillError> {
        let keys = self.ctx.keys.clone();
        let (bytes, token) = self
            .ctx
            .cached_or_compute(token, 1, move |crypto, sketch| {
                crypto.blind_one_layer_register_index(&keys.blind_one_layer(sketch))
            })
            .await?;
        self.ctx
            .forward(&token, Outbound::ConcatenatedSketch, bytes)
            .await?;
        self.ctx.advance(&token)
    }

    async fn blind_positions_and_join_registers(
        &self,
        token: ComputationToken,
    ) -> Result<ComputationToken, MillError> {
        let keys = self.ctx.keys.clone();
        let (bytes, token) = self
            .ctx
            .cached_or_compute(token, 1, move |crypto, sketch| {
                crypto.blind_last_layer_index_then_join_registers(&keys.blind_last_layer(sketch))
            })
            .await?;
        self.ctx
            .forward(&token, Outbound::EncryptedFlagsAndCounts, bytes)
            .await?;
        self.ctx.advance(&token)
    }

    async fn decrypt_flag_counts(
        &self,
        token: ComputationToken,
    ) -> Result<ComputationToken, MillError> {
        let keys = self.ctx.keys.clone();
        let (bytes, token) = self
            .ctx
            .cached_or_compute(token, 1, move |crypto, flag_counts| {
                crypto.decrypt_one_layer_flag_and_count(&keys.decrypt_one_layer(flag_counts))
            })
            .await?;
        self.ctx
            .forward(&token, Outbound::EncryptedFlagsAndCounts, bytes)
            .await?;
        // This duchy's part is done once the result has left.
        self.ctx.complete(&token, CompletedReason::Succeeded).await
    }
}

// =============================================================================
// TESTS
// =============================================================================
