//! # Herald
//!
//! Keeps local storage in step with the kingdom's view of active
//! computations: creates computations the kingdom asks this duchy to
//! confirm, and starts computations that were waiting for the go signal.
//!
//! Syncing is idempotent, so replaying the stream from the beginning after
//! a restart is harmless.

use crate::clients::{ActiveComputation, ClientError, GlobalComputations, GlobalState};
use crate::throttle::MinimumIntervalThrottler;
use duchy_core::{ComputationStorage, DuchyError, Role, Stage, StageDetails};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised while syncing with the kingdom.
#[derive(Debug, Error)]
pub enum HeraldError {
    #[error(transparent)]
    Storage(#[from] DuchyError),

    #[error(transparent)]
    Kingdom(#[from] ClientError),
}

pub struct Herald {
    storage: Arc<dyn ComputationStorage>,
    kingdom: Arc<dyn GlobalComputations>,
    role: Role,
    next_duchy: String,
    poll_interval: Duration,
}

impl Herald {
    pub fn new(
        storage: Arc<dyn ComputationStorage>,
        kingdom: Arc<dyn GlobalComputations>,
        role: Role,
        next_duchy: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            storage,
            kingdom,
            role,
            next_duchy: next_duchy.into(),
            poll_interval,
        }
    }

    /// Sync forever, keeping the continuation token in memory.
    ///
    /// Errors are logged and the next round starts from the last token that
    /// was fully processed.
    pub async fn continually_sync_statuses(&self, cancel: CancellationToken) {
        info!(role = %self.role, "starting herald");
        let mut throttler = MinimumIntervalThrottler::new(self.poll_interval);
        let mut last_token = String::new();

        loop {
            let round = tokio::select! {
                _ = cancel.cancelled() => None,
                result = async {
                    throttler.ready().await;
                    self.sync_statuses(&last_token).await
                } => Some(result),
            };
            match round {
                None => {
                    info!("herald cancelled");
                    return;
                }
                Some(Ok(token)) => last_token = token,
                Some(Err(e)) => warn!(error = %e, "status sync failed"),
            }
        }
    }

    /// Process every active computation after `last_token` and return the
    /// continuation token of the last one (or `last_token` if there were
    /// none).
    pub async fn sync_statuses(&self, last_token: &str) -> Result<String, HeraldError> {
        let mut stream = self.kingdom.stream_active_computations(last_token).await?;
        let mut continuation_token = last_token.to_string();

        while let Some(item) = stream.next().await {
            let computation = item?;
            self.process(&computation)?;
            continuation_token = computation.continuation_token;
        }
        Ok(continuation_token)
    }

    fn process(&self, computation: &ActiveComputation) -> Result<(), HeraldError> {
        let local = self.storage.read_computation_token(&computation.global_id)?;
        match (local, computation.state) {
            (None, GlobalState::Confirming) => {
                let details = StageDetails::ToConfirmRequisitions {
                    keys: computation.requisitions.clone(),
                };
                match self.storage.create_computation(
                    &computation.global_id,
                    self.role,
                    &self.next_duchy,
                    details,
                ) {
                    Ok(_) => info!(global_id = %computation.global_id, "computation created"),
                    // Another herald got there first.
                    Err(DuchyError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            (Some(token), GlobalState::Running) if token.stage == Stage::WaitToStart => {
                self.storage.transition_computation_to_stage(
                    &token,
                    token.input_paths(),
                    Stage::ToAddNoise,
                )?;
                info!(global_id = %computation.global_id, "computation started");
            }
            (local, state) => {
                debug!(
                    global_id = %computation.global_id,
                    known = local.is_some(),
                    state = ?state,
                    "nothing to do"
                );
            }
        }
        Ok(())
    }
}
