//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use super::CliError;
use crate::clients::{ComputationControl, CryptoWorker, GlobalComputations, MetricValues};
use crate::config::{ConfigError, DEFAULT_DATABASE, DuchyConfig};
use crate::herald::Herald;
use crate::mill::{Mill, MillContext, MillError};
use crate::remote::{CommandCryptoWorker, KingdomClient, MetricValuesClient, PeerClient};
use duchy_core::stage::ENCODABLE_STAGES;
use duchy_core::{ComputationStorage, RedbComputationStorage, StorageConfig, encode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// =============================================================================
// RUN COMMAND
// =============================================================================

/// Run the herald and every configured mill until Ctrl-C or a fatal error.
pub async fn cmd_run(
    config_path: &Path,
    database: Option<&Path>,
    quiet: bool,
) -> Result<(), CliError> {
    let config = DuchyConfig::load(config_path)?;
    let db_path = database
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.database.clone());
    let storage: Arc<dyn ComputationStorage> = Arc::new(RedbComputationStorage::open(
        &db_path,
        config.storage_config(),
    )?);

    let command = config.crypto.command.clone().ok_or_else(|| {
        ConfigError::Invalid("crypto.command is required to run mills".to_string())
    })?;
    let crypto: Arc<dyn CryptoWorker> =
        Arc::new(CommandCryptoWorker::new(command, config.crypto.args.clone()));
    let keys = config.crypto.key_set()?;

    let http = reqwest::Client::new();
    let kingdom: Arc<dyn GlobalComputations> =
        Arc::new(KingdomClient::new(http.clone(), config.kingdom.url.clone()));
    let metric_values: Arc<dyn MetricValues> = Arc::new(MetricValuesClient::new(
        http.clone(),
        config.metric_values.url.clone(),
    ));
    let peers: BTreeMap<String, Arc<dyn ComputationControl>> = config
        .peers
        .iter()
        .map(|(name, url)| {
            let client: Arc<dyn ComputationControl> =
                Arc::new(PeerClient::new(http.clone(), url.clone()));
            (name.clone(), client)
        })
        .collect();

    if !quiet {
        println!("Duchy {} ({}) v{}", config.duchy_name, config.role, env!("CARGO_PKG_VERSION"));
        println!();
        println!("Configuration:");
        println!("  Database:   {:?}", db_path);
        println!("  Next duchy: {}", config.next_duchy());
        println!("  Mills:      {}", config.mill_ids().join(", "));
        println!("  Kingdom:    {}", config.kingdom.url);
        println!();
        println!("Press Ctrl+C to stop");
        println!();
    }

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let herald = Herald::new(
        Arc::clone(&storage),
        Arc::clone(&kingdom),
        config.role,
        config.next_duchy(),
        Duration::from_millis(config.herald.poll_interval_ms),
    );
    let herald_cancel = cancel.clone();
    tasks.spawn(async move {
        herald.continually_sync_statuses(herald_cancel).await;
        Ok::<(), MillError>(())
    });

    for mill_id in config.mill_ids() {
        let ctx = MillContext {
            storage: Arc::clone(&storage),
            kingdom: Arc::clone(&kingdom),
            metric_values: Arc::clone(&metric_values),
            peers: peers.clone(),
            crypto: Arc::clone(&crypto),
            keys: keys.clone(),
            chunk_size: config.mill.chunk_size,
        };
        let mill = Mill::new(
            mill_id,
            ctx,
            Duration::from_millis(config.mill.poll_interval_ms),
        );
        let mill_cancel = cancel.clone();
        tasks.spawn(async move { mill.continually_process_computation_queue(mill_cancel).await });
    }

    let mut outcome = Ok(());
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "cannot listen for Ctrl-C");
            }
            info!("shutdown requested");
        }
        Some(finished) = tasks.join_next() => {
            outcome = task_outcome(finished);
        }
    }

    cancel.cancel();
    while let Some(finished) = tasks.join_next().await {
        if let Err(e) = task_outcome(finished) {
            error!(error = %e, "task ended with an error");
        }
    }
    outcome
}

fn task_outcome(
    finished: Result<Result<(), MillError>, tokio::task::JoinError>,
) -> Result<(), CliError> {
    match finished {
        Ok(result) => Ok(result?),
        Err(e) => Err(CliError::Io(format!("task failed: {}", e))),
    }
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// List local computations.
pub fn cmd_status(
    config_path: &Path,
    database: Option<&Path>,
    json_mode: bool,
) -> Result<(), CliError> {
    let (db_path, storage) = open_storage(config_path, database)?;
    let computations = storage.list_computations()?;

    if json_mode {
        let output = serde_json::json!({
            "database": db_path.to_string_lossy(),
            "computations": computations.iter().map(|token| serde_json::json!({
                "local_id": token.local_id,
                "global_id": token.global_id,
                "stage": token.stage.name(),
                "role": token.role,
                "version": token.version,
                "next_duchy": token.next_duchy,
                "completed_reason": token.completed_reason,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!("Duchy Computations");
    println!("==================");
    println!("Database: {:?}", db_path);
    println!();
    if computations.is_empty() {
        println!("No computations.");
        return Ok(());
    }
    for token in &computations {
        let outcome = token
            .completed_reason
            .map(|reason| format!(" ({})", reason))
            .unwrap_or_default();
        println!(
            "{:>6}  {:<20} {:<9} {}{}",
            token.local_id, token.global_id, token.role, token.stage, outcome
        );
    }

    Ok(())
}

// =============================================================================
// STAGES COMMAND
// =============================================================================

/// Print the stage table and legal transitions.
pub fn cmd_stages(json_mode: bool) -> Result<(), CliError> {
    let mut rows = Vec::with_capacity(ENCODABLE_STAGES.len());
    for stage in ENCODABLE_STAGES {
        rows.push((encode(stage)?, stage));
    }

    if json_mode {
        let output: Vec<_> = rows
            .iter()
            .map(|(code, stage)| {
                serde_json::json!({
                    "code": code,
                    "stage": stage.name(),
                    "wait": stage.is_wait_stage(),
                    "successors": stage.successors().iter().map(|s| s.name()).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    for (code, stage) in rows {
        let successors: Vec<&str> = stage.successors().iter().map(|s| s.name()).collect();
        if successors.is_empty() {
            println!("{:>3}  {}", code, stage);
        } else {
            println!("{:>3}  {} -> {}", code, stage, successors.join(" | "));
        }
    }
    Ok(())
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create an empty computation database.
pub fn cmd_init(config_path: &Path, database: Option<&Path>, force: bool) -> Result<(), CliError> {
    let db_path = database_path(config_path, database)?;
    if db_path.exists() {
        if !force {
            return Err(CliError::Io(
                "Database already exists. Use --force to overwrite.".to_string(),
            ));
        }
        std::fs::remove_file(&db_path)
            .map_err(|e| CliError::Io(format!("Cannot remove {:?}: {}", db_path, e)))?;
    }

    let (db_path, _storage) = open_storage(config_path, Some(&db_path))?;
    println!("Initialized new computation database at {:?}", db_path);
    Ok(())
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Load the config file if there is one.
fn optional_config(config_path: &Path) -> Result<Option<DuchyConfig>, CliError> {
    if config_path.exists() {
        Ok(Some(DuchyConfig::load(config_path)?))
    } else {
        Ok(None)
    }
}

fn database_path(config_path: &Path, database: Option<&Path>) -> Result<PathBuf, CliError> {
    if let Some(path) = database {
        return Ok(path.to_path_buf());
    }
    Ok(optional_config(config_path)?
        .map(|config| config.database)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE)))
}

/// Open the database named by the flag, the config file or the default.
pub fn open_storage(
    config_path: &Path,
    database: Option<&Path>,
) -> Result<(PathBuf, RedbComputationStorage), CliError> {
    let config = optional_config(config_path)?;
    let storage_config = config
        .as_ref()
        .map(DuchyConfig::storage_config)
        .unwrap_or_else(|| StorageConfig::new(Vec::new()));
    let db_path = database_path(config_path, database)?;
    let storage = RedbComputationStorage::open(&db_path, storage_config)?;
    Ok((db_path, storage))
}

// =============================================================================
// TESTS
// =============================================================================
