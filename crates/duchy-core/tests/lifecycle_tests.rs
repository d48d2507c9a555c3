//! # Lifecycle Tests
//!
//! Walk computations through every stage of both roles using only the
//! storage contract, the way the herald, the mills and peer traffic do.

use duchy_core::{
    CompletedReason, ComputationStorage, ComputationToken, ComputationType, DuchyError,
    RedbComputationStorage, RequisitionKey, Role, Stage, StageDetails, StorageConfig,
};

const TYPE: ComputationType = ComputationType::LiquidLegionsSketchAggregationV1;

fn store() -> RedbComputationStorage {
    RedbComputationStorage::in_memory(StorageConfig::new(vec![
        "Bavaria".to_string(),
        "Carinthia".to_string(),
    ]))
    .expect("open")
}

fn keys() -> StageDetails {
    StageDetails::ToConfirmRequisitions {
        keys: vec![
            RequisitionKey::new("alice", "a", "1234"),
            RequisitionKey::new("bob", "bb", "abc"),
        ],
    }
}

/// Claim, write the single output and move on, as a mill cycle does.
fn work_stage(store: &RedbComputationStorage, owner: &str, bytes: &[u8]) -> ComputationToken {
    let claimed = store
        .claim_work(TYPE, owner)
        .expect("claim")
        .expect("work available");
    let written = store
        .write_single_output_blob(&claimed, bytes)
        .expect("write");
    let next = written.stage.successor_for(written.role).expect("successor");
    store
        .transition_computation_to_stage(&written, written.output_paths(), next)
        .expect("transition")
}

/// Deliver a peer's payload into a single-slot wait stage and start work.
fn receive(store: &RedbComputationStorage, waiting: &ComputationToken, bytes: &[u8]) -> ComputationToken {
    let blob_id = waiting.single_output().expect("slot").blob_id;
    let filled = store
        .write_output_blob(waiting, blob_id, bytes)
        .expect("receive");
    let next = filled.stage.successor_for(filled.role).expect("successor");
    store
        .transition_computation_to_stage(&filled, filled.output_paths(), next)
        .expect("start")
}

// =============================================================================
// SECONDARY DUCHY
// =============================================================================

#[test]
fn secondary_walks_to_completion() {
    let store = store();
    store
        .create_computation("321", Role::Secondary, "Bavaria", keys())
        .expect("create");

    let waiting = work_stage(&store, "mill-1", b"sketch");
    assert_eq!(waiting.stage, Stage::WaitToStart);
    assert!(store.claim_work(TYPE, "mill-1").expect("claim").is_none());

    // The herald starts the computation once the kingdom says RUNNING.
    let started = store
        .transition_computation_to_stage(&waiting, waiting.input_paths(), Stage::ToAddNoise)
        .expect("start");
    assert_eq!(started.stage, Stage::ToAddNoise);

    let concatenated = work_stage(&store, "mill-2", b"noised");
    assert_eq!(concatenated.stage, Stage::WaitConcatenated);

    let blinding = receive(&store, &concatenated, b"concatenated");
    assert_eq!(blinding.stage, Stage::ToBlindPositions);
    assert_eq!(
        store.read_input_blobs(&blinding).expect("inputs").get(&0),
        Some(&b"concatenated".to_vec())
    );

    let flags = work_stage(&store, "mill-1", b"blinded");
    assert_eq!(flags.stage, Stage::WaitFlagCounts);

    let decrypting = receive(&store, &flags, b"flags");
    assert_eq!(decrypting.stage, Stage::ToDecryptFlagCounts);

    let claimed = store
        .claim_work(TYPE, "mill-1")
        .expect("claim")
        .expect("work");
    let done = store
        .finish_computation(&claimed, Stage::Completed, CompletedReason::Succeeded)
        .expect("finish");
    assert_eq!(done.completed_reason, Some(CompletedReason::Succeeded));
    assert_eq!(
        store.read_computation_token("321").expect("read"),
        Some(done)
    );
}

// =============================================================================
// PRIMARY DUCHY
// =============================================================================

#[test]
fn primary_collects_sketches_then_computes() {
    let store = store();
    store
        .create_computation("654", Role::Primary, "Bavaria", keys())
        .expect("create");

    let waiting = work_stage(&store, "mill-1", b"local");
    assert_eq!(waiting.stage, Stage::WaitSketches);

    let waiting = store.write_output_blob(&waiting, 1, b"b").expect("bavaria");
    let waiting = store.write_output_blob(&waiting, 2, b"c").expect("carinthia");
    let mut inputs = waiting.input_paths();
    inputs.extend(waiting.output_paths());
    let append = store
        .transition_computation_to_stage(&waiting, inputs, Stage::ToAppendSketchesAndAddNoise)
        .expect("append");
    assert_eq!(append.inputs().count(), 3);

    let concatenated = work_stage(&store, "mill-1", b"joined");
    assert_eq!(concatenated.stage, Stage::WaitConcatenated);
    let joining = receive(&store, &concatenated, b"returned");
    assert_eq!(joining.stage, Stage::ToBlindPositionsAndJoinRegisters);

    let flags = work_stage(&store, "mill-1", b"flags");
    let computing = receive(&store, &flags, b"decrypted");
    assert_eq!(computing.stage, Stage::ToDecryptFlagCountsAndComputeMetrics);
}

// =============================================================================
// CONCURRENCY
// =============================================================================

#[test]
fn only_one_of_two_racing_writers_wins() {
    let store = store();
    let token = store
        .create_computation("1", Role::Secondary, "Bavaria", keys())
        .expect("create");

    let first = store.write_single_output_blob(&token, b"first");
    let second = store.finish_computation(&token, Stage::Completed, CompletedReason::Failed);

    assert!(first.is_ok());
    assert!(matches!(second, Err(DuchyError::StaleToken { .. })));
}

#[test]
fn claims_across_threads_never_overlap() {
    let store = std::sync::Arc::new(store());
    for idx in 0..8 {
        store
            .create_computation(&format!("g{}", idx), Role::Secondary, "Bavaria", keys())
            .expect("create");
    }

    let handles: Vec<_> = (0..4)
        .map(|mill| {
            let store = std::sync::Arc::clone(&store);
            std::thread::spawn(move || {
                let owner = format!("mill-{}", mill);
                let mut claimed = Vec::new();
                while let Some(token) = store.claim_work(TYPE, &owner).expect("claim") {
                    // Park it so the same owner does not re-claim it.
                    let token = store.write_single_output_blob(&token, b"s").expect("write");
                    let paths = token.output_paths();
                    store
                        .transition_computation_to_stage(&token, paths, Stage::WaitToStart)
                        .expect("park");
                    claimed.push(token.global_id);
                }
                claimed
            })
        })
        .collect();

    let mut all: Vec<String> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("thread"))
        .collect();
    all.sort();
    let before = all.len();
    all.dedup();
    assert_eq!(before, all.len());
    assert_eq!(all.len(), 8);
}
