//! # Property-Based Tests
//!
//! Stage codes and stage details are durable: whatever is written must come
//! back exactly, and no stored value may crash a reader.

use duchy_core::formats::{stage_details_from_bytes, stage_details_to_bytes};
use duchy_core::stage::ENCODABLE_STAGES;
use duchy_core::{RequisitionKey, Stage, StageDetails, decode, encode, valid_transition};
use proptest::collection::{btree_map, vec};
use proptest::prelude::*;

fn any_stage() -> impl Strategy<Value = Stage> {
    prop_oneof![
        (0usize..ENCODABLE_STAGES.len()).prop_map(|idx| ENCODABLE_STAGES[idx]),
        Just(Stage::Unrecognized),
    ]
}

fn any_key() -> impl Strategy<Value = RequisitionKey> {
    ("[a-z]{1,8}", "[a-z]{1,4}", "[0-9]{1,6}")
        .prop_map(|(provider, campaign, requisition)| {
            RequisitionKey::new(provider, campaign, requisition)
        })
}

fn any_details() -> impl Strategy<Value = StageDetails> {
    prop_oneof![
        Just(StageDetails::None),
        vec(any_key(), 0..8).prop_map(|keys| StageDetails::ToConfirmRequisitions { keys }),
        btree_map("[A-Z][a-z]{1,10}", 1u64..64, 0..6).prop_map(|ids| {
            StageDetails::WaitSketches {
                external_duchy_local_blob_ids: ids,
            }
        }),
    ]
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// decode(encode(s)) == s for every stage with a code.
    #[test]
    fn encode_then_decode_is_identity(idx in 0usize..ENCODABLE_STAGES.len()) {
        let stage = ENCODABLE_STAGES[idx];
        let code = encode(stage).expect("encodable");
        prop_assert_eq!(decode(code), stage);
    }

    /// Any integer decodes without panicking; unmapped ones to the sentinel.
    #[test]
    fn decode_never_panics(code in any::<i64>()) {
        let stage = decode(code);
        if !(0..ENCODABLE_STAGES.len() as i64).contains(&code) {
            prop_assert_eq!(stage, Stage::Unrecognized);
        } else {
            prop_assert_ne!(stage, Stage::Unrecognized);
        }
    }

    /// Sentinels never take part in a transition.
    #[test]
    fn sentinels_never_transition(other in any_stage()) {
        for sentinel in [Stage::Unknown, Stage::Unrecognized] {
            prop_assert!(!valid_transition(sentinel, other));
            prop_assert!(!valid_transition(other, sentinel));
        }
    }

    /// A transition is legal exactly when the target is a listed successor.
    #[test]
    fn transitions_follow_successor_lists(from in any_stage(), to in any_stage()) {
        let listed = from.successors().contains(&to);
        prop_assert_eq!(valid_transition(from, to), listed && !from.is_sentinel());
    }

    /// Stored stage details read back exactly as written.
    #[test]
    fn stage_details_round_trip(details in any_details()) {
        let bytes = stage_details_to_bytes(&details).expect("encode");
        prop_assert_eq!(stage_details_from_bytes(&bytes).expect("decode"), details);
    }

    /// Arbitrary bytes never panic the details decoder.
    #[test]
    fn stage_details_decode_never_panics(bytes in vec(any::<u8>(), 0..256)) {
        let _ = stage_details_from_bytes(&bytes);
    }
}
