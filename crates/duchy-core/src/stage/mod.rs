//! # Stage Module
//!
//! The stage machine of the Liquid Legions sketch aggregation protocol.
//!
//! Transition legality and the persistence encoding are kept apart: the
//! storage layer validates every write against [`valid_transition`], while
//! [`encode`]/[`decode`] only concern the durable integer codes.

mod machine;

pub use machine::*;
