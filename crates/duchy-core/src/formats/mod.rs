//! # Formats Module
//!
//! Durable encodings of what the storage layer persists.

mod record;

pub use record::*;
