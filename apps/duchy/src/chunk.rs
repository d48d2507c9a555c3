//! # Chunking
//!
//! Payloads sent to peers are split into bounded slices. Slices share the
//! payload's buffer, so chunking never copies.

use crate::clients::{ChunkStream, ComputationChunk};
use bytes::Bytes;
use futures::StreamExt;

/// Default chunk size for peer transfers (2 MB).
pub const DEFAULT_CHUNK_SIZE: usize = 2_000_000;

/// Split `payload` into consecutive slices of at most `chunk_size` bytes.
///
/// An empty payload yields no slices. A zero `chunk_size` is treated as 1.
#[must_use]
pub fn split(payload: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    let mut slices = Vec::with_capacity(payload.len().div_ceil(chunk_size));
    let mut begin = 0;
    while begin < payload.len() {
        let end = payload.len().min(begin.saturating_add(chunk_size));
        slices.push(payload.slice(begin..end));
        begin = end;
    }
    slices
}

/// Stream `payload` as chunks tagged with `global_id`.
#[must_use]
pub fn chunk_stream(global_id: &str, payload: Bytes, chunk_size: usize) -> ChunkStream {
    let global_id = global_id.to_string();
    futures::stream::iter(split(&payload, chunk_size))
        .map(move |data| ComputationChunk {
            global_id: global_id.clone(),
            data,
        })
        .boxed()
}

// =============================================================================
// TESTS
// =============================================================================
