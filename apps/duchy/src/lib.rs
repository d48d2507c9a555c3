//! # duchy
//!
//! The duchy daemon: mills that advance computations and a herald that
//! keeps local storage in step with the kingdom.
//!
//! ## Layout
//!
//! - `mill` → claim/process/commit worker loop
//! - `herald` → reconciliation with the kingdom's active computations
//! - `clients` → contracts of the kingdom, metric values, peers and crypto
//! - `remote` → HTTP and command-backed implementations of those contracts
//! - `chunk` / `throttle` → transfer chunking and poll pacing
//! - `config` / `cli` → operator surface
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     apps/duchy (THE BINARY)                  │
//! │                                                              │
//! │   ┌──────────┐   ┌──────────┐ ... ┌──────────┐               │
//! │   │  Herald  │   │  Mill 0  │     │  Mill N  │               │
//! │   └────┬─────┘   └────┬─────┘     └────┬─────┘               │
//! │        └──────────────┼────────────────┘                     │
//! │                       ▼                                      │
//! │               ┌───────────────┐                              │
//! │               │  duchy-core   │                              │
//! │               │  (THE LOGIC)  │                              │
//! │               └───────────────┘                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod chunk;
pub mod cli;
pub mod clients;
pub mod config;
pub mod herald;
pub mod mill;
pub mod remote;
pub mod throttle;
