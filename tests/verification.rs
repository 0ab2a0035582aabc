//! Verification integration tests.
//!
//! This module contains property-based tests:
//! - Tick arithmetic and history indexing across the 32-bit wrap
//! - Codec robustness against arbitrary bytes
//! - Stream framing across arbitrary read boundaries
//! - Reconciliation determinism and the catch-up bound

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Verification test modules
mod verification {
    pub mod property;
}
