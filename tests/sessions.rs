//! Session integration tests.
//!
//! This module contains integration tests for the client side:
//! - Reconciliation: rewind and replay against authoritative snapshots
//! - Client session: handshake, phases and the fixed-step loop over in-memory transports

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Session test modules
mod sessions {
    pub mod client_session;
    pub mod reconciliation;
}
