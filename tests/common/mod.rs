//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: deterministic state updaters and a counting simulation
//! - `test_utils`: in-memory transports, loopback helpers and polling utilities
//!
//! # Usage
//!
//! From any integration test aggregator:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::stubs::{PositionUpdater, StaminaUpdater};
//! use common::{init_tracing, wait_until};
//! ```

pub mod stubs;
pub mod test_utils;

// Re-export commonly used items for convenience.
#[allow(unused_imports)]
pub use test_utils::{init_tracing, loopback, wait_until, POLL_INTERVAL, WAIT_TIMEOUT};
