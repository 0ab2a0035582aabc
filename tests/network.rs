//! Network integration tests.
//!
//! This module contains integration tests for both transports:
//! - Reliable channel: ConnectionManager and ReliableClient over real TCP sockets
//! - Unreliable channel: UDP datagrams, keep-alive filtering and malformed packets

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Network test modules
mod network {
    pub mod reliable_channel;
    pub mod udp;
}
