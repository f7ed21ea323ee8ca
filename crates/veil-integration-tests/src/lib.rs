//! Integration test crate for the Veil relay.
//!
//! This crate has no library code; it only contains integration tests
//! that exercise end-to-end relay flows across multiple workspace crates.
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p veil-integration-tests
//! ```
