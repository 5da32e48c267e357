// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the migration task engine.
//!
//! These tests verify itinerary selection and phase sequences across
//! migration shapes WITHOUT requiring live clusters. They drive the
//! production `select_itinerary` / `next_phase` functions against mocked
//! migration state.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_stage_with_one_pvc
//!
//! # Run with verbose output
//! cargo test --test functional -- --nocapture
//! ```
//!
//! ## Test Categories
//!
//! - **Itinerary tests**: Full phase walks for each migration shape
//!   (stage, final, no-PVs, cancel, failed)
//! - **Compat tests**: API-version conversion round trips
//! - **Transfer tests**: rsync wire formats and progress parsing
//!
//! ## Design Principles
//!
//! - **No clusters required**: Tests run without any infrastructure
//! - **Production logic only**: Mocks simulate state; stepping delegates
//!   to the real engine functions
//! - **Executable documentation**: Tests record the expected phase orders

mod compat_tests;
mod itinerary_tests;
mod mock_state;
mod transfer_tests;

// Re-export for use in tests
pub use mock_state::*;
