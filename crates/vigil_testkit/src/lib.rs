//! # Vigil Testkit
//!
//! Test utilities for the Vigil sync engine.
//!
//! This crate provides:
//! - A harness wiring an engine to mock collaborators on a manual clock
//! - Property-based generators for messages and cache mutations
//! - Invariant checks for cached conversation windows
//! - Push payload test vectors
//! - Fuzz targets for the snapshot decoders
//!
//! Cross-crate scenario tests live in this crate's `tests/` directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vigil_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn sends_confirm() {
//!     let harness = TestHarness::memory();
//!     harness.conversation("c-1", "bob");
//!     let engine = harness.connected_engine().await;
//!     // ... drive the engine
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod fuzz;
pub mod generators;
pub mod invariants;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::invariants::*;
}

pub use fixtures::*;
pub use fuzz::*;
pub use generators::*;
pub use invariants::*;
pub use vectors::*;
