//! # VivaDB Testkit
//!
//! Test utilities for VivaDB.
//!
//! This crate provides:
//! - `MemoryEngine`, a complete in-memory implementation of the
//!   `vivadb_interop::Engine` boundary with versioned snapshots, a small
//!   filter grammar and commit-time change listeners
//! - Test fixtures (schemas, open helpers, tracing init)
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vivadb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_engine() {
//!     let engine = memory_engine();
//!     let db = engine.open(&person_config()).unwrap();
//!     // ... test operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::engine::MemoryEngine;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use vivadb_interop::Engine;
}

pub use engine::MemoryEngine;
pub use fixtures::*;
