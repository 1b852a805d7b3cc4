//! # VivaDB Core
//!
//! The client-side binding layer over a handle-based storage engine.
//!
//! Callers see ordinary objects, composable queries and observable result
//! views; underneath, every value is a raw native handle whose validity is
//! scoped to a database version. This crate manages those lifetimes,
//! bridges the engine's change callbacks into cancellable version-ordered
//! streams, and translates engine failures into a stable error taxonomy.
//!
//! ## Architecture
//!
//! - [`Database`] / [`Reference`] — live and frozen bindings to a native
//!   database handle; closing one terminally invalidates everything
//!   derived from it
//! - [`Object`] and the [`ManagedHandle`] trait — lazy-validity handles
//!   over stored rows
//! - [`Query`] — immutable, lazily composed filter expressions
//! - [`Results`], [`AggregateView`], [`CountView`] — evaluate-once views
//!   that can be thawed into another version
//! - [`Subscription`] — cold, cancellable change-notification streams
//! - [`DbError`] — the caller-facing error taxonomy
//!
//! The engine itself lives behind [`vivadb_interop::Engine`]; this crate
//! never reaches past that boundary.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use vivadb_core::{Database, SortOrder};
//! use vivadb_interop::{EngineConfig, FieldType, TypeSchema, Value};
//! use vivadb_testkit::MemoryEngine;
//!
//! # fn main() -> Result<(), vivadb_core::DbError> {
//! let config = EngineConfig::new("people").with_type(
//!     TypeSchema::new("Person")
//!         .field("name", FieldType::Str)
//!         .field("age", FieldType::Int),
//! );
//! let db = Database::open(Arc::new(MemoryEngine::new()), config)?;
//!
//! db.write(|txn| {
//!     txn.insert("Person", &[("name", Value::from("ada")), ("age", Value::Int(36))])?;
//!     Ok(())
//! })?;
//!
//! let adults = db
//!     .query("Person", "age >= $0", vec![Value::Int(18)])?
//!     .sort("name", SortOrder::Ascending)?
//!     .find();
//! assert_eq!(adults.len()?, 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod database;
pub mod error;
pub mod notify;
pub mod object;
pub mod query;
pub mod reference;
pub mod results;
pub mod transaction;

pub use aggregate::{AggregateView, CountView};
pub use database::Database;
pub use error::{DbError, DbResult};
pub use notify::{ChangeNotification, Subscription};
pub use object::{ManagedHandle, Object, ObjectState};
pub use query::{Query, SortOrder};
pub use reference::{RefMode, Reference};
pub use results::{Results, ResultsIter};
pub use transaction::WriteTransaction;

// Interop types that appear in this crate's public signatures.
pub use vivadb_interop::{AggregateOp, EngineConfig, FieldType, TypeSchema, Value, VersionId};
