//! # VivaDB Interop
//!
//! The handle-based boundary between the VivaDB binding layer and the
//! storage engine.
//!
//! This crate provides:
//! - Opaque handle types scoped to a database version (`DbHandle`,
//!   `QueryHandle`, `ResultsHandle`, `RowHandle`, `ListenerHandle`)
//! - The `Value` and `FieldType` types that cross the boundary
//! - The closed `NativeError` taxonomy the engine reports from
//! - The `Engine` trait, the signature-level contract every engine
//!   implementation satisfies
//!
//! Nothing in this crate touches storage itself; the engine behind the
//! trait is an external collaborator.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod handles;
mod schema;
mod value;

pub use engine::{ChangeCallback, Engine};
pub use error::{NativeError, NativeErrorCode, NativeResult};
pub use handles::{DbHandle, ListenerHandle, QueryHandle, ResultsHandle, RowHandle, VersionId};
pub use schema::{EngineConfig, TypeSchema};
pub use value::{AggregateOp, FieldType, Value};
