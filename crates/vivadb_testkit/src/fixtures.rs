//! Test fixtures and helpers.

use crate::engine::MemoryEngine;
use std::sync::Arc;
use vivadb_interop::{DbHandle, Engine, EngineConfig, FieldType, TypeSchema, Value};

/// Creates a shared in-memory engine.
#[must_use]
pub fn memory_engine() -> Arc<MemoryEngine> {
    MemoryEngine::shared()
}

/// Standard test schema: a `Person` type with string, int, float and bool
/// fields.
#[must_use]
pub fn person_config() -> EngineConfig {
    EngineConfig::new("test").with_type(
        TypeSchema::new("Person")
            .field("name", FieldType::Str)
            .field("age", FieldType::Int)
            .field("score", FieldType::Float)
            .field("active", FieldType::Bool),
    )
}

/// Opens a database with the standard test schema on a fresh engine,
/// returning both.
#[must_use]
pub fn open_person_db() -> (Arc<MemoryEngine>, DbHandle) {
    let engine = memory_engine();
    let db = engine
        .open(&person_config())
        .expect("open on a fresh engine cannot fail");
    (engine, db)
}

/// Inserts one `Person` row inside its own write transaction.
pub fn insert_person(engine: &MemoryEngine, db: DbHandle, name: &str, age: i64) {
    engine.begin_write(db).expect("begin_write");
    engine
        .row_insert(
            db,
            "Person",
            &[
                ("name", Value::from(name)),
                ("age", Value::Int(age)),
                ("active", Value::Bool(true)),
            ],
        )
        .expect("row_insert");
    engine.commit_write(db).expect("commit_write");
}

/// Initializes a tracing subscriber for tests, honoring `RUST_LOG`.
///
/// Safe to call from multiple tests; only the first call installs the
/// subscriber.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
