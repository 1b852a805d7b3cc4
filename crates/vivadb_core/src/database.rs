//! The caller-facing database facade.

use crate::error::{translate_native, DbResult};
use crate::query::Query;
use crate::reference::{RefMode, Reference};
use crate::transaction::WriteTransaction;
use std::sync::Arc;
use vivadb_interop::{Engine, EngineConfig, Value, VersionId};

/// An open database: a reference plus the entry points for querying and
/// writing through it.
///
/// A live database tracks the latest committed version; a frozen one
/// (from [`freeze`]) is pinned at a single version, read-only, and freely
/// shareable across threads. Dropping a `Database` closes its reference.
///
/// [`freeze`]: Database::freeze
pub struct Database {
    reference: Arc<Reference>,
}

impl Database {
    /// Opens a live database on `engine` with the given schema config.
    pub fn open(engine: Arc<dyn Engine>, config: EngineConfig) -> DbResult<Self> {
        let db = engine.open(&config).map_err(translate_native)?;
        tracing::info!(%db, "database opened");
        Ok(Self {
            reference: Reference::new(engine, db, RefMode::Live),
        })
    }

    pub(crate) fn reference(&self) -> &Arc<Reference> {
        &self.reference
    }

    /// Returns whether this database is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.reference.is_closed()
    }

    /// Returns whether this database is a frozen snapshot.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.reference.is_frozen()
    }

    /// Returns the version this database currently observes.
    pub fn version(&self) -> DbResult<VersionId> {
        self.reference.version()
    }

    /// Creates a frozen snapshot of this database at its current version.
    pub fn freeze(&self) -> DbResult<Database> {
        self.reference.ensure_open()?;
        let frozen = self
            .reference
            .engine()
            .freeze(self.reference.db())
            .map_err(translate_native)?;
        Ok(Self {
            reference: Reference::new(Arc::clone(self.reference.engine()), frozen, RefMode::Frozen),
        })
    }

    /// Parses a query over `type_name` with a filter and positional
    /// arguments.
    pub fn query(
        &self,
        type_name: impl Into<String>,
        filter: impl Into<String>,
        args: Vec<Value>,
    ) -> DbResult<Query> {
        Query::new(&self.reference, type_name, filter, args)
    }

    /// Parses a query matching every row of `type_name`.
    pub fn query_all(&self, type_name: impl Into<String>) -> DbResult<Query> {
        Query::new(&self.reference, type_name, "TRUEPREDICATE", Vec::new())
    }

    /// Runs `f` inside a write transaction.
    ///
    /// Commits when `f` returns `Ok`, cancels when it returns `Err`. The
    /// transaction binds this reference to the calling thread for its
    /// duration; only one writer is admitted at a time.
    pub fn write<T>(&self, f: impl FnOnce(&WriteTransaction<'_>) -> DbResult<T>) -> DbResult<T> {
        self.reference.begin_write()?;
        let txn = WriteTransaction::new(&self.reference);
        match f(&txn) {
            Ok(value) => {
                self.reference.commit_write()?;
                Ok(value)
            }
            Err(err) => {
                // Surface the caller's error even if the rollback itself
                // fails (the reference may have closed mid-transaction).
                if let Err(cancel_err) = self.reference.cancel_write() {
                    tracing::warn!(error = %cancel_err, "write rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Closes this database. Idempotent. Every handle derived from it
    /// becomes terminally invalid.
    pub fn close(&self) {
        self.reference.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("open", &self.is_open())
            .field("frozen", &self.is_frozen())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use vivadb_testkit::prelude::*;

    fn open_db() -> Database {
        init_tracing();
        Database::open(memory_engine(), person_config()).unwrap()
    }

    #[test]
    fn open_database_starts_at_version_zero() {
        let db = open_db();
        assert!(db.is_open());
        assert!(!db.is_frozen());
        assert_eq!(db.version().unwrap(), VersionId::new(0));
    }

    #[test]
    fn commits_advance_the_version() {
        let db = open_db();
        db.write(|txn| {
            txn.insert("Person", &[("name", Value::from("a"))])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.version().unwrap(), VersionId::new(1));
    }

    #[test]
    fn failed_writes_roll_back() {
        let db = open_db();
        let err = db.write(|txn| {
            txn.insert("Person", &[("name", Value::from("ghost"))])?;
            Err::<(), _>(DbError::invalid_argument("caller bailed"))
        });
        assert_eq!(err.unwrap_err(), DbError::invalid_argument("caller bailed"));

        assert_eq!(db.version().unwrap(), VersionId::new(0));
        assert_eq!(db.query_all("Person").unwrap().find().len().unwrap(), 0);
    }

    #[test]
    fn frozen_snapshot_is_pinned_and_read_only() {
        let db = open_db();
        db.write(|txn| {
            txn.insert("Person", &[("age", Value::Int(1))])?;
            Ok(())
        })
        .unwrap();

        let frozen = db.freeze().unwrap();
        assert!(frozen.is_frozen());
        let pinned = frozen.version().unwrap();

        db.write(|txn| {
            txn.insert("Person", &[("age", Value::Int(2))])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(frozen.version().unwrap(), pinned);
        assert_eq!(frozen.query_all("Person").unwrap().find().len().unwrap(), 1);
        assert!(matches!(
            frozen.write(|_| Ok(())),
            Err(DbError::InvalidState { .. })
        ));
    }

    #[test]
    fn closing_the_live_database_leaves_snapshots_usable() {
        let db = open_db();
        let frozen = db.freeze().unwrap();
        db.close();

        assert!(!db.is_open());
        assert!(frozen.is_open());
        assert_eq!(frozen.version().unwrap(), VersionId::new(0));
    }

    #[test]
    fn operations_after_close_fail() {
        let db = open_db();
        db.close();
        assert_eq!(
            db.query_all("Person").unwrap_err(),
            DbError::invalid_state("database is closed")
        );
        assert!(db.write(|_| Ok(())).is_err());
    }
}
