//! Live and frozen database references.

use crate::error::{translate_native, DbError, DbResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vivadb_interop::{DbHandle, Engine, VersionId};

/// Whether a reference tracks the live session or a fixed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefMode {
    /// Bound to the current write/read session; its version advances with
    /// commits.
    Live,
    /// Fixed at one version; safely shareable across threads, read-only.
    Frozen,
}

/// A binding between a native database handle and a version scope.
///
/// Every managed object, query, results view and aggregate view holds a
/// non-owning association to the `Reference` it was created from, and
/// re-validates the closed flag before every native call. Once a reference
/// closes, all derived handles are terminally invalid.
pub struct Reference {
    engine: Arc<dyn Engine>,
    db: DbHandle,
    mode: RefMode,
    closed: RwLock<bool>,
    in_write: AtomicBool,
}

impl Reference {
    /// Wraps a freshly issued database handle.
    pub(crate) fn new(engine: Arc<dyn Engine>, db: DbHandle, mode: RefMode) -> Arc<Self> {
        Arc::new(Self {
            engine,
            db,
            mode,
            closed: RwLock::new(false),
            in_write: AtomicBool::new(false),
        })
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub(crate) fn db(&self) -> DbHandle {
        self.db
    }

    /// Returns whether this is a frozen (fixed-version) reference.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.mode == RefMode::Frozen
    }

    /// Returns whether this reference has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    /// Returns whether a write transaction is currently active on this
    /// reference.
    #[must_use]
    pub fn is_in_write_transaction(&self) -> bool {
        self.in_write.load(Ordering::SeqCst)
    }

    /// Fails with `InvalidState` if this reference has been closed.
    pub(crate) fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            Err(DbError::invalid_state("database is closed"))
        } else {
            Ok(())
        }
    }

    /// Resolves the version this reference currently observes.
    ///
    /// The closed flag is re-checked here before the native call; the
    /// engine's own check is not reliable once the database is closed.
    pub fn version(&self) -> DbResult<VersionId> {
        self.ensure_open()?;
        self.engine.version_of(self.db).map_err(translate_native)
    }

    /// Begins a write transaction. Only legal on an open, live reference.
    pub(crate) fn begin_write(&self) -> DbResult<()> {
        self.ensure_open()?;
        if self.is_frozen() {
            return Err(DbError::invalid_state(
                "cannot write through a frozen reference",
            ));
        }
        self.engine.begin_write(self.db).map_err(translate_native)?;
        self.in_write.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Commits the active write transaction, returning the new version.
    pub(crate) fn commit_write(&self) -> DbResult<VersionId> {
        self.ensure_open()?;
        let version = self.engine.commit_write(self.db).map_err(translate_native)?;
        self.in_write.store(false, Ordering::SeqCst);
        tracing::debug!(%version, "write transaction committed");
        Ok(version)
    }

    /// Cancels the active write transaction, discarding its changes.
    pub(crate) fn cancel_write(&self) -> DbResult<()> {
        self.ensure_open()?;
        self.engine.cancel_write(self.db).map_err(translate_native)?;
        self.in_write.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Closes this reference. Idempotent. No further native calls are
    /// issued through it afterwards.
    pub fn close(&self) {
        let mut closed = self.closed.write();
        if *closed {
            return;
        }
        *closed = true;
        self.in_write.store(false, Ordering::SeqCst);
        self.engine.close(self.db);
        tracing::debug!(db = %self.db, "reference closed");
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reference")
            .field("db", &self.db)
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
