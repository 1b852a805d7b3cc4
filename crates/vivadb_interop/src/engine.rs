//! The engine boundary trait.

use crate::error::NativeResult;
use crate::handles::{DbHandle, ListenerHandle, QueryHandle, ResultsHandle, RowHandle, VersionId};
use crate::schema::EngineConfig;
use crate::value::{AggregateOp, Value};

/// Callback invoked by the engine when a tracked result set changed in a
/// newly committed version.
///
/// Callbacks are delivered serially in commit order: a later commit's
/// deliveries do not begin until every callback for the earlier commit has
/// returned, so at invocation time the live database still observes the
/// delivered version. The engine must keep its own state readable while a
/// callback runs (callbacks may re-enter read operations; they must not
/// begin write transactions), and must stop invoking the callback once the
/// registration is unregistered.
pub type ChangeCallback = Box<dyn Fn(VersionId) + Send + Sync>;

/// The storage/query engine, seen through its handle-based boundary.
///
/// Every operation takes the `DbHandle` the other handles were issued
/// against; handles are never valid across databases. Implementations are
/// internally synchronized: a database may be read from multiple threads
/// concurrently, writes are single-writer.
///
/// The binding layer (`vivadb_core`) never inspects engine state directly;
/// this trait is the entire contract.
pub trait Engine: Send + Sync {
    // --- database lifecycle ---

    /// Opens a live database described by `config`.
    fn open(&self, config: &EngineConfig) -> NativeResult<DbHandle>;

    /// Closes a database handle. Closing an already-closed handle is a
    /// no-op. All handles issued against `db` become invalid, and listeners
    /// registered through `db` are unregistered (their callbacks are
    /// dropped; no callback starts after this returns).
    fn close(&self, db: DbHandle);

    /// Returns the version currently observed through `db`: the fixed
    /// snapshot version for frozen handles, the latest committed version
    /// for live handles.
    fn version_of(&self, db: DbHandle) -> NativeResult<VersionId>;

    /// Creates a frozen snapshot handle at `db`'s current version.
    fn freeze(&self, db: DbHandle) -> NativeResult<DbHandle>;

    // --- write transactions ---

    /// Begins a write transaction on a live handle.
    fn begin_write(&self, db: DbHandle) -> NativeResult<()>;

    /// Commits the active write transaction, returning the new version.
    fn commit_write(&self, db: DbHandle) -> NativeResult<VersionId>;

    /// Cancels the active write transaction, discarding its changes.
    fn cancel_write(&self, db: DbHandle) -> NativeResult<()>;

    // --- rows ---

    /// Inserts a row of `type_name` with the given field values. Requires
    /// an active write transaction.
    fn row_insert(
        &self,
        db: DbHandle,
        type_name: &str,
        values: &[(&str, Value)],
    ) -> NativeResult<RowHandle>;

    /// Reads one property of a row, as observed through `db`.
    fn row_get(&self, db: DbHandle, row: RowHandle, property: &str) -> NativeResult<Value>;

    /// Writes one property of a row. Requires an active write transaction.
    fn row_set(
        &self,
        db: DbHandle,
        row: RowHandle,
        property: &str,
        value: Value,
    ) -> NativeResult<()>;

    /// Returns whether the row still exists as observed through `db`.
    /// Never errors; unknown handles report `false`.
    fn row_is_live(&self, db: DbHandle, row: RowHandle) -> bool;

    /// Deletes a row. Requires an active write transaction.
    fn row_delete(&self, db: DbHandle, row: RowHandle) -> NativeResult<()>;

    // --- queries ---

    /// Parses a filter string with positional arguments into a query
    /// handle for `type_name`.
    fn query_parse(
        &self,
        db: DbHandle,
        type_name: &str,
        filter: &str,
        args: &[Value],
    ) -> NativeResult<QueryHandle>;

    /// Composes a new query by appending a parsed fragment onto `base`.
    /// `base` is untouched.
    fn query_append(
        &self,
        db: DbHandle,
        base: QueryHandle,
        fragment: &str,
        args: &[Value],
    ) -> NativeResult<QueryHandle>;

    /// Executes a query against `db`'s version, materializing a results
    /// handle.
    fn query_execute(&self, db: DbHandle, query: QueryHandle) -> NativeResult<ResultsHandle>;

    /// Counts matching rows without materializing them.
    fn query_count(&self, db: DbHandle, query: QueryHandle) -> NativeResult<u64>;

    /// Computes a scalar aggregate over one property of the matching rows.
    /// Returns `None` when no rows match (count is not an aggregate here).
    /// Property existence and numeric suitability are validated at this
    /// point, not at parse time.
    fn query_aggregate(
        &self,
        db: DbHandle,
        query: QueryHandle,
        op: AggregateOp,
        property: &str,
    ) -> NativeResult<Option<Value>>;

    // --- results ---

    /// Returns the number of rows behind a results handle.
    fn results_len(&self, db: DbHandle, results: ResultsHandle) -> NativeResult<usize>;

    /// Returns the row at `index` within a results handle.
    fn results_row(
        &self,
        db: DbHandle,
        results: ResultsHandle,
        index: usize,
    ) -> NativeResult<RowHandle>;

    /// Resolves a results handle issued against `source` into `target`'s
    /// version, re-running the underlying query there. The source handle
    /// is untouched.
    fn results_resolve(
        &self,
        results: ResultsHandle,
        source: DbHandle,
        target: DbHandle,
    ) -> NativeResult<ResultsHandle>;

    // --- change listeners ---

    /// Registers a change listener on a results handle. The callback fires
    /// synchronously once during registration with the currently observed
    /// version, then once per committed version in which the result set
    /// actually changed. The initial firing lets a caller that registers
    /// between commits establish a baseline without racing the next commit.
    fn listener_register(
        &self,
        db: DbHandle,
        results: ResultsHandle,
        callback: ChangeCallback,
    ) -> NativeResult<ListenerHandle>;

    /// Unregisters a change listener. Idempotent; never errors, including
    /// after the owning database has closed. A callback concurrently in
    /// flight may still complete, but no callback starts after this
    /// returns.
    fn listener_unregister(&self, listener: ListenerHandle);
}
