//! In-memory reference implementation of the engine boundary.
//!
//! `MemoryEngine` keeps a full copy-on-write snapshot per committed version,
//! so frozen handles and thawing behave exactly like the production engine's
//! MVCC without any of its storage machinery. Queries are parsed from the
//! same textual grammar the binding layer composes against:
//!
//! ```text
//! TRUEPREDICATE
//! name == $0 AND age > 18
//! TRUEPREDICATE SORT(age DESC, name ASC) DISTINCT(name) LIMIT(10)
//! ```
//!
//! Appended `SORT`/`DISTINCT`/`LIMIT` clauses form a pipeline applied in
//! append order after the predicate.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use vivadb_interop::{
    AggregateOp, ChangeCallback, DbHandle, Engine, EngineConfig, FieldType, ListenerHandle,
    NativeError, NativeResult, QueryHandle, ResultsHandle, RowHandle, TypeSchema, Value,
    VersionId,
};

/// One stored record: property name to value.
type Row = BTreeMap<String, Value>;
/// All rows of one type, in insertion order.
type TableData = BTreeMap<u64, Row>;
/// Full database content at one version.
type Snapshot = HashMap<String, TableData>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Predicate {
    /// Matches every row.
    True,
    /// Single property comparison; the argument value is already resolved.
    Cmp {
        property: String,
        op: CmpOp,
        value: Value,
    },
    /// Conjunction.
    And(Box<Predicate>, Box<Predicate>),
}

#[derive(Debug, Clone)]
enum Clause {
    /// Stable multi-key sort; bool is ascending.
    Sort(Vec<(String, bool)>),
    /// Keep the first row per distinct key tuple.
    Distinct(Vec<String>),
    /// Truncate to at most n rows.
    Limit(usize),
}

#[derive(Debug, Clone)]
struct StoredQuery {
    db_id: u64,
    type_name: String,
    predicate: Predicate,
    pipeline: Vec<Clause>,
}

#[derive(Debug, Clone)]
struct StoredResults {
    query: QueryHandle,
    version: VersionId,
    rows: Vec<u64>,
}

#[derive(Debug, Clone, Copy)]
enum HandleKind {
    Live,
    Frozen(VersionId),
}

#[derive(Debug, Clone, Copy)]
struct HandleInfo {
    db_id: u64,
    kind: HandleKind,
}

struct DatabaseState {
    config: EngineConfig,
    version: VersionId,
    snapshots: BTreeMap<VersionId, Snapshot>,
    /// Row id to type name, for row-handle resolution.
    row_types: HashMap<u64, String>,
    /// Working copy during an active write transaction.
    working: Option<Snapshot>,
    /// Handle that owns the active write transaction.
    writer: Option<u64>,
    next_row: u64,
}

impl DatabaseState {
    fn schema(&self, type_name: &str) -> NativeResult<&TypeSchema> {
        self.config
            .type_schema(type_name)
            .ok_or_else(|| NativeError::invalid_query(format!("unknown type '{type_name}'")))
    }

    /// Resolves the snapshot a handle observes. Live handles inside their
    /// own write transaction see the working copy.
    fn view(&self, handle_id: u64, kind: HandleKind) -> NativeResult<&Snapshot> {
        match kind {
            HandleKind::Frozen(version) => self.snapshots.get(&version).ok_or_else(|| {
                NativeError::invalid_handle(format!("no snapshot at version {version}"))
            }),
            HandleKind::Live => {
                if self.writer == Some(handle_id) {
                    if let Some(working) = &self.working {
                        return Ok(working);
                    }
                }
                self.snapshots.get(&self.version).ok_or_else(|| {
                    NativeError::invalid_handle("database has no committed snapshot")
                })
            }
        }
    }
}

struct ListenerState {
    db_id: u64,
    /// Database handle the listener was registered through; the listener
    /// dies with it.
    handle_id: u64,
    query: QueryHandle,
    callback: Arc<dyn Fn(VersionId) + Send + Sync>,
    /// Held while the callback runs; set to false on unregister so no
    /// callback starts afterwards.
    gate: Arc<Mutex<bool>>,
    /// Matching rows (ids and contents) as of the last notification.
    last: Vec<(u64, Row)>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    databases: HashMap<u64, DatabaseState>,
    handles: HashMap<u64, HandleInfo>,
    queries: HashMap<u64, StoredQuery>,
    results: HashMap<u64, StoredResults>,
    listeners: HashMap<u64, ListenerState>,
}

impl State {
    fn fresh_id(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn handle(&self, db: DbHandle) -> NativeResult<HandleInfo> {
        self.handles
            .get(&db.as_u64())
            .copied()
            .ok_or_else(|| NativeError::invalid_handle(format!("{db} is closed")))
    }

    fn database(&self, db_id: u64) -> NativeResult<&DatabaseState> {
        self.databases
            .get(&db_id)
            .ok_or_else(|| NativeError::invalid_handle("database no longer exists"))
    }

    fn query(&self, query: QueryHandle) -> NativeResult<&StoredQuery> {
        self.queries
            .get(&query.as_u64())
            .ok_or_else(|| NativeError::invalid_handle("unknown query handle"))
    }

    fn stored_results(&self, results: ResultsHandle) -> NativeResult<&StoredResults> {
        self.results
            .get(&results.as_u64())
            .ok_or_else(|| NativeError::invalid_handle("unknown results handle"))
    }
}

/// An in-memory engine implementing the full `Engine` boundary.
///
/// Thread-safe; a single `MemoryEngine` can host any number of independent
/// databases. Change callbacks are invoked outside the engine's state lock,
/// so callbacks may freely call back into the engine; the delivery lock
/// serializes them so callbacks for version N finish before version N+1's
/// commit can deliver.
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
    /// Held across a commit (or registration) and its callback deliveries.
    delivery: Mutex<()>,
}

impl MemoryEngine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine behind an `Arc`, ready to be shared with the
    /// binding layer.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Engine for MemoryEngine {
    fn open(&self, config: &EngineConfig) -> NativeResult<DbHandle> {
        let mut state = self.state.lock();
        let db_id = state.fresh_id();
        let handle_id = state.fresh_id();

        let mut snapshots = BTreeMap::new();
        snapshots.insert(VersionId::new(0), Snapshot::new());

        state.databases.insert(
            db_id,
            DatabaseState {
                config: config.clone(),
                version: VersionId::new(0),
                snapshots,
                row_types: HashMap::new(),
                working: None,
                writer: None,
                next_row: 0,
            },
        );
        state.handles.insert(
            handle_id,
            HandleInfo {
                db_id,
                kind: HandleKind::Live,
            },
        );
        Ok(DbHandle(handle_id))
    }

    fn close(&self, db: DbHandle) {
        let gates = {
            let mut state = self.state.lock();
            let Some(info) = state.handles.remove(&db.as_u64()) else {
                return;
            };
            // An uncommitted write transaction dies with its handle.
            if let Some(database) = state.databases.get_mut(&info.db_id) {
                if database.writer == Some(db.as_u64()) {
                    database.working = None;
                    database.writer = None;
                }
            }
            // Listeners registered through this handle die with it too,
            // dropping their callbacks.
            let doomed: Vec<u64> = state
                .listeners
                .iter()
                .filter(|(_, listener)| listener.handle_id == db.as_u64())
                .map(|(id, _)| *id)
                .collect();
            doomed
                .into_iter()
                .filter_map(|id| state.listeners.remove(&id))
                .map(|listener| listener.gate)
                .collect::<Vec<_>>()
        };
        // Closing the gates outside the state lock waits out in-flight
        // callbacks without deadlocking against them.
        for gate in gates {
            *gate.lock() = false;
        }
    }

    fn version_of(&self, db: DbHandle) -> NativeResult<VersionId> {
        let state = self.state.lock();
        let info = state.handle(db)?;
        match info.kind {
            HandleKind::Frozen(version) => Ok(version),
            HandleKind::Live => Ok(state.database(info.db_id)?.version),
        }
    }

    fn freeze(&self, db: DbHandle) -> NativeResult<DbHandle> {
        let mut state = self.state.lock();
        let info = state.handle(db)?;
        let version = state.database(info.db_id)?.version;
        let handle_id = state.fresh_id();
        state.handles.insert(
            handle_id,
            HandleInfo {
                db_id: info.db_id,
                kind: HandleKind::Frozen(version),
            },
        );
        Ok(DbHandle(handle_id))
    }

    fn begin_write(&self, db: DbHandle) -> NativeResult<()> {
        let mut state = self.state.lock();
        let info = state.handle(db)?;
        if matches!(info.kind, HandleKind::Frozen(_)) {
            return Err(NativeError::other("cannot write through a frozen handle"));
        }
        let database = state
            .databases
            .get_mut(&info.db_id)
            .ok_or_else(|| NativeError::invalid_handle("database no longer exists"))?;
        if database.writer.is_some() {
            return Err(NativeError::other("a write transaction is already active"));
        }
        let base = database
            .snapshots
            .get(&database.version)
            .cloned()
            .unwrap_or_default();
        database.working = Some(base);
        database.writer = Some(db.as_u64());
        Ok(())
    }

    fn commit_write(&self, db: DbHandle) -> NativeResult<VersionId> {
        // Held until every callback for this commit has returned, so a
        // racing writer's next commit cannot deliver out of order.
        let _delivery = self.delivery.lock();
        let (pending, new_version) = {
            let mut state = self.state.lock();
            let info = state.handle(db)?;
            let database = state
                .databases
                .get_mut(&info.db_id)
                .ok_or_else(|| NativeError::invalid_handle("database no longer exists"))?;
            if database.writer != Some(db.as_u64()) {
                return Err(NativeError::other("no active write transaction"));
            }
            let working = database
                .working
                .take()
                .ok_or_else(|| NativeError::other("no active write transaction"))?;
            database.writer = None;
            let new_version = database.version.next();
            database.version = new_version;
            database.snapshots.insert(new_version, working);

            let pending = collect_changed_listeners(&mut state, info.db_id, new_version);
            (pending, new_version)
        };

        // Callbacks run outside the engine lock so they may re-enter.
        for (callback, gate, version) in pending {
            let active = gate.lock();
            if *active {
                callback(version);
            }
        }
        Ok(new_version)
    }

    fn cancel_write(&self, db: DbHandle) -> NativeResult<()> {
        let mut state = self.state.lock();
        let info = state.handle(db)?;
        let database = state
            .databases
            .get_mut(&info.db_id)
            .ok_or_else(|| NativeError::invalid_handle("database no longer exists"))?;
        if database.writer != Some(db.as_u64()) {
            return Err(NativeError::other("no active write transaction"));
        }
        database.working = None;
        database.writer = None;
        Ok(())
    }

    fn row_insert(
        &self,
        db: DbHandle,
        type_name: &str,
        values: &[(&str, Value)],
    ) -> NativeResult<RowHandle> {
        let mut state = self.state.lock();
        let info = state.handle(db)?;
        let database = state
            .databases
            .get_mut(&info.db_id)
            .ok_or_else(|| NativeError::invalid_handle("database no longer exists"))?;
        if database.writer != Some(db.as_u64()) {
            return Err(NativeError::other("no active write transaction"));
        }
        let schema = database.schema(type_name)?.clone();

        let mut row = Row::new();
        for (name, _) in &schema.fields {
            row.insert(name.clone(), Value::Null);
        }
        for (name, value) in values {
            let declared = schema.field_type(name).ok_or_else(|| {
                NativeError::invalid_query(format!("unknown field '{name}' for type '{type_name}'"))
            })?;
            check_value_type(name, declared, value)?;
            row.insert((*name).to_string(), value.clone());
        }

        database.next_row += 1;
        let row_id = database.next_row;
        database.row_types.insert(row_id, type_name.to_string());
        database
            .working
            .as_mut()
            .ok_or_else(|| NativeError::other("no active write transaction"))?
            .entry(type_name.to_string())
            .or_default()
            .insert(row_id, row);
        Ok(RowHandle(row_id))
    }

    fn row_get(&self, db: DbHandle, row: RowHandle, property: &str) -> NativeResult<Value> {
        let state = self.state.lock();
        let info = state.handle(db)?;
        let database = state.database(info.db_id)?;
        let type_name = database
            .row_types
            .get(&row.as_u64())
            .ok_or_else(|| NativeError::invalid_handle("unknown row handle"))?
            .clone();
        let schema = database.schema(&type_name)?;
        if schema.field_type(property).is_none() {
            return Err(NativeError::invalid_query(format!(
                "unknown field '{property}' for type '{type_name}'"
            )));
        }
        let view = database.view(db.as_u64(), info.kind)?;
        let stored = view
            .get(&type_name)
            .and_then(|table| table.get(&row.as_u64()))
            .ok_or_else(|| NativeError::invalid_handle("row has been deleted"))?;
        Ok(stored.get(property).cloned().unwrap_or(Value::Null))
    }

    fn row_set(
        &self,
        db: DbHandle,
        row: RowHandle,
        property: &str,
        value: Value,
    ) -> NativeResult<()> {
        let mut state = self.state.lock();
        let info = state.handle(db)?;
        let database = state
            .databases
            .get_mut(&info.db_id)
            .ok_or_else(|| NativeError::invalid_handle("database no longer exists"))?;
        if database.writer != Some(db.as_u64()) {
            return Err(NativeError::other("no active write transaction"));
        }
        let type_name = database
            .row_types
            .get(&row.as_u64())
            .ok_or_else(|| NativeError::invalid_handle("unknown row handle"))?
            .clone();
        let declared = database.schema(&type_name)?.field_type(property).ok_or_else(|| {
            NativeError::invalid_query(format!(
                "unknown field '{property}' for type '{type_name}'"
            ))
        })?;
        check_value_type(property, declared, &value)?;
        let stored = database
            .working
            .as_mut()
            .ok_or_else(|| NativeError::other("no active write transaction"))?
            .get_mut(&type_name)
            .and_then(|table| table.get_mut(&row.as_u64()))
            .ok_or_else(|| NativeError::invalid_handle("row has been deleted"))?;
        stored.insert(property.to_string(), value);
        Ok(())
    }

    fn row_is_live(&self, db: DbHandle, row: RowHandle) -> bool {
        let state = self.state.lock();
        let Ok(info) = state.handle(db) else {
            return false;
        };
        let Ok(database) = state.database(info.db_id) else {
            return false;
        };
        let Some(type_name) = database.row_types.get(&row.as_u64()) else {
            return false;
        };
        let Ok(view) = database.view(db.as_u64(), info.kind) else {
            return false;
        };
        view.get(type_name)
            .is_some_and(|table| table.contains_key(&row.as_u64()))
    }

    fn row_delete(&self, db: DbHandle, row: RowHandle) -> NativeResult<()> {
        let mut state = self.state.lock();
        let info = state.handle(db)?;
        let database = state
            .databases
            .get_mut(&info.db_id)
            .ok_or_else(|| NativeError::invalid_handle("database no longer exists"))?;
        if database.writer != Some(db.as_u64()) {
            return Err(NativeError::other("no active write transaction"));
        }
        let type_name = database
            .row_types
            .get(&row.as_u64())
            .ok_or_else(|| NativeError::invalid_handle("unknown row handle"))?
            .clone();
        let removed = database
            .working
            .as_mut()
            .ok_or_else(|| NativeError::other("no active write transaction"))?
            .get_mut(&type_name)
            .and_then(|table| table.remove(&row.as_u64()));
        if removed.is_none() {
            return Err(NativeError::invalid_handle("row has been deleted"));
        }
        Ok(())
    }

    fn query_parse(
        &self,
        db: DbHandle,
        type_name: &str,
        filter: &str,
        args: &[Value],
    ) -> NativeResult<QueryHandle> {
        let mut state = self.state.lock();
        let info = state.handle(db)?;
        let schema = state.database(info.db_id)?.schema(type_name)?.clone();
        let (predicate, pipeline) = parse_filter(&schema, filter, args)?;
        let id = state.fresh_id();
        state.queries.insert(
            id,
            StoredQuery {
                db_id: info.db_id,
                type_name: type_name.to_string(),
                predicate,
                pipeline,
            },
        );
        Ok(QueryHandle(id))
    }

    fn query_append(
        &self,
        db: DbHandle,
        base: QueryHandle,
        fragment: &str,
        args: &[Value],
    ) -> NativeResult<QueryHandle> {
        let mut state = self.state.lock();
        let info = state.handle(db)?;
        let base_query = state.query(base)?.clone();
        let schema = state
            .database(info.db_id)?
            .schema(&base_query.type_name)?
            .clone();
        let (predicate, appended) = parse_filter(&schema, fragment, args)?;

        let combined = if matches!(predicate, Predicate::True) {
            base_query.predicate.clone()
        } else if matches!(base_query.predicate, Predicate::True) {
            predicate
        } else {
            Predicate::And(Box::new(base_query.predicate.clone()), Box::new(predicate))
        };
        let mut pipeline = base_query.pipeline.clone();
        pipeline.extend(appended);

        let id = state.fresh_id();
        state.queries.insert(
            id,
            StoredQuery {
                db_id: base_query.db_id,
                type_name: base_query.type_name,
                predicate: combined,
                pipeline,
            },
        );
        Ok(QueryHandle(id))
    }

    fn query_execute(&self, db: DbHandle, query: QueryHandle) -> NativeResult<ResultsHandle> {
        let mut state = self.state.lock();
        let info = state.handle(db)?;
        let stored = state.query(query)?.clone();
        let database = state.database(info.db_id)?;
        let version = match info.kind {
            HandleKind::Frozen(v) => v,
            HandleKind::Live => database.version,
        };
        let view = database.view(db.as_u64(), info.kind)?;
        let rows = evaluate(&stored, view).into_iter().map(|(id, _)| id).collect();
        let id = state.fresh_id();
        state.results.insert(
            id,
            StoredResults {
                query,
                version,
                rows,
            },
        );
        Ok(ResultsHandle(id))
    }

    fn query_count(&self, db: DbHandle, query: QueryHandle) -> NativeResult<u64> {
        let state = self.state.lock();
        let info = state.handle(db)?;
        let stored = state.query(query)?;
        let database = state.database(info.db_id)?;
        let view = database.view(db.as_u64(), info.kind)?;
        Ok(evaluate(stored, view).len() as u64)
    }

    fn query_aggregate(
        &self,
        db: DbHandle,
        query: QueryHandle,
        op: AggregateOp,
        property: &str,
    ) -> NativeResult<Option<Value>> {
        let state = self.state.lock();
        let info = state.handle(db)?;
        let stored = state.query(query)?;
        let database = state.database(info.db_id)?;
        let schema = database.schema(&stored.type_name)?;
        let declared = schema.field_type(property).ok_or_else(|| {
            NativeError::invalid_query(format!(
                "unknown field '{property}' for type '{}'",
                stored.type_name
            ))
        })?;
        if !matches!(declared, FieldType::Int | FieldType::Float) {
            return Err(NativeError::invalid_query(format!(
                "cannot aggregate field '{property}' of type {declared}"
            )));
        }

        let view = database.view(db.as_u64(), info.kind)?;
        let values: Vec<Value> = evaluate(stored, view)
            .into_iter()
            .filter_map(|(_, row)| {
                let v = row.get(property).cloned().unwrap_or(Value::Null);
                (v != Value::Null).then_some(v)
            })
            .collect();
        if values.is_empty() {
            return Ok(None);
        }

        let result = match op {
            AggregateOp::Min => values
                .iter()
                .cloned()
                .min_by(|a, b| value_ord(a, b))
                .unwrap_or(Value::Null),
            AggregateOp::Max => values
                .iter()
                .cloned()
                .max_by(|a, b| value_ord(a, b))
                .unwrap_or(Value::Null),
            AggregateOp::Sum => match declared {
                FieldType::Int => Value::Int(values.iter().filter_map(Value::as_int).sum()),
                _ => Value::Float(values.iter().filter_map(Value::as_numeric).sum()),
            },
            AggregateOp::Average => {
                let sum: f64 = values.iter().filter_map(Value::as_numeric).sum();
                Value::Float(sum / values.len() as f64)
            }
        };
        Ok(Some(result))
    }

    fn results_len(&self, db: DbHandle, results: ResultsHandle) -> NativeResult<usize> {
        let state = self.state.lock();
        state.handle(db)?;
        Ok(state.stored_results(results)?.rows.len())
    }

    fn results_row(
        &self,
        db: DbHandle,
        results: ResultsHandle,
        index: usize,
    ) -> NativeResult<RowHandle> {
        let state = self.state.lock();
        state.handle(db)?;
        let stored = state.stored_results(results)?;
        stored
            .rows
            .get(index)
            .map(|id| RowHandle(*id))
            .ok_or_else(|| {
                NativeError::index_out_of_bounds(format!(
                    "index {index} out of bounds for results of size {}",
                    stored.rows.len()
                ))
            })
    }

    fn results_resolve(
        &self,
        results: ResultsHandle,
        source: DbHandle,
        target: DbHandle,
    ) -> NativeResult<ResultsHandle> {
        let mut state = self.state.lock();
        state.handle(source)?;
        let target_info = state.handle(target)?;
        let stored = state.stored_results(results)?.clone();
        let query = state.query(stored.query)?.clone();
        let database = state.database(target_info.db_id)?;
        let version = match target_info.kind {
            HandleKind::Frozen(v) => v,
            HandleKind::Live => database.version,
        };
        let view = database.view(target.as_u64(), target_info.kind)?;
        let rows = evaluate(&query, view).into_iter().map(|(id, _)| id).collect();
        let id = state.fresh_id();
        state.results.insert(
            id,
            StoredResults {
                query: stored.query,
                version,
                rows,
            },
        );
        Ok(ResultsHandle(id))
    }

    fn listener_register(
        &self,
        db: DbHandle,
        results: ResultsHandle,
        callback: ChangeCallback,
    ) -> NativeResult<ListenerHandle> {
        // Registration shares the delivery lock with commit_write so the
        // initial notification lands before any later commit's callbacks.
        let _delivery = self.delivery.lock();
        let (callback, gate, version, id) = {
            let mut state = self.state.lock();
            let info = state.handle(db)?;
            let stored = state.stored_results(results)?.clone();
            let query = state.query(stored.query)?.clone();
            let database = state.database(info.db_id)?;
            let version = match info.kind {
                HandleKind::Frozen(v) => v,
                HandleKind::Live => database.version,
            };
            // The baseline is the committed snapshot, never a working copy;
            // a transaction in flight must still trigger once it commits.
            let snapshot = database.snapshots.get(&version).ok_or_else(|| {
                NativeError::invalid_handle(format!("no snapshot at version {version}"))
            })?;
            let last = evaluate(&query, snapshot);

            let callback: Arc<dyn Fn(VersionId) + Send + Sync> = Arc::from(callback);
            let gate = Arc::new(Mutex::new(true));
            let id = state.fresh_id();
            state.listeners.insert(
                id,
                ListenerState {
                    db_id: info.db_id,
                    handle_id: db.as_u64(),
                    query: stored.query,
                    callback: Arc::clone(&callback),
                    gate: Arc::clone(&gate),
                    last,
                },
            );
            (callback, gate, version, id)
        };

        // Initial notification at the registration version, delivered
        // outside the engine lock like any commit-time callback.
        {
            let active = gate.lock();
            if *active {
                callback(version);
            }
        }
        Ok(ListenerHandle(id))
    }

    fn listener_unregister(&self, listener: ListenerHandle) {
        let gate = {
            let mut state = self.state.lock();
            state
                .listeners
                .remove(&listener.as_u64())
                .map(|l| Arc::clone(&l.gate))
        };
        // Wait out any in-flight callback, then bar future ones.
        if let Some(gate) = gate {
            *gate.lock() = false;
        }
    }
}

/// Collects (callback, gate, version) for listeners whose result set changed
/// in the freshly committed version, updating their last-seen snapshots.
#[allow(clippy::type_complexity)]
fn collect_changed_listeners(
    state: &mut State,
    db_id: u64,
    version: VersionId,
) -> Vec<(Arc<dyn Fn(VersionId) + Send + Sync>, Arc<Mutex<bool>>, VersionId)> {
    let mut pending = Vec::new();
    let queries = state.queries.clone();
    let Some(database) = state.databases.get(&db_id) else {
        return pending;
    };
    let Some(snapshot) = database.snapshots.get(&version) else {
        return pending;
    };

    let mut updates = Vec::new();
    for (id, listener) in &state.listeners {
        if listener.db_id != db_id {
            continue;
        }
        let Some(query) = queries.get(&listener.query.as_u64()) else {
            continue;
        };
        let current = evaluate(query, snapshot);
        if current != listener.last {
            pending.push((
                Arc::clone(&listener.callback),
                Arc::clone(&listener.gate),
                version,
            ));
            updates.push((*id, current));
        }
    }
    for (id, current) in updates {
        if let Some(listener) = state.listeners.get_mut(&id) {
            listener.last = current;
        }
    }
    pending
}

/// Evaluates a query against a snapshot: predicate filter, then the clause
/// pipeline in append order.
fn evaluate(query: &StoredQuery, snapshot: &Snapshot) -> Vec<(u64, Row)> {
    let mut rows: Vec<(u64, Row)> = snapshot
        .get(&query.type_name)
        .map(|table| {
            table
                .iter()
                .filter(|(_, row)| matches(&query.predicate, row))
                .map(|(id, row)| (*id, row.clone()))
                .collect()
        })
        .unwrap_or_default();

    for clause in &query.pipeline {
        match clause {
            Clause::Sort(keys) => {
                rows.sort_by(|(_, a), (_, b)| {
                    for (property, ascending) in keys {
                        let av = a.get(property).unwrap_or(&Value::Null);
                        let bv = b.get(property).unwrap_or(&Value::Null);
                        let ord = value_ord(av, bv);
                        let ord = if *ascending { ord } else { ord.reverse() };
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                });
            }
            Clause::Distinct(properties) => {
                let mut seen = std::collections::HashSet::new();
                rows.retain(|(_, row)| {
                    let key: Vec<String> = properties
                        .iter()
                        .map(|p| format!("{:?}", row.get(p).unwrap_or(&Value::Null)))
                        .collect();
                    seen.insert(key)
                });
            }
            Clause::Limit(n) => rows.truncate(*n),
        }
    }
    rows
}

fn matches(predicate: &Predicate, row: &Row) -> bool {
    match predicate {
        Predicate::True => true,
        Predicate::And(a, b) => matches(a, row) && matches(b, row),
        Predicate::Cmp {
            property,
            op,
            value,
        } => {
            let field = row.get(property).unwrap_or(&Value::Null);
            compare(field, *op, value)
        }
    }
}

fn compare(field: &Value, op: CmpOp, value: &Value) -> bool {
    if matches!(field, Value::Null) || matches!(value, Value::Null) {
        return match op {
            CmpOp::Eq => field == value,
            CmpOp::Ne => field != value,
            _ => false,
        };
    }
    let ord = value_ord(field, value);
    match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
    }
}

/// Total order over values: null < bool < numeric < string; numerics compare
/// across int/float.
fn value_ord(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Str(_) => 3,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => match (a.as_numeric(), b.as_numeric()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

fn check_value_type(property: &str, declared: FieldType, value: &Value) -> NativeResult<()> {
    let compatible = match value {
        Value::Null => true,
        Value::Bool(_) => declared == FieldType::Bool,
        Value::Int(_) | Value::Float(_) => {
            matches!(declared, FieldType::Int | FieldType::Float)
        }
        Value::Str(_) => declared == FieldType::Str,
    };
    if compatible {
        Ok(())
    } else {
        Err(NativeError::invalid_query(format!(
            "cannot compare field '{property}' of type {declared} with {value}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Filter grammar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Arg(usize),
    Op(CmpOp),
    LParen,
    RParen,
    Comma,
}

fn lex(filter: &str) -> NativeResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = filter.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                }
                tokens.push(Token::Op(CmpOp::Eq));
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(NativeError::invalid_query_string(format!(
                        "unexpected character '!' in '{filter}'"
                    )));
                }
                tokens.push(Token::Op(CmpOp::Ne));
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Le));
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ge));
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                }
            }
            '$' => {
                chars.next();
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let index = digits.parse::<usize>().map_err(|_| {
                    NativeError::invalid_query_string(format!(
                        "malformed argument placeholder in '{filter}'"
                    ))
                })?;
                tokens.push(Token::Arg(index));
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for d in chars.by_ref() {
                    if d == quote {
                        closed = true;
                        break;
                    }
                    text.push(d);
                }
                if !closed {
                    return Err(NativeError::invalid_query_string(format!(
                        "unterminated string literal in '{filter}'"
                    )));
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                text.push(c);
                chars.next();
                let mut is_float = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        chars.next();
                    } else if d == '.' && !is_float {
                        is_float = true;
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if is_float {
                    let f = text.parse::<f64>().map_err(|_| {
                        NativeError::invalid_query_string(format!(
                            "malformed number '{text}' in '{filter}'"
                        ))
                    })?;
                    tokens.push(Token::Float(f));
                } else {
                    let i = text.parse::<i64>().map_err(|_| {
                        NativeError::invalid_query_string(format!(
                            "malformed number '{text}' in '{filter}'"
                        ))
                    })?;
                    tokens.push(Token::Int(i));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(text));
            }
            other => {
                return Err(NativeError::invalid_query_string(format!(
                    "unexpected character '{other}' in '{filter}'"
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    schema: &'a TypeSchema,
    args: &'a [Value],
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token, context: &str) -> NativeResult<()> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(NativeError::invalid_query(format!(
                "expected {expected:?} in {context}, found {other:?}"
            ))),
        }
    }

    fn is_keyword(token: Option<&Token>, keyword: &str) -> bool {
        matches!(token, Some(Token::Ident(s)) if s.eq_ignore_ascii_case(keyword))
    }

    fn parse(&mut self) -> NativeResult<(Predicate, Vec<Clause>)> {
        let mut predicate = self.parse_term()?;
        while Self::is_keyword(self.peek(), "AND") {
            self.next();
            let rhs = self.parse_term()?;
            predicate = Predicate::And(Box::new(predicate), Box::new(rhs));
        }

        let mut pipeline = Vec::new();
        loop {
            if Self::is_keyword(self.peek(), "SORT") {
                self.next();
                pipeline.push(self.parse_sort()?);
            } else if Self::is_keyword(self.peek(), "DISTINCT") {
                self.next();
                pipeline.push(self.parse_distinct()?);
            } else if Self::is_keyword(self.peek(), "LIMIT") {
                self.next();
                pipeline.push(self.parse_limit()?);
            } else {
                break;
            }
        }

        if let Some(extra) = self.peek() {
            return Err(NativeError::invalid_query(format!(
                "unexpected token {extra:?} after query"
            )));
        }
        Ok((predicate, pipeline))
    }

    fn parse_term(&mut self) -> NativeResult<Predicate> {
        if Self::is_keyword(self.peek(), "TRUEPREDICATE") {
            self.next();
            return Ok(Predicate::True);
        }
        let property = match self.next() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(NativeError::invalid_query(format!(
                    "expected a field name, found {other:?}"
                )));
            }
        };
        let declared = self.schema.field_type(&property).ok_or_else(|| {
            NativeError::invalid_query(format!(
                "unknown field '{property}' for type '{}'",
                self.schema.name
            ))
        })?;
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => {
                return Err(NativeError::invalid_query(format!(
                    "expected a comparison operator after '{property}', found {other:?}"
                )));
            }
        };
        let value = match self.next() {
            Some(Token::Int(i)) => Value::Int(i),
            Some(Token::Float(f)) => Value::Float(f),
            Some(Token::Str(s)) => Value::Str(s),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => Value::Bool(true),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => Value::Bool(false),
            Some(Token::Arg(index)) => {
                if index >= self.args.len() {
                    return Err(NativeError::index_out_of_bounds(format!(
                        "request for argument at index {index} but only {} arguments were supplied",
                        self.args.len()
                    )));
                }
                self.args[index].clone()
            }
            other => {
                return Err(NativeError::invalid_query(format!(
                    "expected a value after '{property}', found {other:?}"
                )));
            }
        };
        check_value_type(&property, declared, &value)?;
        Ok(Predicate::Cmp {
            property,
            op,
            value,
        })
    }

    fn parse_property(&mut self, context: &str) -> NativeResult<String> {
        match self.next() {
            Some(Token::Ident(name)) => {
                if self.schema.field_type(&name).is_none() {
                    return Err(NativeError::invalid_query(format!(
                        "unknown field '{name}' for type '{}'",
                        self.schema.name
                    )));
                }
                Ok(name)
            }
            other => Err(NativeError::invalid_query(format!(
                "expected a field name in {context}, found {other:?}"
            ))),
        }
    }

    fn parse_sort(&mut self) -> NativeResult<Clause> {
        self.expect(&Token::LParen, "SORT")?;
        let mut keys = Vec::new();
        loop {
            let property = self.parse_property("SORT")?;
            let ascending = if Self::is_keyword(self.peek(), "ASC") {
                self.next();
                true
            } else if Self::is_keyword(self.peek(), "DESC") {
                self.next();
                false
            } else {
                true
            };
            keys.push((property, ascending));
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => {
                    return Err(NativeError::invalid_query(format!(
                        "expected ',' or ')' in SORT, found {other:?}"
                    )));
                }
            }
        }
        Ok(Clause::Sort(keys))
    }

    fn parse_distinct(&mut self) -> NativeResult<Clause> {
        self.expect(&Token::LParen, "DISTINCT")?;
        let mut properties = Vec::new();
        loop {
            properties.push(self.parse_property("DISTINCT")?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => {
                    return Err(NativeError::invalid_query(format!(
                        "expected ',' or ')' in DISTINCT, found {other:?}"
                    )));
                }
            }
        }
        Ok(Clause::Distinct(properties))
    }

    fn parse_limit(&mut self) -> NativeResult<Clause> {
        self.expect(&Token::LParen, "LIMIT")?;
        let n = match self.next() {
            Some(Token::Int(i)) if i >= 0 => i as usize,
            other => {
                return Err(NativeError::invalid_query(format!(
                    "expected a non-negative integer in LIMIT, found {other:?}"
                )));
            }
        };
        self.expect(&Token::RParen, "LIMIT")?;
        Ok(Clause::Limit(n))
    }
}

fn parse_filter(
    schema: &TypeSchema,
    filter: &str,
    args: &[Value],
) -> NativeResult<(Predicate, Vec<Clause>)> {
    if filter.trim().is_empty() {
        return Err(NativeError::invalid_query_string("empty query string"));
    }
    let tokens = lex(filter)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        schema,
        args,
    };
    parser.parse()
}
