//! Lazy, composable query builder.
//!
//! A `Query` eagerly parses its base filter exactly once; every subsequent
//! composition (`query`, `sort`, `distinct`, `limit`) appends a textual
//! fragment onto the already-parsed native handle through the engine's
//! append entry point, never re-parsing from scratch. Composition never
//! mutates an existing query.

use crate::aggregate::{AggregateView, CountView};
use crate::error::{translate_native, translate_query_error, DbResult};
use crate::object::{ManagedHandle, Object};
use crate::reference::Reference;
use crate::results::Results;
use std::fmt;
use std::sync::Arc;
use vivadb_interop::{AggregateOp, FieldType, QueryHandle, Value};

/// Sort direction for a query clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending order.
    Ascending,
    /// Descending order.
    Descending,
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Ascending => write!(f, "ASC"),
            SortOrder::Descending => write!(f, "DESC"),
        }
    }
}

// Clause-string builders. The appended-fragment grammar is owned by the
// engine; keeping all string assembly here makes that dependency easy to
// audit or swap for a structured expression tree later.

fn sort_clause(keys: &[(&str, SortOrder)]) -> String {
    let body: Vec<String> = keys
        .iter()
        .map(|(property, order)| format!("{property} {order}"))
        .collect();
    format!("TRUEPREDICATE SORT({})", body.join(", "))
}

fn distinct_clause(properties: &[&str]) -> String {
    format!("TRUEPREDICATE DISTINCT({})", properties.join(", "))
}

fn limit_clause(limit: usize) -> String {
    format!("TRUEPREDICATE LIMIT({limit})")
}

/// A composable query over one object type.
///
/// Queries are immutable: every composition returns a new `Query` wrapping
/// a newly composed native handle, preserving the original filter string
/// and arguments for diagnostics.
#[derive(Clone)]
pub struct Query {
    reference: Arc<Reference>,
    type_name: String,
    handle: QueryHandle,
    filter: String,
    args: Vec<Value>,
}

impl Query {
    /// Parses a new base query for `type_name`.
    ///
    /// The filter is parsed eagerly; a malformed filter fails here and no
    /// partially-constructed query is ever exposed.
    pub(crate) fn new(
        reference: &Arc<Reference>,
        type_name: impl Into<String>,
        filter: impl Into<String>,
        args: Vec<Value>,
    ) -> DbResult<Self> {
        let type_name = type_name.into();
        let filter = filter.into();
        reference.ensure_open()?;
        let handle = reference
            .engine()
            .query_parse(reference.db(), &type_name, &filter, &args)
            .map_err(|err| translate_query_error(&filter, err))?;
        tracing::trace!(%type_name, %filter, "query parsed");
        Ok(Self {
            reference: Arc::clone(reference),
            type_name,
            handle,
            filter,
            args,
        })
    }

    /// Appends a parsed fragment onto this query's native handle, yielding
    /// a new query. `diagnostic_filter` is what error messages interpolate.
    fn append(
        &self,
        fragment: &str,
        args: &[Value],
        diagnostic_filter: &str,
    ) -> DbResult<Self> {
        self.reference.ensure_open()?;
        let handle = self
            .reference
            .engine()
            .query_append(self.reference.db(), self.handle, fragment, args)
            .map_err(|err| translate_query_error(diagnostic_filter, err))?;
        Ok(Self {
            reference: Arc::clone(&self.reference),
            type_name: self.type_name.clone(),
            handle,
            filter: self.filter.clone(),
            args: self.args.clone(),
        })
    }

    /// Narrows this query with a further filter. The new predicate layers
    /// onto the already-parsed handle; the base is never re-parsed.
    pub fn query(&self, filter: &str, args: Vec<Value>) -> DbResult<Self> {
        self.append(filter, &args, filter)
    }

    /// Appends a sort clause on one property.
    pub fn sort(&self, property: &str, order: SortOrder) -> DbResult<Self> {
        self.sort_by(&[(property, order)])
    }

    /// Appends a sort clause with multiple keys; call order is preserved
    /// and each key has an independent direction.
    pub fn sort_by(&self, keys: &[(&str, SortOrder)]) -> DbResult<Self> {
        let clause = sort_clause(keys);
        self.append(&clause, &[], &self.filter)
    }

    /// Appends a distinct clause over the given properties.
    pub fn distinct(&self, properties: &[&str]) -> DbResult<Self> {
        let clause = distinct_clause(properties);
        self.append(&clause, &[], &self.filter)
    }

    /// Appends a limit clause.
    pub fn limit(&self, limit: usize) -> DbResult<Self> {
        let clause = limit_clause(limit);
        self.append(&clause, &[], &self.filter)
    }

    /// Returns a lazily materialized view over the matching rows.
    ///
    /// The view evaluates the native handle once, on first access, and
    /// caches the native results handle for its own lifetime.
    #[must_use]
    pub fn find(&self) -> Results {
        Results::new(
            Arc::clone(&self.reference),
            self.type_name.clone(),
            self.handle,
            self.filter.clone(),
        )
    }

    /// Materializes the first matching row, if any. Evaluates the same
    /// native query handle; no new parse.
    pub fn first(&self) -> DbResult<Option<Object>> {
        self.reference.ensure_open()?;
        let engine = self.reference.engine();
        let db = self.reference.db();
        let results = engine
            .query_execute(db, self.handle)
            .map_err(|err| translate_query_error(&self.filter, err))?;
        let len = engine.results_len(db, results).map_err(translate_native)?;
        if len == 0 {
            return Ok(None);
        }
        let row = engine
            .results_row(db, results, 0)
            .map_err(translate_native)?;
        Ok(Some(Object::managed(
            self.type_name.clone(),
            row,
            Arc::clone(&self.reference),
        )))
    }

    /// Returns a count view over the matching rows.
    #[must_use]
    pub fn count(&self) -> CountView {
        CountView::new(Arc::clone(&self.reference), self.handle, self.filter.clone())
    }

    fn aggregate(&self, op: AggregateOp, property: &str, result_type: FieldType) -> AggregateView {
        AggregateView::new(
            Arc::clone(&self.reference),
            self.handle,
            self.filter.clone(),
            op,
            property.to_string(),
            result_type,
        )
    }

    /// Returns a minimum view over `property`, typed as `result_type`.
    ///
    /// The property/type combination is validated when the view is
    /// evaluated, not here.
    #[must_use]
    pub fn min(&self, property: &str, result_type: FieldType) -> AggregateView {
        self.aggregate(AggregateOp::Min, property, result_type)
    }

    /// Returns a maximum view over `property`, typed as `result_type`.
    #[must_use]
    pub fn max(&self, property: &str, result_type: FieldType) -> AggregateView {
        self.aggregate(AggregateOp::Max, property, result_type)
    }

    /// Returns a sum view over `property`, typed as `result_type`.
    #[must_use]
    pub fn sum(&self, property: &str, result_type: FieldType) -> AggregateView {
        self.aggregate(AggregateOp::Sum, property, result_type)
    }

    /// Returns an average view over `property` with an inferred double
    /// result.
    #[must_use]
    pub fn average(&self, property: &str) -> AggregateView {
        self.aggregate(AggregateOp::Average, property, FieldType::Float)
    }

    /// Returns an average view over `property` with an explicit result
    /// type.
    #[must_use]
    pub fn average_of(&self, property: &str, result_type: FieldType) -> AggregateView {
        self.aggregate(AggregateOp::Average, property, result_type)
    }

    /// Returns the original filter string, kept for diagnostics.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.filter
    }

    /// Returns the positional arguments bound to the base filter.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }
}

impl ManagedHandle for Query {
    fn owner(&self) -> Option<&Arc<Reference>> {
        Some(&self.reference)
    }

    fn native_is_live(&self) -> bool {
        // Query handles stay valid for the lifetime of their reference.
        true
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("type_name", &self.type_name)
            .field("filter", &self.filter)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::error::DbError;
    use proptest::prelude::*;
    use vivadb_testkit::prelude::*;

    fn seeded_db() -> Database {
        let db = Database::open(memory_engine(), person_config()).unwrap();
        db.write(|txn| {
            for (name, age) in [("carol", 35), ("alice", 30), ("bob", 30), ("dave", 20)] {
                txn.insert(
                    "Person",
                    &[("name", Value::from(name)), ("age", Value::Int(age))],
                )?;
            }
            Ok(())
        })
        .unwrap();
        db
    }

    #[test]
    fn base_filter_with_arguments() {
        let db = seeded_db();
        let query = db
            .query("Person", "age >= $0", vec![Value::Int(30)])
            .unwrap();
        assert_eq!(query.find().len().unwrap(), 3);
    }

    #[test]
    fn composition_is_immutable() {
        let db = seeded_db();
        let base = db.query_all("Person").unwrap();
        let limited = base.limit(1).unwrap();

        assert_eq!(base.find().len().unwrap(), 4);
        assert_eq!(limited.find().len().unwrap(), 1);
        assert_eq!(base.description(), limited.description());
    }

    #[test]
    fn sort_distinct_limit_compose() {
        let db = seeded_db();
        let query = db
            .query_all("Person")
            .unwrap()
            .sort("age", SortOrder::Descending)
            .unwrap()
            .distinct(&["age"])
            .unwrap()
            .limit(2)
            .unwrap();

        let results = query.find();
        assert_eq!(results.len().unwrap(), 2);
        assert_eq!(results.get(0).unwrap().get("age").unwrap(), Value::Int(35));
        assert_eq!(results.get(1).unwrap().get("age").unwrap(), Value::Int(30));
    }

    #[test]
    fn multi_key_sort_preserves_call_order() {
        let db = seeded_db();
        let results = db
            .query_all("Person")
            .unwrap()
            .sort_by(&[("age", SortOrder::Ascending), ("name", SortOrder::Descending)])
            .unwrap()
            .find();

        assert_eq!(
            results.get(0).unwrap().get("name").unwrap(),
            Value::from("dave")
        );
        // Both 30-year-olds follow, name descending.
        assert_eq!(
            results.get(1).unwrap().get("name").unwrap(),
            Value::from("bob")
        );
        assert_eq!(
            results.get(2).unwrap().get("name").unwrap(),
            Value::from("alice")
        );
    }

    #[test]
    fn sub_query_layers_onto_parsed_handle() {
        let db = seeded_db();
        let adults = db.query("Person", "age >= $0", vec![Value::Int(30)]).unwrap();
        let narrowed = adults.query("name == $0", vec![Value::from("alice")]).unwrap();

        assert_eq!(narrowed.find().len().unwrap(), 1);
        // Original diagnostics are preserved.
        assert_eq!(narrowed.description(), "age >= $0");
    }

    #[test]
    fn missing_argument_mentions_parameters() {
        let db = seeded_db();
        let err = db.query("Person", "name == $0", vec![]).unwrap_err();
        let DbError::InvalidArgument { message } = err else {
            panic!("expected InvalidArgument");
        };
        assert!(
            message.starts_with("Have you specified all parameters for query 'name == $0'?"),
            "unexpected message: {message}"
        );
    }

    #[test]
    fn type_mismatch_mentions_field() {
        let db = seeded_db();
        let err = db.query("Person", "name == 42", vec![]).unwrap_err();
        let DbError::InvalidArgument { message } = err else {
            panic!("expected InvalidArgument");
        };
        assert!(message.contains("Wrong query field or malformed syntax"));
        assert!(message.contains("'name == 42'"));
        assert!(message.contains("name"));
    }

    #[test]
    fn unlexable_filter_is_wrong_query_string() {
        let db = seeded_db();
        let err = db.query("Person", "name ~ 'x'", vec![]).unwrap_err();
        let DbError::InvalidArgument { message } = err else {
            panic!("expected InvalidArgument");
        };
        assert!(message.starts_with("Wrong query string:"));
    }

    #[test]
    fn first_returns_a_managed_object() {
        let db = seeded_db();
        let first = db
            .query("Person", "name == $0", vec![Value::from("carol")])
            .unwrap()
            .first()
            .unwrap()
            .expect("carol exists");
        assert!(first.is_managed());
        assert_eq!(first.get("age").unwrap(), Value::Int(35));

        let none = db
            .query("Person", "age > $0", vec![Value::Int(99)])
            .unwrap()
            .first()
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn terminal_operations_re_ask_the_engine() {
        let db = seeded_db();
        let query = db.query("Person", "age >= $0", vec![Value::Int(30)]).unwrap();
        assert_eq!(query.count().value().unwrap(), 3);

        db.write(|txn| {
            txn.insert("Person", &[("name", Value::from("erin")), ("age", Value::Int(40))])
        })
        .unwrap();

        // A fresh count view re-evaluates; the old view cached its value.
        assert_eq!(query.count().value().unwrap(), 4);
    }

    #[test]
    fn queries_against_closed_database_fail() {
        let db = seeded_db();
        let query = db.query_all("Person").unwrap();
        db.close();

        let err = query.limit(1).unwrap_err();
        assert!(matches!(err, DbError::InvalidState { .. }));
    }

    proptest! {
        // Appending restrictive clauses never grows the result set.
        #[test]
        fn composition_is_monotonically_non_increasing(
            age in small_age(),
            property in person_sort_property(),
            dir in sort_direction(),
            limit in limit_value(),
        ) {
            let db = seeded_db();
            let base = db
                .query("Person", "age >= $0", vec![Value::Int(age)])
                .unwrap();
            let base_len = base.find().len().unwrap();

            let sorted = base
                .query(&format!("TRUEPREDICATE SORT({property} {dir})"), vec![])
                .unwrap();
            let sorted_len = sorted.find().len().unwrap();
            prop_assert_eq!(base_len, sorted_len);

            let distinct = sorted.distinct(&["age"]).unwrap();
            let distinct_len = distinct.find().len().unwrap();
            prop_assert!(distinct_len <= sorted_len);

            let limited = distinct.limit(limit).unwrap();
            let limited_len = limited.find().len().unwrap();
            prop_assert!(limited_len <= distinct_len);
            prop_assert!(limited_len <= limit);
        }
    }
}
