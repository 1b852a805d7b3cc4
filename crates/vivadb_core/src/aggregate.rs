//! Scalar aggregate and count views.
//!
//! These follow the same evaluate-once contract as [`Results`]: the engine
//! is asked exactly once per view, on first access, and the scalar is
//! cached for the view's lifetime. Thawing yields a fresh, unevaluated view
//! against the target reference.
//!
//! [`Results`]: crate::results::Results

use crate::database::Database;
use crate::error::{translate_query_error, DbResult};
use crate::object::ManagedHandle;
use crate::reference::Reference;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use vivadb_interop::{AggregateOp, FieldType, QueryHandle, Value};

/// A lazily evaluated scalar aggregate over one property of a query's
/// matching rows.
///
/// An aggregate over an empty matching set yields `None`, never a zero;
/// use [`CountView`] for cardinality.
pub struct AggregateView {
    reference: Arc<Reference>,
    query: QueryHandle,
    filter: String,
    op: AggregateOp,
    property: String,
    result_type: FieldType,
    cached: Mutex<Option<Option<Value>>>,
}

impl AggregateView {
    pub(crate) fn new(
        reference: Arc<Reference>,
        query: QueryHandle,
        filter: String,
        op: AggregateOp,
        property: String,
        result_type: FieldType,
    ) -> Self {
        Self {
            reference,
            query,
            filter,
            op,
            property,
            result_type,
            cached: Mutex::new(None),
        }
    }

    /// Evaluates the aggregate, asking the engine on first access only.
    ///
    /// Property existence and numeric suitability are validated here, not
    /// at construction; a malformed property/type combination surfaces as
    /// an `InvalidArgument` naming the original filter.
    pub fn value(&self) -> DbResult<Option<Value>> {
        self.reference.ensure_open()?;
        let mut cached = self.cached.lock();
        if let Some(value) = &*cached {
            return Ok(value.clone());
        }
        let raw = self
            .reference
            .engine()
            .query_aggregate(self.reference.db(), self.query, self.op, &self.property)
            .map_err(|err| translate_query_error(&self.filter, err))?;
        let value = raw.map(|v| coerce(v, self.result_type));
        *cached = Some(value.clone());
        Ok(value)
    }

    /// Re-binds this aggregate to `target`'s version, yielding a fresh
    /// unevaluated view. This view and its cached value are untouched.
    pub fn thaw(&self, target: &Database) -> DbResult<AggregateView> {
        let target_ref = target.reference();
        target_ref.ensure_open()?;
        Ok(AggregateView::new(
            Arc::clone(target_ref),
            self.query,
            self.filter.clone(),
            self.op,
            self.property.clone(),
            self.result_type,
        ))
    }
}

impl ManagedHandle for AggregateView {
    fn owner(&self) -> Option<&Arc<Reference>> {
        Some(&self.reference)
    }

    fn native_is_live(&self) -> bool {
        true
    }
}

impl fmt::Debug for AggregateView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateView")
            .field("op", &self.op)
            .field("property", &self.property)
            .field("result_type", &self.result_type)
            .field("evaluated", &self.cached.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// Coerces an engine-produced aggregate into the view's declared result
/// type. Int-to-float widens exactly; float-to-int truncates toward zero.
fn coerce(value: Value, result_type: FieldType) -> Value {
    match (result_type, value) {
        (FieldType::Float, Value::Int(n)) => Value::Float(n as f64),
        (FieldType::Int, Value::Float(f)) => Value::Int(f as i64),
        (_, value) => value,
    }
}

/// A lazily evaluated row count over a query's matching rows.
///
/// Unlike [`AggregateView`], an empty matching set is a plain `0`.
pub struct CountView {
    reference: Arc<Reference>,
    query: QueryHandle,
    filter: String,
    cached: Mutex<Option<u64>>,
}

impl CountView {
    pub(crate) fn new(reference: Arc<Reference>, query: QueryHandle, filter: String) -> Self {
        Self {
            reference,
            query,
            filter,
            cached: Mutex::new(None),
        }
    }

    /// Evaluates the count, asking the engine on first access only.
    pub fn value(&self) -> DbResult<u64> {
        self.reference.ensure_open()?;
        let mut cached = self.cached.lock();
        if let Some(count) = *cached {
            return Ok(count);
        }
        let count = self
            .reference
            .engine()
            .query_count(self.reference.db(), self.query)
            .map_err(|err| translate_query_error(&self.filter, err))?;
        *cached = Some(count);
        Ok(count)
    }

    /// Re-binds this count to `target`'s version, yielding a fresh
    /// unevaluated view.
    pub fn thaw(&self, target: &Database) -> DbResult<CountView> {
        let target_ref = target.reference();
        target_ref.ensure_open()?;
        Ok(CountView::new(
            Arc::clone(target_ref),
            self.query,
            self.filter.clone(),
        ))
    }
}

impl ManagedHandle for CountView {
    fn owner(&self) -> Option<&Arc<Reference>> {
        Some(&self.reference)
    }

    fn native_is_live(&self) -> bool {
        true
    }
}

impl fmt::Debug for CountView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountView")
            .field("filter", &self.filter)
            .field("evaluated", &self.cached.lock().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::error::DbError;
    use vivadb_testkit::prelude::*;

    fn seeded_db() -> Database {
        let db = Database::open(memory_engine(), person_config()).unwrap();
        db.write(|txn| {
            for (name, age, score) in [("alice", 30, 1.5), ("bob", 20, 2.5)] {
                txn.insert(
                    "Person",
                    &[
                        ("name", Value::from(name)),
                        ("age", Value::Int(age)),
                        ("score", Value::Float(score)),
                    ],
                )?;
            }
            Ok(())
        })
        .unwrap();
        db
    }

    #[test]
    fn min_max_sum_respect_the_declared_type() {
        let db = seeded_db();
        let query = db.query_all("Person").unwrap();

        assert_eq!(
            query.min("age", FieldType::Int).value().unwrap(),
            Some(Value::Int(20))
        );
        assert_eq!(
            query.max("age", FieldType::Float).value().unwrap(),
            Some(Value::Float(30.0))
        );
        assert_eq!(
            query.sum("score", FieldType::Float).value().unwrap(),
            Some(Value::Float(4.0))
        );
    }

    #[test]
    fn average_infers_a_double_result() {
        let db = seeded_db();
        let query = db.query_all("Person").unwrap();
        assert_eq!(
            query.average("age").value().unwrap(),
            Some(Value::Float(25.0))
        );
    }

    #[test]
    fn average_with_explicit_type_truncates_to_int() {
        let db = seeded_db();
        let query = db.query_all("Person").unwrap();
        assert_eq!(
            query.average_of("age", FieldType::Int).value().unwrap(),
            Some(Value::Int(25))
        );
        assert_eq!(
            query.average_of("age", FieldType::Float).value().unwrap(),
            Some(Value::Float(25.0))
        );
    }

    #[test]
    fn empty_set_aggregates_are_explicitly_empty() {
        let db = seeded_db();
        let query = db
            .query("Person", "age > $0", vec![Value::Int(99)])
            .unwrap();

        assert_eq!(query.min("age", FieldType::Int).value().unwrap(), None);
        assert_eq!(query.max("age", FieldType::Int).value().unwrap(), None);
        assert_eq!(query.sum("age", FieldType::Int).value().unwrap(), None);
        assert_eq!(query.average("age").value().unwrap(), None);
        // Count is not an aggregate: empty is a plain zero.
        assert_eq!(query.count().value().unwrap(), 0);
    }

    #[test]
    fn aggregates_evaluate_once_per_view() {
        let db = seeded_db();
        let sum = db.query_all("Person").unwrap().sum("age", FieldType::Int);
        assert_eq!(sum.value().unwrap(), Some(Value::Int(50)));

        db.write(|txn| {
            txn.insert("Person", &[("age", Value::Int(50))])?;
            Ok(())
        })
        .unwrap();

        // Cached; the thawed view re-evaluates.
        assert_eq!(sum.value().unwrap(), Some(Value::Int(50)));
        assert_eq!(sum.thaw(&db).unwrap().value().unwrap(), Some(Value::Int(100)));
    }

    #[test]
    fn non_numeric_property_fails_at_evaluation_with_the_filter_named() {
        let db = seeded_db();
        let view = db.query_all("Person").unwrap().min("name", FieldType::Int);
        let err = view.value().unwrap_err();
        let DbError::InvalidArgument { message } = err else {
            panic!("expected InvalidArgument");
        };
        assert!(message.contains("'TRUEPREDICATE'"));
        assert!(message.contains("name"));
    }

    #[test]
    fn count_view_caches_its_value() {
        let db = seeded_db();
        let count = db.query_all("Person").unwrap().count();
        assert_eq!(count.value().unwrap(), 2);

        db.write(|txn| {
            txn.insert("Person", &[("age", Value::Int(1))])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(count.value().unwrap(), 2);
        assert_eq!(count.thaw(&db).unwrap().value().unwrap(), 3);
    }

    #[test]
    fn evaluation_after_close_is_a_state_error() {
        let db = seeded_db();
        let view = db.query_all("Person").unwrap().average("age");
        db.close();
        assert_eq!(
            view.value().unwrap_err(),
            DbError::invalid_state("database is closed")
        );
    }
}
