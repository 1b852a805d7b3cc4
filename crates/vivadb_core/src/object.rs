//! Managed handles and dynamic objects.

use crate::error::{translate_native, DbError, DbResult};
use crate::reference::Reference;
use std::sync::Arc;
use vivadb_interop::{RowHandle, Value, VersionId};

/// Backing state of an object handle.
///
/// A tagged variant rather than a nullable back-reference: validity checks
/// are exhaustive and compiler-enforced.
#[derive(Clone)]
pub enum ObjectState {
    /// Freshly constructed, not yet persisted. Holds no native pointer and
    /// is trivially always valid.
    Unmanaged,
    /// Backed by a native row, scoped to its owning reference.
    Managed {
        /// The native row handle.
        row: RowHandle,
        /// The reference the row was materialized through.
        reference: Arc<Reference>,
    },
}

/// Capability shared by every managed handle: objects, queries, results and
/// aggregate views.
pub trait ManagedHandle {
    /// The owning reference, or `None` for unmanaged handles.
    fn owner(&self) -> Option<&Arc<Reference>>;

    /// Engine-side liveness of the underlying native handle. Only consulted
    /// for managed handles whose reference is still open.
    fn native_is_live(&self) -> bool;

    /// Returns whether this handle owns a native pointer.
    fn is_managed(&self) -> bool {
        self.owner().is_some()
    }

    /// Returns whether this handle may still be used.
    ///
    /// Unmanaged handles are always valid. Managed handles fail closed:
    /// once the owning reference closes, or the underlying row is deleted,
    /// this returns `false` without throwing.
    fn is_valid(&self) -> bool {
        match self.owner() {
            None => true,
            Some(reference) => !reference.is_closed() && self.native_is_live(),
        }
    }

    /// Resolves the version of the owning reference.
    ///
    /// Fails with `InvalidArgument` on unmanaged handles (no native call is
    /// made) and `InvalidState` once the owning database has closed.
    fn version(&self) -> DbResult<VersionId> {
        let reference = self
            .owner()
            .ok_or_else(|| DbError::invalid_argument("object is unmanaged"))?;
        reference.version()
    }
}

/// A dynamic handle onto one stored record.
///
/// Objects are cheap to clone; they carry no data, only the native row
/// handle and the owning reference. Validity is checked lazily before each
/// property access, never pushed from the engine.
#[derive(Clone)]
pub struct Object {
    type_name: String,
    state: ObjectState,
}

impl Object {
    /// Creates an unmanaged object of the given type.
    pub fn unmanaged(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            state: ObjectState::Unmanaged,
        }
    }

    /// Wraps a native row.
    pub(crate) fn managed(
        type_name: impl Into<String>,
        row: RowHandle,
        reference: Arc<Reference>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            state: ObjectState::Managed { row, reference },
        }
    }

    /// Returns the object's type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    fn managed_parts(&self) -> DbResult<(RowHandle, &Arc<Reference>)> {
        match &self.state {
            ObjectState::Unmanaged => Err(DbError::invalid_argument("object is unmanaged")),
            ObjectState::Managed { row, reference } => Ok((*row, reference)),
        }
    }

    /// Reads one property.
    pub fn get(&self, property: &str) -> DbResult<Value> {
        let (row, reference) = self.managed_parts()?;
        reference.ensure_open()?;
        reference
            .engine()
            .row_get(reference.db(), row, property)
            .map_err(translate_native)
    }

    /// Writes one property. Only legal inside a write transaction on the
    /// owning reference.
    pub fn set(&self, property: &str, value: Value) -> DbResult<()> {
        let (row, reference) = self.managed_parts()?;
        reference.ensure_open()?;
        if !reference.is_in_write_transaction() {
            return Err(DbError::invalid_state(
                "objects can only be mutated inside a write transaction",
            ));
        }
        reference
            .engine()
            .row_set(reference.db(), row, property, value)
            .map_err(translate_native)
    }

    /// Deletes the underlying row. Only legal on a managed, valid object
    /// inside a write transaction; unmanaged objects fail fast with
    /// `InvalidArgument`, never a silent no-op.
    pub fn delete(&self) -> DbResult<()> {
        let (row, reference) = self.managed_parts()?;
        reference.ensure_open()?;
        if !self.is_valid() {
            return Err(DbError::invalid_state(
                "object has already been deleted or invalidated",
            ));
        }
        if !reference.is_in_write_transaction() {
            return Err(DbError::invalid_state(
                "objects can only be deleted inside a write transaction",
            ));
        }
        reference
            .engine()
            .row_delete(reference.db(), row)
            .map_err(translate_native)
    }
}

impl ManagedHandle for Object {
    fn owner(&self) -> Option<&Arc<Reference>> {
        match &self.state {
            ObjectState::Unmanaged => None,
            ObjectState::Managed { reference, .. } => Some(reference),
        }
    }

    fn native_is_live(&self) -> bool {
        match &self.state {
            ObjectState::Unmanaged => true,
            ObjectState::Managed { row, reference } => {
                reference.engine().row_is_live(reference.db(), *row)
            }
        }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("type_name", &self.type_name)
            .field("managed", &self.is_managed())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use vivadb_testkit::prelude::*;

    fn open_db() -> Database {
        Database::open(memory_engine(), person_config()).unwrap()
    }

    #[test]
    fn unmanaged_objects_are_trivially_valid() {
        let object = Object::unmanaged("Person");
        assert!(!object.is_managed());
        assert!(object.is_valid());
    }

    #[test]
    fn unmanaged_property_access_is_an_argument_error() {
        let object = Object::unmanaged("Person");
        let expected = DbError::invalid_argument("object is unmanaged");

        assert_eq!(object.get("name").unwrap_err(), expected);
        assert_eq!(object.version().unwrap_err(), expected);
        assert_eq!(object.delete().unwrap_err(), expected);
    }

    #[test]
    fn managed_object_reads_properties() {
        let db = open_db();
        let object = db
            .write(|txn| txn.insert("Person", &[("name", Value::from("alice"))]))
            .unwrap();

        assert!(object.is_managed());
        assert!(object.is_valid());
        assert_eq!(object.get("name").unwrap(), Value::from("alice"));
        assert_eq!(object.get("age").unwrap(), Value::Null);
    }

    #[test]
    fn mutation_outside_write_transaction_fails() {
        let db = open_db();
        let object = db
            .write(|txn| txn.insert("Person", &[("name", Value::from("bob"))]))
            .unwrap();

        let err = object.set("age", Value::Int(1)).unwrap_err();
        assert!(matches!(err, DbError::InvalidState { .. }));

        let err = object.delete().unwrap_err();
        assert!(matches!(err, DbError::InvalidState { .. }));
    }

    #[test]
    fn deleted_object_fails_closed() {
        let db = open_db();
        let object = db
            .write(|txn| txn.insert("Person", &[("name", Value::from("gone"))]))
            .unwrap();

        db.write(|_| object.delete()).unwrap();

        assert!(!object.is_valid());
        let err = object.get("name").unwrap_err();
        assert!(matches!(err, DbError::InvalidState { .. }));
    }

    #[test]
    fn validity_fails_closed_after_database_close() {
        let db = open_db();
        let object = db
            .write(|txn| txn.insert("Person", &[("name", Value::from("x"))]))
            .unwrap();

        db.close();
        assert!(!object.is_valid());
        assert!(matches!(
            object.version().unwrap_err(),
            DbError::InvalidState { .. }
        ));
    }

    #[test]
    fn version_resolves_through_owner() {
        let db = open_db();
        let object = db
            .write(|txn| txn.insert("Person", &[("name", Value::from("v"))]))
            .unwrap();

        assert_eq!(object.version().unwrap(), db.version().unwrap());
    }
}
