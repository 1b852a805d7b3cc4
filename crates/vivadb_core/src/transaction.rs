//! Write transaction scope.

use crate::error::{translate_native, DbResult};
use crate::object::Object;
use crate::reference::Reference;
use std::marker::PhantomData;
use std::sync::Arc;
use vivadb_interop::Value;

/// The mutation scope handed to [`Database::write`] closures.
///
/// Holds the write lock on its reference for the closure's duration. The
/// transaction is bound to the calling thread; the `!Send` marker keeps it
/// from migrating.
///
/// [`Database::write`]: crate::database::Database::write
pub struct WriteTransaction<'a> {
    reference: &'a Arc<Reference>,
    _not_send: PhantomData<*mut ()>,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(reference: &'a Arc<Reference>) -> Self {
        Self {
            reference,
            _not_send: PhantomData,
        }
    }

    /// Inserts a row of `type_name`, returning the managed object backing
    /// it. Omitted fields default to null.
    pub fn insert(&self, type_name: &str, values: &[(&str, Value)]) -> DbResult<Object> {
        self.reference.ensure_open()?;
        let row = self
            .reference
            .engine()
            .row_insert(self.reference.db(), type_name, values)
            .map_err(translate_native)?;
        Ok(Object::managed(
            type_name.to_string(),
            row,
            Arc::clone(self.reference),
        ))
    }

    /// Deletes a managed object's underlying row.
    pub fn delete(&self, object: &Object) -> DbResult<()> {
        object.delete()
    }
}

impl std::fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction").finish_non_exhaustive()
    }
}
