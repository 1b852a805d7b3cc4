//! Lazily materialized results views.

use crate::database::Database;
use crate::error::{translate_native, translate_query_error, DbResult};
use crate::notify::{subscribe, Subscription};
use crate::object::{ManagedHandle, Object};
use crate::reference::Reference;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use vivadb_interop::{QueryHandle, ResultsHandle};

/// A materialized view over the rows matching one query, pinned to the
/// version of its owning reference.
///
/// The underlying query executes once, on first access, and the native
/// results handle is cached for the lifetime of the view. Writes committed
/// after materialization are not reflected; build a fresh view (or [`thaw`]
/// into a live reference) to observe them.
///
/// [`thaw`]: Results::thaw
pub struct Results {
    reference: Arc<Reference>,
    type_name: String,
    query: QueryHandle,
    filter: String,
    view: Mutex<Option<ResultsHandle>>,
}

impl Results {
    pub(crate) fn new(
        reference: Arc<Reference>,
        type_name: String,
        query: QueryHandle,
        filter: String,
    ) -> Self {
        Self {
            reference,
            type_name,
            query,
            filter,
            view: Mutex::new(None),
        }
    }

    pub(crate) fn resolved(
        reference: Arc<Reference>,
        type_name: String,
        query: QueryHandle,
        filter: String,
        view: ResultsHandle,
    ) -> Self {
        Self {
            reference,
            type_name,
            query,
            filter,
            view: Mutex::new(Some(view)),
        }
    }

    /// Executes the query if this view has not been materialized yet and
    /// returns the pinned native results handle.
    pub(crate) fn view(&self) -> DbResult<ResultsHandle> {
        self.reference.ensure_open()?;
        let mut view = self.view.lock();
        if let Some(handle) = *view {
            return Ok(handle);
        }
        let handle = self
            .reference
            .engine()
            .query_execute(self.reference.db(), self.query)
            .map_err(|err| translate_query_error(&self.filter, err))?;
        tracing::trace!(type_name = %self.type_name, filter = %self.filter, "results materialized");
        *view = Some(handle);
        Ok(handle)
    }

    pub(crate) fn reference(&self) -> &Arc<Reference> {
        &self.reference
    }

    pub(crate) fn type_name(&self) -> &str {
        &self.type_name
    }

    pub(crate) fn query_handle(&self) -> QueryHandle {
        self.query
    }

    pub(crate) fn filter(&self) -> &str {
        &self.filter
    }

    /// Returns the number of rows in this view.
    pub fn len(&self) -> DbResult<usize> {
        let view = self.view()?;
        self.reference
            .engine()
            .results_len(self.reference.db(), view)
            .map_err(translate_native)
    }

    /// Returns whether this view holds no rows.
    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns the object at `index`.
    pub fn get(&self, index: usize) -> DbResult<Object> {
        let view = self.view()?;
        let row = self
            .reference
            .engine()
            .results_row(self.reference.db(), view, index)
            .map_err(translate_native)?;
        Ok(Object::managed(
            self.type_name.clone(),
            row,
            Arc::clone(&self.reference),
        ))
    }

    /// Iterates the view's objects in result order.
    ///
    /// The length is fixed at the time `iter` is called; individual row
    /// fetches can still fail if the reference closes mid-iteration.
    pub fn iter(&self) -> DbResult<ResultsIter<'_>> {
        Ok(ResultsIter {
            results: self,
            index: 0,
            len: self.len()?,
        })
    }

    /// Resolves this view's result set in `target`'s version, yielding a
    /// new view bound to that reference.
    ///
    /// The new view is materialized immediately; this view is untouched,
    /// and the two share no state. A result computed against a frozen
    /// snapshot is brought into the live version this way, without
    /// re-parsing the predicate.
    pub fn thaw(&self, target: &Database) -> DbResult<Results> {
        let source_view = self.view()?;
        let target_ref = target.reference();
        target_ref.ensure_open()?;
        let resolved = self
            .reference
            .engine()
            .results_resolve(source_view, self.reference.db(), target_ref.db())
            .map_err(translate_native)?;
        Ok(Results::resolved(
            Arc::clone(target_ref),
            self.type_name.clone(),
            self.query,
            self.filter.clone(),
            resolved,
        ))
    }

    /// Subscribes to change notifications for this view's result set.
    ///
    /// See [`Subscription`] for the delivery contract.
    pub fn subscribe(&self) -> DbResult<Subscription> {
        subscribe(self)
    }
}

impl ManagedHandle for Results {
    fn owner(&self) -> Option<&Arc<Reference>> {
        Some(&self.reference)
    }

    fn native_is_live(&self) -> bool {
        true
    }
}

impl fmt::Debug for Results {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Results")
            .field("type_name", &self.type_name)
            .field("filter", &self.filter)
            .field("materialized", &self.view.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// Iterator over the objects of a [`Results`] view.
pub struct ResultsIter<'a> {
    results: &'a Results,
    index: usize,
    len: usize,
}

impl Iterator for ResultsIter<'_> {
    type Item = DbResult<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.len {
            return None;
        }
        let item = self.results.get(self.index);
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ResultsIter<'_> {}
