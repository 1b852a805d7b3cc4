//! Change-notification bridge.
//!
//! The engine pushes raw version-change callbacks; this module re-shapes
//! them into a cold, cancellable, version-ordered stream of snapshot views
//! per subscription. Each [`Subscription`] owns exactly one native listener
//! registration, released on cancellation or drop. Emissions arrive over a
//! channel the subscriber drains at its own pace.
//!
//! Lock discipline: the engine may invoke the callback while holding its
//! per-listener gate, so the callback only ever takes the subscription's
//! own state lock, and cancellation never waits on the engine while holding
//! that lock. The engine guarantees callbacks run outside its internal
//! locks, so the callback may re-enter it to resolve the snapshot view.

use crate::error::{translate_native, DbError, DbResult};
use crate::reference::Reference;
use crate::results::Results;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use vivadb_interop::{
    ChangeCallback, DbHandle, Engine, ListenerHandle, QueryHandle, ResultsHandle, VersionId,
};

struct Inner {
    cancelled: bool,
    listener: Option<ListenerHandle>,
    /// Highest version delivered so far; stale or replayed callbacks are
    /// dropped against it.
    last_version: Option<VersionId>,
}

struct Shared {
    engine: Arc<dyn Engine>,
    inner: Mutex<Inner>,
}

/// One emission of a [`Subscription`]: the tracked result set, resolved at
/// the version that changed it.
#[derive(Debug)]
pub struct ChangeNotification {
    /// The committed version this snapshot observes.
    pub version: VersionId,
    /// The result set re-wrapped at that version. Pre-materialized; reading
    /// it issues no new query.
    pub results: Results,
}

/// A cancellable stream of change notifications for one results view.
///
/// The engine fires once at registration with the current version, then
/// once per committed version in which the tracked result set actually
/// changed; each firing is resolved into a fresh snapshot view. Emissions
/// are strictly version-ordered and never skip a changed version. The
/// stream never completes on its own for a live view; it ends when
/// cancelled or when the owning database closes.
pub struct Subscription {
    shared: Arc<Shared>,
    reference: Arc<Reference>,
    type_name: String,
    query: QueryHandle,
    filter: String,
    receiver: Receiver<(VersionId, ResultsHandle)>,
}

pub(crate) fn subscribe(results: &Results) -> DbResult<Subscription> {
    let reference = results.reference();
    reference.ensure_open()?;
    if reference.is_frozen() {
        return Err(DbError::invalid_state(
            "cannot observe changes through a frozen reference",
        ));
    }
    if reference.is_in_write_transaction() {
        return Err(DbError::invalid_state(
            "cannot subscribe to notifications inside a write transaction",
        ));
    }

    let view = results.view()?;
    let (sender, receiver) = mpsc::channel();
    let shared = Arc::new(Shared {
        engine: Arc::clone(reference.engine()),
        inner: Mutex::new(Inner {
            cancelled: false,
            listener: None,
            last_version: None,
        }),
    });

    let callback = make_callback(Arc::clone(&shared), sender, reference.db(), view);
    // The engine fires the callback synchronously during registration, so
    // the subscription state must already be live here and must not be
    // locked across this call.
    let listener = reference
        .engine()
        .listener_register(reference.db(), view, callback)
        .map_err(translate_native)?;
    shared.inner.lock().listener = Some(listener);
    tracing::debug!(listener = listener.as_u64(), "change listener registered");

    Ok(Subscription {
        shared,
        reference: Arc::clone(reference),
        type_name: results.type_name().to_string(),
        query: results.query_handle(),
        filter: results.filter().to_string(),
        receiver,
    })
}

fn make_callback(
    shared: Arc<Shared>,
    sender: Sender<(VersionId, ResultsHandle)>,
    db: DbHandle,
    view: ResultsHandle,
) -> ChangeCallback {
    Box::new(move |version| {
        {
            let mut inner = shared.inner.lock();
            if inner.cancelled {
                return;
            }
            if inner.last_version.is_some_and(|last| version <= last) {
                return;
            }
            inner.last_version = Some(version);
        }
        // Resolve the snapshot at the changed version. Delivery is part of
        // the engine contract: callbacks arrive serially in commit order,
        // and a later commit's delivery does not begin until this one has
        // returned, so the live handle still observes `version` here.
        let snapshot = match shared.engine.results_resolve(view, db, db) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(%version, error = %err, "dropping undeliverable notification");
                return;
            }
        };
        // Receiver gone means the subscription was dropped mid-flight.
        let _ = sender.send((version, snapshot));
    })
}

impl Subscription {
    fn wrap(&self, version: VersionId, snapshot: ResultsHandle) -> ChangeNotification {
        ChangeNotification {
            version,
            results: Results::resolved(
                Arc::clone(&self.reference),
                self.type_name.clone(),
                self.query,
                self.filter.clone(),
                snapshot,
            ),
        }
    }

    /// Blocks until the next notification, or returns `None` once the
    /// stream has ended (cancelled, or the listener was torn down).
    pub fn recv(&self) -> Option<ChangeNotification> {
        if self.is_cancelled() {
            return None;
        }
        match self.receiver.recv() {
            Ok((version, snapshot)) if !self.is_cancelled() => {
                Some(self.wrap(version, snapshot))
            }
            _ => None,
        }
    }

    /// Returns the next notification if one is already queued.
    pub fn try_recv(&self) -> Option<ChangeNotification> {
        if self.is_cancelled() {
            return None;
        }
        match self.receiver.try_recv() {
            Ok((version, snapshot)) if !self.is_cancelled() => {
                Some(self.wrap(version, snapshot))
            }
            Ok(_) | Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocks up to `timeout` for the next notification.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ChangeNotification> {
        if self.is_cancelled() {
            return None;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok((version, snapshot)) if !self.is_cancelled() => {
                Some(self.wrap(version, snapshot))
            }
            Ok(_) | Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Returns whether this subscription has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.inner.lock().cancelled
    }

    /// Cancels this subscription, releasing the native listener before
    /// returning.
    ///
    /// Idempotent; never raises, including after the owning database has
    /// closed. An emission racing the cancellation is discarded rather than
    /// delivered.
    pub fn cancel(&self) {
        let listener = {
            let mut inner = self.shared.inner.lock();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            inner.listener.take()
        };
        // Unregister outside the state lock: the engine blocks here until a
        // concurrently firing callback has finished.
        if let Some(listener) = listener {
            self.shared.engine.listener_unregister(listener);
            tracing::debug!(listener = listener.as_u64(), "change listener released");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("type_name", &self.type_name)
            .field("filter", &self.filter)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use vivadb_interop::Value;
    use vivadb_testkit::prelude::*;

    const TICK: Duration = Duration::from_millis(200);

    fn open_db() -> Database {
        init_tracing();
        Database::open(memory_engine(), person_config()).unwrap()
    }

    #[test]
    fn emits_once_at_registration_then_once_per_matching_commit() {
        let db = open_db();
        let results = db
            .query("Person", "age >= $0", vec![Value::Int(18)])
            .unwrap()
            .find();
        let sub = results.subscribe().unwrap();

        // Initial snapshot at the current version, size 0.
        let initial = sub.recv_timeout(TICK).expect("initial emission");
        assert_eq!(initial.version, db.version().unwrap());
        assert_eq!(initial.results.len().unwrap(), 0);

        db.write(|txn| {
            txn.insert("Person", &[("age", Value::Int(30))])?;
            Ok(())
        })
        .unwrap();

        // Exactly one further snapshot, of size 1, at the new version.
        let next = sub.recv_timeout(TICK).expect("change emission");
        assert_eq!(next.version, db.version().unwrap());
        assert!(next.version > initial.version);
        assert_eq!(next.results.len().unwrap(), 1);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn unrelated_commits_do_not_emit() {
        let db = open_db();
        let adults = db
            .query("Person", "age >= $0", vec![Value::Int(18)])
            .unwrap()
            .find();
        let sub = adults.subscribe().unwrap();
        sub.recv_timeout(TICK).expect("initial emission");

        db.write(|txn| {
            txn.insert("Person", &[("age", Value::Int(5))])?;
            Ok(())
        })
        .unwrap();

        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn emissions_are_version_ordered_without_gaps() {
        let db = open_db();
        let results = db.query_all("Person").unwrap().find();
        let sub = results.subscribe().unwrap();
        let mut seen = vec![sub.recv_timeout(TICK).expect("initial emission")];

        for age in [1, 2, 3] {
            db.write(|txn| {
                txn.insert("Person", &[("age", Value::Int(age))])?;
                Ok(())
            })
            .unwrap();
        }
        while let Some(notification) = sub.try_recv() {
            seen.push(notification);
        }

        assert_eq!(seen.len(), 4);
        for (size, notification) in seen.iter().enumerate() {
            assert_eq!(notification.results.len().unwrap(), size);
        }
        for pair in seen.windows(2) {
            assert_eq!(pair[1].version, pair[0].version.next());
        }
    }

    #[test]
    fn snapshots_are_pinned_even_after_later_commits() {
        let db = open_db();
        let sub = db.query_all("Person").unwrap().find().subscribe().unwrap();
        sub.recv_timeout(TICK).expect("initial");

        db.write(|txn| {
            txn.insert("Person", &[("age", Value::Int(1))])?;
            Ok(())
        })
        .unwrap();
        let first_change = sub.recv_timeout(TICK).expect("change");

        db.write(|txn| {
            txn.insert("Person", &[("age", Value::Int(2))])?;
            Ok(())
        })
        .unwrap();

        // The earlier snapshot still observes its own version.
        assert_eq!(first_change.results.len().unwrap(), 1);
        assert_eq!(sub.recv_timeout(TICK).expect("change").results.len().unwrap(), 2);
    }

    #[test]
    fn independent_subscriptions_each_see_their_own_order() {
        let db = open_db();
        let all = db.query_all("Person").unwrap().find();
        let first = all.subscribe().unwrap();
        let second = db.query_all("Person").unwrap().find().subscribe().unwrap();

        db.write(|txn| {
            txn.insert("Person", &[("age", Value::Int(7))])?;
            Ok(())
        })
        .unwrap();

        for sub in [&first, &second] {
            let initial = sub.recv_timeout(TICK).expect("initial");
            let change = sub.recv_timeout(TICK).expect("change");
            assert!(change.version > initial.version);
        }
    }

    #[test]
    fn subscribing_inside_a_write_transaction_fails() {
        let db = open_db();
        let results = db.query_all("Person").unwrap().find();
        // Materialize before the transaction so the only failure is the
        // in-transaction check.
        results.len().unwrap();

        let outcome = db.write(|_| {
            let err = results.subscribe().unwrap_err();
            assert_eq!(
                err,
                crate::error::DbError::invalid_state(
                    "cannot subscribe to notifications inside a write transaction"
                )
            );
            Ok(())
        });
        outcome.unwrap();
    }

    #[test]
    fn frozen_references_reject_subscriptions() {
        let db = open_db();
        let frozen = db.freeze().unwrap();
        let results = frozen.query_all("Person").unwrap().find();
        let err = results.subscribe().unwrap_err();
        assert_eq!(
            err,
            crate::error::DbError::invalid_state(
                "cannot observe changes through a frozen reference"
            )
        );
    }

    #[test]
    fn cancel_is_idempotent_and_survives_close() {
        let db = open_db();
        let sub = db.query_all("Person").unwrap().find().subscribe().unwrap();

        sub.cancel();
        sub.cancel();
        assert!(sub.is_cancelled());

        let db2 = open_db();
        let other = db2.query_all("Person").unwrap().find().subscribe().unwrap();
        db2.close();
        other.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn pending_emissions_are_discarded_after_cancel() {
        let db = open_db();
        let sub = db.query_all("Person").unwrap().find().subscribe().unwrap();

        db.write(|txn| {
            txn.insert("Person", &[("age", Value::Int(1))])?;
            Ok(())
        })
        .unwrap();

        // Initial + change are queued but undelivered; cancel wins.
        sub.cancel();
        assert!(sub.try_recv().is_none());
        assert!(sub.recv().is_none());
    }

    #[test]
    fn closing_the_database_unblocks_a_pending_recv() {
        let db = open_db();
        let sub = db.query_all("Person").unwrap().find().subscribe().unwrap();
        sub.recv_timeout(TICK).expect("initial");

        let (done, outcome) = mpsc::channel();
        let waiter = std::thread::spawn(move || {
            let _ = done.send(sub.recv().map(|n| n.version));
        });

        // Closing drops the native listener and with it the channel's only
        // sender; the blocked recv() must observe the end of the stream
        // instead of waiting forever.
        db.close();
        let delivered = outcome
            .recv_timeout(Duration::from_secs(5))
            .expect("recv() returns once the database closes");
        assert!(delivered.is_none());
        waiter.join().unwrap();
    }

    #[test]
    fn closing_the_database_ends_the_stream_without_affecting_others() {
        let db = open_db();
        let other_db = open_db();
        let doomed = db.query_all("Person").unwrap().find().subscribe().unwrap();
        let healthy = other_db
            .query_all("Person")
            .unwrap()
            .find()
            .subscribe()
            .unwrap();
        doomed.recv_timeout(TICK).expect("initial");
        healthy.recv_timeout(TICK).expect("initial");

        db.close();
        assert!(doomed.try_recv().is_none());
        doomed.cancel();

        other_db
            .write(|txn| {
                txn.insert("Person", &[("age", Value::Int(2))])?;
                Ok(())
            })
            .unwrap();
        assert!(healthy.recv_timeout(TICK).is_some());
    }
}
