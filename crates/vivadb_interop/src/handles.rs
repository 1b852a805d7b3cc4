//! Opaque handle types.
//!
//! Handles are engine-assigned tokens. They carry no meaning on this side
//! of the boundary beyond identity; validity is scoped to the database
//! handle (and therefore version) they were issued against.

use std::fmt;

/// An opaque database handle.
///
/// A `DbHandle` identifies one open view of a database: either the live
/// session or a frozen snapshot at a fixed version. Never synthesize one;
/// handles are only valid when issued by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbHandle(pub u64);

impl DbHandle {
    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db:{}", self.0)
    }
}

/// An opaque parsed-query handle.
///
/// Issued by `Engine::query_parse` and `Engine::query_append`. The handle
/// stays valid for the lifetime of the database handle it was parsed
/// against; appending to it never mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHandle(pub u64);

impl QueryHandle {
    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// An opaque materialized-results handle.
///
/// Bound to the version of the database handle it was executed against.
/// Use `Engine::results_resolve` to obtain an equivalent handle in another
/// version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultsHandle(pub u64);

impl ResultsHandle {
    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// An opaque row handle.
///
/// Identifies one stored record. A row handle becomes invalid when the row
/// is deleted or the owning database handle closes; liveness is checked
/// lazily through `Engine::row_is_live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowHandle(pub u64);

impl RowHandle {
    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// An opaque change-listener registration handle.
///
/// Returned by `Engine::listener_register`; pass it back to
/// `Engine::listener_unregister` exactly once (extra calls are no-ops).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub u64);

impl ListenerHandle {
    /// Returns the raw handle value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// An opaque version identifier.
///
/// Versions are totally ordered per database; later versions observe an
/// evolution of earlier state. Used to detect staleness and to order
/// notification emissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId(pub u64);

impl VersionId {
    /// Creates a version identifier from its raw value.
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Returns the raw version value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next version identifier.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = VersionId::new(1);
        let v2 = v1.next();
        assert!(v1 < v2);
        assert_eq!(v2.as_u64(), 2);
    }

    #[test]
    fn handle_display() {
        assert_eq!(format!("{}", DbHandle(7)), "db:7");
        assert_eq!(format!("{}", VersionId::new(3)), "v:3");
    }
}
