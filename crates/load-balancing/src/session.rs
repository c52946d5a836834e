//! Per unit-of-work routing state.
//!
//! A [`Session`] belongs to exactly one request or job and is passed by
//! mutable reference to every routing call. It is never shared between
//! concurrent units of work.

use crate::location::WalLocation;

/// Routing state for one unit of work.
///
/// Once [`write`](Session::write) has been called the session stays pinned
/// to the primary until [`clear`](Session::clear).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Session {
    use_primary: bool,
    performed_write: bool,
    last_write_location: Option<WalLocation>,
    transaction_depth: usize,
    use_replicas_for_read_queries: bool,
    fallback_to_replicas_for_ambiguous_queries: bool,
}

/// Saved flag returned by the `enter_*` scope methods.
///
/// Hand it back to the matching `exit_*` method to restore the previous state.
#[derive(Debug)]
#[must_use = "pass the scope to the matching exit method"]
pub struct SessionScope {
    previous: bool,
}

impl Session {
    /// Creates an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the session to the primary.
    pub fn use_primary(&mut self) {
        self.use_primary = true;
    }

    /// Returns true if queries must go to the primary.
    pub fn using_primary(&self) -> bool {
        self.use_primary || self.performed_write
    }

    /// Records that a write happened. Also pins the session to the primary.
    pub fn write(&mut self) {
        self.performed_write = true;
        self.use_primary = true;
    }

    /// Returns true if a write happened in this unit of work.
    pub fn performed_write(&self) -> bool {
        self.performed_write
    }

    /// Runs `f` pinned to the primary.
    ///
    /// The previous pinning is restored afterwards unless `f` wrote.
    pub fn with_primary<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let scope = self.enter_primary_scope();
        let result = f(self);
        self.exit_primary_scope(scope);
        result
    }

    /// Pins the session to the primary until [`exit_primary_scope`](Self::exit_primary_scope).
    pub fn enter_primary_scope(&mut self) -> SessionScope {
        let previous = self.use_primary;
        self.use_primary = true;
        SessionScope { previous }
    }

    /// Ends a scope started with [`enter_primary_scope`](Self::enter_primary_scope).
    pub fn exit_primary_scope(&mut self, scope: SessionScope) {
        self.use_primary = scope.previous || self.performed_write;
    }

    /// Runs `f` with plain reads sent to replicas even if the session is pinned.
    pub fn with_replicas_for_read_queries<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let scope = self.enter_replicas_for_read_queries();
        let result = f(self);
        self.exit_replicas_for_read_queries(scope);
        result
    }

    /// Starts sending plain reads to replicas regardless of pinning.
    pub fn enter_replicas_for_read_queries(&mut self) -> SessionScope {
        let previous = self.use_replicas_for_read_queries;
        self.use_replicas_for_read_queries = true;
        SessionScope { previous }
    }

    /// Ends a scope started with [`enter_replicas_for_read_queries`](Self::enter_replicas_for_read_queries).
    pub fn exit_replicas_for_read_queries(&mut self, scope: SessionScope) {
        self.use_replicas_for_read_queries = scope.previous;
    }

    /// Returns true if plain reads go to replicas regardless of pinning.
    pub fn use_replicas_for_read_queries(&self) -> bool {
        self.use_replicas_for_read_queries
    }

    /// Runs `f` with unclassified queries sent to replicas.
    pub fn with_fallback_to_replicas_for_ambiguous_queries<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let scope = self.enter_fallback_to_replicas_for_ambiguous_queries();
        let result = f(self);
        self.exit_fallback_to_replicas_for_ambiguous_queries(scope);
        result
    }

    /// Starts sending unclassified queries to replicas.
    pub fn enter_fallback_to_replicas_for_ambiguous_queries(&mut self) -> SessionScope {
        let previous = self.fallback_to_replicas_for_ambiguous_queries;
        self.fallback_to_replicas_for_ambiguous_queries = true;
        SessionScope { previous }
    }

    /// Ends a scope started with
    /// [`enter_fallback_to_replicas_for_ambiguous_queries`](Self::enter_fallback_to_replicas_for_ambiguous_queries).
    pub fn exit_fallback_to_replicas_for_ambiguous_queries(&mut self, scope: SessionScope) {
        self.fallback_to_replicas_for_ambiguous_queries = scope.previous;
    }

    /// Returns true if unclassified queries may go to replicas.
    ///
    /// Never true once the session is pinned to the primary.
    pub fn fallback_to_replicas_for_ambiguous_queries(&self) -> bool {
        self.fallback_to_replicas_for_ambiguous_queries && !self.using_primary()
    }

    /// Enters a transaction or savepoint.
    pub fn enter_transaction(&mut self) {
        self.transaction_depth += 1;
    }

    /// Leaves a transaction or savepoint.
    pub fn leave_transaction(&mut self) {
        self.transaction_depth = self.transaction_depth.saturating_sub(1);
    }

    /// Returns true inside a transaction.
    pub fn in_transaction(&self) -> bool {
        self.transaction_depth > 0
    }

    /// Current transaction nesting depth.
    pub fn transaction_depth(&self) -> usize {
        self.transaction_depth
    }

    /// Primary write location recorded after the last tracked write.
    pub fn last_write_location(&self) -> Option<WalLocation> {
        self.last_write_location
    }

    /// Records the primary write location after a write.
    pub fn set_last_write_location(&mut self, location: WalLocation) {
        self.last_write_location = Some(location);
    }

    /// Forgets the recorded write location once replicas caught up.
    pub fn clear_last_write_location(&mut self) {
        self.last_write_location = None;
    }

    /// Resets all state at the end of a unit of work.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
