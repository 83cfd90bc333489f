//! Aggregate contract for event-sourced domain models.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::AggregateId;

/// Optimistic concurrency expectation for an aggregate.
///
/// Versions are zero-based: the first commit to an aggregate is written at
/// version `0`, the next at `1`, and so on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "version", rename_all = "snake_case")]
pub enum ExpectedVersion {
    /// The aggregate must not exist yet.
    Initial,
    /// Skip version checking (useful for idempotent commands, migrations, etc.).
    Any,
    /// Require the aggregate to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Whether a stream whose last version is `current` (`None` when the
    /// stream is empty) satisfies this expectation.
    pub fn matches(self, current: Option<u64>) -> bool {
        match self {
            ExpectedVersion::Initial => current.is_none(),
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => current == Some(v),
        }
    }

    /// The version the next commit is written at.
    pub fn next_version(self, current: Option<u64>) -> u64 {
        match self {
            ExpectedVersion::Initial => 0,
            ExpectedVersion::Exact(v) => v.saturating_add(1),
            ExpectedVersion::Any => current.map_or(0, |v| v.saturating_add(1)),
        }
    }

    pub fn check(self, current: Option<u64>) -> DomainResult<()> {
        if self.matches(current) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {current:?})"
            )))
        }
    }
}

impl From<Option<u64>> for ExpectedVersion {
    /// The expectation that pins an aggregate to the version it was loaded at.
    fn from(value: Option<u64>) -> Self {
        match value {
            None => ExpectedVersion::Initial,
            Some(v) => ExpectedVersion::Exact(v),
        }
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns events.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// Aggregates must not perform IO or side effects. The runtime tracks the
/// stream version; aggregates only fold events into state.
pub trait Aggregate: Send + Sync + Sized + 'static {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;

    /// Stable aggregate type identifier (e.g. "token.mint").
    fn aggregate_type() -> &'static str;

    /// A fresh aggregate with no history.
    fn new(id: AggregateId) -> Self;

    /// Evolve in-memory state from a single event.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    ///
    /// This must not mutate state. State evolution is done through `apply`.
    fn handle(&self, command: &Self::Command) -> DomainResult<Vec<Self::Event>>;

    /// Full state for a snapshot. `None` disables snapshotting.
    fn snapshot(&self) -> Option<JsonValue> {
        None
    }

    /// Rebuild an aggregate from a snapshot produced by [`Aggregate::snapshot`].
    fn restore(id: AggregateId, state: JsonValue) -> DomainResult<Self> {
        let _ = (id, state);
        Err(DomainError::invariant(format!(
            "{} does not support snapshots",
            Self::aggregate_type()
        )))
    }
}

/// Execute a command against an aggregate and fold the resulting events into it.
///
/// 1. **Decide**: `aggregate.handle(command)` (pure, no mutation)
/// 2. **Evolve**: `aggregate.apply(event)` for each decided event
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> DomainResult<Vec<A::Event>>
where
    A: Aggregate,
{
    let events = aggregate.handle(command)?;
    for ev in &events {
        aggregate.apply(ev);
    }
    Ok(events)
}
