//! Append-only event store with optimistic concurrency and snapshots.
//!
//! Reads go straight to the [`PersistenceBackend`]; every write is a
//! [`Commit`] handed to the commit protocol, so saved events are enqueued to
//! the outbox in the same transaction.
//!
//! ## Versions
//!
//! Versions are zero-based and one commit produces one version. Events written
//! by the same commit share the version and are ordered by `sequence`.
//!
//! ## Snapshots
//!
//! `load_stream` yields the latest snapshot first and then only the events
//! written after it. A snapshot can never claim a version the stream has not
//! reached; `save_snapshot` rejects it.

pub mod repository;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use eventide_core::{AggregateId, Clock, DomainError, ExpectedVersion};
use eventide_events::{Envelope, EnvelopeError};

use crate::cancel::Cancellation;
use crate::persistence::{
    BackendError, Commit, CommitPersistence, CommitReceipt, EventRecord, PersistenceBackend, PersistenceError,
    SnapshotRecord,
};

pub use repository::{AggregateCommandHandler, AggregateRepository, Loaded};

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("aggregate {0} not found")]
    AggregateNotFound(AggregateId),

    #[error("load of aggregate {0} was cancelled")]
    Timeout(AggregateId),

    #[error("snapshot of {aggregate_id} at version {version} is ahead of the stream (current: {current:?})")]
    InvalidSnapshot {
        aggregate_id: AggregateId,
        version: u64,
        current: Option<u64>,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl EventStoreError {
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            EventStoreError::Persistence(PersistenceError::ConcurrencyConflict { .. })
        )
    }
}

/// One element of a snapshot-aware stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamItem<'a> {
    Snapshot(&'a SnapshotRecord),
    Event(&'a EventRecord),
}

/// Latest snapshot (if any) followed by the events written after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStream {
    pub snapshot: Option<SnapshotRecord>,
    pub events: Vec<EventRecord>,
}

impl EventStream {
    /// Version of the last element of the stream.
    pub fn version(&self) -> Option<u64> {
        self.events
            .last()
            .map(|e| e.version)
            .or_else(|| self.snapshot.as_ref().map(|s| s.version))
    }

    pub fn iter(&self) -> impl Iterator<Item = StreamItem<'_>> {
        self.snapshot
            .iter()
            .map(StreamItem::Snapshot)
            .chain(self.events.iter().map(StreamItem::Event))
    }
}

/// Event store over a backend and a commit protocol. Cheap to clone.
#[derive(Clone)]
pub struct EventStore {
    backend: Arc<dyn PersistenceBackend>,
    persistence: Arc<dyn CommitPersistence>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

impl EventStore {
    pub fn new(
        backend: Arc<dyn PersistenceBackend>,
        persistence: Arc<dyn CommitPersistence>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            persistence,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// All events of an aggregate in `(version, sequence)` order.
    #[instrument(skip(self, cancel), fields(aggregate_id = %aggregate_id), err)]
    pub async fn load(&self, aggregate_id: AggregateId, cancel: &Cancellation) -> Result<Vec<EventRecord>, EventStoreError> {
        let events = cancel
            .run(self.backend.load_events(aggregate_id, None))
            .await
            .ok_or(EventStoreError::Timeout(aggregate_id))??;

        if events.is_empty() {
            return Err(EventStoreError::AggregateNotFound(aggregate_id));
        }
        debug!(count = events.len(), "events loaded");
        Ok(events)
    }

    /// Like [`EventStore::load`], keeping only records accepted by `predicate`.
    ///
    /// An aggregate with events is found even if nothing matches.
    pub async fn load_matching<F>(
        &self,
        aggregate_id: AggregateId,
        predicate: F,
        cancel: &Cancellation,
    ) -> Result<Vec<EventRecord>, EventStoreError>
    where
        F: Fn(&EventRecord) -> bool,
    {
        let events = self.load(aggregate_id, cancel).await?;
        Ok(events.into_iter().filter(|e| predicate(e)).collect())
    }

    /// Snapshot-aware stream.
    #[instrument(skip(self, cancel), fields(aggregate_id = %aggregate_id), err)]
    pub async fn load_stream(&self, aggregate_id: AggregateId, cancel: &Cancellation) -> Result<EventStream, EventStoreError> {
        let snapshot = cancel
            .run(self.backend.load_snapshot(aggregate_id))
            .await
            .ok_or(EventStoreError::Timeout(aggregate_id))??;
        let after = snapshot.as_ref().map(|s| s.version);

        let mut events = cancel
            .run(self.backend.load_events(aggregate_id, after))
            .await
            .ok_or(EventStoreError::Timeout(aggregate_id))??;
        if let Some(floor) = after {
            events.retain(|e| e.version > floor);
        }

        if snapshot.is_none() && events.is_empty() {
            return Err(EventStoreError::AggregateNotFound(aggregate_id));
        }
        Ok(EventStream { snapshot, events })
    }

    /// Version of the last committed event, `None` for an empty stream.
    pub async fn current_version(
        &self,
        aggregate_id: AggregateId,
        cancel: &Cancellation,
    ) -> Result<Option<u64>, EventStoreError> {
        cancel
            .run(self.backend.current_version(aggregate_id))
            .await
            .ok_or(EventStoreError::Timeout(aggregate_id))?
            .map_err(EventStoreError::from)
    }

    /// Append `events` as the next version of the aggregate.
    ///
    /// Each event is also enqueued to the outbox. An empty list is a no-op
    /// and returns `None` without touching the backend.
    #[instrument(
        skip(self, events, cancel),
        fields(aggregate_id = %aggregate_id, expected_version = ?expected_version, count = events.len()),
        err
    )]
    pub async fn save(
        &self,
        aggregate_id: AggregateId,
        events: Vec<Envelope>,
        expected_version: ExpectedVersion,
        cancel: &Cancellation,
    ) -> Result<Option<CommitReceipt>, EventStoreError> {
        if events.is_empty() {
            return Ok(None);
        }

        let messages = events.clone();
        let commit = Commit::new(aggregate_id, expected_version)
            .with_events(events)
            .with_messages(messages);
        let receipt = self.persistence.persist(commit, cancel).await?;
        Ok(Some(receipt))
    }

    #[instrument(
        skip(self, snapshot, cancel),
        fields(aggregate_id = %snapshot.aggregate_id, version = snapshot.version),
        err
    )]
    pub async fn save_snapshot(&self, snapshot: SnapshotRecord, cancel: &Cancellation) -> Result<(), EventStoreError> {
        let aggregate_id = snapshot.aggregate_id;
        let current = self.current_version(aggregate_id, cancel).await?;
        if current.is_none_or(|c| snapshot.version > c) {
            return Err(EventStoreError::InvalidSnapshot {
                aggregate_id,
                version: snapshot.version,
                current,
            });
        }

        cancel
            .run(self.backend.store_snapshot(snapshot))
            .await
            .ok_or(EventStoreError::Timeout(aggregate_id))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use eventide_core::{CorrelationId, SystemClock};
    use eventide_events::{Event, Message};

    use crate::cancel::CancellationSource;
    use crate::persistence::{InMemoryBackend, Persistence};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Deposited {
        amount: u64,
    }

    impl Message for Deposited {
        fn message_type() -> &'static str {
            "wallet.deposited"
        }
    }

    impl Event for Deposited {}

    fn setup() -> (Arc<InMemoryBackend>, EventStore) {
        let backend = Arc::new(InMemoryBackend::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let persistence = Arc::new(Persistence::new(backend.clone(), clock.clone()));
        (backend.clone(), EventStore::new(backend, persistence, clock))
    }

    fn deposited(id: AggregateId, amount: u64) -> Envelope {
        Envelope::event(id, &Deposited { amount }, CorrelationId::new(), Utc::now()).unwrap()
    }

    fn snapshot(id: AggregateId, version: u64) -> SnapshotRecord {
        SnapshotRecord {
            aggregate_id: id,
            version,
            snapshot_type: "wallet".into(),
            revision: 1,
            taken_on: Utc::now(),
            state: json!({ "balance": 3 }),
        }
    }

    #[tokio::test]
    async fn missing_aggregate_is_not_found() {
        let (_, store) = setup();
        let id = AggregateId::new();
        assert!(matches!(
            store.load(id, &Cancellation::none()).await,
            Err(EventStoreError::AggregateNotFound(missing)) if missing == id
        ));
        assert!(matches!(
            store.load_stream(id, &Cancellation::none()).await,
            Err(EventStoreError::AggregateNotFound(_))
        ));
    }

    #[tokio::test]
    async fn save_enqueues_one_message_per_event() {
        let (backend, store) = setup();
        let id = AggregateId::new();
        let receipt = store
            .save(id, vec![deposited(id, 1), deposited(id, 2)], ExpectedVersion::Initial, &Cancellation::none())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(receipt.version, Some(0));
        assert_eq!(receipt.enqueued, 2);
        assert_eq!(backend.outbox_len().await, 2);
    }

    #[tokio::test]
    async fn empty_save_is_a_no_op() {
        let (backend, store) = setup();
        let saved = store
            .save(AggregateId::new(), vec![], ExpectedVersion::Exact(9), &Cancellation::none())
            .await
            .unwrap();
        assert!(saved.is_none());
        assert_eq!(backend.transactions_begun(), 0);
    }

    #[tokio::test]
    async fn load_matching_filters_after_existence_check() {
        let (_, store) = setup();
        let id = AggregateId::new();
        store
            .save(id, vec![deposited(id, 1), deposited(id, 5)], ExpectedVersion::Initial, &Cancellation::none())
            .await
            .unwrap();

        let big = store
            .load_matching(id, |e| e.payload["amount"].as_u64() > Some(2), &Cancellation::none())
            .await
            .unwrap();
        assert_eq!(big.len(), 1);

        let none = store.load_matching(id, |_| false, &Cancellation::none()).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn stream_skips_events_covered_by_the_snapshot() {
        let (_, store) = setup();
        let id = AggregateId::new();
        for v in 0..3u64 {
            store
                .save(id, vec![deposited(id, v + 1)], ExpectedVersion::from(v.checked_sub(1)), &Cancellation::none())
                .await
                .unwrap();
        }
        store.save_snapshot(snapshot(id, 1), &Cancellation::none()).await.unwrap();

        let stream = store.load_stream(id, &Cancellation::none()).await.unwrap();
        let items: Vec<_> = stream.iter().collect();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], StreamItem::Snapshot(s) if s.version == 1));
        assert!(matches!(items[1], StreamItem::Event(e) if e.version == 2));
        assert_eq!(stream.version(), Some(2));
    }

    #[tokio::test]
    async fn snapshots_ahead_of_the_stream_are_rejected() {
        let (_, store) = setup();
        let id = AggregateId::new();
        let err = store.save_snapshot(snapshot(id, 0), &Cancellation::none()).await.unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidSnapshot { current: None, .. }));

        store
            .save(id, vec![deposited(id, 1)], ExpectedVersion::Initial, &Cancellation::none())
            .await
            .unwrap();
        let err = store.save_snapshot(snapshot(id, 1), &Cancellation::none()).await.unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidSnapshot { version: 1, current: Some(0), .. }));
    }

    #[tokio::test]
    async fn cancelled_load_is_a_timeout_not_a_partial_result() {
        let (_, store) = setup();
        let id = AggregateId::new();
        store
            .save(id, vec![deposited(id, 1)], ExpectedVersion::Initial, &Cancellation::none())
            .await
            .unwrap();

        let source = CancellationSource::new();
        source.cancel();
        assert!(matches!(
            store.load(id, &source.token()).await,
            Err(EventStoreError::Timeout(_))
        ));
    }
}
