//! In-memory persistence backend.
//!
//! Intended for tests/dev. A transaction holds the store-wide lock for its
//! whole lifetime and stages its writes; commit applies them, rollback (or
//! drop) discards them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use eventide_core::{AggregateId, MessageId};

use super::backend::{
    BackendError, BackendTransaction, Correlation, EventRecord, OutboxRecord, PersistenceBackend, SagaRecord,
    SnapshotRecord,
};

type OutboxKey = (DateTime<Utc>, u64, u64);

#[derive(Debug)]
struct OutboxSlot {
    record: OutboxRecord,
    leased_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Store {
    events: HashMap<AggregateId, Vec<EventRecord>>,
    snapshots: HashMap<AggregateId, SnapshotRecord>,
    sagas: HashMap<AggregateId, SagaRecord>,
    outbox: BTreeMap<OutboxKey, OutboxSlot>,
    inserted: u64,
}

impl Store {
    fn current_version(&self, aggregate_id: AggregateId) -> Option<u64> {
        self.events
            .get(&aggregate_id)
            .and_then(|stream| stream.last())
            .map(|e| e.version)
    }
}

/// In-memory backend. Cheap to clone; clones share storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    store: Arc<Mutex<Store>>,
    begun: Arc<AtomicU64>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions opened so far.
    pub fn transactions_begun(&self) -> u64 {
        self.begun.load(Ordering::SeqCst)
    }

    /// Number of records waiting in the outbox, due or not, leased or not.
    pub async fn outbox_len(&self) -> usize {
        self.store.lock().await.outbox.len()
    }

    /// Number of outbox records currently leased by a relay.
    pub async fn leased_len(&self) -> usize {
        let now = Utc::now();
        self.store
            .lock()
            .await
            .outbox
            .values()
            .filter(|slot| slot.leased_until.is_some_and(|until| until > now))
            .count()
    }
}

#[async_trait]
impl PersistenceBackend for InMemoryBackend {
    async fn begin(&self) -> Result<Box<dyn BackendTransaction>, BackendError> {
        let guard = Arc::clone(&self.store).lock_owned().await;
        self.begun.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryTransaction {
            guard,
            events: Vec::new(),
            sagas: HashMap::new(),
            outbox: Vec::new(),
        }))
    }

    async fn current_version(&self, aggregate_id: AggregateId) -> Result<Option<u64>, BackendError> {
        Ok(self.store.lock().await.current_version(aggregate_id))
    }

    async fn load_events(
        &self,
        aggregate_id: AggregateId,
        after: Option<u64>,
    ) -> Result<Vec<EventRecord>, BackendError> {
        let store = self.store.lock().await;
        Ok(store
            .events
            .get(&aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| after.is_none_or(|v| e.version > v))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<SnapshotRecord>, BackendError> {
        Ok(self.store.lock().await.snapshots.get(&aggregate_id).cloned())
    }

    async fn store_snapshot(&self, snapshot: SnapshotRecord) -> Result<(), BackendError> {
        let mut store = self.store.lock().await;
        let newer = store
            .snapshots
            .get(&snapshot.aggregate_id)
            .is_none_or(|existing| existing.version <= snapshot.version);
        if newer {
            store.snapshots.insert(snapshot.aggregate_id, snapshot);
        }
        Ok(())
    }

    async fn load_saga(&self, saga_id: AggregateId) -> Result<Option<SagaRecord>, BackendError> {
        Ok(self.store.lock().await.sagas.get(&saga_id).cloned())
    }

    async fn find_saga(
        &self,
        saga_type: &str,
        correlation: &Correlation,
    ) -> Result<Option<SagaRecord>, BackendError> {
        let store = self.store.lock().await;
        Ok(store
            .sagas
            .values()
            .find(|s| !s.completed && s.saga_type == saga_type && &s.correlation == correlation)
            .cloned())
    }

    async fn lease_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, BackendError> {
        let wall = Utc::now();
        let leased_until = TimeDelta::from_std(lease)
            .ok()
            .and_then(|lease| wall.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut store = self.store.lock().await;
        Ok(store
            .outbox
            .iter_mut()
            .take_while(|((due_at, _, _), _)| *due_at <= now)
            .filter(|(_, slot)| slot.leased_until.is_none_or(|until| until <= wall))
            .take(limit)
            .map(|(_, slot)| {
                slot.leased_until = Some(leased_until);
                slot.record.clone()
            })
            .collect())
    }

    async fn acknowledge(&self, message_id: MessageId) -> Result<(), BackendError> {
        self.store
            .lock()
            .await
            .outbox
            .retain(|_, slot| slot.record.envelope.message_id() != message_id);
        Ok(())
    }

    async fn release(&self, message_ids: &[MessageId]) -> Result<(), BackendError> {
        let mut store = self.store.lock().await;
        for slot in store.outbox.values_mut() {
            if message_ids.contains(&slot.record.envelope.message_id()) {
                slot.leased_until = None;
            }
        }
        Ok(())
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<Store>,
    events: Vec<EventRecord>,
    sagas: HashMap<AggregateId, SagaRecord>,
    outbox: Vec<OutboxRecord>,
}

impl InMemoryTransaction {
    fn saga_version(&self, saga_id: AggregateId) -> Option<u64> {
        self.sagas
            .get(&saga_id)
            .or_else(|| self.guard.sagas.get(&saga_id))
            .map(|s| s.version)
    }

    fn check_saga_version(&self, saga_id: AggregateId, expected: u64) -> Result<(), BackendError> {
        match self.saga_version(saga_id) {
            Some(actual) if actual == expected => Ok(()),
            actual => Err(BackendError::StaleVersion {
                key: format!("saga {saga_id}"),
                expected,
                actual,
            }),
        }
    }
}

#[async_trait]
impl BackendTransaction for InMemoryTransaction {
    async fn current_version(&mut self, aggregate_id: AggregateId) -> Result<Option<u64>, BackendError> {
        let staged = self
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.version)
            .max();
        Ok(staged.or_else(|| self.guard.current_version(aggregate_id)))
    }

    async fn append_event(&mut self, record: EventRecord) -> Result<(), BackendError> {
        let key = (record.aggregate_id, record.version, record.sequence);
        let taken = self
            .guard
            .events
            .get(&record.aggregate_id)
            .into_iter()
            .flatten()
            .chain(self.events.iter())
            .any(|e| (e.aggregate_id, e.version, e.sequence) == key);
        if taken {
            return Err(BackendError::UniqueViolation(format!(
                "event ({}, {}, {})",
                record.aggregate_id, record.version, record.sequence
            )));
        }
        self.events.push(record);
        Ok(())
    }

    async fn insert_saga(&mut self, record: SagaRecord) -> Result<(), BackendError> {
        if self.saga_version(record.saga_id).is_some() {
            return Err(BackendError::UniqueViolation(format!("saga {}", record.saga_id)));
        }
        self.sagas.insert(record.saga_id, record);
        Ok(())
    }

    async fn update_saga(&mut self, record: SagaRecord, expected_version: u64) -> Result<(), BackendError> {
        self.check_saga_version(record.saga_id, expected_version)?;
        self.sagas.insert(record.saga_id, record);
        Ok(())
    }

    async fn complete_saga(&mut self, record: SagaRecord, expected_version: u64) -> Result<(), BackendError> {
        self.check_saga_version(record.saga_id, expected_version)?;
        self.sagas.insert(
            record.saga_id,
            SagaRecord {
                completed: true,
                ..record
            },
        );
        Ok(())
    }

    async fn enqueue(&mut self, record: OutboxRecord) -> Result<(), BackendError> {
        self.outbox.push(record);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), BackendError> {
        let InMemoryTransaction {
            mut guard,
            events,
            sagas,
            outbox,
        } = *self;

        for record in events {
            let stream = guard.events.entry(record.aggregate_id).or_default();
            stream.push(record);
            stream.sort_by_key(|e| (e.version, e.sequence));
        }
        guard.sagas.extend(sagas);
        for record in outbox {
            guard.inserted += 1;
            let key = (record.due_at, record.offset, guard.inserted);
            guard.outbox.insert(
                key,
                OutboxSlot {
                    record,
                    leased_until: None,
                },
            );
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), BackendError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    use eventide_core::{CorrelationId, MessageId};
    use eventide_events::{Envelope, Event, Message};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Pinged;

    impl Message for Pinged {
        fn message_type() -> &'static str {
            "test.pinged"
        }
    }

    impl Event for Pinged {}

    fn record(aggregate_id: AggregateId, version: u64, sequence: u32) -> EventRecord {
        EventRecord {
            aggregate_id,
            version,
            sequence,
            message_id: MessageId::new(),
            correlation_id: CorrelationId::new(),
            causation_id: None,
            message_type: "test.pinged".into(),
            revision: 1,
            recorded_on: Utc::now(),
            payload: json!(null),
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let backend = InMemoryBackend::new();
        let id = AggregateId::new();

        let mut tx = backend.begin().await.unwrap();
        tx.append_event(record(id, 0, 0)).await.unwrap();
        assert_eq!(tx.current_version(id).await.unwrap(), Some(0));
        tx.rollback().await.unwrap();

        assert_eq!(backend.current_version(id).await.unwrap(), None);
        assert!(backend.load_events(id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_event_keys_are_unique_violations() {
        let backend = InMemoryBackend::new();
        let id = AggregateId::new();

        let mut tx = backend.begin().await.unwrap();
        tx.append_event(record(id, 0, 0)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = backend.begin().await.unwrap();
        let err = tx.append_event(record(id, 0, 0)).await.unwrap_err();
        assert!(matches!(err, BackendError::UniqueViolation(_)));
        tx.append_event(record(id, 1, 0)).await.unwrap();
        tx.commit().await.unwrap();

        let after = backend.load_events(id, Some(0)).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].version, 1);
    }

    const LEASE: std::time::Duration = std::time::Duration::from_secs(60);

    async fn enqueue_pings(backend: &InMemoryBackend, slots: &[(DateTime<Utc>, u64)]) -> Vec<MessageId> {
        let mut tx = backend.begin().await.unwrap();
        let mut ids = Vec::new();
        for &(due_at, offset) in slots {
            let envelope = Envelope::event(AggregateId::new(), &Pinged, CorrelationId::new(), due_at).unwrap();
            ids.push(envelope.message_id());
            tx.enqueue(OutboxRecord {
                due_at,
                offset,
                envelope,
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();
        ids
    }

    #[tokio::test]
    async fn outbox_leases_in_due_then_offset_order() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        enqueue_pings(&backend, &[(now + Duration::seconds(5), 0), (now, 2), (now, 1)]).await;

        let due = backend.lease_due(now, 10, LEASE).await.unwrap();
        assert_eq!(due.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(backend.outbox_len().await, 3);
        assert_eq!(backend.leased_len().await, 2);

        // Leased records are not handed out twice.
        let due = backend.lease_due(now + Duration::seconds(5), 10, LEASE).await.unwrap();
        assert_eq!(due.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0]);
        assert!(backend.lease_due(now + Duration::seconds(5), 10, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acknowledged_records_are_gone_and_released_ones_come_back() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let ids = enqueue_pings(&backend, &[(now, 0), (now, 1)]).await;

        assert_eq!(backend.lease_due(now, 10, LEASE).await.unwrap().len(), 2);
        backend.acknowledge(ids[0]).await.unwrap();
        backend.release(&ids[1..]).await.unwrap();

        assert_eq!(backend.outbox_len().await, 1);
        let again = backend.lease_due(now, 10, LEASE).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].envelope.message_id(), ids[1]);
    }

    #[tokio::test]
    async fn expired_leases_are_handed_out_again() {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        enqueue_pings(&backend, &[(now, 0)]).await;

        assert_eq!(backend.lease_due(now, 10, std::time::Duration::ZERO).await.unwrap().len(), 1);
        assert_eq!(backend.lease_due(now, 10, LEASE).await.unwrap().len(), 1);
        assert!(backend.lease_due(now, 10, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn older_snapshots_do_not_replace_newer_ones() {
        let backend = InMemoryBackend::new();
        let id = AggregateId::new();
        let snapshot = |version| SnapshotRecord {
            aggregate_id: id,
            version,
            snapshot_type: "test.counter".into(),
            revision: 1,
            taken_on: Utc::now(),
            state: json!({ "at": version }),
        };

        backend.store_snapshot(snapshot(5)).await.unwrap();
        backend.store_snapshot(snapshot(2)).await.unwrap();
        assert_eq!(backend.load_snapshot(id).await.unwrap().unwrap().version, 5);
    }
}
