//! Storage contract required by the commit protocol.
//!
//! A backend stores four things: event streams, snapshots, saga instances and
//! the outbox. Writes happen only through a [`BackendTransaction`]; reads that
//! do not participate in a commit go straight to the backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use eventide_core::{AggregateId, CorrelationId, MessageId};
use eventide_events::{Envelope, EnvelopeError, Message, TypeRegistry};

/// Backend-level failure.
///
/// Constraint violations are reported as data; the commit protocol turns them
/// into typed conflicts.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),

    #[error("stale version for {key}: expected {expected}, found {actual:?}")]
    StaleVersion {
        key: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("storage error in {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }
}

/// A persisted event, keyed by `(aggregate_id, version, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub aggregate_id: AggregateId,
    pub version: u64,
    /// Position of the event within its version.
    pub sequence: u32,

    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<MessageId>,

    pub message_type: String,
    pub revision: u32,
    pub recorded_on: DateTime<Utc>,

    pub payload: JsonValue,
}

impl EventRecord {
    /// Stamp an event envelope with its position in the stream.
    pub fn stamp(envelope: &Envelope, version: u64, sequence: u32, recorded_on: DateTime<Utc>) -> Self {
        Self {
            aggregate_id: envelope.aggregate_id(),
            version,
            sequence,
            message_id: envelope.message_id(),
            correlation_id: envelope.correlation_id(),
            causation_id: envelope.causation_id(),
            message_type: envelope.message_type().to_string(),
            revision: envelope.revision(),
            recorded_on,
            payload: envelope.payload().clone(),
        }
    }

    /// Decode the payload, upcasting older revisions.
    pub fn decode<M: Message>(&self, types: &TypeRegistry) -> Result<M, EnvelopeError> {
        types.decode_payload(&self.message_type, self.revision, self.payload.clone())
    }
}

/// Serialized aggregate state at a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub aggregate_id: AggregateId,
    pub version: u64,
    pub snapshot_type: String,
    pub revision: u32,
    pub taken_on: DateTime<Utc>,
    pub state: JsonValue,
}

/// `(property, value)` pair a saga instance is found by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Correlation {
    pub property: String,
    pub value: String,
}

impl Correlation {
    pub fn new(property: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            value: value.into(),
        }
    }
}

/// A persisted saga instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_id: AggregateId,
    pub saga_type: String,
    pub version: u64,
    pub completed: bool,
    pub correlation: Correlation,
    pub state: JsonValue,
}

/// A message waiting in the outbox until `due_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub due_at: DateTime<Utc>,
    pub offset: u64,
    pub envelope: Envelope,
}

#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Open a write transaction.
    async fn begin(&self) -> Result<Box<dyn BackendTransaction>, BackendError>;

    /// Version of the last committed event, `None` for an empty stream.
    async fn current_version(&self, aggregate_id: AggregateId) -> Result<Option<u64>, BackendError>;

    /// Events ordered by `(version, sequence)`, optionally only those after `after`.
    async fn load_events(
        &self,
        aggregate_id: AggregateId,
        after: Option<u64>,
    ) -> Result<Vec<EventRecord>, BackendError>;

    /// Latest snapshot, if any.
    async fn load_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<SnapshotRecord>, BackendError>;

    async fn store_snapshot(&self, snapshot: SnapshotRecord) -> Result<(), BackendError>;

    /// Saga by id, completed or not.
    async fn load_saga(&self, saga_id: AggregateId) -> Result<Option<SagaRecord>, BackendError>;

    /// Non-completed saga of `saga_type` whose stored correlation equals `correlation`.
    async fn find_saga(
        &self,
        saga_type: &str,
        correlation: &Correlation,
    ) -> Result<Option<SagaRecord>, BackendError>;

    /// Lease up to `limit` records due at `now`, in `(due_at, offset)` order.
    ///
    /// Leased records stay stored and are skipped by later calls until the
    /// lease (measured on the wall clock) runs out or is released.
    async fn lease_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, BackendError>;

    /// Delete a delivered record.
    async fn acknowledge(&self, message_id: MessageId) -> Result<(), BackendError>;

    /// End the lease on records that were leased but not delivered.
    async fn release(&self, message_ids: &[MessageId]) -> Result<(), BackendError>;
}

#[async_trait]
pub trait BackendTransaction: Send {
    async fn current_version(&mut self, aggregate_id: AggregateId) -> Result<Option<u64>, BackendError>;

    /// Unique on `(aggregate_id, version, sequence)`.
    async fn append_event(&mut self, record: EventRecord) -> Result<(), BackendError>;

    /// Fails with `UniqueViolation` if the saga id already exists.
    async fn insert_saga(&mut self, record: SagaRecord) -> Result<(), BackendError>;

    /// Overwrite the instance if its stored version equals `expected_version`.
    async fn update_saga(&mut self, record: SagaRecord, expected_version: u64) -> Result<(), BackendError>;

    /// Store the final state and mark the instance completed if its stored
    /// version equals `expected_version`.
    async fn complete_saga(&mut self, record: SagaRecord, expected_version: u64) -> Result<(), BackendError>;

    async fn enqueue(&mut self, record: OutboxRecord) -> Result<(), BackendError>;

    async fn commit(self: Box<Self>) -> Result<(), BackendError>;

    async fn rollback(self: Box<Self>) -> Result<(), BackendError>;
}
