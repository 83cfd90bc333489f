//! Atomic commit protocol.
//!
//! A [`Commit`] carries three parts that persist together or not at all:
//!
//! 1. new events for one aggregate, guarded by an expected version
//! 2. an optional saga mutation (insert, versioned update or completion)
//! 3. outbound messages for the outbox
//!
//! ```text
//! Commit
//!   ↓
//! begin (cancellation observed)
//!   ↓
//! resolve target version → stamp (version, sequence) → append events
//!   ↓
//! saga insert / update / complete (version checked)
//!   ↓
//! enqueue messages (due_at, offset)
//!   ↓
//! commit (cancellation observed) | rollback on any failure
//! ```

pub mod backend;
pub mod in_memory;
pub mod postgres;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use eventide_core::{AggregateId, Clock, ExpectedVersion};
use eventide_events::Envelope;

use crate::cancel::Cancellation;

pub use backend::{
    BackendError, BackendTransaction, Correlation, EventRecord, OutboxRecord, PersistenceBackend, SagaRecord,
    SnapshotRecord,
};
pub use in_memory::InMemoryBackend;
pub use postgres::PostgresBackend;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("concurrency conflict on aggregate {aggregate_id} at version {version}")]
    ConcurrencyConflict { aggregate_id: AggregateId, version: u64 },

    #[error("saga conflict on {saga_type} instance {saga_id}")]
    SagaConflict { saga_id: AggregateId, saga_type: String },

    #[error("commit cancelled")]
    Cancelled,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl PersistenceError {
    /// Only version conflicts are worth retrying after a reload.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PersistenceError::ConcurrencyConflict { .. } | PersistenceError::SagaConflict { .. }
        )
    }
}

/// Saga state to write alongside a commit.
///
/// `record.version` is the version the instance was loaded at (`0` when new);
/// `record.completed` requests completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaMutation {
    pub record: SagaRecord,
    pub is_new: bool,
}

/// One atomic unit of change.
#[derive(Debug, Clone)]
pub struct Commit {
    pub aggregate_id: AggregateId,
    pub expected_version: ExpectedVersion,
    pub events: Vec<Envelope>,
    pub saga: Option<SagaMutation>,
    pub messages: Vec<Envelope>,
}

impl Commit {
    pub fn new(aggregate_id: AggregateId, expected_version: ExpectedVersion) -> Self {
        Self {
            aggregate_id,
            expected_version,
            events: Vec::new(),
            saga: None,
            messages: Vec::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<Envelope>) -> Self {
        self.events = events;
        self
    }

    pub fn with_saga(mut self, saga: SagaMutation) -> Self {
        self.saga = Some(saga);
        self
    }

    pub fn with_messages(mut self, messages: Vec<Envelope>) -> Self {
        self.messages = messages;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.saga.is_none() && self.messages.is_empty()
    }
}

/// What a successful commit wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub aggregate_id: AggregateId,
    /// Version the events were written at, `None` when the commit had no events.
    pub version: Option<u64>,
    pub events: Vec<EventRecord>,
    pub enqueued: usize,
}

impl CommitReceipt {
    pub fn empty(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            version: None,
            events: Vec::new(),
            enqueued: 0,
        }
    }
}

#[async_trait]
pub trait CommitPersistence: Send + Sync {
    async fn persist(&self, commit: Commit, cancel: &Cancellation) -> Result<CommitReceipt, PersistenceError>;
}

#[async_trait]
impl<P> CommitPersistence for Arc<P>
where
    P: CommitPersistence + ?Sized,
{
    async fn persist(&self, commit: Commit, cancel: &Cancellation) -> Result<CommitReceipt, PersistenceError> {
        (**self).persist(commit, cancel).await
    }
}

/// Commit protocol over a [`PersistenceBackend`].
pub struct Persistence {
    backend: Arc<dyn PersistenceBackend>,
    clock: Arc<dyn Clock>,
    offsets: AtomicU64,
}

impl core::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Persistence")
            .field("next_offset", &self.offsets.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Persistence {
    pub fn new(backend: Arc<dyn PersistenceBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            offsets: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn PersistenceBackend> {
        &self.backend
    }

    async fn write(
        &self,
        tx: &mut dyn BackendTransaction,
        commit: Commit,
    ) -> Result<CommitReceipt, PersistenceError> {
        let Commit {
            aggregate_id,
            expected_version,
            events,
            saga,
            messages,
        } = commit;
        let now = self.clock.now();

        // 1) Events
        let mut records = Vec::with_capacity(events.len());
        let mut written_at = None;
        if !events.is_empty() {
            let current = tx.current_version(aggregate_id).await?;
            let target = expected_version.next_version(current);
            if !expected_version.matches(current) {
                return Err(PersistenceError::ConcurrencyConflict {
                    aggregate_id,
                    version: target,
                });
            }

            for (sequence, envelope) in events.iter().enumerate() {
                let record = EventRecord::stamp(envelope, target, sequence as u32, now);
                tx.append_event(record.clone()).await.map_err(|err| match err {
                    BackendError::UniqueViolation(_) => PersistenceError::ConcurrencyConflict {
                        aggregate_id,
                        version: target,
                    },
                    other => PersistenceError::Backend(other),
                })?;
                records.push(record);
            }
            written_at = Some(target);
        }

        // 2) Saga
        if let Some(SagaMutation { record, is_new }) = saga {
            let saga_id = record.saga_id;
            let saga_type = record.saga_type.clone();
            let loaded_at = record.version;

            let result = if record.completed {
                if is_new {
                    Ok(())
                } else {
                    tx.complete_saga(
                        SagaRecord {
                            version: loaded_at + 1,
                            ..record
                        },
                        loaded_at,
                    )
                    .await
                }
            } else if is_new {
                tx.insert_saga(SagaRecord { version: 0, ..record }).await
            } else {
                tx.update_saga(
                    SagaRecord {
                        version: loaded_at + 1,
                        ..record
                    },
                    loaded_at,
                )
                .await
            };

            result.map_err(|err| match err {
                BackendError::UniqueViolation(_) | BackendError::StaleVersion { .. } => {
                    PersistenceError::SagaConflict { saga_id, saga_type }
                }
                other => PersistenceError::Backend(other),
            })?;
        }

        // 3) Outbox
        let enqueued = messages.len();
        for envelope in messages {
            let due_at = envelope.options().due_at.unwrap_or(now);
            let offset = self.offsets.fetch_add(1, Ordering::SeqCst);
            tx.enqueue(OutboxRecord {
                due_at,
                offset,
                envelope,
            })
            .await?;
        }

        Ok(CommitReceipt {
            aggregate_id,
            version: written_at,
            events: records,
            enqueued,
        })
    }
}

#[async_trait]
impl CommitPersistence for Persistence {
    #[instrument(
        skip(self, commit, cancel),
        fields(
            aggregate_id = %commit.aggregate_id,
            expected_version = ?commit.expected_version,
            events = commit.events.len(),
            messages = commit.messages.len(),
            saga = commit.saga.is_some()
        ),
        err
    )]
    async fn persist(&self, commit: Commit, cancel: &Cancellation) -> Result<CommitReceipt, PersistenceError> {
        if commit.is_empty() {
            return Ok(CommitReceipt::empty(commit.aggregate_id));
        }

        let mut tx = cancel
            .run(self.backend.begin())
            .await
            .ok_or(PersistenceError::Cancelled)??;

        let outcome = match self.write(tx.as_mut(), commit).await {
            Ok(_) if cancel.is_cancelled() => Err(PersistenceError::Cancelled),
            other => other,
        };

        match outcome {
            Ok(receipt) => {
                tx.commit().await?;
                debug!(version = ?receipt.version, enqueued = receipt.enqueued, "commit persisted");
                Ok(receipt)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}
