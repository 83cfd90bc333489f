//! Aggregate rehydration and command execution.
//!
//! ```text
//! Command envelope
//!   ↓
//! 1. Decode the command (upcasting older revisions)
//!   ↓
//! 2. Rehydrate: snapshot (Aggregate::restore) + tail events (Aggregate::apply)
//!   ↓
//! 3. Decide: aggregate.handle(command) (pure, no IO)
//!   ↓
//! 4. Save events at the loaded version (optimistic concurrency check)
//!   ↓
//! 5. Snapshot when the new version crosses the configured interval
//! ```
//!
//! Commands sent with `ExpectedVersion::Any` are retried from step 2 when the
//! save loses a concurrency race.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use eventide_core::{execute, Aggregate, AggregateId, CorrelationId, DomainError, ExpectedVersion};
use eventide_events::{Command, Envelope, Event, TypeRegistry};

use crate::bus::handler::{HandlerContext, HandlerError, MessageHandler};
use crate::cancel::Cancellation;
use crate::persistence::{CommitReceipt, PersistenceError, SnapshotRecord};

use super::{EventStore, EventStoreError, StreamItem};

/// An aggregate together with the version it was loaded at.
#[derive(Debug, Clone)]
pub struct Loaded<A> {
    pub aggregate: A,
    /// `None` for an aggregate with no history.
    pub version: Option<u64>,
}

impl<A: Aggregate> Loaded<A> {
    pub fn fresh(id: AggregateId) -> Self {
        Self {
            aggregate: A::new(id),
            version: None,
        }
    }
}

/// Loads and saves one aggregate type through the event store.
pub struct AggregateRepository<A> {
    store: EventStore,
    types: Arc<TypeRegistry>,
    snapshot_interval: Option<u64>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Clone for AggregateRepository<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            types: Arc::clone(&self.types),
            snapshot_interval: self.snapshot_interval,
            _aggregate: PhantomData,
        }
    }
}

impl<A> AggregateRepository<A>
where
    A: Aggregate,
    A::Event: Event,
{
    pub fn new(store: EventStore, types: Arc<TypeRegistry>) -> Self {
        Self {
            store,
            types,
            snapshot_interval: None,
            _aggregate: PhantomData,
        }
    }

    pub fn with_snapshot_interval(mut self, every: Option<u64>) -> Self {
        self.snapshot_interval = every.filter(|n| *n > 0);
        self
    }

    /// Rehydrate an existing aggregate.
    #[instrument(skip(self, cancel), fields(aggregate_type = A::aggregate_type(), aggregate_id = %id), err)]
    pub async fn load(&self, id: AggregateId, cancel: &Cancellation) -> Result<Loaded<A>, EventStoreError> {
        let stream = self.store.load_stream(id, cancel).await?;
        let mut aggregate = A::new(id);

        for item in stream.iter() {
            match item {
                StreamItem::Snapshot(snapshot) => {
                    if snapshot.snapshot_type != A::aggregate_type() {
                        return Err(DomainError::invariant(format!(
                            "snapshot of '{}' cannot restore '{}'",
                            snapshot.snapshot_type,
                            A::aggregate_type()
                        ))
                        .into());
                    }
                    aggregate = A::restore(id, snapshot.state.clone())?;
                }
                StreamItem::Event(record) => {
                    let event: A::Event = record.decode(&self.types)?;
                    aggregate.apply(&event);
                }
            }
        }

        Ok(Loaded {
            aggregate,
            version: stream.version(),
        })
    }

    /// Rehydrate, or start from a fresh aggregate when there is no history.
    pub async fn load_or_new(&self, id: AggregateId, cancel: &Cancellation) -> Result<Loaded<A>, EventStoreError> {
        match self.load(id, cancel).await {
            Err(EventStoreError::AggregateNotFound(_)) => Ok(Loaded::fresh(id)),
            other => other,
        }
    }

    /// Save events decided against `loaded` (already applied to it).
    ///
    /// The write expects the version `loaded` was read at. On success the
    /// loaded version moves forward and a snapshot is taken if due.
    pub async fn save(
        &self,
        id: AggregateId,
        loaded: &mut Loaded<A>,
        events: &[A::Event],
        cause: Option<&Envelope>,
        cancel: &Cancellation,
    ) -> Result<Option<CommitReceipt>, EventStoreError> {
        let now = self.store.clock().now();
        let correlation_id = cause.map_or_else(CorrelationId::new, Envelope::correlation_id);

        let envelopes = events
            .iter()
            .map(|event| -> Result<Envelope, EventStoreError> {
                let envelope = Envelope::event(id, event, correlation_id, now)?;
                Ok(match cause {
                    Some(cause) => envelope.caused_by(cause),
                    None => envelope,
                })
            })
            .collect::<Result<Vec<_>, EventStoreError>>()?;

        let expected = ExpectedVersion::from(loaded.version);
        let receipt = self.store.save(id, envelopes, expected, cancel).await?;

        if let Some(version) = receipt.as_ref().and_then(|r| r.version) {
            loaded.version = Some(version);
            self.snapshot_if_due(id, loaded, version, cancel).await;
        }
        Ok(receipt)
    }

    async fn snapshot_if_due(&self, id: AggregateId, loaded: &Loaded<A>, version: u64, cancel: &Cancellation) {
        let Some(every) = self.snapshot_interval else {
            return;
        };
        if (version + 1) % every != 0 {
            return;
        }
        let Some(state) = loaded.aggregate.snapshot() else {
            return;
        };

        let snapshot = SnapshotRecord {
            aggregate_id: id,
            version,
            snapshot_type: A::aggregate_type().to_string(),
            revision: 1,
            taken_on: self.store.clock().now(),
            state,
        };
        match self.store.save_snapshot(snapshot, cancel).await {
            Ok(()) => debug!(aggregate_id = %id, version, "snapshot taken"),
            Err(err) => warn!(aggregate_id = %id, version, error = %err, "snapshot failed"),
        }
    }
}

/// Registrable command handler that runs `A`'s decision logic.
pub struct AggregateCommandHandler<A> {
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Default for AggregateCommandHandler<A> {
    fn default() -> Self {
        Self {
            _aggregate: PhantomData,
        }
    }
}

impl<A> AggregateCommandHandler<A> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<A> MessageHandler for AggregateCommandHandler<A>
where
    A: Aggregate,
    A::Command: Command,
    A::Event: Event,
{
    #[instrument(
        skip(self, envelope, ctx),
        fields(aggregate_type = A::aggregate_type(), aggregate_id = %envelope.aggregate_id()),
        err
    )]
    async fn handle(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let command: A::Command = ctx.types().decode(envelope)?;
        let id = command.target_aggregate_id();
        let expected = envelope.expected_version().unwrap_or(ExpectedVersion::Any);
        let repository = ctx.repository::<A>();
        let retries = ctx.config().conflict_retries;

        let mut attempt = 0;
        loop {
            let mut loaded = match expected {
                ExpectedVersion::Initial => Loaded::fresh(id),
                _ => repository.load_or_new(id, ctx.cancel()).await?,
            };
            if !expected.matches(loaded.version) {
                return Err(PersistenceError::ConcurrencyConflict {
                    aggregate_id: id,
                    version: expected.next_version(loaded.version),
                }
                .into());
            }

            let events = execute(&mut loaded.aggregate, &command)?;
            match repository.save(id, &mut loaded, &events, Some(envelope), ctx.cancel()).await {
                Ok(_) => return Ok(()),
                Err(err)
                    if expected == ExpectedVersion::Any && err.is_concurrency_conflict() && attempt < retries =>
                {
                    attempt += 1;
                    debug!(attempt, "concurrency conflict, reloading");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
