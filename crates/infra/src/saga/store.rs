//! Saga instance storage.
//!
//! Instances are keyed by saga id and found by their correlation value.
//! Writes go through the commit protocol so a saga's state change, the events
//! it records and the messages it sends are atomic.

use std::sync::Arc;

use thiserror::Error;

use eventide_core::{AggregateId, ExpectedVersion};
use eventide_events::{Saga, SagaEffects};

use crate::cancel::Cancellation;
use crate::persistence::{
    BackendError, Commit, CommitPersistence, CommitReceipt, Correlation, PersistenceBackend, PersistenceError,
    SagaMutation, SagaRecord,
};

#[derive(Debug, Error)]
pub enum SagaStoreError {
    #[error("saga store operation cancelled")]
    Cancelled,

    #[error("saga {saga_id} is a '{found}', not a '{expected}'")]
    TypeMismatch {
        saga_id: AggregateId,
        expected: &'static str,
        found: String,
    },

    #[error("failed to (de)serialize {saga_type} state: {source}")]
    State {
        saga_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Typed view of a saga instance.
pub struct SagaInstance<S: Saga> {
    pub saga_id: AggregateId,
    /// Version the instance was loaded at (`0` for a new one).
    pub version: u64,
    pub completed: bool,
    pub is_new: bool,
    pub correlation: Correlation,
    pub data: S::Data,
}

impl<S: Saga> core::fmt::Debug for SagaInstance<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SagaInstance")
            .field("saga_type", &S::saga_type())
            .field("saga_id", &self.saga_id)
            .field("version", &self.version)
            .field("completed", &self.completed)
            .field("is_new", &self.is_new)
            .field("correlation", &self.correlation)
            .field("data", &self.data)
            .finish()
    }
}

impl<S: Saga> SagaInstance<S> {
    /// A brand-new instance with default data.
    pub fn start(saga_id: AggregateId, correlation: Correlation) -> Self {
        Self {
            saga_id,
            version: 0,
            completed: false,
            is_new: true,
            correlation,
            data: S::Data::default(),
        }
    }

    pub fn from_record(record: SagaRecord) -> Result<Self, SagaStoreError> {
        if record.saga_type != S::saga_type() {
            return Err(SagaStoreError::TypeMismatch {
                saga_id: record.saga_id,
                expected: S::saga_type(),
                found: record.saga_type,
            });
        }
        let data = serde_json::from_value(record.state).map_err(|source| SagaStoreError::State {
            saga_type: S::saga_type(),
            source,
        })?;
        Ok(Self {
            saga_id: record.saga_id,
            version: record.version,
            completed: record.completed,
            is_new: false,
            correlation: record.correlation,
            data,
        })
    }

    pub fn to_record(&self) -> Result<SagaRecord, SagaStoreError> {
        let state = serde_json::to_value(&self.data).map_err(|source| SagaStoreError::State {
            saga_type: S::saga_type(),
            source,
        })?;
        Ok(SagaRecord {
            saga_id: self.saga_id,
            saga_type: S::saga_type().to_string(),
            version: self.version,
            completed: self.completed,
            correlation: self.correlation.clone(),
            state,
        })
    }
}

/// Saga storage over a backend and a commit protocol. Cheap to clone.
#[derive(Clone)]
pub struct SagaStore {
    backend: Arc<dyn PersistenceBackend>,
    persistence: Arc<dyn CommitPersistence>,
}

impl core::fmt::Debug for SagaStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SagaStore").finish_non_exhaustive()
    }
}

impl SagaStore {
    pub fn new(backend: Arc<dyn PersistenceBackend>, persistence: Arc<dyn CommitPersistence>) -> Self {
        Self { backend, persistence }
    }

    /// Instance by id, including completed ones.
    pub async fn retrieve<S: Saga>(
        &self,
        saga_id: AggregateId,
        cancel: &Cancellation,
    ) -> Result<Option<SagaInstance<S>>, SagaStoreError> {
        let record = cancel
            .run(self.backend.load_saga(saga_id))
            .await
            .ok_or(SagaStoreError::Cancelled)??;
        record.map(SagaInstance::from_record).transpose()
    }

    /// The live (non-completed) instance with this correlation.
    pub async fn find<S: Saga>(
        &self,
        correlation: &Correlation,
        cancel: &Cancellation,
    ) -> Result<Option<SagaInstance<S>>, SagaStoreError> {
        let record = cancel
            .run(self.backend.find_saga(S::saga_type(), correlation))
            .await
            .ok_or(SagaStoreError::Cancelled)??;
        record.map(SagaInstance::from_record).transpose()
    }

    /// Persist the instance (insert when new, versioned update otherwise)
    /// together with the events it recorded and the messages it produced.
    ///
    /// Recorded events are appended to the stream keyed by the saga id.
    pub async fn store<S: Saga>(
        &self,
        instance: &SagaInstance<S>,
        effects: SagaEffects,
        cancel: &Cancellation,
    ) -> Result<CommitReceipt, SagaStoreError> {
        let mutation = SagaMutation {
            record: instance.to_record()?,
            is_new: instance.is_new,
        };
        let commit = Commit::new(instance.saga_id, ExpectedVersion::Any)
            .with_events(effects.events)
            .with_saga(mutation)
            .with_messages(effects.messages);
        Ok(self.persistence.persist(commit, cancel).await?)
    }

    /// Mark the instance completed. It stays retrievable by id but no longer
    /// correlates.
    pub async fn complete<S: Saga>(
        &self,
        instance: &mut SagaInstance<S>,
        effects: SagaEffects,
        cancel: &Cancellation,
    ) -> Result<CommitReceipt, SagaStoreError> {
        instance.completed = true;
        self.store(instance, effects, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    use eventide_core::{Clock, CorrelationId, SystemClock};
    use eventide_events::{Envelope, Event, Message, SagaConfiguration, SagaContext};

    use crate::persistence::{InMemoryBackend, Persistence};

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct EscrowData {
        held: u64,
    }

    struct Escrow;

    impl Saga for Escrow {
        type Data = EscrowData;

        fn saga_type() -> &'static str {
            "saga.escrow"
        }

        fn configure(config: &mut SagaConfiguration<Self>) {
            config.correlate_by("deal_id");
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct FundsHeld {
        amount: u64,
    }

    impl Message for FundsHeld {
        fn message_type() -> &'static str {
            "escrow.funds_held"
        }
    }

    impl Event for FundsHeld {}

    fn store_over(backend: Arc<InMemoryBackend>) -> SagaStore {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let persistence = Arc::new(Persistence::new(backend.clone(), clock));
        SagaStore::new(backend, persistence)
    }

    fn store() -> SagaStore {
        store_over(Arc::new(InMemoryBackend::new()))
    }

    #[tokio::test]
    async fn stored_instances_are_found_by_correlation() {
        let sagas = store();
        let correlation = Correlation::new("deal_id", "D-7");
        let mut instance = SagaInstance::<Escrow>::start(AggregateId::new(), correlation.clone());
        instance.data.held = 30;
        sagas.store(&instance, SagaEffects::default(), &Cancellation::none()).await.unwrap();

        let found = sagas
            .find::<Escrow>(&correlation, &Cancellation::none())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.saga_id, instance.saga_id);
        assert_eq!(found.data, EscrowData { held: 30 });
        assert!(!found.is_new);
        assert_eq!(found.version, 0);
    }

    #[tokio::test]
    async fn completed_instances_no_longer_correlate() {
        let sagas = store();
        let correlation = Correlation::new("deal_id", "D-8");
        let instance = SagaInstance::<Escrow>::start(AggregateId::new(), correlation.clone());
        sagas.store(&instance, SagaEffects::default(), &Cancellation::none()).await.unwrap();

        let mut live = sagas
            .retrieve::<Escrow>(instance.saga_id, &Cancellation::none())
            .await
            .unwrap()
            .unwrap();
        sagas.complete(&mut live, SagaEffects::default(), &Cancellation::none()).await.unwrap();

        assert!(sagas.find::<Escrow>(&correlation, &Cancellation::none()).await.unwrap().is_none());
        let retained = sagas
            .retrieve::<Escrow>(instance.saga_id, &Cancellation::none())
            .await
            .unwrap()
            .unwrap();
        assert!(retained.completed);
    }

    #[tokio::test]
    async fn concurrent_updates_from_the_same_version_conflict() {
        let sagas = store();
        let instance = SagaInstance::<Escrow>::start(AggregateId::new(), Correlation::new("deal_id", "D-9"));
        sagas.store(&instance, SagaEffects::default(), &Cancellation::none()).await.unwrap();

        let first = sagas.retrieve::<Escrow>(instance.saga_id, &Cancellation::none()).await.unwrap().unwrap();
        let second = sagas.retrieve::<Escrow>(instance.saga_id, &Cancellation::none()).await.unwrap().unwrap();
        sagas.store(&first, SagaEffects::default(), &Cancellation::none()).await.unwrap();

        let err = sagas.store(&second, SagaEffects::default(), &Cancellation::none()).await.unwrap_err();
        assert!(matches!(
            err,
            SagaStoreError::Persistence(PersistenceError::SagaConflict { .. })
        ));
    }

    #[tokio::test]
    async fn recorded_events_land_in_the_saga_stream_and_the_outbox() {
        let backend = Arc::new(InMemoryBackend::new());
        let sagas = store_over(backend.clone());
        let instance = SagaInstance::<Escrow>::start(AggregateId::new(), Correlation::new("deal_id", "D-10"));
        let cause = Envelope::event(
            AggregateId::new(),
            &FundsHeld { amount: 0 },
            CorrelationId::new(),
            SystemClock.now(),
        )
        .unwrap();

        let mut ctx = SagaContext::new(instance.saga_id, &cause, SystemClock.now());
        ctx.publish(&FundsHeld { amount: 12 }).unwrap();
        ctx.publish(&FundsHeld { amount: 3 }).unwrap();
        let receipt = sagas
            .store(&instance, ctx.into_effects(), &Cancellation::none())
            .await
            .unwrap();

        assert_eq!(receipt.enqueued, 2);
        let events = backend.load_events(instance.saga_id, None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.version == 0 && e.message_type == "escrow.funds_held"));
        assert_eq!(events[1].payload["amount"], 3);
        assert_eq!(backend.outbox_len().await, 2);
    }
}
