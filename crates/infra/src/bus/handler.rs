//! Handler contract used by the dispatcher.
//!
//! Handlers are registered as factories in the command and event registrars.
//! A fresh instance handles each delivery and receives a [`HandlerContext`]
//! giving it the runtime's stores and a way to send further messages. Every
//! commit made through the context counts its outbound messages as pending,
//! so `MessageBus::flush` waits for whole cascades.
//!
//! ## Typed handlers
//!
//! Most handlers only care about one payload type. Implement [`Handles`] and
//! register through the builder; the [`Typed`] adapter decodes the envelope
//! (upcasting older revisions) before calling it.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use eventide_core::{Aggregate, AggregateId, Clock, DomainError, ExpectedVersion, MessageId};
use eventide_events::{Command, Envelope, EnvelopeError, Event, Message, RegistrarError, SagaError, TypeRegistry};

use crate::cancel::Cancellation;
use crate::config::RuntimeConfig;
use crate::event_store::{AggregateRepository, EventStore, EventStoreError};
use crate::persistence::{Commit, CommitReceipt, PersistenceError};
use crate::saga::{SagaStore, SagaStoreError};

use super::Runtime;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Registrar(#[from] RegistrarError),

    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    #[error(transparent)]
    SagaStore(#[from] SagaStoreError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("no {saga_type} instance correlates with '{message_type}' ({property} = {value})")]
    UnknownSaga {
        saga_type: &'static str,
        message_type: String,
        property: String,
        value: String,
    },

    #[error("{saga_type} declares no route for '{message_type}'")]
    NoRoute {
        saga_type: &'static str,
        message_type: String,
    },

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Envelope-level handler. This is what the registrars store.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<(), HandlerError>;
}

/// Per-delivery context.
#[derive(Clone)]
pub struct HandlerContext {
    runtime: Arc<Runtime>,
    cause: Arc<Envelope>,
    cancel: Cancellation,
}

impl core::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("message_id", &self.cause.message_id())
            .field("message_type", &self.cause.message_type())
            .finish_non_exhaustive()
    }
}

impl HandlerContext {
    pub(crate) fn new(runtime: Arc<Runtime>, cause: Envelope, cancel: Cancellation) -> Self {
        Self {
            runtime,
            cause: Arc::new(cause),
            cancel,
        }
    }

    /// The message being handled.
    pub fn cause(&self) -> &Envelope {
        &self.cause
    }

    pub fn event_store(&self) -> &EventStore {
        &self.runtime.event_store
    }

    pub fn sagas(&self) -> &SagaStore {
        &self.runtime.sagas
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.runtime.types
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.runtime.clock
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.runtime.config
    }

    pub fn cancel(&self) -> &Cancellation {
        &self.cancel
    }

    /// Repository for `A` using the runtime's snapshot interval.
    pub fn repository<A>(&self) -> AggregateRepository<A>
    where
        A: Aggregate,
        A::Event: Event,
    {
        AggregateRepository::new(self.runtime.event_store.clone(), Arc::clone(&self.runtime.types))
            .with_snapshot_interval(self.runtime.config.snapshot_interval)
    }

    /// Persist an arbitrary commit through the bus.
    pub async fn commit(&self, commit: Commit) -> Result<CommitReceipt, HandlerError> {
        Ok(self.runtime.persistence.persist(commit, &self.cancel).await?)
    }

    /// Send a follow-up command in the same conversation.
    pub async fn send<C: Command>(&self, command: &C) -> Result<MessageId, HandlerError> {
        let envelope = Envelope::command(command, self.cause.correlation_id(), self.runtime.clock.now())?
            .caused_by(&self.cause);
        self.enqueue(envelope).await
    }

    /// Send a command that is delivered once the clock reaches `due_at`.
    pub async fn send_at<C: Command>(&self, due_at: DateTime<Utc>, command: &C) -> Result<MessageId, HandlerError> {
        let envelope = Envelope::command(command, self.cause.correlation_id(), self.runtime.clock.now())?
            .caused_by(&self.cause)
            .deliver_at(due_at);
        self.enqueue(envelope).await
    }

    /// Publish a follow-up event without recording it in a stream.
    pub async fn publish<E: Event>(&self, aggregate_id: AggregateId, event: &E) -> Result<MessageId, HandlerError> {
        let envelope = Envelope::event(aggregate_id, event, self.cause.correlation_id(), self.runtime.clock.now())?
            .caused_by(&self.cause);
        self.enqueue(envelope).await
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<MessageId, HandlerError> {
        self.runtime.types.ensure_registered(&envelope)?;
        let id = envelope.message_id();
        let commit = Commit::new(envelope.aggregate_id(), ExpectedVersion::Any).with_messages(vec![envelope]);
        self.commit(commit).await?;
        Ok(id)
    }
}

/// Typed handler for payload `M`.
#[async_trait]
pub trait Handles<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: M, ctx: &HandlerContext) -> Result<(), HandlerError>;
}

/// Adapts a [`Handles`] implementation to [`MessageHandler`].
pub struct Typed<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

impl<M, H> Typed<M, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M, H> MessageHandler for Typed<M, H>
where
    M: Message,
    H: Handles<M>,
{
    async fn handle(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let message: M = ctx.types().decode(envelope)?;
        self.handler.handle(message, ctx).await
    }
}
