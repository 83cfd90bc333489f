//! In-process message bus.
//!
//! ```text
//! send / publish / handler commits
//!   ↓  (pending += outbound messages)
//! Commit protocol ── events + saga state + outbox, one transaction
//!   ↓  (relay woken)
//! Outbox relay ── leases due records in (due_at, offset) order
//!   ↓
//! Receive stream ── one bounded pump per subscriber
//!   ↓
//! Dispatcher ── registrars → handler tasks (pending -= 1, outbox ack)
//! ```
//!
//! `flush` waits for the pending counter to reach zero, which covers every
//! cascade triggered by handlers. The bus is assembled once through
//! [`MessageBus::builder`]; nothing is global.

pub mod dispatcher;
pub mod handler;
pub mod pending;
pub mod pump;
mod relay;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use eventide_core::{Aggregate, AggregateId, Clock, CorrelationId, ExpectedVersion, MessageId, SystemClock};
use eventide_events::{
    Command, CommandRegistrar, Envelope, EnvelopeError, Event, EventRegistrar, HandlerResolver, Message,
    MessageKind, RegistrarError, Registration, Saga, SagaConfiguration, TypeRegistry,
};

use crate::cancel::{Cancellation, CancellationSource};
use crate::config::RuntimeConfig;
use crate::event_store::{AggregateCommandHandler, AggregateRepository, EventStore};
use crate::persistence::{
    Commit, CommitPersistence, CommitReceipt, Persistence, PersistenceBackend, PersistenceError,
};
use crate::saga::{SagaHandler, SagaStore};

pub use dispatcher::{DispatchError, ErrorSink, TracingErrorSink};
pub use handler::{HandlerContext, HandlerError, Handles, MessageHandler, Typed};
pub use pending::{PendingGuard, PendingOperations};
pub use pump::{MessageStream, Observer, Subscription};

use dispatcher::Dispatcher;

#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Registrar(#[from] RegistrarError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("message bus is missing a {0}")]
    NotConfigured(&'static str),
}

/// Envelope-level command sending.
#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send_envelope(&self, envelope: Envelope, cancel: &Cancellation) -> Result<MessageId, BusError>;
}

/// Envelope-level event publishing.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_envelope(&self, envelope: Envelope, cancel: &Cancellation) -> Result<MessageId, BusError>;
}

/// Everything the running bus shares with handlers, the relay and the dispatcher.
pub(crate) struct Runtime {
    pub(crate) backend: Arc<dyn PersistenceBackend>,
    pub(crate) persistence: Arc<dyn CommitPersistence>,
    pub(crate) event_store: EventStore,
    pub(crate) sagas: SagaStore,
    pub(crate) types: Arc<TypeRegistry>,
    pub(crate) commands: CommandRegistrar<dyn MessageHandler>,
    pub(crate) events: EventRegistrar<dyn MessageHandler>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: RuntimeConfig,
    pub(crate) pending: PendingOperations,
    pub(crate) stream: Arc<MessageStream>,
    pub(crate) sink: Arc<dyn ErrorSink>,
    pub(crate) wake: Arc<Notify>,
}

/// Commit protocol that counts outbound messages as pending.
///
/// Messages already due at commit are reserved up front; messages deferred
/// into the future are counted by the relay when they are released.
struct TrackedPersistence {
    inner: Persistence,
    clock: Arc<dyn Clock>,
    pending: PendingOperations,
    wake: Arc<Notify>,
}

#[async_trait]
impl CommitPersistence for TrackedPersistence {
    async fn persist(&self, commit: Commit, cancel: &Cancellation) -> Result<CommitReceipt, PersistenceError> {
        let now = self.clock.now();
        let immediate: Vec<MessageId> = commit
            .messages
            .iter()
            .filter(|m| m.options().due_at.is_none_or(|due_at| due_at <= now))
            .map(Envelope::message_id)
            .collect();
        self.pending.reserve(&immediate);

        match self.inner.persist(commit, cancel).await {
            Ok(receipt) => {
                if receipt.enqueued > 0 {
                    self.wake.notify_one();
                }
                Ok(receipt)
            }
            Err(err) => {
                self.pending.unreserve(&immediate);
                Err(err)
            }
        }
    }
}

struct Tasks {
    dispatcher: Subscription,
    relay_shutdown: oneshot::Sender<()>,
    relay: JoinHandle<()>,
}

struct BusInner {
    runtime: Arc<Runtime>,
    handlers: CancellationSource,
    tasks: Mutex<Option<Tasks>>,
}

/// Handle to a running bus. Cheap to clone.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl core::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageBus")
            .field("pending", &self.pending_count())
            .field("config", &self.inner.runtime.config)
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    pub fn builder() -> MessageBusBuilder {
        MessageBusBuilder::default()
    }

    fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Send `command` to its single handler, starting a new conversation.
    pub async fn send<C: Command>(&self, command: &C, cancel: &Cancellation) -> Result<MessageId, BusError> {
        let envelope = Envelope::command(command, CorrelationId::new(), self.runtime().clock.now())?;
        self.send_envelope(envelope, cancel).await
    }

    /// Publish `event` on behalf of `aggregate_id` without recording it in a stream.
    pub async fn publish<E: Event>(
        &self,
        aggregate_id: AggregateId,
        event: &E,
        cancel: &Cancellation,
    ) -> Result<MessageId, BusError> {
        let envelope = Envelope::event(aggregate_id, event, CorrelationId::new(), self.runtime().clock.now())?;
        self.publish_envelope(envelope, cancel).await
    }

    /// Wait until every accepted message, and everything it caused, was handled.
    pub async fn flush(&self, cancel: &Cancellation) -> Result<(), BusError> {
        if self.runtime().pending.wait_for_zero(cancel).await {
            Ok(())
        } else {
            Err(BusError::Cancelled)
        }
    }

    /// Ask the relay to look for due messages now (e.g. after moving a virtual clock).
    pub fn release_due(&self) {
        self.runtime().wake.notify_one();
    }

    pub fn pending_count(&self) -> u64 {
        self.runtime().pending.count()
    }

    pub fn event_store(&self) -> &EventStore {
        &self.runtime().event_store
    }

    pub fn sagas(&self) -> &SagaStore {
        &self.runtime().sagas
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.runtime().types
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.runtime().clock
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.runtime().config
    }

    pub fn repository<A>(&self) -> AggregateRepository<A>
    where
        A: Aggregate,
        A::Event: Event,
    {
        AggregateRepository::new(self.runtime().event_store.clone(), Arc::clone(&self.runtime().types))
            .with_snapshot_interval(self.runtime().config.snapshot_interval)
    }

    /// Observe the receive stream alongside the dispatcher.
    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> Subscription {
        self.runtime().stream.subscribe(observer)
    }

    /// Stop the relay and the dispatcher.
    ///
    /// Messages still queued are handed back to the outbox and delivered by
    /// the next bus started on the same backend.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.inner.tasks.lock().await.take() else {
            return;
        };
        let _ = tasks.relay_shutdown.send(());
        let _ = tasks.relay.await;
        tasks.dispatcher.dispose().await;
        self.inner.handlers.cancel();
        info!("message bus stopped");
    }

    async fn enqueue(&self, envelope: Envelope, cancel: &Cancellation) -> Result<MessageId, BusError> {
        let id = envelope.message_id();
        let commit = Commit::new(envelope.aggregate_id(), ExpectedVersion::Any).with_messages(vec![envelope]);
        match self.runtime().persistence.persist(commit, cancel).await {
            Ok(_) => Ok(id),
            Err(PersistenceError::Cancelled) => Err(BusError::Cancelled),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl CommandSender for MessageBus {
    #[instrument(skip(self, envelope, cancel), fields(message_type = envelope.message_type()), err)]
    async fn send_envelope(&self, envelope: Envelope, cancel: &Cancellation) -> Result<MessageId, BusError> {
        if envelope.kind() != MessageKind::Command {
            return Err(EnvelopeError::KindMismatch {
                message_type: envelope.message_type().to_string(),
                registered: MessageKind::Command,
                found: envelope.kind(),
            }
            .into());
        }
        self.runtime().types.ensure_registered(&envelope)?;
        if self.runtime().config.validate_routes_on_send {
            self.runtime().commands.registration_for(envelope.message_type())?;
        }
        self.enqueue(envelope, cancel).await
    }
}

#[async_trait]
impl EventPublisher for MessageBus {
    #[instrument(skip(self, envelope, cancel), fields(message_type = envelope.message_type()), err)]
    async fn publish_envelope(&self, envelope: Envelope, cancel: &Cancellation) -> Result<MessageId, BusError> {
        if envelope.kind() != MessageKind::Event {
            return Err(EnvelopeError::KindMismatch {
                message_type: envelope.message_type().to_string(),
                registered: MessageKind::Event,
                found: envelope.kind(),
            }
            .into());
        }
        self.runtime().types.ensure_registered(&envelope)?;
        self.enqueue(envelope, cancel).await
    }
}

/// Assembles registrars, type registry, clock, config and backend.
pub struct MessageBusBuilder {
    backend: Option<Arc<dyn PersistenceBackend>>,
    config: RuntimeConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ErrorSink>,
    types: Arc<TypeRegistry>,
    commands: CommandRegistrar<dyn MessageHandler>,
    events: EventRegistrar<dyn MessageHandler>,
}

impl Default for MessageBusBuilder {
    fn default() -> Self {
        Self {
            backend: None,
            config: RuntimeConfig::default(),
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingErrorSink),
            types: Arc::new(TypeRegistry::new()),
            commands: CommandRegistrar::new(),
            events: EventRegistrar::new(),
        }
    }
}

impl MessageBusBuilder {
    pub fn with_backend<B: PersistenceBackend + 'static>(mut self, backend: Arc<B>) -> Self {
        let backend: Arc<dyn PersistenceBackend> = backend;
        self.backend = Some(backend);
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: Arc<C>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_error_sink<S: ErrorSink + 'static>(mut self, sink: Arc<S>) -> Self {
        self.sink = sink;
        self
    }

    /// The registry being built (for upcasters).
    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn register_command_type<C: Command>(self) -> Self {
        self.types.register_command::<C>();
        self
    }

    pub fn register_event_type<E: Event>(self) -> Self {
        self.types.register_event::<E>();
        self
    }

    /// Register a typed command handler; `factory` runs once per delivery.
    pub fn register_command_handler<C, H, F>(self, handler_name: impl Into<String>, factory: F) -> Self
    where
        C: Command,
        H: Handles<C>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.types.register_command::<C>();
        self.commands.register(C::message_type(), typed_registration::<C, H, F>(handler_name, factory));
        self
    }

    /// Register a typed event handler; `factory` runs once per delivery.
    pub fn register_event_handler<E, H, F>(self, handler_name: impl Into<String>, factory: F) -> Self
    where
        E: Event,
        H: Handles<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.types.register_event::<E>();
        self.events.register(E::message_type(), typed_registration::<E, H, F>(handler_name, factory));
        self
    }

    /// Register an envelope-level handler under `message_type`.
    pub fn register_registration(
        self,
        kind: MessageKind,
        message_type: impl Into<String>,
        registration: Registration<dyn MessageHandler>,
    ) -> Self {
        match kind {
            MessageKind::Command => self.commands.register(message_type, registration),
            MessageKind::Event => self.events.register(message_type, registration),
        }
        self
    }

    pub fn with_command_resolver(self, resolver: Arc<dyn HandlerResolver<dyn MessageHandler>>) -> Self {
        self.commands.add_resolver(resolver);
        self
    }

    pub fn with_event_resolver(self, resolver: Arc<dyn HandlerResolver<dyn MessageHandler>>) -> Self {
        self.events.add_resolver(resolver);
        self
    }

    /// Route `A::Command` to an [`AggregateCommandHandler`].
    pub fn register_aggregate<A>(self) -> Self
    where
        A: Aggregate,
        A::Command: Command,
        A::Event: Event,
    {
        self.types.register_command::<A::Command>();
        self.types.register_event::<A::Event>();
        let registration = Registration::new(A::aggregate_type(), || -> Box<dyn MessageHandler> {
            Box::new(AggregateCommandHandler::<A>::new())
        });
        self.commands.register(<A::Command as Message>::message_type(), registration);
        self
    }

    /// Route every message `S` declares to a [`SagaHandler`].
    pub fn register_saga<S: Saga>(self) -> Self {
        let config = Arc::new(SagaConfiguration::<S>::build());

        for route in config.routes() {
            route.declare_type(&self.types);

            let shared = Arc::clone(&config);
            let registration = Registration::new(S::saga_type(), move || -> Box<dyn MessageHandler> {
                Box::new(SagaHandler::new(Arc::clone(&shared)))
            });
            match route.kind() {
                MessageKind::Command => self.commands.register(route.message_type(), registration),
                MessageKind::Event => self.events.register(route.message_type(), registration),
            }
        }
        debug!(saga_type = S::saga_type(), routes = config.routes().count(), "saga registered");
        self
    }

    /// Start the relay and the dispatcher. Must run inside a Tokio runtime.
    pub fn start(self) -> Result<MessageBus, BusError> {
        let backend = self.backend.ok_or(BusError::NotConfigured("persistence backend"))?;
        let pending = PendingOperations::new();
        let wake = Arc::new(Notify::new());

        let persistence: Arc<dyn CommitPersistence> = Arc::new(TrackedPersistence {
            inner: Persistence::new(Arc::clone(&backend), Arc::clone(&self.clock)),
            clock: Arc::clone(&self.clock),
            pending: pending.clone(),
            wake: Arc::clone(&wake),
        });
        let event_store = EventStore::new(Arc::clone(&backend), Arc::clone(&persistence), Arc::clone(&self.clock));
        let sagas = SagaStore::new(Arc::clone(&backend), Arc::clone(&persistence));

        let runtime = Arc::new(Runtime {
            backend,
            persistence,
            event_store,
            sagas,
            types: self.types,
            commands: self.commands,
            events: self.events,
            clock: self.clock,
            stream: Arc::new(MessageStream::new(self.config.pump_capacity)),
            config: self.config,
            pending,
            sink: self.sink,
            wake,
        });

        let handlers = CancellationSource::new();
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&runtime), handlers.token()));
        let dispatcher = runtime.stream.subscribe_until(dispatcher, handlers.token());
        let (relay_shutdown, relay_rx) = oneshot::channel();
        let relay = tokio::spawn(relay::run(Arc::clone(&runtime), relay_rx));

        info!(
            command_types = runtime.commands.registry().message_types().len(),
            event_types = runtime.events.registry().message_types().len(),
            "message bus started"
        );

        Ok(MessageBus {
            inner: Arc::new(BusInner {
                runtime,
                handlers,
                tasks: Mutex::new(Some(Tasks {
                    dispatcher,
                    relay_shutdown,
                    relay,
                })),
            }),
        })
    }
}

fn typed_registration<M, H, F>(handler_name: impl Into<String>, factory: F) -> Registration<dyn MessageHandler>
where
    M: Message,
    H: Handles<M>,
    F: Fn() -> H + Send + Sync + 'static,
{
    Registration::new(handler_name, move || -> Box<dyn MessageHandler> {
        Box::new(Typed::<M, H>::new(factory()))
    })
}
