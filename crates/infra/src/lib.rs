//! Infrastructure layer: persistence backends, commit protocol, event store,
//! saga storage and the in-process message bus.

pub mod bus;
pub mod cancel;
pub mod config;
pub mod event_store;
pub mod persistence;
pub mod saga;


pub use bus::{
    BusError, CommandSender, DispatchError, ErrorSink, EventPublisher, HandlerContext, HandlerError, Handles,
    MessageBus, MessageBusBuilder, MessageHandler, Observer, Subscription, TracingErrorSink,
};
pub use cancel::{Cancellation, CancellationSource};
pub use config::{ConfigError, RuntimeConfig};
pub use event_store::{AggregateRepository, EventStore, EventStoreError, EventStream, Loaded, StreamItem};
pub use persistence::{
    Commit, CommitPersistence, CommitReceipt, InMemoryBackend, Persistence, PersistenceBackend, PersistenceError,
    PostgresBackend,
};
pub use saga::{SagaHandler, SagaInstance, SagaStore, SagaStoreError};
