//! Saga infrastructure: instance storage and message dispatch.

pub mod dispatcher;
pub mod store;

pub use dispatcher::SagaHandler;
pub use store::{SagaInstance, SagaStore, SagaStoreError};
