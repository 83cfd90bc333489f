//! `eventide-events`: message contracts and dispatch mechanics.
//!
//! Pure building blocks (no IO, no async): message traits, the envelope,
//! the versioned type registry, handler registrars and saga definitions.

pub mod envelope;
pub mod message;
pub mod registrar;
pub mod saga;
pub mod types;

pub use envelope::{DeliveryOptions, Envelope, EnvelopeError};
pub use message::{Command, Event, Message, MessageKind};
pub use registrar::{
    CommandRegistrar, EventRegistrar, HandlerFactory, HandlerRegistry, HandlerResolver, Registration,
    RegistrarError,
};
pub use saga::{Saga, SagaConfiguration, SagaContext, SagaEffects, SagaError, SagaRoute};
pub use types::{MessageTypeInfo, TypeRegistry, Upcaster};
