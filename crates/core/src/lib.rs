//! `eventide-core`: foundation building blocks shared by every layer.
//!
//! This crate contains **pure** primitives (no IO, no async): identifiers,
//! optimistic concurrency expectations, the aggregate contract and the clock
//! abstraction.

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;

pub use aggregate::{execute, Aggregate, ExpectedVersion};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, CorrelationId, MessageId};
