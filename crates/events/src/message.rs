//! Message abstractions: the payloads carried by envelopes.

use serde::Serialize;
use serde::de::DeserializeOwned;

use eventide_core::{AggregateId, ExpectedVersion};

/// Whether an envelope carries a command (unicast) or an event (broadcast).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Command,
    Event,
}

/// A serializable payload with a stable, versioned type name.
///
/// The `(message_type, revision)` pair is persisted alongside every payload so
/// messages survive process restarts and schema evolution.
pub trait Message: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable message name/type identifier (e.g. "token.mint_requested").
    fn message_type() -> &'static str;

    /// Schema revision of the payload (independent of aggregate versions).
    fn revision() -> u32 {
        1
    }
}

/// A command targets a specific aggregate.
///
/// Commands represent **intent**. They are routed to exactly one handler,
/// which may turn them into events.
pub trait Command: Message {
    fn target_aggregate_id(&self) -> AggregateId;

    /// Version the sender believes the target aggregate is at.
    fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::Any
    }
}

/// A fact that something happened.
///
/// Events are immutable once recorded and are delivered to every interested
/// handler. The aggregate, version and sequence an event belongs to are
/// stamped by the runtime, not carried in the payload.
pub trait Event: Message {}
