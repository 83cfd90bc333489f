use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use eventide_core::{AggregateId, CorrelationId, ExpectedVersion, MessageId};

use crate::message::{Command, Event, Message, MessageKind};

/// Errors raised while wrapping or unwrapping message payloads.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to serialize '{message_type}': {source}")]
    Serialize {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to deserialize '{message_type}' (revision {revision}): {source}")]
    Deserialize {
        message_type: String,
        revision: u32,
        #[source]
        source: serde_json::Error,
    },

    #[error("expected message type '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },

    #[error("message type '{0}' is not registered")]
    UnknownType(String),

    #[error("message type '{message_type}' is registered as {registered:?}, not {found:?}")]
    KindMismatch {
        message_type: String,
        registered: MessageKind,
        found: MessageKind,
    },

    #[error("'{message_type}' revision {found} is newer than the supported revision {supported}")]
    UnsupportedRevision {
        message_type: String,
        found: u32,
        supported: u32,
    },

    #[error("no upcaster registered for '{message_type}' revision {from}")]
    MissingUpcaster { message_type: String, from: u32 },
}

/// Delivery options for a single message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    /// Defer delivery until this instant (saga timers, scheduled commands).
    pub due_at: Option<DateTime<Utc>>,
    /// Free-form routing hint for transports that partition traffic.
    pub route: Option<String>,
}

/// Envelope for a command or an event.
///
/// This is the unit that is enqueued to the outbox and delivered to receivers.
///
/// Notes:
/// - `correlation_id` is propagated from the causing message; `causation_id`
///   points at that message directly.
/// - `revision` is the payload schema version, not an aggregate version.
/// - `expected_version` is only set for commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    message_id: MessageId,
    correlation_id: CorrelationId,
    causation_id: Option<MessageId>,

    kind: MessageKind,
    message_type: String,
    revision: u32,

    aggregate_id: AggregateId,
    expected_version: Option<ExpectedVersion>,

    created_on: DateTime<Utc>,
    options: DeliveryOptions,

    payload: JsonValue,
}

impl Envelope {
    /// Wrap a command addressed to its target aggregate.
    pub fn command<C: Command>(
        command: &C,
        correlation_id: CorrelationId,
        created_on: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self {
            message_id: MessageId::new(),
            correlation_id,
            causation_id: None,
            kind: MessageKind::Command,
            message_type: C::message_type().to_string(),
            revision: C::revision(),
            aggregate_id: command.target_aggregate_id(),
            expected_version: Some(command.expected_version()),
            created_on,
            options: DeliveryOptions::default(),
            payload: to_payload(command)?,
        })
    }

    /// Wrap an event raised by (or on behalf of) `aggregate_id`.
    pub fn event<E: Event>(
        aggregate_id: AggregateId,
        event: &E,
        correlation_id: CorrelationId,
        created_on: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        Ok(Self {
            message_id: MessageId::new(),
            correlation_id,
            causation_id: None,
            kind: MessageKind::Event,
            message_type: E::message_type().to_string(),
            revision: E::revision(),
            aggregate_id,
            expected_version: None,
            created_on,
            options: DeliveryOptions::default(),
            payload: to_payload(event)?,
        })
    }

    /// Continue the conversation of `cause`: same correlation, causation set to it.
    pub fn caused_by(mut self, cause: &Envelope) -> Self {
        self.correlation_id = cause.correlation_id;
        self.causation_id = Some(cause.message_id);
        self
    }

    pub fn with_options(mut self, options: DeliveryOptions) -> Self {
        self.options = options;
        self
    }

    /// Defer delivery until `due_at`.
    pub fn deliver_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.options.due_at = Some(due_at);
        self
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<MessageId> {
        self.causation_id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_command(&self) -> bool {
        self.kind == MessageKind::Command
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn expected_version(&self) -> Option<ExpectedVersion> {
        self.expected_version
    }

    pub fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    pub fn options(&self) -> &DeliveryOptions {
        &self.options
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Decode the payload as `M` without any schema migration.
    ///
    /// Use `TypeRegistry::decode` when older revisions must be upcast.
    pub fn decode<M: Message>(&self) -> Result<M, EnvelopeError> {
        if self.message_type != M::message_type() {
            return Err(EnvelopeError::TypeMismatch {
                expected: M::message_type().to_string(),
                found: self.message_type.clone(),
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|source| EnvelopeError::Deserialize {
            message_type: self.message_type.clone(),
            revision: self.revision,
            source,
        })
    }
}

fn to_payload<M: Message>(message: &M) -> Result<JsonValue, EnvelopeError> {
    serde_json::to_value(message).map_err(|source| EnvelopeError::Serialize {
        message_type: M::message_type().to_string(),
        source,
    })
}
