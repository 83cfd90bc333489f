//! Versioned message type registry.
//!
//! Built once at startup from the declared message types. Maps a stored
//! `(type name, revision)` to a concrete payload type and migrates payloads
//! written under older revisions through registered upcasters.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value as JsonValue;
use tracing::warn;

use crate::envelope::{Envelope, EnvelopeError};
use crate::message::{Command, Event, Message, MessageKind};

/// Migrates a payload from revision `n` to revision `n + 1`.
pub type Upcaster = Arc<dyn Fn(JsonValue) -> JsonValue + Send + Sync>;

/// A registered message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTypeInfo {
    pub name: &'static str,
    pub revision: u32,
    pub kind: MessageKind,
}

#[derive(Default)]
struct Inner {
    types: HashMap<&'static str, MessageTypeInfo>,
    upcasters: HashMap<(&'static str, u32), Upcaster>,
}

/// Registry of known message types. Internally synchronized.
#[derive(Default)]
pub struct TypeRegistry {
    inner: RwLock<Inner>,
}

impl core::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TypeRegistry")
            .field("types", &inner.types.len())
            .field("upcasters", &inner.upcasters.len())
            .finish()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command<C: Command>(&self) -> MessageTypeInfo {
        self.register::<C>(MessageKind::Command)
    }

    pub fn register_event<E: Event>(&self) -> MessageTypeInfo {
        self.register::<E>(MessageKind::Event)
    }

    fn register<M: Message>(&self, kind: MessageKind) -> MessageTypeInfo {
        let info = MessageTypeInfo {
            name: M::message_type(),
            revision: M::revision(),
            kind,
        };

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inner.types.get(info.name) {
            if existing != &info {
                warn!(
                    message_type = info.name,
                    previous = ?existing,
                    current = ?info,
                    "message type re-registered with a different shape"
                );
            }
        }
        inner.types.insert(info.name, info.clone());
        info
    }

    /// Register the migration of `M` payloads from `from_revision` to `from_revision + 1`.
    pub fn add_upcaster<M, F>(&self, from_revision: u32, upcaster: F)
    where
        M: Message,
        F: Fn(JsonValue) -> JsonValue + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .upcasters
            .insert((M::message_type(), from_revision), Arc::new(upcaster));
    }

    pub fn lookup(&self, message_type: &str) -> Option<MessageTypeInfo> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.types.get(message_type).cloned()
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.lookup(message_type).is_some()
    }

    /// Reject envelopes whose type is unknown or registered as the other kind.
    pub fn ensure_registered(&self, envelope: &Envelope) -> Result<(), EnvelopeError> {
        let info = self
            .lookup(envelope.message_type())
            .ok_or_else(|| EnvelopeError::UnknownType(envelope.message_type().to_string()))?;
        if info.kind != envelope.kind() {
            return Err(EnvelopeError::KindMismatch {
                message_type: envelope.message_type().to_string(),
                registered: info.kind,
                found: envelope.kind(),
            });
        }
        Ok(())
    }

    pub fn decode<M: Message>(&self, envelope: &Envelope) -> Result<M, EnvelopeError> {
        self.decode_payload(envelope.message_type(), envelope.revision(), envelope.payload().clone())
    }

    /// Decode a stored payload as `M`, upcasting it to `M::revision()` first.
    pub fn decode_payload<M: Message>(
        &self,
        message_type: &str,
        revision: u32,
        payload: JsonValue,
    ) -> Result<M, EnvelopeError> {
        if message_type != M::message_type() {
            return Err(EnvelopeError::TypeMismatch {
                expected: M::message_type().to_string(),
                found: message_type.to_string(),
            });
        }

        let supported = M::revision();
        if revision > supported {
            return Err(EnvelopeError::UnsupportedRevision {
                message_type: message_type.to_string(),
                found: revision,
                supported,
            });
        }

        let steps = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            (revision..supported)
                .map(|from| {
                    inner
                        .upcasters
                        .get(&(M::message_type(), from))
                        .cloned()
                        .ok_or_else(|| EnvelopeError::MissingUpcaster {
                            message_type: message_type.to_string(),
                            from,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let upcast = steps.iter().fold(payload, |value, step| step(value));
        serde_json::from_value(upcast).map_err(|source| EnvelopeError::Deserialize {
            message_type: message_type.to_string(),
            revision,
            source,
        })
    }
}
