//! Command/event handler registrars (mechanics only).
//!
//! A registrar maps a message type to handler factories. Handlers come from
//! two sources whose results are unioned at dispatch time:
//!
//! - a static registry (`register`)
//! - optional pluggable resolvers (`add_resolver`) for dynamically discovered handlers
//!
//! Commands are unicast: exactly one handler must resolve. Events are
//! broadcast: zero or more handlers are all valid. The registrars are generic
//! over the handler trait object so this crate stays free of IO and async.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use crate::envelope::Envelope;

/// Creates a fresh handler instance for one dispatch.
pub type HandlerFactory<H> = Arc<dyn Fn() -> Box<H> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrarError {
    #[error("no command handler registered for '{message_type}'")]
    MissingCommandHandler { message_type: String },

    #[error("multiple command handlers registered for '{message_type}': {}", handlers.join(", "))]
    MultipleCommandHandlers {
        message_type: String,
        handlers: Vec<String>,
    },
}

/// A named handler factory.
pub struct Registration<H: ?Sized> {
    handler_name: String,
    factory: HandlerFactory<H>,
}

impl<H: ?Sized> Registration<H> {
    pub fn new<F>(handler_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<H> + Send + Sync + 'static,
    {
        Self {
            handler_name: handler_name.into(),
            factory: Arc::new(factory),
        }
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    pub fn create(&self) -> Box<H> {
        (self.factory)()
    }
}

impl<H: ?Sized> Clone for Registration<H> {
    fn clone(&self) -> Self {
        Self {
            handler_name: self.handler_name.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<H: ?Sized> core::fmt::Debug for Registration<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("handler_name", &self.handler_name)
            .finish_non_exhaustive()
    }
}

/// Dynamically discovered handlers for a message type.
pub trait HandlerResolver<H: ?Sized>: Send + Sync {
    fn resolve(&self, message_type: &str) -> Vec<Registration<H>>;
}

/// Static buckets plus resolvers. Safe for concurrent registration and resolution.
pub struct HandlerRegistry<H: ?Sized> {
    buckets: RwLock<HashMap<String, Vec<Registration<H>>>>,
    resolvers: RwLock<Vec<Arc<dyn HandlerResolver<H>>>>,
}

impl<H: ?Sized> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            resolvers: RwLock::new(Vec::new()),
        }
    }
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_type: impl Into<String>, registration: Registration<H>) {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        buckets.entry(message_type.into()).or_default().push(registration);
    }

    pub fn add_resolver(&self, resolver: Arc<dyn HandlerResolver<H>>) {
        self.resolvers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resolver);
    }

    /// Union of static registrations and every resolver's answer.
    pub fn registrations_for(&self, message_type: &str) -> Vec<Registration<H>> {
        let mut found = {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            buckets.get(message_type).cloned().unwrap_or_default()
        };

        let resolvers = self
            .resolvers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for resolver in resolvers {
            found.extend(resolver.resolve(message_type));
        }
        found
    }

    /// Message types with at least one static registration, sorted.
    pub fn message_types(&self) -> Vec<String> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<String> = buckets.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Unicast registrar: every command resolves to exactly one handler.
pub struct CommandRegistrar<H: ?Sized> {
    registry: HandlerRegistry<H>,
}

impl<H: ?Sized> Default for CommandRegistrar<H> {
    fn default() -> Self {
        Self {
            registry: HandlerRegistry::new(),
        }
    }
}

impl<H: ?Sized> CommandRegistrar<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_type: impl Into<String>, registration: Registration<H>) {
        self.registry.register(message_type, registration);
    }

    pub fn add_resolver(&self, resolver: Arc<dyn HandlerResolver<H>>) {
        self.registry.add_resolver(resolver);
    }

    pub fn registry(&self) -> &HandlerRegistry<H> {
        &self.registry
    }

    /// The single registration for `message_type`, without creating a handler.
    pub fn registration_for(&self, message_type: &str) -> Result<Registration<H>, RegistrarError> {
        let mut found = self.registry.registrations_for(message_type);
        match found.len() {
            0 => Err(RegistrarError::MissingCommandHandler {
                message_type: message_type.to_string(),
            }),
            1 => Ok(found.remove(0)),
            _ => Err(RegistrarError::MultipleCommandHandlers {
                message_type: message_type.to_string(),
                handlers: found.iter().map(|r| r.handler_name().to_string()).collect(),
            }),
        }
    }

    pub fn resolve_for(&self, envelope: &Envelope) -> Result<Box<H>, RegistrarError> {
        self.registration_for(envelope.message_type())
            .map(|registration| registration.create())
    }
}

/// Broadcast registrar: an event may have any number of handlers.
pub struct EventRegistrar<H: ?Sized> {
    registry: HandlerRegistry<H>,
}

impl<H: ?Sized> Default for EventRegistrar<H> {
    fn default() -> Self {
        Self {
            registry: HandlerRegistry::new(),
        }
    }
}

impl<H: ?Sized> EventRegistrar<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_type: impl Into<String>, registration: Registration<H>) {
        self.registry.register(message_type, registration);
    }

    pub fn add_resolver(&self, resolver: Arc<dyn HandlerResolver<H>>) {
        self.registry.add_resolver(resolver);
    }

    pub fn registry(&self) -> &HandlerRegistry<H> {
        &self.registry
    }

    /// Every handler for the envelope's type, each created fresh, with its name.
    pub fn resolve_for(&self, envelope: &Envelope) -> Vec<(String, Box<H>)> {
        self.registry
            .registrations_for(envelope.message_type())
            .into_iter()
            .map(|registration| (registration.handler_name().to_string(), registration.create()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use eventide_core::{AggregateId, CorrelationId};
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    use crate::message::{Command, Event, Message};

    trait Tagged: Send + Sync {
        fn name(&self) -> String;
    }

    struct NamedTag(String);

    impl Tagged for NamedTag {
        fn name(&self) -> String {
            self.0.clone()
        }
    }

    fn tagged(name: &str) -> Registration<dyn Tagged> {
        let owned = name.to_string();
        Registration::new(name, move || Box::new(NamedTag(owned.clone())) as Box<dyn Tagged>)
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Burn {
        token_id: AggregateId,
    }

    impl Message for Burn {
        fn message_type() -> &'static str {
            "token.burn"
        }
    }

    impl Command for Burn {
        fn target_aggregate_id(&self) -> AggregateId {
            self.token_id
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Burned;

    impl Message for Burned {
        fn message_type() -> &'static str {
            "token.burned"
        }
    }

    impl Event for Burned {}

    fn burn() -> Envelope {
        Envelope::command(&Burn { token_id: AggregateId::new() }, CorrelationId::new(), Utc::now()).unwrap()
    }

    fn burned() -> Envelope {
        Envelope::event(AggregateId::new(), &Burned, CorrelationId::new(), Utc::now()).unwrap()
    }

    struct StaticResolver(Vec<&'static str>);

    impl HandlerResolver<dyn Tagged> for StaticResolver {
        fn resolve(&self, message_type: &str) -> Vec<Registration<dyn Tagged>> {
            if message_type == "token.burn" {
                self.0.iter().map(|n| tagged(n)).collect()
            } else {
                vec![]
            }
        }
    }

    #[test]
    fn command_without_handlers_is_missing() {
        let registrar = CommandRegistrar::<dyn Tagged>::new();
        let err = registrar.resolve_for(&burn()).err().unwrap();
        assert_eq!(
            err,
            RegistrarError::MissingCommandHandler {
                message_type: "token.burn".into()
            }
        );
    }

    #[test]
    fn command_with_two_handlers_lists_both() {
        let registrar = CommandRegistrar::<dyn Tagged>::new();
        registrar.register("token.burn", tagged("BurnHandler"));
        registrar.register("token.burn", tagged("LegacyBurnHandler"));

        let err = registrar.resolve_for(&burn()).err().unwrap();
        assert!(err.to_string().contains("BurnHandler, LegacyBurnHandler"));
    }

    #[test]
    fn static_and_resolved_handlers_are_unioned() {
        let registrar = CommandRegistrar::<dyn Tagged>::new();
        registrar.add_resolver(Arc::new(StaticResolver(vec!["DynamicBurnHandler"])));
        assert_eq!(registrar.resolve_for(&burn()).unwrap().name(), "DynamicBurnHandler");

        registrar.register("token.burn", tagged("BurnHandler"));
        match registrar.resolve_for(&burn()) {
            Err(RegistrarError::MultipleCommandHandlers { handlers, .. }) => {
                assert_eq!(handlers, vec!["BurnHandler", "DynamicBurnHandler"]);
            }
            other => panic!("expected MultipleCommandHandlers, got {:?}", other.map(|h| h.name())),
        }
    }

    #[test]
    fn event_without_handlers_resolves_to_nothing() {
        let registrar = EventRegistrar::<dyn Tagged>::new();
        assert!(registrar.resolve_for(&burned()).is_empty());
    }

    #[test]
    fn factories_run_once_per_resolution() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let registrar = EventRegistrar::<dyn Tagged>::new();
        registrar.register(
            "token.burned",
            Registration::new("CountingProbe", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(NamedTag("counting".into())) as Box<dyn Tagged>
            }),
        );

        registrar.resolve_for(&burned());
        registrar.resolve_for(&burned());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    proptest! {
        /// Property: commands resolve iff exactly one handler is registered;
        /// events always resolve to every registered handler.
        #[test]
        fn unicast_commands_broadcast_events(count in 0usize..5) {
            let commands = CommandRegistrar::<dyn Tagged>::new();
            let events = EventRegistrar::<dyn Tagged>::new();
            for i in 0..count {
                commands.register("token.burn", tagged(&format!("H{i}")));
                events.register("token.burned", tagged(&format!("H{i}")));
            }

            match (count, commands.resolve_for(&burn())) {
                (1, Ok(handler)) => prop_assert_eq!(handler.name(), "H0"),
                (0, Err(RegistrarError::MissingCommandHandler { .. })) => {}
                (n, Err(RegistrarError::MultipleCommandHandlers { handlers, .. })) => {
                    prop_assert_eq!(handlers.len(), n)
                }
                (n, _) => prop_assert!(false, "unexpected resolution for {} handlers", n),
            }
            prop_assert_eq!(events.resolve_for(&burned()).len(), count);
        }
    }
}
