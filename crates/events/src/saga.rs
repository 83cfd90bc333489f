//! Saga / process manager mechanics (framework only, no business rules).
//!
//! A saga type declares its routing once, in [`Saga::configure`]:
//!
//! - a correlation property name (e.g. `"order_id"`)
//! - per message type, whether the message *starts* an instance or is *handled*
//!   by an existing one, an extractor producing the correlation value, and a
//!   typed handler
//!
//! Starting messages use their `aggregate_id` as the saga id and store the
//! extracted value as the instance's correlation value. Handled messages are
//! matched against the stored value of non-completed instances.
//!
//! Infra loads/stores instances and folds the [`SagaContext`] effects into a
//! single commit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use eventide_core::{AggregateId, DomainError};

use crate::envelope::{Envelope, EnvelopeError};
use crate::message::{Command, Event, Message, MessageKind};
use crate::types::TypeRegistry;

#[derive(Debug, Error)]
pub enum SagaError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Saga contract.
pub trait Saga: Send + Sync + Sized + 'static {
    /// Persisted instance state.
    type Data: Default + Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static;

    /// Stable saga type identifier (e.g. "saga.token_sale").
    fn saga_type() -> &'static str;

    fn configure(config: &mut SagaConfiguration<Self>);
}

type Extractor = Arc<dyn Fn(&TypeRegistry, &Envelope) -> Result<String, SagaError> + Send + Sync>;

type Invoker<D> =
    Arc<dyn Fn(&TypeRegistry, &Envelope, &mut D, &mut SagaContext<'_>) -> Result<(), SagaError> + Send + Sync>;

/// How one message type reaches a saga.
pub struct SagaRoute<S: Saga> {
    message_type: &'static str,
    kind: MessageKind,
    starts: bool,
    declare: fn(&TypeRegistry),
    extract: Extractor,
    invoke: Invoker<S::Data>,
}

impl<S: Saga> Clone for SagaRoute<S> {
    fn clone(&self) -> Self {
        Self {
            message_type: self.message_type,
            kind: self.kind,
            starts: self.starts,
            declare: self.declare,
            extract: Arc::clone(&self.extract),
            invoke: Arc::clone(&self.invoke),
        }
    }
}

impl<S: Saga> core::fmt::Debug for SagaRoute<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SagaRoute")
            .field("saga_type", &S::saga_type())
            .field("message_type", &self.message_type)
            .field("kind", &self.kind)
            .field("starts", &self.starts)
            .finish_non_exhaustive()
    }
}

impl<S: Saga> SagaRoute<S> {
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Whether an unmatched message creates a new instance.
    pub fn starts(&self) -> bool {
        self.starts
    }

    /// Register the routed message type with `types`.
    pub fn declare_type(&self, types: &TypeRegistry) {
        (self.declare)(types)
    }

    /// Correlation value carried by `envelope`.
    pub fn correlate(&self, types: &TypeRegistry, envelope: &Envelope) -> Result<String, SagaError> {
        (self.extract)(types, envelope)
    }

    pub fn invoke(
        &self,
        types: &TypeRegistry,
        envelope: &Envelope,
        data: &mut S::Data,
        ctx: &mut SagaContext<'_>,
    ) -> Result<(), SagaError> {
        (self.invoke)(types, envelope, data, ctx)
    }
}

/// Declared routing table of one saga type.
pub struct SagaConfiguration<S: Saga> {
    correlation_property: &'static str,
    routes: HashMap<&'static str, SagaRoute<S>>,
}

impl<S: Saga> core::fmt::Debug for SagaConfiguration<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SagaConfiguration")
            .field("saga_type", &S::saga_type())
            .field("correlation_property", &self.correlation_property)
            .field("routes", &self.routes.values().collect::<Vec<_>>())
            .finish()
    }
}

impl<S: Saga> SagaConfiguration<S> {
    /// Run `S::configure` against an empty configuration.
    pub fn build() -> Self {
        let mut config = Self {
            correlation_property: "id",
            routes: HashMap::new(),
        };
        S::configure(&mut config);
        config
    }

    pub fn correlate_by(&mut self, property: &'static str) -> &mut Self {
        self.correlation_property = property;
        self
    }

    pub fn correlation_property(&self) -> &'static str {
        self.correlation_property
    }

    pub fn starts_with_command<C, K, H>(&mut self, key: K, handle: H) -> &mut Self
    where
        C: Command,
        K: Fn(&C) -> String + Send + Sync + 'static,
        H: Fn(&mut S::Data, C, &mut SagaContext<'_>) -> Result<(), SagaError> + Send + Sync + 'static,
    {
        self.add_route::<C, K, H>(
            MessageKind::Command,
            true,
            |types| {
                types.register_command::<C>();
            },
            key,
            handle,
        )
    }

    pub fn starts_with_event<E, K, H>(&mut self, key: K, handle: H) -> &mut Self
    where
        E: Event,
        K: Fn(&E) -> String + Send + Sync + 'static,
        H: Fn(&mut S::Data, E, &mut SagaContext<'_>) -> Result<(), SagaError> + Send + Sync + 'static,
    {
        self.add_route::<E, K, H>(
            MessageKind::Event,
            true,
            |types| {
                types.register_event::<E>();
            },
            key,
            handle,
        )
    }

    pub fn handles_command<C, K, H>(&mut self, key: K, handle: H) -> &mut Self
    where
        C: Command,
        K: Fn(&C) -> String + Send + Sync + 'static,
        H: Fn(&mut S::Data, C, &mut SagaContext<'_>) -> Result<(), SagaError> + Send + Sync + 'static,
    {
        self.add_route::<C, K, H>(
            MessageKind::Command,
            false,
            |types| {
                types.register_command::<C>();
            },
            key,
            handle,
        )
    }

    pub fn handles_event<E, K, H>(&mut self, key: K, handle: H) -> &mut Self
    where
        E: Event,
        K: Fn(&E) -> String + Send + Sync + 'static,
        H: Fn(&mut S::Data, E, &mut SagaContext<'_>) -> Result<(), SagaError> + Send + Sync + 'static,
    {
        self.add_route::<E, K, H>(
            MessageKind::Event,
            false,
            |types| {
                types.register_event::<E>();
            },
            key,
            handle,
        )
    }

    fn add_route<M, K, H>(
        &mut self,
        kind: MessageKind,
        starts: bool,
        declare: fn(&TypeRegistry),
        key: K,
        handle: H,
    ) -> &mut Self
    where
        M: Message,
        K: Fn(&M) -> String + Send + Sync + 'static,
        H: Fn(&mut S::Data, M, &mut SagaContext<'_>) -> Result<(), SagaError> + Send + Sync + 'static,
    {
        let extract: Extractor = Arc::new(move |types: &TypeRegistry, envelope: &Envelope| -> Result<String, SagaError> {
            let message: M = types.decode(envelope)?;
            Ok(key(&message))
        });
        let invoke: Invoker<S::Data> = Arc::new(
            move |types: &TypeRegistry, envelope: &Envelope, data: &mut S::Data, ctx: &mut SagaContext<'_>| -> Result<(), SagaError> {
                let message: M = types.decode(envelope)?;
                handle(data, message, ctx)
            },
        );

        self.routes.insert(
            M::message_type(),
            SagaRoute {
                message_type: M::message_type(),
                kind,
                starts,
                declare,
                extract,
                invoke,
            },
        );
        self
    }

    pub fn route(&self, message_type: &str) -> Option<&SagaRoute<S>> {
        self.routes.get(message_type)
    }

    pub fn routes(&self) -> impl Iterator<Item = &SagaRoute<S>> {
        self.routes.values()
    }
}

/// What one saga step produced, ready to fold into a single commit.
#[derive(Debug, Clone, Default)]
pub struct SagaEffects {
    /// Events recorded in the saga's own stream.
    pub events: Vec<Envelope>,
    /// Every outbound message, recorded events included.
    pub messages: Vec<Envelope>,
}

/// Effects collected while a saga handles one message.
///
/// Outbound messages continue the conversation of the handled message.
#[derive(Debug)]
pub struct SagaContext<'a> {
    saga_id: AggregateId,
    cause: &'a Envelope,
    now: DateTime<Utc>,
    recorded: Vec<Envelope>,
    outbound: Vec<Envelope>,
    completed: bool,
}

impl<'a> SagaContext<'a> {
    pub fn new(saga_id: AggregateId, cause: &'a Envelope, now: DateTime<Utc>) -> Self {
        Self {
            saga_id,
            cause,
            now,
            recorded: Vec::new(),
            outbound: Vec::new(),
            completed: false,
        }
    }

    pub fn saga_id(&self) -> AggregateId {
        self.saga_id
    }

    pub fn cause(&self) -> &Envelope {
        self.cause
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn send<C: Command>(&mut self, command: &C) -> Result<(), SagaError> {
        let envelope = Envelope::command(command, self.cause.correlation_id(), self.now)?.caused_by(self.cause);
        self.outbound.push(envelope);
        Ok(())
    }

    /// Publish an event on behalf of this saga.
    ///
    /// The event is recorded in the saga's stream (keyed by the saga id) and
    /// delivered like any other published event.
    pub fn publish<E: Event>(&mut self, event: &E) -> Result<(), SagaError> {
        let envelope =
            Envelope::event(self.saga_id, event, self.cause.correlation_id(), self.now)?.caused_by(self.cause);
        self.recorded.push(envelope.clone());
        self.outbound.push(envelope);
        Ok(())
    }

    /// Saga timer: deliver `command` once `delay` has elapsed on the runtime clock.
    pub fn send_after<C: Command>(&mut self, delay: Duration, command: &C) -> Result<(), SagaError> {
        self.send_at(self.now + delay, command)
    }

    pub fn send_at<C: Command>(&mut self, due_at: DateTime<Utc>, command: &C) -> Result<(), SagaError> {
        let envelope = Envelope::command(command, self.cause.correlation_id(), self.now)?
            .caused_by(self.cause)
            .deliver_at(due_at);
        self.outbound.push(envelope);
        Ok(())
    }

    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn outbound(&self) -> &[Envelope] {
        &self.outbound
    }

    /// Events published so far; a subset of [`outbound`](Self::outbound).
    pub fn recorded(&self) -> &[Envelope] {
        &self.recorded
    }

    pub fn into_effects(self) -> SagaEffects {
        SagaEffects {
            events: self.recorded,
            messages: self.outbound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventide_core::{CorrelationId, ExpectedVersion};
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SaleOpened {
        sale_id: String,
        tokens: u64,
    }

    impl Message for SaleOpened {
        fn message_type() -> &'static str {
            "sale.opened"
        }
    }

    impl Event for SaleOpened {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PaymentReceived {
        sale_id: String,
    }

    impl Message for PaymentReceived {
        fn message_type() -> &'static str {
            "sale.payment_received"
        }
    }

    impl Event for PaymentReceived {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ReleaseTokens {
        wallet: AggregateId,
        tokens: u64,
    }

    impl Message for ReleaseTokens {
        fn message_type() -> &'static str {
            "wallet.release_tokens"
        }
    }

    impl Command for ReleaseTokens {
        fn target_aggregate_id(&self) -> AggregateId {
            self.wallet
        }

        fn expected_version(&self) -> ExpectedVersion {
            ExpectedVersion::Any
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct SaleData {
        tokens: u64,
        paid: bool,
    }

    struct TokenSale;

    impl Saga for TokenSale {
        type Data = SaleData;

        fn saga_type() -> &'static str {
            "saga.token_sale"
        }

        fn configure(config: &mut SagaConfiguration<Self>) {
            config
                .correlate_by("sale_id")
                .starts_with_event(
                    |e: &SaleOpened| e.sale_id.clone(),
                    |data, e: SaleOpened, ctx| {
                        data.tokens = e.tokens;
                        ctx.send_after(
                            Duration::minutes(15),
                            &ReleaseTokens {
                                wallet: ctx.saga_id(),
                                tokens: 0,
                            },
                        )
                    },
                )
                .handles_event(
                    |e: &PaymentReceived| e.sale_id.clone(),
                    |data, _e: PaymentReceived, ctx| {
                        data.paid = true;
                        ctx.mark_completed();
                        Ok(())
                    },
                );
        }
    }

    fn types() -> TypeRegistry {
        let types = TypeRegistry::new();
        types.register_event::<SaleOpened>();
        types.register_event::<PaymentReceived>();
        types.register_command::<ReleaseTokens>();
        types
    }

    #[test]
    fn configuration_declares_routes_once() {
        let config = SagaConfiguration::<TokenSale>::build();
        assert_eq!(config.correlation_property(), "sale_id");
        assert!(config.route("sale.opened").unwrap().starts());
        assert!(!config.route("sale.payment_received").unwrap().starts());
        assert!(config.route("wallet.release_tokens").is_none());
        assert_eq!(config.routes().count(), 2);

        let types = TypeRegistry::new();
        for route in config.routes() {
            route.declare_type(&types);
        }
        assert!(types.contains("sale.opened"));
        assert!(types.contains("sale.payment_received"));
    }

    #[test]
    fn starting_route_extracts_correlation_and_schedules_timer() {
        let types = types();
        let config = SagaConfiguration::<TokenSale>::build();
        let now = Utc::now();
        let sale = AggregateId::new();
        let opened = Envelope::event(
            sale,
            &SaleOpened {
                sale_id: "S-1".into(),
                tokens: 40,
            },
            CorrelationId::new(),
            now,
        )
        .unwrap();

        let route = config.route(opened.message_type()).unwrap();
        assert_eq!(route.correlate(&types, &opened).unwrap(), "S-1");

        let mut data = SaleData::default();
        let mut ctx = SagaContext::new(sale, &opened, now);
        route.invoke(&types, &opened, &mut data, &mut ctx).unwrap();

        assert_eq!(data.tokens, 40);
        assert!(!ctx.is_completed());
        let SagaEffects {
            events,
            messages: outbound,
        } = ctx.into_effects();
        assert!(events.is_empty());
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].options().due_at, Some(now + Duration::minutes(15)));
        assert_eq!(outbound[0].correlation_id(), opened.correlation_id());
        assert_eq!(outbound[0].causation_id(), Some(opened.message_id()));
    }

    #[test]
    fn handled_route_can_complete_the_saga() {
        let types = types();
        let config = SagaConfiguration::<TokenSale>::build();
        let paid = Envelope::event(
            AggregateId::new(),
            &PaymentReceived { sale_id: "S-1".into() },
            CorrelationId::new(),
            Utc::now(),
        )
        .unwrap();

        let route = config.route(paid.message_type()).unwrap();
        let mut data = SaleData::default();
        let mut ctx = SagaContext::new(AggregateId::new(), &paid, Utc::now());
        route.invoke(&types, &paid, &mut data, &mut ctx).unwrap();

        assert!(data.paid);
        assert!(ctx.is_completed());
        assert!(ctx.outbound().is_empty());
    }

    #[test]
    fn published_events_are_recorded_under_the_saga_id() {
        let saga_id = AggregateId::new();
        let paid = Envelope::event(
            AggregateId::new(),
            &PaymentReceived { sale_id: "S-2".into() },
            CorrelationId::new(),
            Utc::now(),
        )
        .unwrap();

        let mut ctx = SagaContext::new(saga_id, &paid, Utc::now());
        ctx.publish(&SaleOpened {
            sale_id: "S-3".into(),
            tokens: 1,
        })
        .unwrap();
        ctx.send(&ReleaseTokens {
            wallet: AggregateId::new(),
            tokens: 1,
        })
        .unwrap();

        let effects = ctx.into_effects();
        assert_eq!(effects.events.len(), 1);
        assert_eq!(effects.events[0].aggregate_id(), saga_id);
        assert_eq!(effects.events[0].causation_id(), Some(paid.message_id()));
        assert_eq!(effects.messages.len(), 2);
        assert_eq!(effects.messages[0].message_id(), effects.events[0].message_id());
    }
}
