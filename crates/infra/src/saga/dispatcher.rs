//! Saga dispatch: correlate a message to an instance, run the route, commit.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use eventide_events::{Envelope, Saga, SagaConfiguration, SagaContext};

use crate::bus::handler::{HandlerContext, HandlerError, MessageHandler};
use crate::persistence::Correlation;

use super::store::{SagaInstance, SagaStoreError};

/// Registrable handler for every message routed to saga `S`.
pub struct SagaHandler<S: Saga> {
    config: Arc<SagaConfiguration<S>>,
}

impl<S: Saga> Clone for SagaHandler<S> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: Saga> SagaHandler<S> {
    pub fn new(config: Arc<SagaConfiguration<S>>) -> Self {
        Self { config }
    }

    pub fn configuration(&self) -> &SagaConfiguration<S> {
        &self.config
    }

    /// Instance the message belongs to, or `None` if the message must be skipped.
    async fn resolve(
        &self,
        starts: bool,
        envelope: &Envelope,
        correlation: &Correlation,
        ctx: &HandlerContext,
    ) -> Result<Option<SagaInstance<S>>, HandlerError> {
        let sagas = ctx.sagas();

        if starts {
            let saga_id = envelope.aggregate_id();
            return match sagas.retrieve::<S>(saga_id, ctx.cancel()).await? {
                Some(instance) if instance.completed => {
                    debug!(%saga_id, "starting message for a completed saga ignored");
                    Ok(None)
                }
                Some(instance) => Ok(Some(instance)),
                None => Ok(Some(SagaInstance::start(saga_id, correlation.clone()))),
            };
        }

        match sagas.find::<S>(correlation, ctx.cancel()).await? {
            Some(instance) => Ok(Some(instance)),
            None => Err(HandlerError::UnknownSaga {
                saga_type: S::saga_type(),
                message_type: envelope.message_type().to_string(),
                property: correlation.property.clone(),
                value: correlation.value.clone(),
            }),
        }
    }
}

#[async_trait]
impl<S: Saga> MessageHandler for SagaHandler<S> {
    #[instrument(
        skip(self, envelope, ctx),
        fields(saga_type = S::saga_type(), message_type = envelope.message_type()),
        err
    )]
    async fn handle(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<(), HandlerError> {
        let route = self
            .config
            .route(envelope.message_type())
            .ok_or_else(|| HandlerError::NoRoute {
                saga_type: S::saga_type(),
                message_type: envelope.message_type().to_string(),
            })?;

        let value = route.correlate(ctx.types(), envelope)?;
        let correlation = Correlation::new(self.config.correlation_property(), value);
        let retries = ctx.config().conflict_retries;

        let mut attempt = 0;
        loop {
            let Some(mut instance) = self.resolve(route.starts(), envelope, &correlation, ctx).await? else {
                return Ok(());
            };

            let mut saga_ctx = SagaContext::new(instance.saga_id, envelope, ctx.clock().now());
            route.invoke(ctx.types(), envelope, &mut instance.data, &mut saga_ctx)?;
            instance.completed = saga_ctx.is_completed();

            match ctx.sagas().store(&instance, saga_ctx.into_effects(), ctx.cancel()).await {
                Ok(receipt) => {
                    debug!(
                        saga_id = %instance.saga_id,
                        completed = instance.completed,
                        enqueued = receipt.enqueued,
                        "saga step committed"
                    );
                    return Ok(());
                }
                Err(SagaStoreError::Persistence(err)) if err.is_retryable() && attempt < retries => {
                    attempt += 1;
                    debug!(attempt, error = %err, "saga conflict, reloading");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
