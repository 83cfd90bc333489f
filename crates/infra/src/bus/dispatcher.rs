//! Delivery of received messages to their handlers.
//!
//! Commands resolve to exactly one handler, events to every registered one.
//! Each handler runs on its own task so a panic is caught as a join error and
//! reported instead of taking the pump down. Failures never cross the bus
//! boundary: they are handed to the [`ErrorSink`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, instrument, warn, Instrument};

use eventide_events::{Envelope, RegistrarError};

use crate::cancel::Cancellation;
use crate::persistence::BackendError;

use super::handler::{HandlerContext, HandlerError, MessageHandler};
use super::pending::PendingGuard;
use super::pump::Observer;
use super::Runtime;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registrar(#[from] RegistrarError),

    #[error("{handler}: no {saga_type} instance for '{message_type}' ({property} = {value})")]
    UnknownSaga {
        handler: String,
        saga_type: &'static str,
        message_type: String,
        property: String,
        value: String,
    },

    #[error("handler '{handler}' failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: HandlerError,
    },

    #[error("handler '{handler}' panicked while handling '{message_type}'")]
    Panicked { handler: String, message_type: String },

    #[error("handler '{handler}' was aborted")]
    Aborted { handler: String },
}

impl DispatchError {
    fn from_handler(handler: &str, err: HandlerError) -> Self {
        match err {
            HandlerError::UnknownSaga {
                saga_type,
                message_type,
                property,
                value,
            } => Self::UnknownSaga {
                handler: handler.to_string(),
                saga_type,
                message_type,
                property,
                value,
            },
            source => Self::Handler {
                handler: handler.to_string(),
                source,
            },
        }
    }
}

/// Destination for failures that happen off the caller's path.
pub trait ErrorSink: Send + Sync {
    fn dispatch_failed(&self, envelope: &Envelope, error: &DispatchError);

    /// Leasing, acknowledging or releasing outbox records failed.
    fn relay_failed(&self, error: &BackendError) {
        warn!(error = %error, "outbox relay failed");
    }
}

/// Logs failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn dispatch_failed(&self, envelope: &Envelope, error: &DispatchError) {
        match error {
            DispatchError::Panicked { .. } => error!(
                message_id = %envelope.message_id(),
                message_type = envelope.message_type(),
                error = %error,
                "dispatch failed"
            ),
            _ => warn!(
                message_id = %envelope.message_id(),
                message_type = envelope.message_type(),
                error = %error,
                "dispatch failed"
            ),
        }
    }
}

/// Pump observer that routes envelopes through the registrars.
pub(crate) struct Dispatcher {
    runtime: Arc<Runtime>,
    cancel: Cancellation,
}

impl Dispatcher {
    pub(crate) fn new(runtime: Arc<Runtime>, cancel: Cancellation) -> Self {
        Self { runtime, cancel }
    }

    #[instrument(
        skip_all,
        fields(
            message_type = envelope.message_type(),
            message_id = %envelope.message_id(),
            aggregate_id = %envelope.aggregate_id()
        )
    )]
    async fn dispatch(&self, envelope: &Envelope) -> Vec<DispatchError> {
        let ctx = HandlerContext::new(Arc::clone(&self.runtime), envelope.clone(), self.cancel.clone());

        if envelope.is_command() {
            let registration = match self.runtime.commands.registration_for(envelope.message_type()) {
                Ok(registration) => registration,
                Err(err) => return vec![err.into()],
            };
            return run(registration.handler_name(), registration.create(), envelope, &ctx)
                .await
                .err()
                .into_iter()
                .collect();
        }

        let handlers = self.runtime.events.resolve_for(envelope);
        if handlers.is_empty() {
            debug!("no event handlers");
        }

        let mut errors = Vec::new();
        for (name, handler) in handlers {
            if let Err(err) = run(&name, handler, envelope, &ctx).await {
                errors.push(err);
            }
        }
        errors
    }
}

async fn run(
    name: &str,
    handler: Box<dyn MessageHandler>,
    envelope: &Envelope,
    ctx: &HandlerContext,
) -> Result<(), DispatchError> {
    let task = {
        let envelope = envelope.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { handler.handle(&envelope, &ctx).await }.in_current_span())
    };

    match task.await {
        Ok(Ok(())) => {
            debug!(handler = name, "handled");
            Ok(())
        }
        Ok(Err(err)) => Err(DispatchError::from_handler(name, err)),
        Err(join) if join.is_panic() => Err(DispatchError::Panicked {
            handler: name.to_string(),
            message_type: envelope.message_type().to_string(),
        }),
        Err(_) => Err(DispatchError::Aborted {
            handler: name.to_string(),
        }),
    }
}

#[async_trait]
impl Observer for Dispatcher {
    async fn on_next(&self, envelope: Envelope) {
        let _pending = PendingGuard::new(self.runtime.pending.clone(), 1);
        for err in self.dispatch(&envelope).await {
            self.runtime.sink.dispatch_failed(&envelope, &err);
        }
        if let Err(err) = self.runtime.backend.acknowledge(envelope.message_id()).await {
            self.runtime.sink.relay_failed(&err);
        }
    }

    async fn on_cancelled(&self, undelivered: Vec<Envelope>) {
        if undelivered.is_empty() {
            return;
        }
        warn!(count = undelivered.len(), "dispatcher stopped with undelivered messages");
        let ids: Vec<_> = undelivered.iter().map(Envelope::message_id).collect();
        if let Err(err) = self.runtime.backend.release(&ids).await {
            self.runtime.sink.relay_failed(&err);
        }
        self.runtime.pending.decrement_by(undelivered.len());
    }
}
