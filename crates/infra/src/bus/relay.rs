//! Outbox relay.
//!
//! Leases due outbox records and moves them into the receive stream in
//! `(due_at, offset)` order. Records stay in the outbox until the dispatcher
//! acknowledges them. Woken after every bus commit and otherwise on the poll
//! interval, so deferred messages surface once the clock passes their due time.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::Runtime;

pub(crate) async fn run(runtime: Arc<Runtime>, mut shutdown: oneshot::Receiver<()>) {
    let batch = runtime.config.relay_batch_size.max(1);
    let poll = runtime.config.relay_poll_interval;

    loop {
        drain(&runtime, batch).await;

        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = runtime.wake.notified() => trace!("relay woken"),
            _ = tokio::time::sleep(poll) => {}
        }
    }
    debug!("outbox relay stopped");
}

/// Relay everything that is due right now.
async fn drain(runtime: &Runtime, batch: usize) {
    loop {
        let leased = runtime
            .backend
            .lease_due(runtime.clock.now(), batch, runtime.config.outbox_lease)
            .await;
        let records = match leased {
            Ok(records) => records,
            Err(err) => {
                runtime.sink.relay_failed(&err);
                return;
            }
        };
        let full = records.len() == batch;

        for record in records {
            runtime.pending.released(record.envelope.message_id());
            trace!(offset = record.offset, message_type = record.envelope.message_type(), "relaying");
            runtime.stream.push(record.envelope).await;
        }

        if !full {
            return;
        }
    }
}
