//! Receive stream and per-subscriber message pump.
//!
//! Every subscription owns a bounded queue and a dedicated task that pulls
//! messages in arrival order and hands them to its [`Observer`]. Subscribers
//! never wait on each other's handlers; a full queue only back-pressures the
//! producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use eventide_events::Envelope;

use crate::cancel::Cancellation;

/// Consumer side of a subscription.
#[async_trait]
pub trait Observer: Send + Sync + 'static {
    async fn on_next(&self, envelope: Envelope);

    /// Messages still queued when the subscription was disposed.
    async fn on_cancelled(&self, undelivered: Vec<Envelope>) {
        let _ = undelivered;
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Envelope>,
}

/// Fan-out of envelopes to every live subscription.
pub struct MessageStream {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl core::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageStream")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl MessageStream {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Start a pump task for `observer`. Requires a Tokio runtime.
    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> Subscription {
        self.subscribe_until(observer, Cancellation::none())
    }

    /// Like [`subscribe`](Self::subscribe), but the pump also stops when
    /// `cancel` fires, checked before every dequeue.
    pub fn subscribe_until(&self, observer: Arc<dyn Observer>, cancel: Cancellation) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, tx });

        let join = tokio::spawn(pump_loop(id, rx, shutdown_rx, cancel, observer));
        Subscription {
            id,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }

    /// Deliver `envelope` to every live subscription, waiting for queue space.
    pub async fn push(&self, envelope: Envelope) {
        let targets: Vec<(u64, mpsc::Sender<Envelope>)> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| (s.id, s.tx.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, tx) in targets {
            if tx.send(envelope.clone()).await.is_err() {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            // Disposed subscribers.
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|s| !closed.contains(&s.id));
        }
    }
}

/// Handle to a running pump. Dropping it stops the pump without waiting.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop the pump after the in-flight message and wait for it to exit.
    ///
    /// Queued messages are handed to `Observer::on_cancelled`.
    pub async fn dispose(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn pump_loop(
    id: u64,
    mut rx: mpsc::Receiver<Envelope>,
    mut shutdown: oneshot::Receiver<()>,
    cancel: Cancellation,
    observer: Arc<dyn Observer>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => observer.on_next(envelope).await,
                None => return,
            },
        }
    }

    rx.close();
    let mut undelivered = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        undelivered.push(envelope);
    }
    debug!(subscription = id, undelivered = undelivered.len(), "pump stopped");
    observer.on_cancelled(undelivered).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use tokio::sync::Notify;

    use eventide_core::{AggregateId, CorrelationId};
    use eventide_events::{Event, Message};

    use crate::cancel::CancellationSource;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tick(u32);

    impl Message for Tick {
        fn message_type() -> &'static str {
            "test.tick"
        }
    }

    impl Event for Tick {}

    fn tick(n: u32) -> Envelope {
        Envelope::event(AggregateId::new(), &Tick(n), CorrelationId::new(), Utc::now()).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
        cancelled: Mutex<Vec<u32>>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Observer for Recorder {
        async fn on_next(&self, envelope: Envelope) {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let Tick(n) = envelope.decode().unwrap();
            self.seen.lock().unwrap().push(n);
        }

        async fn on_cancelled(&self, undelivered: Vec<Envelope>) {
            let mut cancelled = self.cancelled.lock().unwrap();
            cancelled.extend(undelivered.iter().map(|e| e.decode::<Tick>().unwrap().0));
        }
    }

    async fn settle(recorder: &Recorder, expected: usize) {
        for _ in 0..100 {
            if recorder.seen.lock().unwrap().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn each_subscriber_sees_messages_in_arrival_order() {
        let stream = MessageStream::new(16);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let _sa = stream.subscribe(a.clone());
        let _sb = stream.subscribe(b.clone());

        for n in 0..10 {
            stream.push(tick(n)).await;
        }
        settle(&a, 10).await;
        settle(&b, 10).await;

        assert_eq!(*a.seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(*b.seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn disposing_hands_queued_messages_to_on_cancelled() {
        let stream = MessageStream::new(16);
        let gate = Arc::new(Notify::new());
        let blocked = Arc::new(Recorder {
            gate: Some(gate.clone()),
            ..Recorder::default()
        });
        let free = Arc::new(Recorder::default());
        let blocked_sub = stream.subscribe(blocked.clone());
        let _free_sub = stream.subscribe(free.clone());

        for n in 0..3 {
            stream.push(tick(n)).await;
        }
        settle(&free, 3).await;
        assert_eq!(free.seen.lock().unwrap().len(), 3);

        // Release the in-flight message; the rest are still queued.
        let dispose = tokio::spawn(blocked_sub.dispose());
        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(1), dispose).await.unwrap().unwrap();

        assert_eq!(*blocked.seen.lock().unwrap(), vec![0]);
        assert_eq!(*blocked.cancelled.lock().unwrap(), vec![1, 2]);

        stream.push(tick(3)).await;
        assert_eq!(stream.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn cancelling_the_token_stops_the_pump_before_the_next_dequeue() {
        let stream = MessageStream::new(16);
        let gate = Arc::new(Notify::new());
        let recorder = Arc::new(Recorder {
            gate: Some(gate.clone()),
            ..Recorder::default()
        });
        let source = CancellationSource::new();
        let _sub = stream.subscribe_until(recorder.clone(), source.token());

        for n in 0..3 {
            stream.push(tick(n)).await;
        }
        // Let the pump pick up the first tick.
        tokio::time::sleep(Duration::from_millis(20)).await;
        source.cancel();
        gate.notify_one();

        for _ in 0..100 {
            if recorder.cancelled.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*recorder.seen.lock().unwrap(), vec![0]);
        assert_eq!(*recorder.cancelled.lock().unwrap(), vec![1, 2]);
    }
}
