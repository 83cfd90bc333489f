//! Cooperative cancellation passed explicitly through every async operation.

use std::future::{Future, pending};

use tokio::sync::watch;

/// Cloneable cancellation token.
///
/// Observed at backend I/O boundaries and, for pumps started with
/// [`MessageStream::subscribe_until`](crate::bus::MessageStream::subscribe_until),
/// before every dequeue. A token that was never connected to a source
/// ([`Cancellation::none`]) never fires.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancellation is requested.
    ///
    /// Pends forever if the source is dropped without cancelling.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return pending().await;
            }
        }
    }

    /// Run `fut` unless cancellation wins first. `None` when cancelled.
    pub async fn run<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

/// Owner side of a [`Cancellation`].
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: Some(self.tx.subscribe()),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn tokens_observe_the_source() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        source.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
        assert!(source.token().is_cancelled());
    }

    #[tokio::test]
    async fn run_short_circuits_when_already_cancelled() {
        let source = CancellationSource::new();
        source.cancel();
        assert_eq!(source.token().run(async { 7 }).await, None);
        assert_eq!(Cancellation::none().run(async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn dropped_source_never_fires() {
        let token = {
            let source = CancellationSource::new();
            source.token()
        };
        let fired = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(fired.is_err());
    }
}
