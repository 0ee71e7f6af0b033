//! Signal-of-Stop: cooperative cancellation token.
//!
//! Clones share one flag. Cancelling any clone wakes every pending `wait()`,
//! including waiters that subscribed after the cancel.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct SignalOfStop {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalOfStop {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation to all clones. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancelled; immediately if already cancelled.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` can only end by matching.
        let _ = rx.wait_for(|closing| *closing).await;
    }

    /// Race a future against cancellation. `None` if cancellation won.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            res = fut => Some(res),
            _ = self.wait() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_after_cancel() {
        let sos = SignalOfStop::new();
        let waiter = {
            let sos = sos.clone();
            tokio::spawn(async move { sos.wait().await })
        };
        tokio::task::yield_now().await;
        sos.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn late_waiters_see_the_cancel() {
        let sos = SignalOfStop::new();
        sos.cancel();
        tokio::time::timeout(Duration::from_millis(100), sos.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn select_prefers_completed_future() {
        let sos = SignalOfStop::new();
        assert_eq!(sos.select(async { 7 }).await, Some(7));
        sos.cancel();
        assert_eq!(sos.select(std::future::pending::<u8>()).await, None);
    }
}
