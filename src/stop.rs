use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative stop signal shared by collection and training runs
///
/// Runs poll `is_stopped` between symbols, windows and batches. Background
/// loops can await `stopped` to exit promptly.
#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request every holder of this signal to stop
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `stop` has been called
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // Sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stop_is_shared_between_clones() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_stopped());

        signal.stop();
        assert!(clone.is_stopped());
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_stop() {
        let signal = StopSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.stopped().await })
        };

        signal.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stopped() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_resolves_immediately_when_already_stopped() {
        let signal = StopSignal::new();
        signal.stop();
        tokio::time::timeout(Duration::from_millis(100), signal.stopped())
            .await
            .expect("already stopped");
    }
}
