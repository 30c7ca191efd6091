//! Graceful shutdown coordination.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// One token every task watches, plus a tracker for the tasks that must
/// finish (connection sessions) before the process exits.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wrap `future` so the coordinator waits for it without spawning.
    pub fn track<F: Future>(&self, future: F) -> impl Future<Output = F::Output> {
        self.tasks.track_future(future)
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel the token, then wait up to `timeout` for tracked tasks.
    ///
    /// Returns `false` if tasks were still running when the timeout hit.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();
        self.tasks.close();
        info!(tasks = self.tasks.len(), timeout_ms = timeout.as_millis() as u64, "waiting for tasks to finish");

        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(remaining = self.tasks.len(), "shutdown timed out after {timeout:?}");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
        assert_eq!(coord.active_tasks(), 0);
    }

    #[test]
    fn shutdown_cancels_every_token() {
        let coord = ShutdownCoordinator::new();
        let t1 = coord.token();
        let t2 = coord.token();
        coord.shutdown();
        coord.shutdown();
        assert!(t1.is_cancelled() && t2.is_cancelled());
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn graceful_shutdown_waits_for_tracked_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let handle = tokio::spawn(coord.track(async move {
            token.cancelled().await;
            42
        }));

        assert!(coord.graceful_shutdown(Some(Duration::from_secs(1))).await);
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn tracked_future_counts_until_done() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let fut = coord.track(async move { token.cancelled().await });
        assert_eq!(coord.active_tasks(), 1);
        let handle = tokio::spawn(fut);
        assert!(coord.graceful_shutdown(Some(Duration::from_secs(1))).await);
        handle.await.unwrap();
        assert_eq!(coord.active_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_times_out() {
        let coord = ShutdownCoordinator::new();
        let _handle = tokio::spawn(coord.track(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }));
        assert!(!coord.graceful_shutdown(Some(Duration::from_millis(50))).await);
    }
}
