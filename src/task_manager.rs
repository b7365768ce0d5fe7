//! Tracking and cancellation of running provider tasks.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AutoExtractError, Result};

/// Runs tasks that can all be cancelled at once.
///
/// Once `cancel_all` has been called every running task resolves to
/// `Cancelled`, and so does every task submitted afterwards.
#[derive(Debug, Clone, Default)]
pub struct TaskManager {
    token: CancellationToken,
    running: Arc<AtomicUsize>,
}

struct Running(Arc<AtomicUsize>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(AutoExtractError::Cancelled);
        }
        self.running.fetch_add(1, Ordering::SeqCst);
        let _running = Running(Arc::clone(&self.running));

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(AutoExtractError::Cancelled),
            outcome = task => outcome,
        }
    }

    pub fn cancel_all(&self) {
        if !self.token.is_cancelled() {
            warn!("Cancelling {} running AutoExtract tasks", self.len());
            self.token.cancel();
        }
    }

    /// Number of tasks currently running.
    pub fn len(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token that fires when `cancel_all` is called.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels all tasks when the process receives Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.token.cancelled() => {}
                signal = tokio::signal::ctrl_c() => {
                    if signal.is_ok() {
                        info!("Ctrl-C received, stopping AutoExtract tasks");
                        manager.cancel_all();
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completed_tasks_are_untracked() {
        let manager = TaskManager::new();
        let value = manager.run(async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn cancel_all_stops_running_and_later_tasks() {
        let manager = TaskManager::new();
        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .run(async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                    .await
            })
        };
        while manager.is_empty() {
            tokio::task::yield_now().await;
        }

        manager.cancel_all();
        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Err(AutoExtractError::Cancelled)));
        assert!(manager.is_empty());

        let later = manager.run(async { Ok(1) }).await;
        assert!(matches!(later, Err(AutoExtractError::Cancelled)));
        assert!(manager.is_cancelled());
    }
}
