use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::domain::TableIdentifier;

/// Hand-off between scrapes and the background reconciliation task.
///
/// At most one runner exists at a time. Requests that arrive while it runs
/// replace any request still waiting, so the runner always reconciles
/// against the latest desired set.
#[derive(Debug, Default)]
pub struct ReconcileQueue {
    pending: Mutex<Option<Vec<TableIdentifier>>>,
    running: AtomicBool,
}

impl ReconcileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `desired`. Returns true when the caller must start a runner.
    pub async fn submit(&self, desired: Vec<TableIdentifier>) -> bool {
        *self.pending.lock().await = Some(desired);
        !self.running.swap(true, Ordering::SeqCst)
    }

    /// Next desired set for the runner, or `None` when the runner should exit.
    pub async fn next(&self) -> Option<Vec<TableIdentifier>> {
        loop {
            if let Some(desired) = self.pending.lock().await.take() {
                return Some(desired);
            }
            self.running.store(false, Ordering::SeqCst);
            // A submit may have landed between take() and store()
            if self.pending.lock().await.is_none() || self.running.swap(true, Ordering::SeqCst) {
                return None;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> Vec<TableIdentifier> {
        names
            .iter()
            .map(|n| TableIdentifier::new("ns", "db", *n))
            .collect()
    }

    #[tokio::test]
    async fn test_first_submit_starts_runner() {
        let queue = ReconcileQueue::new();
        assert!(queue.submit(set(&["a"])).await);
        assert!(queue.is_running());
        assert!(!queue.submit(set(&["b"])).await);
    }

    #[tokio::test]
    async fn test_latest_request_wins() {
        let queue = ReconcileQueue::new();
        assert!(queue.submit(set(&["a"])).await);
        assert!(!queue.submit(set(&["b"])).await);
        assert!(!queue.submit(set(&["c"])).await);

        assert_eq!(queue.next().await, Some(set(&["c"])));
        assert_eq!(queue.next().await, None);
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_submit_after_runner_exit_starts_new_runner() {
        let queue = ReconcileQueue::new();
        assert!(queue.submit(set(&["a"])).await);
        assert!(queue.next().await.is_some());
        assert!(queue.next().await.is_none());

        assert!(queue.submit(set(&["b"])).await);
        assert_eq!(queue.next().await, Some(set(&["b"])));
    }
}
