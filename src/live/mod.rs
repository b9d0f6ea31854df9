//! Live-query tracking: one subscription per monitored table.
//!
//! Every scrape drains the accumulated counters and then reconciles the
//! running workers against the desired table set in the background.

pub mod accumulator;
pub mod classifier;

pub use accumulator::OperationAccumulator;
pub use classifier::classify;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::domain::{OperationAction, OperationKind, TableIdentifier, TableOperationMetrics};
use crate::driver::Notification;
use crate::error::{ExporterError, Result};
use crate::metrics;
use crate::pool::SessionPool;
use crate::reconcile::ReconcileQueue;

const KILL_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================
// Data Structures
// ============================================================

#[derive(Debug, Clone)]
pub struct LiveQuerySettings {
    /// Wait between a failed subscription and the next attempt
    pub reconnect_delay: Duration,
    /// Consecutive failures after which a worker gives up
    pub max_reconnect_attempts: u32,
}

impl Default for LiveQuerySettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
        }
    }
}

struct WorkerHandle {
    generation: u64,
    cancel: CancellationToken,
}

enum RunOutcome {
    Cancelled,
    Failed { delivered: bool, error: ExporterError },
}

pub struct ChangeSubscriptionManager {
    pool: Arc<dyn SessionPool>,
    settings: LiveQuerySettings,
    accumulator: OperationAccumulator,

    // Active workers keyed by `ns:db:table`
    workers: Mutex<HashMap<String, WorkerHandle>>,
    next_generation: AtomicU64,

    queue: ReconcileQueue,

    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ChangeSubscriptionManager {
    pub fn new(pool: Arc<dyn SessionPool>, settings: LiveQuerySettings) -> Arc<Self> {
        Arc::new(Self {
            pool,
            settings,
            accumulator: OperationAccumulator::new(),
            workers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            queue: ReconcileQueue::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Drain the counters accumulated since the previous call and schedule a
    /// reconciliation against `desired`. Never waits for reconciliation.
    pub async fn get_metrics(
        self: &Arc<Self>,
        desired: Vec<TableIdentifier>,
    ) -> Result<Vec<TableOperationMetrics>> {
        let metrics = self.accumulator.drain_all().await;
        self.schedule_reconcile(desired).await;
        Ok(metrics)
    }

    /// Keys of the tables that currently have a worker, sorted.
    pub async fn active_tables(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.workers.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Cancel every worker and wait for all background tasks to finish.
    pub async fn stop(&self) {
        info!("Stopping live query manager");
        self.shutdown.cancel();
        self.workers.lock().await.clear();
        self.tasks.close();
        self.tasks.wait().await;
    }

    // ============================================================
    // Reconciliation
    // ============================================================

    async fn schedule_reconcile(self: &Arc<Self>, desired: Vec<TableIdentifier>) {
        if self.shutdown.is_cancelled() {
            return;
        }

        if !self.queue.submit(desired).await {
            debug!("Reconciliation already running, latest desired set queued");
            return;
        }

        let manager = self.clone();
        self.tasks.spawn(async move {
            while let Some(desired) = manager.queue.next().await {
                manager.reconcile(desired).await;
            }
        });
    }

    /// Start and stop workers so that exactly the tables in `desired` have one.
    pub async fn reconcile(self: &Arc<Self>, desired: Vec<TableIdentifier>) {
        let desired: HashMap<String, TableIdentifier> =
            desired.into_iter().map(|t| (t.key(), t)).collect();

        let mut workers = self.workers.lock().await;

        let stale: Vec<String> = workers
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(handle) = workers.remove(&key) {
                info!(table = %key, "Table no longer monitored, stopping live query");
                handle.cancel.cancel();
            }
        }

        for (key, table) in desired {
            if workers.contains_key(&key) {
                continue;
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            info!(table = %key, "Starting live query worker");
            let handle = self.spawn_worker(table);
            workers.insert(key, handle);
        }

        metrics::record_active_subscriptions(workers.len());
    }

    fn spawn_worker(self: &Arc<Self>, table: TableIdentifier) -> WorkerHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.shutdown.child_token();

        let manager = self.clone();
        let token = cancel.clone();
        self.tasks.spawn(async move {
            manager.run_worker(table, generation, token).await;
        });

        WorkerHandle { generation, cancel }
    }

    /// Remove a worker's own entry; a newer worker for the same table is left alone.
    async fn remove_worker(&self, key: &str, generation: u64) {
        let mut workers = self.workers.lock().await;
        if workers.get(key).is_some_and(|h| h.generation == generation) {
            workers.remove(key);
        }
        metrics::record_active_subscriptions(workers.len());
    }

    // ============================================================
    // Worker
    // ============================================================

    async fn run_worker(
        self: Arc<Self>,
        table: TableIdentifier,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let max_attempts = self.settings.max_reconnect_attempts;
        let mut attempts: u32 = 0;

        loop {
            match self.run_subscription(&table, &cancel).await {
                RunOutcome::Cancelled => {
                    debug!(table = %table, "Live query worker cancelled");
                    return;
                }
                RunOutcome::Failed { delivered, error } => {
                    if delivered {
                        attempts = 0;
                    }
                    attempts += 1;

                    if attempts >= max_attempts {
                        error!(
                            table = %table,
                            attempts,
                            error = %error,
                            "Live query reconnect attempts exhausted, stopping worker"
                        );
                        self.remove_worker(&table.key(), generation).await;
                        return;
                    }

                    warn!(
                        table = %table,
                        attempt = attempts,
                        max_attempts,
                        error = %error,
                        "Live query failed, retrying in {:?}",
                        self.settings.reconnect_delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    /// Open one live query and consume it until cancellation or failure.
    async fn run_subscription(&self, table: &TableIdentifier, cancel: &CancellationToken) -> RunOutcome {
        let lease = tokio::select! {
            _ = cancel.cancelled() => return RunOutcome::Cancelled,
            lease = self.pool.get(&table.namespace, &table.database) => lease,
        };
        let lease = match lease {
            Ok(lease) => lease,
            Err(error) => return RunOutcome::Failed { delivered: false, error },
        };

        let session = lease.session();
        let opened = tokio::select! {
            _ = cancel.cancelled() => return RunOutcome::Cancelled,
            opened = lease.live(&table.table) => opened,
        };
        drop(lease);

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => return RunOutcome::Failed { delivered: false, error },
        };
        info!(table = %table, live_id = %stream.id, "Live query subscribed");

        let mut delivered = false;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break RunOutcome::Cancelled,
                next = stream.next() => match next {
                    Some(notification) => {
                        delivered = true;
                        self.handle_notification(table, notification).await;
                    }
                    None => {
                        break RunOutcome::Failed {
                            delivered,
                            error: ExporterError::Live("notification stream closed".to_string()),
                        };
                    }
                },
            }
        };

        if !session.is_closed() {
            self.kill_live_query(table, &stream.id).await;
        }

        outcome
    }

    /// Best-effort KILL through a fresh lease, so a single shared session is
    /// never touched outside the pool lock.
    async fn kill_live_query(&self, table: &TableIdentifier, live_id: &str) {
        let kill = async {
            let lease = self.pool.get(&table.namespace, &table.database).await?;
            lease.kill(live_id).await
        };
        match tokio::time::timeout(KILL_TIMEOUT, kill).await {
            Ok(Ok(())) => debug!(table = %table, live_id, "Live query killed"),
            Ok(Err(e)) => debug!(table = %table, live_id, error = %e, "Failed to kill live query"),
            Err(_) => debug!(table = %table, live_id, "Timed out killing live query"),
        }
    }

    async fn handle_notification(&self, table: &TableIdentifier, notification: Notification) {
        let action = OperationAction::from_notification(&notification.action);
        if action == OperationAction::Unknown {
            warn!(
                table = %table,
                action = %notification.action,
                "Ignoring live notification with unknown action"
            );
            metrics::record_unknown_live_action(table);
            return;
        }

        let kind = classify(notification.record());
        if kind == OperationKind::Unknown {
            debug!(table = %table, action = %action, "Notification without a record payload");
        }
        self.accumulator.record(table, kind, action).await;
    }
}
