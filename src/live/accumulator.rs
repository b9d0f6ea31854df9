use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::domain::{OperationAction, OperationKind, TableIdentifier, TableOperationMetrics};

/// Operation counters shared by every subscription worker.
///
/// Workers call [`record`](Self::record); the scrape calls
/// [`drain_all`](Self::drain_all), which swaps the whole map out under the
/// same lock so no increment falls between the read and the reset.
#[derive(Debug, Default)]
pub struct OperationAccumulator {
    counters: Mutex<HashMap<String, TableOperationMetrics>>,
}

impl OperationAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one operation. Unknown actions are not counted.
    pub async fn record(&self, table: &TableIdentifier, kind: OperationKind, action: OperationAction) {
        if action == OperationAction::Unknown {
            return;
        }

        let key = format!("{}:{}", table, kind);
        let mut counters = self.counters.lock().await;
        let entry = counters
            .entry(key)
            .or_insert_with(|| TableOperationMetrics::new(table.clone(), kind));
        match action {
            OperationAction::Create => entry.creates += 1,
            OperationAction::Update => entry.updates += 1,
            OperationAction::Delete => entry.deletes += 1,
            OperationAction::Unknown => {}
        }
    }

    /// Return everything accumulated since the last drain and reset to empty.
    pub async fn drain_all(&self) -> Vec<TableOperationMetrics> {
        let drained = std::mem::take(&mut *self.counters.lock().await);
        let mut metrics: Vec<_> = drained.into_values().collect();
        metrics.sort_by(|a, b| (&a.table, a.kind).cmp(&(&b.table, b.kind)));
        metrics
    }
}
