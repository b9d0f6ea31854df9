pub mod health;
pub mod metrics_handler;

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::collector::Collectors;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub collectors: Arc<Collectors>,
    pub metrics_handle: Arc<PrometheusHandle>,
}
