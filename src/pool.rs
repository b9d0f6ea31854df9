use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::driver::{Connector, Session};
use crate::error::{ExporterError, Result};

/// Map key used for sessions that were not scoped to a namespace/database.
pub const ROOT_SCOPE_KEY: &str = "__common__";

/// How sessions are shared between callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingDiscipline {
    /// One connection; every access goes through one lock and scope switches happen in place
    Single,
    /// One connection per namespace/database pair
    #[default]
    Multi,
}

impl std::fmt::Display for PoolingDiscipline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => f.write_str("single"),
            Self::Multi => f.write_str("multi"),
        }
    }
}

/// A borrowed session.
///
/// Under [`PoolingDiscipline::Single`] the lease holds the pool lock, so no
/// other caller can switch scope until it is dropped. Keep leases short-lived.
pub struct SessionLease {
    session: Arc<dyn Session>,
    guard: Option<OwnedMutexGuard<SingleState>>,
}

impl SessionLease {
    pub fn session(&self) -> Arc<dyn Session> {
        self.session.clone()
    }

    /// Call after running a statement that changes scope itself (`USE NS ...`),
    /// so the next single-session lease switches scope again.
    pub fn invalidate_scope(&mut self) {
        if let Some(state) = self.guard.as_mut() {
            state.scope = None;
        }
    }
}

impl Deref for SessionLease {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

#[async_trait]
pub trait SessionPool: Send + Sync + 'static {
    /// Borrow a session scoped to `namespace`/`database`, or the root scope when both are empty.
    async fn get(&self, namespace: &str, database: &str) -> Result<SessionLease>;

    fn discipline(&self) -> PoolingDiscipline;
}

pub fn build_pool(discipline: PoolingDiscipline, connector: Arc<dyn Connector>) -> Arc<dyn SessionPool> {
    info!(discipline = %discipline, "Creating session pool");
    match discipline {
        PoolingDiscipline::Single => Arc::new(SingleSessionPool::new(connector)),
        PoolingDiscipline::Multi => Arc::new(MultiSessionPool::new(connector)),
    }
}

/// `Some("ns:db")` for a scoped request, `None` for root, error on mismatch.
fn scope_key(namespace: &str, database: &str) -> Result<Option<String>> {
    match (namespace.is_empty(), database.is_empty()) {
        (true, true) => Ok(None),
        (false, false) => Ok(Some(format!("{}:{}", namespace, database))),
        _ => Err(ExporterError::InvalidScope {
            namespace: namespace.to_string(),
            database: database.to_string(),
        }),
    }
}

// ============================================================
// Single session
// ============================================================

#[derive(Default)]
pub struct SingleState {
    session: Option<Arc<dyn Session>>,
    scope: Option<(String, String)>,
}

pub struct SingleSessionPool {
    connector: Arc<dyn Connector>,
    state: Arc<Mutex<SingleState>>,
}

impl SingleSessionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            state: Arc::new(Mutex::new(SingleState::default())),
        }
    }
}

#[async_trait]
impl SessionPool for SingleSessionPool {
    async fn get(&self, namespace: &str, database: &str) -> Result<SessionLease> {
        let scoped = scope_key(namespace, database)?.is_some();
        let mut state = self.state.clone().lock_owned().await;

        if state.session.as_ref().is_some_and(|s| s.is_closed()) {
            debug!("Cached session closed, reconnecting");
            state.session = None;
            state.scope = None;
        }

        let session = match &state.session {
            Some(session) => session.clone(),
            None => {
                let session = self.connector.connect().await?;
                state.session = Some(session.clone());
                state.scope = None;
                session
            }
        };

        if scoped {
            let unchanged = state
                .scope
                .as_ref()
                .is_some_and(|(ns, db)| ns == namespace && db == database);
            if !unchanged {
                debug!(namespace, database, "Switching session scope");
                session.use_scope(namespace, database).await?;
                state.scope = Some((namespace.to_string(), database.to_string()));
            }
        }

        Ok(SessionLease {
            session,
            guard: Some(state),
        })
    }

    fn discipline(&self) -> PoolingDiscipline {
        PoolingDiscipline::Single
    }
}

// ============================================================
// Multi session
// ============================================================

pub struct MultiSessionPool {
    connector: Arc<dyn Connector>,
    sessions: DashMap<String, Arc<dyn Session>>,
    // Per-key creation locks (single-flight)
    creating: DashMap<String, Arc<Mutex<()>>>,
}

impl MultiSessionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            sessions: DashMap::new(),
            creating: DashMap::new(),
        }
    }

    /// Number of sessions currently cached.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn cached(&self, key: &str) -> Option<Arc<dyn Session>> {
        let session = self.sessions.get(key).map(|s| s.value().clone())?;
        if session.is_closed() {
            self.sessions.remove_if(key, |_, s| s.is_closed());
            return None;
        }
        Some(session)
    }
}

#[async_trait]
impl SessionPool for MultiSessionPool {
    async fn get(&self, namespace: &str, database: &str) -> Result<SessionLease> {
        let scope = scope_key(namespace, database)?;
        let key = scope.clone().unwrap_or_else(|| ROOT_SCOPE_KEY.to_string());

        if let Some(session) = self.cached(&key) {
            return Ok(SessionLease {
                session,
                guard: None,
            });
        }

        let lock = self
            .creating
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _creating = lock.lock().await;

        // Another caller may have finished while we waited
        if let Some(session) = self.cached(&key) {
            return Ok(SessionLease {
                session,
                guard: None,
            });
        }

        debug!(scope = %key, "Creating session");
        let session = self.connector.connect().await?;
        if scope.is_some() {
            session.use_scope(namespace, database).await?;
        }
        self.sessions.insert(key, session.clone());

        Ok(SessionLease {
            session,
            guard: None,
        })
    }

    fn discipline(&self) -> PoolingDiscipline {
        PoolingDiscipline::Multi
    }
}
