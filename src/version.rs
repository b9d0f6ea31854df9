use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ExporterError, Result};
use crate::pool::SessionPool;

/// How long a fetched server version is reused.
pub const VERSION_CACHE_TTL: Duration = Duration::from_secs(10);

struct CachedVersion {
    version: String,
    fetched_at: Instant,
}

/// Reads the server version through the root lease and caches it briefly.
pub struct VersionReader {
    pool: Arc<dyn SessionPool>,
    timeout: Duration,
    ttl: Duration,
    cache: RwLock<Option<CachedVersion>>,
}

impl VersionReader {
    pub fn new(pool: Arc<dyn SessionPool>, timeout: Duration) -> Self {
        Self::with_ttl(pool, timeout, VERSION_CACHE_TTL)
    }

    pub fn with_ttl(pool: Arc<dyn SessionPool>, timeout: Duration, ttl: Duration) -> Self {
        Self {
            pool,
            timeout,
            ttl,
            cache: RwLock::new(None),
        }
    }

    pub async fn version(&self) -> Result<String> {
        if let Some(version) = self.fresh(&*self.cache.read().await) {
            return Ok(version);
        }

        let mut cache = self.cache.write().await;
        // Another caller may have refreshed while we waited for the write lock
        if let Some(version) = self.fresh(&cache) {
            return Ok(version);
        }

        let version = tokio::time::timeout(self.timeout, async {
            let lease = self.pool.get("", "").await?;
            lease.version().await
        })
        .await
        .map_err(|_| ExporterError::Timeout(self.timeout))??;

        debug!(version = %version, "Fetched SurrealDB server version");
        *cache = Some(CachedVersion {
            version: version.clone(),
            fetched_at: Instant::now(),
        });
        Ok(version)
    }

    fn fresh(&self, cached: &Option<CachedVersion>) -> Option<String> {
        cached
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.ttl && !c.version.is_empty())
            .map(|c| c.version.clone())
    }
}
