//! Instance Resolver.
//!
//! `resolve(id) -> ConnectionInfo` backed by a per-identifier cache and a
//! periodic background refresher. The resolver is the only component that
//! talks to the control plane; everything downstream sees it only through
//! the [`Resolve`] trait, so tests can substitute the control-plane mock
//! directly or a whole fake `Resolve` implementation.

mod cache;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::control_plane::{Api, ConnectionInfo};
use crate::error::ResolveError;
use crate::instance_id::InstanceId;

use cache::InstanceCache;

/// The margin before `not_after` at which a background refresh fires, so a
/// dial in flight is never left holding a certificate that expires mid-TLS
/// handshake.
const REFRESH_SAFETY_MARGIN: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, id: &InstanceId) -> Result<ConnectionInfo, ResolveError>;
    async fn close(&self);
}

/// Whether the resolver refreshes proactively in the background, or only
/// lazily when `resolve` observes an expired entry — useful on
/// CPU-throttled environments where a background task would never get
/// scheduled between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    Background,
    Lazy,
}

pub struct Resolver {
    api: Arc<dyn Api>,
    cache: Arc<InstanceCache>,
    mode: RefreshMode,
    cancel: CancellationToken,
    refresh_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Resolver {
    pub fn new(api: Arc<dyn Api>, mode: RefreshMode) -> Arc<Self> {
        Arc::new(Self {
            api,
            cache: Arc::new(InstanceCache::new()),
            mode,
            cancel: CancellationToken::new(),
            refresh_tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Ensures a cache entry (and, in background mode, its refresh task)
    /// exists for `id`, then returns the cached value.
    async fn resolve_inner(&self, id: &InstanceId) -> Result<ConnectionInfo, ResolveError> {
        if let Some(info) = self.cache.get_if_fresh(id) {
            return Ok(info);
        }

        match self.mode {
            RefreshMode::Lazy => self.refresh_once(id).await,
            RefreshMode::Background => {
                self.ensure_refresh_task(id.clone());
                // The entry might already be populated by a refresh task
                // that raced us; otherwise do one synchronous fetch so the
                // very first caller doesn't have to wait for the next tick.
                if let Some(info) = self.cache.get_if_fresh(id) {
                    Ok(info)
                } else {
                    self.refresh_once(id).await
                }
            }
        }
    }

    async fn refresh_once(&self, id: &InstanceId) -> Result<ConnectionInfo, ResolveError> {
        match self.api.resolve_connection_info(id).await {
            Ok(info) => {
                self.cache.put(id.clone(), Ok(info.clone()));
                Ok(info)
            }
            Err(err) => {
                if self.cache.has_unexpired(id) {
                    // Refresh failures leave the prior entry in place until
                    // it expires.
                    debug!(instance = %id, error = %err, "refresh failed, retaining cached entry");
                    self.cache.get_if_fresh(id).ok_or(err)
                } else {
                    self.cache.put(id.clone(), Err(err.clone()));
                    Err(err)
                }
            }
        }
    }

    fn ensure_refresh_task(self: &Arc<Self>, id: InstanceId) {
        if !self.cache.mark_task_started(&id) {
            return;
        }
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let sleep_for = this
                    .cache
                    .time_until_refresh(&id)
                    .unwrap_or(REFRESH_SAFETY_MARGIN);

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(sleep_for) => {}
                }

                if let Err(err) = this.refresh_once(&id).await {
                    if err.is_retryable() {
                        warn!(instance = %id, error = %err, "background refresh failed, will retry");
                    } else {
                        warn!(instance = %id, error = %err, "background refresh failed permanently");
                        return;
                    }
                }
            }
        });
        self.refresh_tasks.lock().push(handle);
    }
}

#[async_trait]
impl Resolve for Resolver {
    async fn resolve(&self, id: &InstanceId) -> Result<ConnectionInfo, ResolveError> {
        self.resolve_inner(id).await
    }

    async fn close(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.refresh_tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::control_plane::mock::{MockApi, MockFailure};

    fn id() -> InstanceId {
        InstanceId::parse("projects/p/locations/r/clusters/c/instances/i").unwrap()
    }

    #[tokio::test]
    async fn lazy_mode_resolves_without_background_task() {
        let mock = Arc::new(MockApi::new());
        mock.set_ok(id(), "10.0.0.1".parse().unwrap(), Duration::from_secs(60));
        let resolver = Resolver::new(mock.clone() as Arc<dyn Api>, RefreshMode::Lazy);

        let info = resolver.resolve(&id()).await.unwrap();
        assert_eq!(info.ip_address, "10.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(mock.call_count(&id()), 1);

        // Second call within the TTL should hit the cache, not the API.
        resolver.resolve(&id()).await.unwrap();
        assert_eq!(mock.call_count(&id()), 1);
    }

    #[tokio::test]
    async fn lazy_mode_refreshes_after_expiry() {
        let mock = Arc::new(MockApi::new());
        mock.set_ok(id(), "10.0.0.1".parse().unwrap(), Duration::from_millis(10));
        let resolver = Resolver::new(mock.clone() as Arc<dyn Api>, RefreshMode::Lazy);

        resolver.resolve(&id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        resolver.resolve(&id()).await.unwrap();
        assert_eq!(mock.call_count(&id()), 2);
    }

    #[tokio::test]
    async fn failure_after_expiry_is_surfaced_to_caller() {
        let mock = Arc::new(MockApi::new());
        mock.set_failure(id(), MockFailure::Permanent("nope".into()));
        let resolver = Resolver::new(mock as Arc<dyn Api>, RefreshMode::Lazy);

        let err = resolver.resolve(&id()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Permanent { .. }));
    }

    #[tokio::test]
    async fn background_mode_populates_cache_via_task() {
        let mock = Arc::new(MockApi::new());
        mock.set_ok(id(), "10.0.0.1".parse().unwrap(), Duration::from_secs(60));
        let resolver = Resolver::new(mock.clone() as Arc<dyn Api>, RefreshMode::Background);

        resolver.resolve(&id()).await.unwrap();
        assert!(mock.call_count(&id()) >= 1);
        resolver.close().await;
    }
}
