use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use scc::HashMap;
use tokio::time::Instant;

use crate::{
    config::models::RpcClientConfig,
    core::{
        connection_pool::ConnectionPool,
        lifecycle::{Lifecycle, LifecycleError},
    },
    ports::{
        discovery::{Discovery, DiscoveryExtra},
        rpc::{RpcConnector, RpcError, RpcResult},
    },
};

/// Hands out one shared [`ConnectionPool`] per remote service
pub struct RpcClientFactory {
    discovery: Arc<dyn Discovery>,
    connector: Arc<dyn RpcConnector>,
    extra: DiscoveryExtra,
    config: RpcClientConfig,
    pools: HashMap<String, Arc<ConnectionPool>>,
    creating: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
}

impl RpcClientFactory {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        connector: Arc<dyn RpcConnector>,
        extra: DiscoveryExtra,
        config: RpcClientConfig,
    ) -> Self {
        Self {
            discovery,
            connector,
            extra,
            config,
            pools: HashMap::new(),
            creating: tokio::sync::Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    async fn cached(&self, service_name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools
            .get_async(service_name)
            .await
            .map(|entry| entry.get().clone())
    }

    /// Get the pool for `service_name`, creating it on first use.
    ///
    /// A pool whose first discovery failed is still stored; its watch heals it
    /// and calls fail with [`RpcError::NotReady`] until then. After
    /// [`stop`](Self::stop) every acquire fails with [`RpcError::Closed`].
    pub async fn acquire(&self, service_name: &str) -> RpcResult<Arc<ConnectionPool>> {
        if service_name.trim().is_empty() {
            return Err(RpcError::InvalidServiceName(service_name.to_string()));
        }
        if self.is_stopped() {
            return Err(RpcError::Closed);
        }

        if let Some(pool) = self.cached(service_name).await {
            return Ok(pool);
        }

        let _creating = self.creating.lock().await;
        if self.is_stopped() {
            return Err(RpcError::Closed);
        }
        if let Some(pool) = self.cached(service_name).await {
            return Ok(pool);
        }

        tracing::info!("Creating rpc client for {}", service_name);
        let pool = ConnectionPool::connect(
            service_name,
            self.discovery.clone(),
            self.connector.clone(),
            self.extra.clone(),
            &self.config,
        )
        .await;
        let _ = self
            .pools
            .insert_async(service_name.to_string(), pool.clone())
            .await;
        Ok(pool)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop every pool under one deadline.
    ///
    /// Creation is locked out first so no pool can be added behind the drain.
    pub async fn stop(&self, deadline: Instant) -> Result<(), LifecycleError> {
        let mut pools = Vec::new();
        {
            let _creating = self.creating.lock().await;
            if self.stopped.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.pools
                .retain_async(|name, pool| {
                    pools.push((name.clone(), pool.clone()));
                    false
                })
                .await;
        }
        pools.sort_by(|a, b| a.0.cmp(&b.0));

        let mut errors = Vec::new();
        for (name, pool) in pools {
            if let Err(err) = pool.stop(deadline).await {
                let abort = err.is_abort();
                errors.push(LifecycleError::component(name, err));
                if abort {
                    break;
                }
            }
        }
        LifecycleError::from_errors(errors)
    }
}

#[async_trait]
impl Lifecycle for RpcClientFactory {
    async fn on_dispose(&self, deadline: Instant) -> Result<(), LifecycleError> {
        self.stop(deadline).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        adapters::in_memory_discovery::InMemoryDiscovery,
        ports::discovery::Instance,
        test_support::{FlakyDiscovery, MockConnector},
    };

    fn factory(discovery: Arc<dyn Discovery>, connector: Arc<MockConnector>) -> Arc<RpcClientFactory> {
        Arc::new(RpcClientFactory::new(
            discovery,
            connector,
            DiscoveryExtra::default(),
            RpcClientConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_acquire_memoises_per_service() {
        let discovery = Arc::new(InMemoryDiscovery::new());
        discovery.set_instances("auth", vec![Instance::new("10.0.1.1", 9000)]);
        let connector = Arc::new(MockConnector::default());
        let factory = factory(discovery, connector.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let factory = factory.clone();
                tokio::spawn(async move { factory.acquire("auth").await.unwrap() })
            })
            .collect();
        let mut pools = Vec::new();
        for handle in handles {
            pools.push(handle.await.unwrap());
        }

        assert!(pools.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(factory.pool_count(), 1);
        assert_eq!(connector.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_service_name_rejected() {
        let factory = factory(
            Arc::new(InMemoryDiscovery::new()),
            Arc::new(MockConnector::default()),
        );
        assert!(matches!(
            factory.acquire("").await,
            Err(RpcError::InvalidServiceName(_))
        ));
        assert_eq!(factory.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_discovery_still_memoised() {
        let discovery = Arc::new(FlakyDiscovery::failing());
        let factory = factory(discovery.clone(), Arc::new(MockConnector::default()));

        let pool = factory.acquire("auth").await.unwrap();
        assert!(!pool.is_ready());
        let again = factory.acquire("auth").await.unwrap();
        assert!(Arc::ptr_eq(&pool, &again));
        assert_eq!(
            discovery.discover_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert!(matches!(
            pool.call("Auth.Check", json!({}), Duration::from_millis(100)).await,
            Err(RpcError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispose_stops_all_pools() {
        let discovery = Arc::new(InMemoryDiscovery::new());
        discovery.set_instances("auth", vec![Instance::new("10.0.1.1", 9000)]);
        discovery.set_instances("users", vec![Instance::new("10.0.2.1", 9000)]);
        let connector = Arc::new(MockConnector::default());
        let factory = factory(discovery, connector.clone());

        factory.acquire("auth").await.unwrap();
        factory.acquire("users").await.unwrap();
        factory
            .on_dispose(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(factory.pool_count(), 0);
        assert_eq!(connector.connection("10.0.1.1:9000").unwrap().close_count(), 1);
        assert_eq!(connector.connection("10.0.2.1:9000").unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_after_dispose_is_rejected() {
        let discovery = Arc::new(InMemoryDiscovery::new());
        discovery.set_instances("auth", vec![Instance::new("10.0.1.1", 9000)]);
        let connector = Arc::new(MockConnector::default());
        let factory = factory(discovery.clone(), connector.clone());

        factory.acquire("auth").await.unwrap();
        assert_eq!(discovery.watcher_count("auth"), 1);
        factory
            .on_dispose(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        assert!(factory.is_stopped());
        assert!(matches!(factory.acquire("auth").await, Err(RpcError::Closed)));
        assert!(matches!(factory.acquire("users").await, Err(RpcError::Closed)));
        assert_eq!(discovery.watcher_count("auth"), 0);
        assert_eq!(discovery.watcher_count("users"), 0);
        assert_eq!(factory.pool_count(), 0);
        assert_eq!(connector.dial_count(), 1);

        factory
            .stop(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
    }
}
