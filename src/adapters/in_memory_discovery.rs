use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;

use crate::ports::{
    discovery::{
        DiscoverParam, Discovery, DiscoveryError, DiscoveryKind, DiscoveryResult, Instance,
        WatchCallback, WatchId, pretty_instances,
    },
    registry::{DeregisterParam, RegisterParam, Registry},
};

/// Metadata key overriding the port for HTTP consumers
pub const HTTP_PORT_METADATA: &str = "http_port";
/// Metadata key overriding the port for RPC consumers
pub const RPC_PORT_METADATA: &str = "rpc_port";

struct Subscription {
    id: WatchId,
    kind: DiscoveryKind,
    callback: WatchCallback,
}

/// Process-local discovery provider and registry.
///
/// Services are seeded from configuration or registered at runtime; every
/// change is pushed to watchers as a full snapshot.
#[derive(Default)]
pub struct InMemoryDiscovery {
    services: scc::HashMap<String, Vec<Instance>>,
    watchers: scc::HashMap<String, Vec<Subscription>>,
    next_watch_id: AtomicU64,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_services(services: HashMap<String, Vec<Instance>>) -> Self {
        let discovery = Self::default();
        for (name, instances) in services {
            let instances = instances
                .into_iter()
                .map(|instance| {
                    if instance.service_name.is_empty() {
                        instance.with_service(name.clone())
                    } else {
                        instance
                    }
                })
                .collect();
            discovery.services.upsert_sync(name, instances);
        }
        discovery
    }

    /// Replace the instances of a service and notify its watchers.
    pub fn set_instances(&self, service_name: &str, instances: Vec<Instance>) {
        tracing::debug!(
            "Setting {} instances of {}: {}",
            instances.len(),
            service_name,
            pretty_instances(&instances)
        );
        self.services
            .upsert_sync(service_name.to_string(), instances);
        self.publish(service_name);
    }

    /// Current raw instances of a service, without per-kind port projection.
    pub fn instances(&self, service_name: &str) -> Vec<Instance> {
        self.services
            .read_sync(service_name, |_, instances| instances.clone())
            .unwrap_or_default()
    }

    pub fn watcher_count(&self, service_name: &str) -> usize {
        self.watchers
            .read_sync(service_name, |_, subs| subs.len())
            .unwrap_or(0)
    }

    fn snapshot(&self, service_name: &str, kind: DiscoveryKind) -> Vec<Instance> {
        self.instances(service_name)
            .into_iter()
            .map(|instance| project(instance, kind))
            .collect()
    }

    fn publish(&self, service_name: &str) {
        let targets: Vec<(DiscoveryKind, WatchCallback)> = self
            .watchers
            .read_sync(service_name, |_, subs| {
                subs.iter()
                    .map(|sub| (sub.kind, sub.callback.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (kind, callback) in targets {
            callback(Ok(self.snapshot(service_name, kind)));
        }
    }
}

/// Apply the per-kind port override carried in metadata.
fn project(mut instance: Instance, kind: DiscoveryKind) -> Instance {
    let key = match kind {
        DiscoveryKind::Http => HTTP_PORT_METADATA,
        DiscoveryKind::Rpc => RPC_PORT_METADATA,
    };
    if let Some(port) = instance.metadata.get(key).and_then(|p| p.parse::<u16>().ok()) {
        instance.port = port;
    }
    instance
}

fn parse_addr(addr: &str) -> DiscoveryResult<SocketAddr> {
    addr.parse()
        .map_err(|e| DiscoveryError::InvalidParam(format!("address '{addr}': {e}")))
}

#[async_trait]
impl Discovery for InMemoryDiscovery {
    async fn discover(&self, param: &DiscoverParam) -> DiscoveryResult<Vec<Instance>> {
        Ok(self.snapshot(&param.service_name, param.kind))
    }

    async fn watch(&self, param: &DiscoverParam, callback: WatchCallback) -> DiscoveryResult<WatchId> {
        if param.service_name.is_empty() {
            return Err(DiscoveryError::InvalidParam(
                "service name cannot be empty".to_string(),
            ));
        }
        let id = WatchId(self.next_watch_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.watchers
            .entry_async(param.service_name.clone())
            .await
            .or_default()
            .get_mut()
            .push(Subscription {
                id,
                kind: param.kind,
                callback,
            });
        tracing::debug!("Watching {} ({:?}) as {:?}", param.service_name, param.kind, id);
        Ok(id)
    }

    async fn unwatch(&self, param: &DiscoverParam, id: WatchId) -> DiscoveryResult<()> {
        let removed = self
            .watchers
            .update_async(&param.service_name, |_, subs| {
                let before = subs.len();
                subs.retain(|sub| sub.id != id);
                before != subs.len()
            })
            .await
            .unwrap_or(false);

        if removed {
            Ok(())
        } else {
            Err(DiscoveryError::WatchNotFound {
                service: param.service_name.clone(),
                id: id.0,
            })
        }
    }
}

#[async_trait]
impl Registry for InMemoryDiscovery {
    async fn register(&self, param: &RegisterParam) -> DiscoveryResult<()> {
        let addr = parse_addr(&param.addr)?;
        let mut instance = Instance::new(addr.ip().to_string(), addr.port())
            .with_service(param.service_name.clone())
            .with_weight(param.weight);
        instance.instance_id = param.addr.clone();
        instance.metadata = param.metadata.clone();

        {
            let mut entry = self
                .services
                .entry_async(param.service_name.clone())
                .await
                .or_default();
            let instances = entry.get_mut();
            let identity = instance.identity();
            instances.retain(|existing| existing.identity() != identity);
            instances.push(instance);
        }

        tracing::info!("Registered {} at {}", param.service_name, param.addr);
        self.publish(&param.service_name);
        Ok(())
    }

    async fn deregister(&self, param: &DeregisterParam) -> DiscoveryResult<()> {
        let addr = parse_addr(&param.addr)?;
        let identity = format!("{}:{}", addr.ip(), addr.port());

        let removed = self
            .services
            .update_async(&param.service_name, |_, instances| {
                let before = instances.len();
                instances.retain(|existing| existing.identity() != identity);
                before != instances.len()
            })
            .await
            .unwrap_or(false);

        if !removed {
            return Err(DiscoveryError::ServiceNotFound(format!(
                "{} at {}",
                param.service_name, param.addr
            )));
        }

        tracing::info!("Deregistered {} at {}", param.service_name, param.addr);
        self.publish(&param.service_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::ports::discovery::DiscoveryExtra;

    fn param(service: &str, kind: DiscoveryKind) -> DiscoverParam {
        DiscoverParam::new(service, kind, DiscoveryExtra::default())
    }

    #[tokio::test]
    async fn test_port_projection_per_kind() {
        let discovery = InMemoryDiscovery::new();
        discovery.set_instances(
            "orders",
            vec![
                Instance::new("10.0.0.1", 7000)
                    .with_metadata(HTTP_PORT_METADATA, "8080")
                    .with_metadata(RPC_PORT_METADATA, "9090"),
            ],
        );

        let http = discovery
            .discover(&param("orders", DiscoveryKind::Http))
            .await
            .unwrap();
        let rpc = discovery
            .discover(&param("orders", DiscoveryKind::Rpc))
            .await
            .unwrap();
        assert_eq!(http[0].port, 8080);
        assert_eq!(rpc[0].port, 9090);
    }

    #[tokio::test]
    async fn test_watch_receives_snapshots_until_unwatched() {
        let discovery = InMemoryDiscovery::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let p = param("orders", DiscoveryKind::Http);

        let id = discovery
            .watch(
                &p,
                Arc::new(move |event: DiscoveryResult<Vec<Instance>>| {
                    sink.lock().unwrap().push(event.map(|list| list.len()).unwrap_or(usize::MAX));
                }),
            )
            .await
            .unwrap();

        discovery.set_instances("orders", vec![Instance::new("a", 1), Instance::new("b", 2)]);
        discovery.set_instances("orders", vec![]);
        discovery.unwatch(&p, id).await.unwrap();
        discovery.set_instances("orders", vec![Instance::new("c", 3)]);

        assert_eq!(seen.lock().unwrap().clone(), vec![2, 0]);
        assert!(matches!(
            discovery.unwatch(&p, id).await,
            Err(DiscoveryError::WatchNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let discovery = InMemoryDiscovery::new();
        let register = RegisterParam {
            service_name: "gateway".to_string(),
            addr: "127.0.0.1:8080".to_string(),
            weight: 2.0,
            metadata: HashMap::new(),
            extra: DiscoveryExtra::default(),
        };

        discovery.register(&register).await.unwrap();
        discovery.register(&register).await.unwrap();
        assert_eq!(discovery.instances("gateway").len(), 1);

        discovery
            .deregister(&DeregisterParam::from(&register))
            .await
            .unwrap();
        assert!(discovery.instances("gateway").is_empty());
        assert!(discovery.deregister(&DeregisterParam::from(&register)).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_all_land() {
        let discovery = Arc::new(InMemoryDiscovery::new());
        let handles: Vec<_> = (0..16u16)
            .map(|i| {
                let discovery = discovery.clone();
                tokio::spawn(async move {
                    let register = RegisterParam {
                        service_name: "gateway".to_string(),
                        addr: format!("127.0.0.1:{}", 8000 + i),
                        weight: 1.0,
                        metadata: HashMap::new(),
                        extra: DiscoveryExtra::default(),
                    };
                    discovery.register(&register).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(discovery.instances("gateway").len(), 16);
    }

    #[tokio::test]
    async fn test_seeded_services_get_names() {
        let mut seed = HashMap::new();
        seed.insert("users".to_string(), vec![Instance::new("10.0.0.9", 80)]);
        let discovery = InMemoryDiscovery::with_services(seed);
        let list = discovery
            .discover(&param("users", DiscoveryKind::Http))
            .await
            .unwrap();
        assert_eq!(list[0].service_name, "users");
        assert!(
            discovery
                .discover(&param("unknown", DiscoveryKind::Http))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
