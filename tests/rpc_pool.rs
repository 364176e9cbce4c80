mod common;

use std::{sync::Arc, time::Duration};

use common::{EchoConnector, eventually};
use gantry::{
    adapters::{InMemoryDiscovery, in_memory_discovery::RPC_PORT_METADATA},
    config::RpcClientConfig,
    core::{ErrorReporter, Finalizer, RpcClientFactory},
    ports::{
        discovery::{DiscoveryExtra, Instance},
        rpc::RpcError,
    },
};
use serde_json::json;
use tokio::time::Instant;

const TIMEOUT: Duration = Duration::from_secs(1);

fn factory(discovery: Arc<InMemoryDiscovery>, connector: Arc<EchoConnector>) -> Arc<RpcClientFactory> {
    Arc::new(RpcClientFactory::new(
        discovery,
        connector,
        DiscoveryExtra::default(),
        RpcClientConfig::default(),
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_orders_pool_follows_discovery() {
    let discovery = Arc::new(InMemoryDiscovery::new());
    discovery.set_instances(
        "orders",
        vec![Instance::new("10.0.0.1", 8080), Instance::new("10.0.0.2", 8080)],
    );
    let connector = Arc::new(EchoConnector::default());
    let factory = factory(discovery.clone(), connector.clone());

    let pool = factory.acquire("orders").await.unwrap();
    assert!(Arc::ptr_eq(&pool, &factory.acquire("orders").await.unwrap()));

    let mut seen = Vec::new();
    for i in 0..4 {
        let reply = pool.call("Orders.Get", json!({"id": i}), TIMEOUT).await.unwrap();
        assert_eq!(reply["echo"]["id"], i);
        seen.push(reply["addr"].as_str().unwrap().to_string());
    }
    assert_eq!(
        seen,
        vec!["10.0.0.1:8080", "10.0.0.2:8080", "10.0.0.1:8080", "10.0.0.2:8080"]
    );

    let kept = pool.connection("10.0.0.2:8080").unwrap();
    discovery.set_instances(
        "orders",
        vec![Instance::new("10.0.0.2", 8080), Instance::new("10.0.0.3", 8080)],
    );
    assert!(
        eventually(|| {
            let mut ids = pool.identities();
            ids.sort();
            ids == ["10.0.0.2:8080", "10.0.0.3:8080"]
        })
        .await
    );
    assert!(Arc::ptr_eq(&kept, &pool.connection("10.0.0.2:8080").unwrap()));
    assert!(eventually(|| !connector.open_connections().contains(&"10.0.0.1:8080".to_string())).await);

    // An empty snapshot keeps the last known connections.
    discovery.set_instances("orders", Vec::new());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.identities().len(), 2);
    assert!(pool.call("Orders.Get", json!({}), TIMEOUT).await.is_ok());

    let (reporter, _errors) = ErrorReporter::channel(4);
    let finalizer = Finalizer::new(reporter);
    finalizer.collect("rpc-clients", factory.clone());
    let outcome = finalizer.release(Instant::now() + Duration::from_secs(2)).await;
    assert!(outcome.is_clean(), "{outcome:?}");
    assert!(connector.open_connections().is_empty());
    assert_eq!(discovery.watcher_count("orders"), 0);
    assert_eq!(factory.pool_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rpc_port_metadata_and_unknown_service() {
    let discovery = Arc::new(InMemoryDiscovery::new());
    discovery.set_instances(
        "billing",
        vec![Instance::new("10.0.1.1", 8080).with_metadata(RPC_PORT_METADATA, "9090")],
    );
    let connector = Arc::new(EchoConnector::default());
    let factory = factory(discovery.clone(), connector.clone());

    let billing = factory.acquire("billing").await.unwrap();
    assert_eq!(billing.identities(), vec!["10.0.1.1:9090".to_string()]);

    let missing = factory.acquire("inventory").await.unwrap();
    let err = missing.call("Inventory.Get", json!({}), TIMEOUT).await.unwrap_err();
    assert!(matches!(err, RpcError::NoInstance { .. }), "{err:?}");

    discovery.set_instances("inventory", vec![Instance::new("10.0.2.1", 7000)]);
    assert!(eventually(|| missing.is_ready()).await);
    let reply = missing.call("Inventory.Get", json!({}), TIMEOUT).await.unwrap();
    assert_eq!(reply["addr"], "10.0.2.1:7000");

    assert!(matches!(
        factory.acquire("  ").await,
        Err(RpcError::InvalidServiceName(_))
    ));
    factory.stop(Instant::now() + Duration::from_secs(2)).await.unwrap();
}
