//! Gateway router: turns a routing table into backend pools and dispatcher routes.
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{Arc, OnceLock, Weak},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::mpsc, time::Instant};

use crate::{
    config::models::{RouteItem, ServerConfig},
    core::{
        backend_pool::BackendPool,
        hot_reload::{DispatcherError, HandlerTable, HotReloadServer},
        lifecycle::{ErrorReporter, Lifecycle, LifecycleError},
        match_rule::create_rule_handler,
    },
    ports::{
        config_provider::{ConfigValue, ROUTER_TABLE_DATA_ID},
        discovery::{Discovery, DiscoveryExtra},
        http_client::TransportFactory,
        http_server::{ErrorResponder, RequestModifier, ResponseModifier},
    },
    utils::observer::ObserverRegistry,
};

/// Error type for routing-table changes
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouterError {
    /// The routing table has no routes
    #[error("Routing table is empty")]
    EmptyRoutingTable,

    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    #[error("Router is not started")]
    NotStarted,
}

/// Collaborators shared by every route of the gateway
#[derive(Clone)]
pub struct GatewayOptions {
    pub discovery: Arc<dyn Discovery>,
    pub extra: DiscoveryExtra,
    pub transport_factory: Arc<dyn TransportFactory>,
    /// Run after the route's own rule handler, in order
    pub request_modifiers: Vec<Arc<dyn RequestModifier>>,
    pub response_modifiers: Vec<Arc<dyn ResponseModifier>>,
    pub error_responder: ErrorResponder,
    pub dev_mode: bool,
}

impl GatewayOptions {
    /// No modifiers, default discovery scope, dev mode off.
    pub fn new(
        discovery: Arc<dyn Discovery>,
        transport_factory: Arc<dyn TransportFactory>,
        error_responder: ErrorResponder,
    ) -> Self {
        Self {
            discovery,
            extra: DiscoveryExtra::default(),
            transport_factory,
            request_modifiers: Vec::new(),
            response_modifiers: Vec::new(),
            error_responder,
            dev_mode: false,
        }
    }

    pub fn with_extra(mut self, extra: DiscoveryExtra) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_request_modifier(mut self, modifier: Arc<dyn RequestModifier>) -> Self {
        self.request_modifiers.push(modifier);
        self
    }

    pub fn with_response_modifier(mut self, modifier: Arc<dyn ResponseModifier>) -> Self {
        self.response_modifiers.push(modifier);
        self
    }

    pub fn with_dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }
}

#[derive(Default)]
struct RouterState {
    items: BTreeMap<String, RouteItem>,
    pools: BTreeMap<String, Arc<BackendPool>>,
}

pub struct GatewayRouter {
    options: GatewayOptions,
    state: tokio::sync::Mutex<RouterState>,
    server: OnceLock<Arc<HotReloadServer>>,
}

impl GatewayRouter {
    /// Build pools for `items`, bind the dispatcher and start serving.
    pub async fn start(
        items: Vec<RouteItem>,
        server_config: &ServerConfig,
        errors: ErrorReporter,
        options: GatewayOptions,
    ) -> Result<Arc<Self>, RouterError> {
        if items.is_empty() {
            return Err(RouterError::EmptyRoutingTable);
        }

        let router = Arc::new(Self {
            options,
            state: tokio::sync::Mutex::new(RouterState::default()),
            server: OnceLock::new(),
        });

        let mut state = router.state.lock().await;
        let items = index_items(items);
        for item in items.values() {
            let pool = router.create_pool(item).await;
            state.pools.insert(item.service_name.clone(), pool);
        }
        state.items = items;

        let table = router.handler_table(&state);
        let server = match HotReloadServer::bind(
            server_config,
            &table,
            router.options.error_responder.clone(),
            errors,
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                for (service, pool) in &state.pools {
                    if let Err(err) = pool.shutdown().await {
                        tracing::warn!("Shutting down {} after failed bind: {}", service, err);
                    }
                }
                return Err(e.into());
            }
        };
        let _ = router.server.set(server);
        drop(state);

        Ok(router)
    }

    async fn create_pool(&self, item: &RouteItem) -> Arc<BackendPool> {
        BackendPool::new(
            item.service_name.clone(),
            self.options.discovery.clone(),
            self.options.extra.clone(),
            item.host_client.clone(),
            self.options.transport_factory.clone(),
            self.options.dev_mode,
        )
        .await
    }

    fn handler_table(&self, state: &RouterState) -> HandlerTable {
        let mut table = HandlerTable::new();
        for item in state.items.values() {
            let Some(pool) = state.pools.get(&item.service_name) else {
                continue;
            };

            let mut request_modifiers = Vec::with_capacity(self.options.request_modifiers.len() + 1);
            if let Some(rule) = create_rule_handler(&item.service_name, &item.match_rule) {
                request_modifiers.push(rule);
            }
            request_modifiers.extend(self.options.request_modifiers.iter().cloned());

            let handler =
                pool.reverse_proxy(request_modifiers, self.options.response_modifiers.clone());
            if table.insert(item.match_rule.path.clone(), handler).is_some() {
                tracing::warn!(
                    "Path {} is routed more than once, {} wins",
                    item.match_rule.path,
                    item.service_name
                );
            }
        }
        table
    }

    /// Replace the routing table.
    ///
    /// Services that disappeared or whose client settings changed get their
    /// pools shut down after the new table is live; a table the dispatcher
    /// rejects leaves everything as it was.
    pub async fn refresh(&self, items: Vec<RouteItem>) -> Result<u64, RouterError> {
        if items.is_empty() {
            return Err(RouterError::EmptyRoutingTable);
        }
        let server = self.server.get().ok_or(RouterError::NotStarted)?;

        let mut state = self.state.lock().await;
        let items = index_items(items);

        let mut pools = BTreeMap::new();
        let mut created = Vec::new();
        for item in items.values() {
            let reusable = state
                .items
                .get(&item.service_name)
                .is_some_and(|old| old.host_client == item.host_client);
            match state.pools.get(&item.service_name) {
                Some(pool) if reusable => {
                    pools.insert(item.service_name.clone(), pool.clone());
                }
                _ => {
                    let pool = self.create_pool(item).await;
                    created.push(pool.clone());
                    pools.insert(item.service_name.clone(), pool);
                }
            }
        }

        let next = RouterState { items, pools };
        let table = self.handler_table(&next);
        let generation = match server.reload(&table) {
            Ok(generation) => generation,
            Err(e) => {
                tracing::error!("Rejected routing table: {}", e);
                for pool in created {
                    if let Err(err) = pool.shutdown().await {
                        tracing::warn!(
                            "Shutting down unused pool {} failed: {}",
                            pool.service_name(),
                            err
                        );
                    }
                }
                return Err(e.into());
            }
        };

        let previous = std::mem::replace(&mut *state, next);
        for (service, pool) in previous.pools {
            let still_used = state
                .pools
                .get(&service)
                .is_some_and(|current| Arc::ptr_eq(current, &pool));
            if !still_used {
                tracing::info!("Retiring backend pool {}", service);
                if let Err(e) = pool.shutdown().await {
                    tracing::warn!("Retiring {} failed: {}", service, e);
                }
            }
        }

        tracing::info!(
            "Routing table refreshed to generation {} with services {:?}",
            generation,
            state.items.keys().collect::<Vec<_>>()
        );
        Ok(generation)
    }

    /// Refresh whenever a new routing-table document is published.
    ///
    /// Must be called from within a tokio runtime. Documents without routes
    /// are ignored and the current table stays live.
    pub fn observe(self: &Arc<Self>, registry: &ObserverRegistry) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<RouteItem>>();
        registry.register_observer(
            ROUTER_TABLE_DATA_ID,
            Arc::new(move |value: &ConfigValue| {
                let ConfigValue::RouterTable(config) = value else {
                    return;
                };
                let items = config.to_route_items();
                if items.is_empty() {
                    tracing::warn!("Ignoring routing table without routes");
                    return;
                }
                let _ = tx.send(items);
            }),
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(mut items) = rx.recv().await {
                while let Ok(newer) = rx.try_recv() {
                    items = newer;
                }
                let Some(router) = weak.upgrade() else { break };
                if let Err(e) = router.refresh(items).await {
                    tracing::error!("Routing table refresh failed: {}", e);
                }
            }
        });
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.get().map(|server| server.local_addr())
    }

    pub fn generation(&self) -> u64 {
        self.server.get().map_or(0, |server| server.generation())
    }

    /// Routed service names in order.
    pub async fn services(&self) -> Vec<String> {
        self.state.lock().await.items.keys().cloned().collect()
    }

    pub async fn pool(&self, service_name: &str) -> Option<Arc<BackendPool>> {
        self.state.lock().await.pools.get(service_name).cloned()
    }

    /// Stop the dispatcher, then every backend pool.
    pub async fn shutdown(&self, deadline: Instant) -> Result<(), LifecycleError> {
        let mut errors = Vec::new();
        if let Some(server) = self.server.get() {
            if let Err(e) = server.shutdown(deadline).await {
                let abort = e.is_abort();
                errors.push(LifecycleError::component("dispatcher", e));
                if abort {
                    return LifecycleError::from_errors(errors);
                }
            }
        }

        let Ok(state) = tokio::time::timeout_at(deadline, self.state.lock()).await else {
            errors.push(LifecycleError::DeadlineExceeded);
            return LifecycleError::from_errors(errors);
        };
        for (service, pool) in &state.pools {
            if Instant::now() >= deadline {
                errors.push(LifecycleError::DeadlineExceeded);
                break;
            }
            match tokio::time::timeout_at(deadline, pool.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(LifecycleError::component(
                    service.clone(),
                    LifecycleError::failed(e),
                )),
                Err(_) => {
                    errors.push(LifecycleError::DeadlineExceeded);
                    break;
                }
            }
        }
        LifecycleError::from_errors(errors)
    }
}

fn index_items(items: Vec<RouteItem>) -> BTreeMap<String, RouteItem> {
    let mut indexed = BTreeMap::new();
    for item in items {
        if let Some(old) = indexed.insert(item.service_name.clone(), item) {
            tracing::warn!("Service {} is listed more than once, last wins", old.service_name);
        }
    }
    indexed
}

#[async_trait]
impl Lifecycle for GatewayRouter {
    async fn on_dispose(&self, deadline: Instant) -> Result<(), LifecycleError> {
        self.shutdown(deadline).await
    }
}
