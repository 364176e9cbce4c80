//! Per-service pool of upstream HTTP transports kept in sync with discovery.
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{HeaderMap, Request, Response, StatusCode, header};

use crate::{
    config::models::{HostClientConfig, LoadBalanceStrategy},
    core::{
        load_balancer::{LoadBalancerFactory, LoadBalancingStrategy},
        reconcile::reconcile,
    },
    ports::{
        discovery::{
            DiscoverParam, Discovery, DiscoveryExtra, DiscoveryKind, DiscoveryResult, Instance,
            WatchCallback, WatchId, pretty_instances,
        },
        http_client::{HostTransport, TransportFactory},
        http_server::{
            GatewayError, RequestHandler, RequestModifier, ResponseContext, ResponseModifier,
            RouteMeta,
        },
    },
};

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP_HEADERS: [header::HeaderName; 8] = [
    header::CONNECTION,
    header::HeaderName::from_static("keep-alive"),
    header::HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
];

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<header::HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| header::HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS.iter() {
        headers.remove(name);
    }
    headers.remove(header::PROXY_AUTHENTICATE);
}

#[derive(Clone)]
struct PoolMember {
    instance: Instance,
    transport: Arc<dyn HostTransport>,
}

/// Upstream transports of one service, one per discovered instance
pub struct BackendPool {
    param: DiscoverParam,
    discovery: Arc<dyn Discovery>,
    client_config: HostClientConfig,
    factory: Arc<dyn TransportFactory>,
    strategy: Box<dyn LoadBalancingStrategy>,
    members: RwLock<Vec<PoolMember>>,
    reconcile_lock: Mutex<()>,
    unavailable: AtomicBool,
    stopped: AtomicBool,
    watch_id: Mutex<Option<WatchId>>,
    dev_mode: bool,
}

impl BackendPool {
    /// Discover the service once, build its transports and start watching it.
    ///
    /// A failed first discovery leaves the pool unavailable; the watch still
    /// starts so a later snapshot can heal it.
    pub async fn new(
        service_name: impl Into<String>,
        discovery: Arc<dyn Discovery>,
        extra: DiscoveryExtra,
        client_config: HostClientConfig,
        factory: Arc<dyn TransportFactory>,
        dev_mode: bool,
    ) -> Arc<Self> {
        let param = DiscoverParam::new(service_name, DiscoveryKind::Http, extra);
        let pool = Arc::new(Self {
            param,
            discovery,
            client_config,
            factory,
            strategy: LoadBalancerFactory::create_strategy(&LoadBalanceStrategy::RoundRobin),
            members: RwLock::new(Vec::new()),
            reconcile_lock: Mutex::new(()),
            unavailable: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            watch_id: Mutex::new(None),
            dev_mode,
        });

        match pool.discovery.discover(&pool.param).await {
            Ok(instances) => {
                tracing::debug!(
                    "Discovered {} instances of {}: {}",
                    instances.len(),
                    pool.param.service_name,
                    pretty_instances(&instances)
                );
                pool.apply_instances(instances);
            }
            Err(e) => {
                tracing::error!(
                    "Discover {} failed, service marked unavailable: {}",
                    pool.param.service_name,
                    e
                );
                pool.unavailable.store(true, Ordering::Release);
            }
        }

        pool.start_watch().await;
        pool
    }

    async fn start_watch(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let callback: WatchCallback = Arc::new(move |event: DiscoveryResult<Vec<Instance>>| {
            if let Some(pool) = weak.upgrade() {
                pool.on_watch_event(event);
            }
        });

        match self.discovery.watch(&self.param, callback).await {
            Ok(id) => {
                *self.watch_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
            }
            Err(e) => tracing::error!("Watch {} failed: {}", self.param.service_name, e),
        }
    }

    fn on_watch_event(&self, event: DiscoveryResult<Vec<Instance>>) {
        match event {
            Ok(instances) => {
                if self.stopped.load(Ordering::Acquire) {
                    return;
                }
                tracing::info!(
                    "Instances of {} changed: {}",
                    self.param.service_name,
                    pretty_instances(&instances)
                );
                self.apply_instances(instances);
            }
            Err(e) => tracing::error!(
                "Watch event for {} carried an error: {}",
                self.param.service_name,
                e
            ),
        }
    }

    /// Reconcile the pool against a full snapshot.
    pub fn apply_instances(&self, instances: Vec<Instance>) {
        let _serial = self.reconcile_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        if instances.is_empty() {
            let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
            self.unavailable.store(true, Ordering::Release);
            for member in members.drain(..) {
                member.transport.close();
            }
            tracing::warn!(
                "No instances left for {}, service marked unavailable",
                self.param.service_name
            );
            return;
        }

        let current: Vec<String> = self
            .members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|member| member.instance.identity())
            .collect();
        let plan = reconcile(&current, &instances);
        if plan.is_noop() {
            tracing::debug!("Instances of {} unchanged", self.param.service_name);
        }

        let mut created = Vec::with_capacity(plan.to_create.len());
        for instance in &plan.to_create {
            match self.factory.create(instance, &self.client_config) {
                Ok(transport) => created.push(PoolMember {
                    instance: (*instance).clone(),
                    transport,
                }),
                Err(e) => tracing::error!(
                    "Creating transport for {} at {} failed: {}",
                    self.param.service_name,
                    instance,
                    e
                ),
            }
        }

        let fresh: HashMap<String, &Instance> = plan
            .keep
            .iter()
            .map(|instance| (instance.identity(), *instance))
            .collect();

        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Vec::with_capacity(fresh.len() + created.len());
        for member in members.drain(..) {
            match fresh.get(&member.instance.identity()) {
                Some(instance) => next.push(PoolMember {
                    instance: (*instance).clone(),
                    transport: member.transport,
                }),
                None => {
                    tracing::debug!(
                        "Closing transport of removed instance {} of {}",
                        member.instance,
                        self.param.service_name
                    );
                    member.transport.close();
                }
            }
        }
        next.extend(created);
        *members = next;
        self.unavailable.store(members.is_empty(), Ordering::Release);

        tracing::debug!(
            "{} now has {} transports",
            self.param.service_name,
            members.len()
        );
    }

    pub fn service_name(&self) -> &str {
        &self.param.service_name
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Identities currently holding a transport, in pool order.
    pub fn identities(&self) -> Vec<String> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|member| member.instance.identity())
            .collect()
    }

    /// The pooled instance for an identity, with the latest weight and metadata.
    pub fn instance(&self, identity: &str) -> Option<Instance> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|member| member.instance.identity() == identity)
            .map(|member| member.instance.clone())
    }

    pub fn transport(&self, identity: &str) -> Option<Arc<dyn HostTransport>> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|member| member.instance.identity() == identity)
            .map(|member| member.transport.clone())
    }

    fn select_transport(&self) -> Option<Arc<dyn HostTransport>> {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        self.strategy
            .select(members.as_slice())
            .map(|member| member.transport.clone())
    }

    fn unavailable_response(&self) -> Response<AxumBody> {
        let body = if self.dev_mode {
            format!("Unavailable:{}", self.param.service_name)
        } else {
            "Unavailable".to_string()
        };
        let mut resp = Response::new(AxumBody::from(body));
        *resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        resp
    }

    /// Build the handler that forwards requests to this pool.
    pub fn reverse_proxy(
        self: &Arc<Self>,
        request_modifiers: Vec<Arc<dyn RequestModifier>>,
        response_modifiers: Vec<Arc<dyn ResponseModifier>>,
    ) -> Arc<dyn RequestHandler> {
        Arc::new(ReverseProxy {
            pool: self.clone(),
            request_modifiers,
            response_modifiers,
        })
    }

    /// Stop watching and close every transport. Idempotent.
    pub async fn shutdown(&self) -> DiscoveryResult<()> {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.unavailable.store(true, Ordering::Release);

        let watch_id = self
            .watch_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let unwatched = match watch_id {
            Some(id) => self.discovery.unwatch(&self.param, id).await,
            None => Ok(()),
        };
        if let Err(e) = &unwatched {
            tracing::error!("Unwatch {} failed: {}", self.param.service_name, e);
        }

        let _serial = self.reconcile_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        for member in members.drain(..) {
            member.transport.close();
        }
        tracing::info!("Backend pool {} shut down", self.param.service_name);

        unwatched
    }
}

struct ReverseProxy {
    pool: Arc<BackendPool>,
    request_modifiers: Vec<Arc<dyn RequestModifier>>,
    response_modifiers: Vec<Arc<dyn ResponseModifier>>,
}

#[async_trait]
impl RequestHandler for ReverseProxy {
    async fn handle(&self, mut req: Request<AxumBody>) -> Result<Response<AxumBody>, GatewayError> {
        if self.pool.is_unavailable() {
            return Ok(self.pool.unavailable_response());
        }

        strip_hop_by_hop_headers(req.headers_mut());
        for modifier in &self.request_modifiers {
            modifier.modify_request(&mut req).await?;
        }

        let route = req.extensions().get::<RouteMeta>().cloned();
        let Some(transport) = self.pool.select_transport() else {
            return Ok(self.pool.unavailable_response());
        };

        tracing::debug!(
            "Forwarding {} {} to {} ({})",
            req.method(),
            req.uri(),
            transport.addr(),
            self.pool.service_name()
        );
        let mut resp = transport.send_request(req).await.map_err(|e| {
            tracing::warn!(
                "Upstream {} of {} failed: {}",
                transport.addr(),
                self.pool.service_name(),
                e
            );
            GatewayError::from(e)
        })?;

        strip_hop_by_hop_headers(resp.headers_mut());
        let ctx = ResponseContext {
            service_name: self.pool.service_name(),
            route: route.as_ref(),
        };
        for modifier in &self.response_modifiers {
            modifier.modify_response(&ctx, &mut resp).await?;
        }

        Ok(resp)
    }
}
