//! Discovery-synchronised pool of RPC connections for one remote service.
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use futures_util::future::join_all;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::models::{EmptySnapshotPolicy, RpcClientConfig},
    core::{
        lifecycle::LifecycleError,
        load_balancer::{LoadBalancerFactory, LoadBalancingStrategy},
        reconcile::reconcile,
    },
    ports::{
        discovery::{
            DiscoverParam, Discovery, DiscoveryError, DiscoveryExtra, DiscoveryKind,
            DiscoveryResult, Instance, WatchCallback, WatchId, pretty_instances,
        },
        rpc::{
            AsyncReplyHandler, RpcConnection, RpcConnector, RpcError, RpcMessage, RpcResult,
        },
    },
};

/// A live connection plus the instance it was dialled for.
pub struct PooledConnection {
    instance: ArcSwap<Instance>,
    conn: Arc<dyn RpcConnection>,
    closed: AtomicBool,
}

impl PooledConnection {
    fn new(instance: Instance, conn: Arc<dyn RpcConnection>) -> Self {
        Self {
            instance: ArcSwap::from_pointee(instance),
            conn,
            closed: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> String {
        self.instance.load().identity()
    }

    /// Latest instance snapshot for this identity.
    pub fn instance(&self) -> Arc<Instance> {
        self.instance.load_full()
    }

    pub fn connection(&self) -> &Arc<dyn RpcConnection> {
        &self.conn
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the underlying connection once; returns whether this call closed it.
    fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.conn.close();
            true
        } else {
            false
        }
    }
}

struct WatchState {
    id: Option<WatchId>,
    task: JoinHandle<()>,
}

/// Load-balanced RPC connections to every discovered instance of one service
pub struct ConnectionPool {
    param: DiscoverParam,
    discovery: Arc<dyn Discovery>,
    connector: Arc<dyn RpcConnector>,
    strategy: Box<dyn LoadBalancingStrategy>,
    dial_timeout: Duration,
    empty_policy: EmptySnapshotPolicy,
    connections: RwLock<Vec<Arc<PooledConnection>>>,
    reconcile_lock: tokio::sync::Mutex<()>,
    init_err: ArcSwapOption<DiscoveryError>,
    stopped: AtomicBool,
    watch: Mutex<Option<WatchState>>,
}

impl ConnectionPool {
    /// Discover the service, dial every instance and start watching.
    ///
    /// The pool is returned even when discovery fails; calls then fail fast
    /// with [`RpcError::NotReady`] until a watch snapshot heals it.
    pub async fn connect(
        service_name: impl Into<String>,
        discovery: Arc<dyn Discovery>,
        connector: Arc<dyn RpcConnector>,
        extra: DiscoveryExtra,
        config: &RpcClientConfig,
    ) -> Arc<Self> {
        let param = DiscoverParam::new(service_name, DiscoveryKind::Rpc, extra);
        let pool = Arc::new(Self {
            param,
            discovery,
            connector,
            strategy: LoadBalancerFactory::create_strategy(&config.load_balance),
            dial_timeout: config.dial_timeout(),
            empty_policy: config.empty_snapshot_policy,
            connections: RwLock::new(Vec::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
            init_err: ArcSwapOption::empty(),
            stopped: AtomicBool::new(false),
            watch: Mutex::new(None),
        });

        match pool.discovery.discover(&pool.param).await {
            Ok(instances) => {
                tracing::debug!(
                    "Discovered {} rpc instances of {}: {}",
                    instances.len(),
                    pool.param.service_name,
                    pretty_instances(&instances)
                );
                pool.apply_instances(instances).await;
            }
            Err(e) => {
                tracing::error!(
                    "Discover rpc service {} failed: {}",
                    pool.param.service_name,
                    e
                );
                pool.init_err.store(Some(Arc::new(e)));
            }
        }

        pool.start_watch().await;
        pool
    }

    async fn start_watch(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Instance>>();
        let service = self.param.service_name.clone();
        let callback: WatchCallback =
            Arc::new(move |event: DiscoveryResult<Vec<Instance>>| match event {
                Ok(instances) => {
                    let _ = tx.send(instances);
                }
                Err(e) => tracing::error!("Watch event for rpc service {} failed: {}", service, e),
            });

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(mut instances) = rx.recv().await {
                // snapshots are complete, only the newest matters
                while let Ok(newer) = rx.try_recv() {
                    instances = newer;
                }
                let Some(pool) = weak.upgrade() else { break };
                tracing::info!(
                    "Rpc instances of {} changed: {}",
                    pool.param.service_name,
                    pretty_instances(&instances)
                );
                pool.apply_instances(instances).await;
            }
        });

        let id = match self.discovery.watch(&self.param, callback).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!("Watch rpc service {} failed: {}", self.param.service_name, e);
                None
            }
        };
        *self.watch.lock().unwrap_or_else(|e| e.into_inner()) = Some(WatchState { id, task });
    }

    async fn dial_all(&self, instances: &[&Instance]) -> Vec<Arc<PooledConnection>> {
        let dials = instances.iter().map(|instance| async move {
            match self.connector.connect(instance, self.dial_timeout).await {
                Ok(conn) => Some(Arc::new(PooledConnection::new((*instance).clone(), conn))),
                Err(e) => {
                    tracing::error!(
                        "Dial {} of {} failed: {}",
                        instance,
                        self.param.service_name,
                        e
                    );
                    None
                }
            }
        });
        join_all(dials).await.into_iter().flatten().collect()
    }

    fn snapshot(&self) -> Vec<Arc<PooledConnection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reconcile the pool against a full snapshot.
    pub async fn apply_instances(&self, instances: Vec<Instance>) {
        let _serial = self.reconcile_lock.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let current = self.snapshot();

        if current.is_empty() {
            if instances.is_empty() {
                return;
            }
            let plan = reconcile(Vec::<String>::new(), &instances);
            let dialled = self.dial_all(&plan.to_create).await;
            if dialled.is_empty() {
                tracing::warn!(
                    "No instance of {} could be dialled, pool left empty",
                    self.param.service_name
                );
                return;
            }
            let stale = {
                let mut conns = self.connections.write().unwrap_or_else(|e| e.into_inner());
                std::mem::replace(&mut *conns, dialled)
            };
            for conn in stale {
                conn.close();
            }
            self.init_err.store(None);
            tracing::debug!("Rpc pool {} populated", self.param.service_name);
            return;
        }

        if instances.is_empty() {
            match self.empty_policy {
                EmptySnapshotPolicy::KeepStale => {
                    tracing::warn!(
                        "Discovery reports no instance of {}, keeping {} existing connections",
                        self.param.service_name,
                        current.len()
                    );
                }
                EmptySnapshotPolicy::CloseAll => {
                    let removed = std::mem::take(
                        &mut *self.connections.write().unwrap_or_else(|e| e.into_inner()),
                    );
                    for conn in removed {
                        conn.close();
                    }
                    tracing::warn!(
                        "Discovery reports no instance of {}, all connections closed",
                        self.param.service_name
                    );
                }
            }
            return;
        }

        let identities: Vec<String> = current.iter().map(|conn| conn.identity()).collect();
        let plan = reconcile(&identities, &instances);
        let created = self.dial_all(&plan.to_create).await;
        let fresh: HashMap<String, &Instance> = plan
            .keep
            .iter()
            .map(|instance| (instance.identity(), *instance))
            .collect();

        {
            let mut conns = self.connections.write().unwrap_or_else(|e| e.into_inner());
            let mut next = Vec::with_capacity(fresh.len() + created.len());
            for conn in conns.drain(..) {
                match fresh.get(&conn.identity()) {
                    Some(instance) => {
                        conn.instance.store(Arc::new((*instance).clone()));
                        next.push(conn);
                    }
                    None => {
                        conn.close();
                    }
                }
            }
            next.extend(created);
            *conns = next;
        }

        self.init_err.store(None);
        tracing::debug!(
            "Rpc pool {} reconciled: {} kept, {} created, {} removed",
            self.param.service_name,
            plan.keep.len(),
            plan.to_create.len(),
            plan.to_remove.len()
        );
    }

    pub fn service_name(&self) -> &str {
        &self.param.service_name
    }

    /// The error of the first discovery, until a snapshot is installed.
    pub fn init_error(&self) -> Option<DiscoveryError> {
        self.init_err.load_full().map(|e| (*e).clone())
    }

    /// Discovery succeeded and at least one connection is live.
    pub fn is_ready(&self) -> bool {
        self.init_err.load().is_none()
            && !self
                .connections
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty()
    }

    /// Identities currently holding a connection, in pool order.
    pub fn identities(&self) -> Vec<String> {
        self.snapshot().iter().map(|conn| conn.identity()).collect()
    }

    pub fn connection(&self, identity: &str) -> Option<Arc<PooledConnection>> {
        self.snapshot()
            .into_iter()
            .find(|conn| conn.identity() == identity)
    }

    fn choose(&self) -> RpcResult<Arc<PooledConnection>> {
        if let Some(err) = self.init_err.load_full() {
            return Err(RpcError::NotReady {
                service: self.param.service_name.clone(),
                source: (*err).clone(),
            });
        }
        let conns = self.connections.read().unwrap_or_else(|e| e.into_inner());
        self.strategy
            .select(conns.as_slice())
            .cloned()
            .ok_or_else(|| RpcError::NoInstance {
                service: self.param.service_name.clone(),
            })
    }

    pub async fn call(&self, method: &str, req: Value, timeout: Duration) -> RpcResult<Value> {
        let conn = self.choose()?;
        conn.conn.call(method, req, timeout).await
    }

    /// Like [`ConnectionPool::call`] but returns [`RpcError::Cancelled`] as soon as `cancel` fires.
    pub async fn call_with_cancel(
        &self,
        cancel: &CancellationToken,
        method: &str,
        req: Value,
        timeout: Duration,
    ) -> RpcResult<Value> {
        let conn = self.choose()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RpcError::Cancelled),
            reply = conn.conn.call(method, req, timeout) => reply,
        }
    }

    /// Serialize `req`, call and decode the reply.
    pub async fn call_typed<Req, Resp>(
        &self,
        method: &str,
        req: &Req,
        timeout: Duration,
    ) -> RpcResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let value = serde_json::to_value(req)?;
        let reply = self.call(method, value, timeout).await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn call_async(
        &self,
        method: &str,
        req: Value,
        handler: AsyncReplyHandler,
        timeout: Duration,
    ) -> RpcResult<()> {
        let conn = self.choose()?;
        conn.conn.call_async(method, req, handler, timeout).await
    }

    pub async fn push_msg(&self, msg: RpcMessage, timeout: Duration) -> RpcResult<()> {
        let conn = self.choose()?;
        conn.conn.push_msg(msg, timeout).await
    }

    pub async fn notify(&self, method: &str, data: Value, timeout: Duration) -> RpcResult<()> {
        let conn = self.choose()?;
        conn.conn.notify(method, data, timeout).await
    }

    pub async fn notify_with_cancel(
        &self,
        cancel: &CancellationToken,
        method: &str,
        data: Value,
        timeout: Duration,
    ) -> RpcResult<()> {
        let conn = self.choose()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RpcError::Cancelled),
            sent = conn.conn.notify(method, data, timeout) => sent,
        }
    }

    /// Stop watching and close every connection exactly once.
    ///
    /// Gives up with the errors collected so far plus `DeadlineExceeded`
    /// once `deadline` passes.
    pub async fn stop(&self, deadline: Instant) -> Result<(), LifecycleError> {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let mut errors = Vec::new();
        let watch = self.watch.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(WatchState { id, task }) = watch {
            task.abort();
            if let Some(id) = id {
                match tokio::time::timeout_at(deadline, self.discovery.unwatch(&self.param, id))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => errors.push(LifecycleError::failed(format!(
                        "unwatch {} failed: {e}",
                        self.param.service_name
                    ))),
                    Err(_) => {
                        errors.push(LifecycleError::DeadlineExceeded);
                        return LifecycleError::from_errors(errors);
                    }
                }
            }
        }

        let Ok(_serial) = tokio::time::timeout_at(deadline, self.reconcile_lock.lock()).await else {
            errors.push(LifecycleError::DeadlineExceeded);
            return LifecycleError::from_errors(errors);
        };

        let conns = self.snapshot();
        for (closed, conn) in conns.iter().enumerate() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    "Deadline passed after closing {} of {} connections of {}",
                    closed,
                    conns.len(),
                    self.param.service_name
                );
                errors.push(LifecycleError::DeadlineExceeded);
                return LifecycleError::from_errors(errors);
            }
            conn.close();
        }
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        tracing::info!("Rpc pool {} stopped", self.param.service_name);
        LifecycleError::from_errors(errors)
    }
}
