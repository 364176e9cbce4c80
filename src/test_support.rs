//! Test doubles shared by the unit tests.
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use serde_json::{Value, json};

use crate::{
    adapters::in_memory_discovery::InMemoryDiscovery,
    config::models::HostClientConfig,
    ports::{
        discovery::{
            DiscoverParam, Discovery, DiscoveryError, DiscoveryResult, Instance, WatchCallback,
            WatchId,
        },
        http_client::{HostTransport, HttpClientError, HttpClientResult, TransportFactory},
        rpc::{AsyncReplyHandler, RpcConnection, RpcConnector, RpcError, RpcMessage, RpcResult},
    },
};

pub struct MockTransport {
    addr: String,
    closed: AtomicBool,
    pub close_calls: AtomicUsize,
    pub served: AtomicUsize,
}

impl MockTransport {
    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostTransport for MockTransport {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        if self.is_closed() {
            return Err(HttpClientError::Closed(self.addr.clone()));
        }
        self.served.fetch_add(1, Ordering::SeqCst);
        let body = format!("{} {}", self.addr, req.uri());
        Response::builder()
            .header("x-upstream", self.addr.as_str())
            .header("connection", "keep-alive")
            .body(AxumBody::from(body))
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockTransportFactory {
    pub created: Mutex<Vec<Arc<MockTransport>>>,
    pub fail_for: Mutex<HashSet<String>>,
}

impl MockTransportFactory {
    pub fn fail(&self, identity: &str) {
        self.fail_for.lock().unwrap().insert(identity.to_string());
    }

    pub fn transport(&self, identity: &str) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.addr == identity)
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        instance: &Instance,
        _config: &HostClientConfig,
    ) -> HttpClientResult<Arc<dyn HostTransport>> {
        let identity = instance.identity();
        if self.fail_for.lock().unwrap().contains(&identity) {
            return Err(HttpClientError::ConnectionError(format!("refused {identity}")));
        }
        let transport = Arc::new(MockTransport {
            addr: identity,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            served: AtomicUsize::new(0),
        });
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Discovery whose `discover` can be switched to fail; watches go to the inner provider.
#[derive(Default)]
pub struct FlakyDiscovery {
    pub inner: InMemoryDiscovery,
    pub failing: AtomicBool,
    pub discover_calls: AtomicUsize,
}

impl FlakyDiscovery {
    pub fn failing() -> Self {
        Self {
            failing: AtomicBool::new(true),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Discovery for FlakyDiscovery {
    async fn discover(&self, param: &DiscoverParam) -> DiscoveryResult<Vec<Instance>> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Unreachable("registry offline".to_string()));
        }
        self.inner.discover(param).await
    }

    async fn watch(&self, param: &DiscoverParam, callback: WatchCallback) -> DiscoveryResult<WatchId> {
        self.inner.watch(param, callback).await
    }

    async fn unwatch(&self, param: &DiscoverParam, id: WatchId) -> DiscoveryResult<()> {
        self.inner.unwatch(param, id).await
    }
}

pub struct MockConnection {
    pub addr: String,
    closed: AtomicBool,
    pub close_calls: AtomicUsize,
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub canned: Option<Value>,
}

impl MockConnection {
    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn reply(&self, method: &str, req: Value) -> RpcResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(canned) = &self.canned {
            return Ok(canned.clone());
        }
        Ok(json!({"addr": self.addr, "method": method, "echo": req}))
    }
}

#[async_trait]
impl RpcConnection for MockConnection {
    async fn call(&self, method: &str, req: Value, timeout: Duration) -> RpcResult<Value> {
        if !self.delay.is_zero() {
            if self.delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(RpcError::Timeout(timeout));
            }
            tokio::time::sleep(self.delay).await;
        }
        self.reply(method, req)
    }

    async fn call_async(
        &self,
        method: &str,
        req: Value,
        handler: AsyncReplyHandler,
        _timeout: Duration,
    ) -> RpcResult<()> {
        let reply = self.reply(method, req);
        tokio::spawn(async move { handler(reply) });
        Ok(())
    }

    async fn notify(&self, method: &str, data: Value, _timeout: Duration) -> RpcResult<()> {
        self.reply(method, data).map(|_| ())
    }

    async fn push_msg(&self, msg: RpcMessage, _timeout: Duration) -> RpcResult<()> {
        self.reply(&msg.method, msg.payload).map(|_| ())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockConnector {
    pub dialled: Mutex<Vec<Arc<MockConnection>>>,
    pub fail_for: Mutex<HashSet<String>>,
    pub call_delay: Duration,
    pub canned: Option<Value>,
}

impl MockConnector {
    pub fn with_call_delay(call_delay: Duration) -> Self {
        Self {
            call_delay,
            ..Self::default()
        }
    }

    /// Every connection answers calls with `reply`.
    pub fn replying(reply: Value) -> Self {
        Self {
            canned: Some(reply),
            ..Self::default()
        }
    }

    pub fn fail(&self, identity: &str) {
        self.fail_for.lock().unwrap().insert(identity.to_string());
    }

    pub fn connection(&self, identity: &str) -> Option<Arc<MockConnection>> {
        self.dialled
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.addr == identity)
            .cloned()
    }

    pub fn dial_count(&self) -> usize {
        self.dialled.lock().unwrap().len()
    }
}

#[async_trait]
impl RpcConnector for MockConnector {
    async fn connect(
        &self,
        instance: &Instance,
        _dial_timeout: Duration,
    ) -> RpcResult<Arc<dyn RpcConnection>> {
        let identity = instance.identity();
        if self.fail_for.lock().unwrap().contains(&identity) {
            return Err(RpcError::Transport(format!("dial {identity} refused")));
        }
        let conn = Arc::new(MockConnection {
            addr: identity,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            delay: self.call_delay,
            canned: self.canned.clone(),
        });
        self.dialled.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
