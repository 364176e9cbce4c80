#![allow(dead_code)]

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{Router, body::Body as AxumBody, extract::Request};
use gantry::ports::{
    discovery::Instance,
    rpc::{AsyncReplyHandler, RpcConnection, RpcConnector, RpcError, RpcMessage, RpcResult},
};
use http_body_util::BodyExt;
use hyper::{HeaderMap, StatusCode};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use serde_json::{Value, json};

/// Start an upstream that answers every request with `"<name> <uri>"`.
pub async fn spawn_upstream(name: &'static str) -> SocketAddr {
    let app = Router::new().fallback(move |req: Request| async move {
        format!("{name} {}", req.uri())
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn instance_at(addr: SocketAddr) -> Instance {
    Instance::new(addr.ip().to_string(), addr.port())
}

pub async fn try_get(
    addr: SocketAddr,
    path: &str,
) -> Result<(StatusCode, HeaderMap, String), hyper_util::client::legacy::Error> {
    let client = Client::builder(TokioExecutor::new()).build_http::<AxumBody>();
    let uri = format!("http://{addr}{path}").parse().unwrap();
    let resp = client.get(uri).await?;
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    Ok((status, headers, String::from_utf8_lossy(&body).into_owned()))
}

pub async fn get(addr: SocketAddr, path: &str) -> (StatusCode, HeaderMap, String) {
    try_get(addr, path).await.unwrap()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub struct EchoConnection {
    pub addr: String,
    closed: AtomicBool,
}

impl EchoConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn reply(&self, method: &str, req: Value) -> RpcResult<Value> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        Ok(json!({"addr": self.addr, "method": method, "echo": req}))
    }
}

#[async_trait]
impl RpcConnection for EchoConnection {
    async fn call(&self, method: &str, req: Value, _timeout: Duration) -> RpcResult<Value> {
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
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Dials [`EchoConnection`]s and remembers every one of them.
#[derive(Default)]
pub struct EchoConnector {
    pub dialled: Mutex<Vec<Arc<EchoConnection>>>,
    pub refuse: Mutex<HashSet<String>>,
}

impl EchoConnector {
    pub fn open_connections(&self) -> Vec<String> {
        self.dialled
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.is_closed())
            .map(|c| c.addr.clone())
            .collect()
    }
}

#[async_trait]
impl RpcConnector for EchoConnector {
    async fn connect(
        &self,
        instance: &Instance,
        _dial_timeout: Duration,
    ) -> RpcResult<Arc<dyn RpcConnection>> {
        let addr = instance.identity();
        if self.refuse.lock().unwrap().contains(&addr) {
            return Err(RpcError::Transport(format!("dial {addr} refused")));
        }
        let conn = Arc::new(EchoConnection {
            addr,
            closed: AtomicBool::new(false),
        });
        self.dialled.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}
