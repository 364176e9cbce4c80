//! HTTP dispatcher whose routing table can be swapped while serving.
//!
//! The listening socket is bound once. Each routing table is compiled into an
//! immutable [`EngineInstance`]; requests pick up whichever instance is
//! current when they are dispatched, and a replaced instance is drained in the
//! background while new requests already see its successor.
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use axum::{Router, body::Body as AxumBody, extract::Request};
use hyper::{Response, StatusCode};
use thiserror::Error;
use tokio::{net::TcpListener, sync::Notify, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    config::models::ServerConfig,
    core::lifecycle::{ErrorReporter, LifecycleError},
    ports::http_server::{ErrorResponder, RequestHandler},
};

/// Routed path to handler, ordered so builds are deterministic.
pub type HandlerTable = BTreeMap<String, Arc<dyn RequestHandler>>;

/// Error type for the dispatcher
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatcherError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The handler table could not be compiled
    #[error("Invalid route {path}: {reason}")]
    InvalidRoute { path: String, reason: String },

    #[error("Dispatcher is closed")]
    Closed,
}

/// One compiled routing table.
pub struct EngineInstance {
    generation: u64,
    router: matchit::Router<Arc<dyn RequestHandler>>,
    responder: ErrorResponder,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Matchit patterns for a routed path.
///
/// A trailing `/*` or `/**` is a prefix match: the catch-all pattern comes
/// first, followed by the bare prefix.
fn route_patterns(path: &str) -> Vec<String> {
    let base = path
        .strip_suffix("/**")
        .or_else(|| path.strip_suffix("/*"));
    match base {
        Some(base) => {
            let bare = if base.is_empty() { "/" } else { base };
            vec![format!("{base}/{{*rest}}"), bare.to_string()]
        }
        None => vec![path.to_string()],
    }
}

impl EngineInstance {
    fn build(
        generation: u64,
        table: &HandlerTable,
        responder: ErrorResponder,
    ) -> Result<Self, DispatcherError> {
        let mut router = matchit::Router::new();
        for (path, handler) in table {
            let mut patterns = route_patterns(path).into_iter();
            if let Some(primary) = patterns.next() {
                router
                    .insert(primary.clone(), handler.clone())
                    .map_err(|e| DispatcherError::InvalidRoute {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
            }
            for alias in patterns {
                if let Err(e) = router.insert(alias.clone(), handler.clone()) {
                    tracing::debug!("Skipping alias {} of {}: {}", alias, path, e);
                }
            }
        }

        Ok(Self {
            generation,
            router,
            responder,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no request is running on this instance.
    async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct InFlight(Arc<EngineInstance>);

impl InFlight {
    fn enter(engine: Arc<EngineInstance>) -> Self {
        engine.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(engine)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<AxumBody> {
    let mut resp = Response::new(AxumBody::from(body));
    *resp.status_mut() = status;
    resp
}

async fn dispatch(engine: Option<Arc<EngineInstance>>, req: Request) -> Response<AxumBody> {
    let Some(engine) = engine else {
        return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Unavailable:Not ready");
    };
    let guard = InFlight::enter(engine);

    let handler = match guard.0.router.at(req.uri().path()) {
        Ok(matched) => matched.value.clone(),
        Err(_) => return plain_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    match handler.handle(req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!("Request failed on generation {}: {}", guard.0.generation, e);
            (guard.0.responder)(&e)
        }
    }
}

/// The single listening server of the gateway
pub struct HotReloadServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    responder: ErrorResponder,
    current: ArcSwapOption<EngineInstance>,
    generation: AtomicU64,
    reloading: Mutex<()>,
    closed: AtomicBool,
    cancel: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl HotReloadServer {
    /// Compile `table`, bind the listener and start serving in the background.
    ///
    /// Failures of the accept loop are sent to `errors`.
    pub async fn bind(
        config: &ServerConfig,
        table: &HandlerTable,
        responder: ErrorResponder,
        errors: ErrorReporter,
    ) -> Result<Arc<Self>, DispatcherError> {
        let first = Arc::new(EngineInstance::build(1, table, responder.clone())?);

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| DispatcherError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| DispatcherError::Bind { addr, source })?;

        let server = Arc::new(Self {
            config: config.clone(),
            local_addr,
            responder,
            current: ArcSwapOption::new(Some(first)),
            generation: AtomicU64::new(1),
            reloading: Mutex::new(()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            serve_task: Mutex::new(None),
        });

        let app = server.app(Arc::downgrade(&server));
        let shutdown = server.cancel.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("Gateway server on {} failed: {}", local_addr, e);
                errors.report(eyre::Report::new(e).wrap_err("gateway server failed"));
            }
        });
        *server.serve_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        tracing::info!("Gateway listening on {} with {} routes", local_addr, table.len());
        Ok(server)
    }

    #[allow(deprecated)]
    fn app(&self, server: Weak<Self>) -> Router {
        Router::new()
            .fallback(move |req: Request| {
                let server = server.clone();
                async move {
                    match server.upgrade() {
                        Some(server) => dispatch(server.current.load_full(), req).await,
                        None => dispatch(None, req).await,
                    }
                }
            })
            .layer(TimeoutLayer::new(self.config.request_timeout()))
            .layer(RequestBodyLimitLayer::new(self.config.body_limit))
            .layer(GlobalConcurrencyLimitLayer::new(self.config.concurrency))
            .layer(TraceLayer::new_for_http())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Generation of the active routing table; the first table is 1.
    pub fn generation(&self) -> u64 {
        self.current
            .load_full()
            .map_or(0, |engine| engine.generation)
    }

    pub fn current(&self) -> Option<Arc<EngineInstance>> {
        self.current.load_full()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Install `table` as the active routing table.
    ///
    /// Returns the new generation. The previous instance is drained in the
    /// background for at most `reload_shutdown_timeout`. A table that fails to
    /// compile leaves the active instance in place. Concurrent reloads are
    /// installed one at a time in generation order.
    pub fn reload(&self, table: &HandlerTable) -> Result<u64, DispatcherError> {
        let _serial = self.reloading.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() {
            return Err(DispatcherError::Closed);
        }

        let generation = self.generation.load(Ordering::Acquire) + 1;
        let next = Arc::new(EngineInstance::build(
            generation,
            table,
            self.responder.clone(),
        )?);
        self.generation.store(generation, Ordering::Release);

        let previous = self.current.swap(Some(next));
        tracing::info!(
            "Routing table generation {} installed with {} routes",
            generation,
            table.len()
        );

        if let Some(previous) = previous {
            let timeout = self.config.reload_shutdown_timeout();
            tokio::spawn(drain_previous(previous, timeout));
        }
        Ok(generation)
    }

    /// Stop accepting and wait for in-flight requests until `deadline`.
    pub async fn shutdown(&self, deadline: Instant) -> Result<(), LifecycleError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        tracing::info!("Shutting down gateway listener {}", self.local_addr);
        self.cancel.cancel();

        if let Some(engine) = self.current.load_full() {
            if tokio::time::timeout_at(deadline, engine.drain()).await.is_err() {
                tracing::warn!(
                    "{} requests still running on generation {} at shutdown deadline",
                    engine.in_flight(),
                    engine.generation
                );
            }
        }

        let task = self
            .serve_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                return Err(LifecycleError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

async fn drain_previous(previous: Arc<EngineInstance>, timeout: Duration) {
    let generation = previous.generation;
    match tokio::time::timeout(timeout, previous.drain()).await {
        Ok(()) => tracing::debug!("Routing table generation {} drained", generation),
        Err(_) => tracing::warn!(
            "Routing table generation {} still had {} requests after {:?}",
            generation,
            previous.in_flight(),
            timeout
        ),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use hyper_util::{client::legacy::Client, rt::TokioExecutor};

    use super::*;
    use crate::ports::http_server::GatewayError;

    struct Fixed {
        body: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl RequestHandler for Fixed {
        async fn handle(&self, req: Request) -> Result<Response<AxumBody>, GatewayError> {
            tokio::time::sleep(self.delay).await;
            Ok(Response::new(AxumBody::from(format!(
                "{} {}",
                self.body,
                req.uri().path()
            ))))
        }
    }

    struct Failing;

    #[async_trait]
    impl RequestHandler for Failing {
        async fn handle(&self, _req: Request) -> Result<Response<AxumBody>, GatewayError> {
            Err(GatewayError::Unavailable("billing".to_string()))
        }
    }

    fn fixed(body: &'static str) -> Arc<dyn RequestHandler> {
        Arc::new(Fixed {
            body,
            delay: Duration::ZERO,
        })
    }

    fn responder() -> ErrorResponder {
        Arc::new(|e: &GatewayError| {
            let mut resp = Response::new(AxumBody::from(e.to_string()));
            *resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            resp
        })
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        }
    }

    async fn get(addr: SocketAddr, path: &str) -> (StatusCode, String) {
        let client = Client::builder(TokioExecutor::new()).build_http::<AxumBody>();
        let uri = format!("http://{addr}{path}");
        let resp = client
            .get(uri.parse().unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_route_patterns() {
        assert_eq!(route_patterns("/orders/*"), vec!["/orders/{*rest}", "/orders"]);
        assert_eq!(route_patterns("/orders/**"), vec!["/orders/{*rest}", "/orders"]);
        assert_eq!(route_patterns("/*"), vec!["/{*rest}", "/"]);
        assert_eq!(route_patterns("/health"), vec!["/health"]);
    }

    #[test]
    fn test_conflicting_table_is_rejected() {
        let mut table = HandlerTable::new();
        table.insert("/a/{id}".to_string(), fixed("a"));
        table.insert("/a/{name}".to_string(), fixed("b"));
        assert!(matches!(
            EngineInstance::build(1, &table, responder()),
            Err(DispatcherError::InvalidRoute { .. })
        ));
    }

    #[tokio::test]
    async fn test_unset_dispatcher_is_not_ready() {
        let req = Request::builder().uri("/x").body(AxumBody::empty()).unwrap();
        let resp = dispatch(None, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Unavailable:Not ready");
    }

    #[tokio::test]
    async fn test_serves_and_reloads() {
        let (reporter, _errors) = ErrorReporter::channel(4);
        let mut table = HandlerTable::new();
        table.insert("/orders/*".to_string(), fixed("v1"));
        table.insert("/fail".to_string(), Arc::new(Failing));
        let server = HotReloadServer::bind(&local_config(), &table, responder(), reporter)
            .await
            .unwrap();
        let addr = server.local_addr();

        assert_eq!(get(addr, "/orders/1").await, (StatusCode::OK, "v1 /orders/1".to_string()));
        assert_eq!(get(addr, "/orders").await.1, "v1 /orders");
        assert_eq!(get(addr, "/users").await.0, StatusCode::NOT_FOUND);
        let (status, body) = get(addr, "/fail").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("billing"));

        let mut next = HandlerTable::new();
        next.insert("/users/*".to_string(), fixed("v2"));
        assert_eq!(server.reload(&next).unwrap(), 2);
        assert_eq!(server.generation(), 2);
        assert_eq!(get(addr, "/users/9").await.1, "v2 /users/9");
        assert_eq!(get(addr, "/orders/1").await.0, StatusCode::NOT_FOUND);

        server
            .shutdown(Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(server.reload(&next), Err(DispatcherError::Closed)));
        server
            .shutdown(Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_flight_request_finishes_on_old_table() {
        let (reporter, _errors) = ErrorReporter::channel(4);
        let mut table = HandlerTable::new();
        table.insert(
            "/slow".to_string(),
            Arc::new(Fixed {
                body: "old",
                delay: Duration::from_millis(200),
            }),
        );
        let server = HotReloadServer::bind(&local_config(), &table, responder(), reporter)
            .await
            .unwrap();
        let addr = server.local_addr();

        let slow = tokio::spawn(async move { get(addr, "/slow").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let old = server.current().unwrap();
        assert_eq!(old.in_flight(), 1);

        let mut next = HandlerTable::new();
        next.insert("/slow".to_string(), fixed("new"));
        server.reload(&next).unwrap();

        assert_eq!(get(addr, "/slow").await.1, "new /slow");
        assert_eq!(slow.await.unwrap().1, "old /slow");
        assert_eq!(old.in_flight(), 0);

        server
            .shutdown(Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
    }

    struct Labelled(String);

    #[async_trait]
    impl RequestHandler for Labelled {
        async fn handle(&self, req: Request) -> Result<Response<AxumBody>, GatewayError> {
            Ok(Response::new(AxumBody::from(format!(
                "{} {}",
                self.0,
                req.uri().path()
            ))))
        }
    }

    fn side(generation: u64) -> &'static str {
        if generation % 2 == 0 { "b" } else { "a" }
    }

    /// Two routes answering with the same `generation:side` label.
    fn labelled_table(generation: u64) -> HandlerTable {
        let label = format!("{generation}:{}", side(generation));
        let mut table = HandlerTable::new();
        for path in ["/x", "/y"] {
            table.insert(
                path.to_string(),
                Arc::new(Labelled(label.clone())) as Arc<dyn RequestHandler>,
            );
        }
        table
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_requests_under_reload_see_whole_tables() {
        const LAST: u64 = 40;
        let (reporter, _errors) = ErrorReporter::channel(4);
        let server =
            HotReloadServer::bind(&local_config(), &labelled_table(1), responder(), reporter)
                .await
                .unwrap();
        let addr = server.local_addr();
        let stop = CancellationToken::new();

        let clients: Vec<_> = (0..4)
            .map(|_| {
                let stop = stop.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    loop {
                        for path in ["/x", "/y"] {
                            let (status, body) = get(addr, path).await;
                            seen.push((path, status, body));
                        }
                        if stop.is_cancelled() {
                            return seen;
                        }
                    }
                })
            })
            .collect();

        for generation in 2..=LAST {
            assert_eq!(server.reload(&labelled_table(generation)).unwrap(), generation);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        stop.cancel();

        let mut total = 0;
        for client in clients {
            for (path, status, body) in client.await.unwrap() {
                total += 1;
                assert_eq!(status, StatusCode::OK, "{path} answered {body}");
                let (label, served) = body.split_once(' ').unwrap();
                assert_eq!(served, path);
                let (generation, answered) = label.split_once(':').unwrap();
                let generation: u64 = generation.parse().unwrap();
                assert!((1..=LAST).contains(&generation));
                assert_eq!(answered, side(generation), "mixed table in {body}");
            }
        }
        assert!(total >= 8);
        assert_eq!(get(addr, "/y").await.1, format!("{LAST}:{} /y", side(LAST)));

        server
            .shutdown(Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reloads_get_distinct_generations() {
        let (reporter, _errors) = ErrorReporter::channel(4);
        let server =
            HotReloadServer::bind(&local_config(), &labelled_table(1), responder(), reporter)
                .await
                .unwrap();

        let reloads: Vec<_> = (0..8)
            .map(|_| {
                let server = server.clone();
                tokio::spawn(async move {
                    (0..5)
                        .map(|_| server.reload(&labelled_table(0)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut generations = Vec::new();
        for reload in reloads {
            generations.extend(reload.await.unwrap());
        }
        generations.sort_unstable();

        assert_eq!(generations, (2..=41).collect::<Vec<u64>>());
        assert_eq!(server.generation(), 41);

        server
            .shutdown(Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_reload_keeps_active_table() {
        let (reporter, _errors) = ErrorReporter::channel(4);
        let mut table = HandlerTable::new();
        table.insert("/a".to_string(), fixed("a"));
        let server = HotReloadServer::bind(&local_config(), &table, responder(), reporter)
            .await
            .unwrap();

        let mut broken = HandlerTable::new();
        broken.insert("/b/{id}".to_string(), fixed("b"));
        broken.insert("/b/{name}".to_string(), fixed("b"));
        assert!(server.reload(&broken).is_err());
        assert_eq!(get(server.local_addr(), "/a").await.1, "a /a");

        server
            .shutdown(Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
    }
}
