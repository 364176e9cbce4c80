use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body as AxumBody;
use http_body_util::{BodyExt, Limited};
use hyper::{Request, Response, Uri, Version, header, header::HeaderValue};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tokio::{sync::Semaphore, time::timeout};

use crate::{
    config::models::HostClientConfig,
    ports::{
        discovery::Instance,
        http_client::{HostTransport, HttpClientError, HttpClientResult, TransportFactory},
    },
};

struct PooledClient {
    client: Client<HttpConnector, AxumBody>,
    born: Instant,
}

impl PooledClient {
    fn new(config: &HostClientConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(config.write_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.max_idle_conn_duration)
            .pool_max_idle_per_host(config.max_conns)
            .build(connector);

        Self {
            client,
            born: Instant::now(),
        }
    }
}

/// HTTP/1.1 client bound to a single upstream instance.
///
/// * At most `max_conns` exchanges run at once; extra requests wait up to
///   `max_conn_wait_timeout` for a slot
/// * The whole exchange is bounded by [`HostClientConfig::exchange_timeout`]
/// * Pooled connections are retired once the pool is older than
///   `max_conn_duration`
/// * Response bodies are capped at `max_response_body_size`
///
/// Closing refuses new requests; requests that already entered, including
/// those still waiting for a slot, run to completion.
pub struct HyperHostClient {
    addr: String,
    config: HostClientConfig,
    client: ArcSwap<PooledClient>,
    slots: Arc<Semaphore>,
    closed: AtomicBool,
}

impl HyperHostClient {
    pub fn new(addr: impl Into<String>, config: HostClientConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_conns.max(1)));
        Self {
            addr: addr.into(),
            client: ArcSwap::from_pointee(PooledClient::new(&config)),
            config,
            slots,
            closed: AtomicBool::new(false),
        }
    }

    fn client(&self) -> Client<HttpConnector, AxumBody> {
        let current = self.client.load();
        if current.born.elapsed() < self.config.max_conn_duration {
            return current.client.clone();
        }

        tracing::debug!("Recycling connection pool of {}", self.addr);
        let fresh = Arc::new(PooledClient::new(&self.config));
        self.client.store(fresh.clone());
        fresh.client.clone()
    }

    fn upstream_uri(&self, uri: &Uri) -> HttpClientResult<Uri> {
        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
        format!("http://{}{}", self.addr, path_and_query)
            .parse()
            .map_err(|e| HttpClientError::InvalidRequest(format!("upstream uri: {e}")))
    }
}

#[async_trait]
impl HostTransport for HyperHostClient {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        if self.is_closed() {
            return Err(HttpClientError::Closed(self.addr.clone()));
        }

        let waiting = Instant::now();
        let permit = match timeout(
            self.config.max_conn_wait_timeout,
            self.slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(HttpClientError::Closed(self.addr.clone())),
            Err(_) => {
                return Err(HttpClientError::PoolExhausted {
                    addr: self.addr.clone(),
                    waited_ms: waiting.elapsed().as_millis() as u64,
                });
            }
        };

        let (mut parts, body) = req.into_parts();
        parts.uri = self.upstream_uri(&parts.uri)?;
        parts.version = Version::HTTP_11;
        if !parts.headers.contains_key(header::HOST) {
            let host = HeaderValue::from_str(&self.addr)
                .map_err(|e| HttpClientError::InvalidRequest(format!("host header: {e}")))?;
            parts.headers.insert(header::HOST, host);
        }

        let method = parts.method.clone();
        let uri = parts.uri.clone();
        let exchange_timeout = self.config.exchange_timeout();
        let response = match timeout(
            exchange_timeout,
            self.client().request(Request::from_parts(parts, body)),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::error!("Error making request to {} ({} {}): {}", self.addr, method, uri, e);
                return Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )));
            }
            Err(_) => return Err(HttpClientError::Timeout(exchange_timeout.as_millis() as u64)),
        };

        let limit = self.config.max_response_body_size;
        let announced = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(actual) = announced.filter(|len| *len > limit as u64) {
            return Err(HttpClientError::ResponseTooLarge { limit, actual });
        }

        let (mut parts, incoming) = response.into_parts();
        parts.headers.remove(header::TRANSFER_ENCODING);

        // the slot is released when the body is dropped
        let body = Limited::new(incoming, limit).map_frame(move |frame| {
            let _slot = &permit;
            frame
        });
        Ok(Response::from_parts(parts, AxumBody::new(body)))
    }

    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("Transport to {} closed", self.addr);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Builds a [`HyperHostClient`] per instance
#[derive(Debug, Default, Clone, Copy)]
pub struct HyperTransportFactory;

impl TransportFactory for HyperTransportFactory {
    fn create(
        &self,
        instance: &Instance,
        config: &HostClientConfig,
    ) -> HttpClientResult<Arc<dyn HostTransport>> {
        Ok(Arc::new(HyperHostClient::new(
            instance.identity(),
            config.clone(),
        )))
    }
}
