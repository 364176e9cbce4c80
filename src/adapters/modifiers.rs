//! Built-in request and response modifiers of the gateway.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{
    Request, Response, StatusCode,
    header::{self, HeaderName, HeaderValue},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    core::{
        rpc::{RpcRequest, RpcResponse, SERVER_UNPREDICTABLE_ERR},
        rpc_factory::RpcClientFactory,
    },
    ports::{
        http_server::{
            ErrorResponder, GatewayError, RequestModifier, ResponseContext, ResponseModifier,
            RouteMeta,
        },
        rpc::RpcError,
    },
};

/// Response header carrying the gateway request id
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-req-id");
/// Request header carrying the auth service's verdict to the upstream
pub const AUTH_INFO_HEADER: HeaderName = HeaderName::from_static("info-from-gateway");

/// Adds `X-Req-ID` to responses of routes that tag requests with [`RouteMeta`]
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestIdHeader;

#[async_trait]
impl ResponseModifier for RequestIdHeader {
    async fn modify_response(
        &self,
        ctx: &ResponseContext<'_>,
        resp: &mut Response<AxumBody>,
    ) -> Result<(), GatewayError> {
        if let Some(route) = ctx.route {
            let value = HeaderValue::from_str(&route.request_id)
                .map_err(|e| GatewayError::InternalError(format!("request id header: {e}")))?;
            resp.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthReq {
    pub token: String,
}

/// Asks an auth service over RPC whether the request may pass.
///
/// The bearer token of the request is sent to `method` of `service`; the
/// reply payload is forwarded upstream as JSON in `Info-From-Gateway`.
pub struct RpcAuth {
    factory: Arc<RpcClientFactory>,
    service: String,
    method: String,
    timeout: Duration,
}

impl RpcAuth {
    pub fn new(
        factory: Arc<RpcClientFactory>,
        service: impl Into<String>,
        method: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            factory,
            service: service.into(),
            method: method.into(),
            timeout,
        }
    }
}

fn bearer_token(req: &Request<AxumBody>) -> String {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl RequestModifier for RpcAuth {
    async fn modify_request(&self, req: &mut Request<AxumBody>) -> Result<(), GatewayError> {
        let mut auth = RpcRequest::new(AuthReq {
            token: bearer_token(req),
        });
        if let Some(route) = req.extensions().get::<RouteMeta>() {
            auth = auth.with_req_id(route.request_id.clone());
        }
        let req_id = auth.req_id.clone();

        let pool = self.factory.acquire(&self.service).await?;
        let resp: RpcResponse<Value> = pool
            .call_typed(&self.method, &auth, self.timeout)
            .await
            .inspect_err(|e| {
                tracing::error!("Call auth server failed, req_id: {}: {}", req_id, e);
            })?;
        let verdict = resp.ok_or_err()?.unwrap_or(Value::Null);

        let encoded = serde_json::to_string(&verdict).map_err(RpcError::from)?;
        let value = HeaderValue::from_str(&encoded)
            .map_err(|e| GatewayError::InternalError(format!("auth header: {e}")))?;
        req.headers_mut().append(AUTH_INFO_HEADER, value);
        Ok(())
    }
}

/// Status code a gateway error is answered with.
pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Rpc(rpc) if rpc.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::Rpc(RpcError::Remote { code, .. }) if code == SERVER_UNPREDICTABLE_ERR => {
            StatusCode::BAD_GATEWAY
        }
        GatewayError::Rpc(RpcError::Remote { .. }) => StatusCode::UNAUTHORIZED,
        GatewayError::Rpc(_) | GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Maps errors to bare status responses; `dev` puts the error text in the body.
pub fn default_error_responder(dev: bool) -> ErrorResponder {
    Arc::new(move |err: &GatewayError| {
        let status = status_for(err);
        let body = if dev {
            err.to_string()
        } else {
            status.canonical_reason().unwrap_or_default().to_string()
        };
        let mut resp = Response::new(AxumBody::from(body));
        *resp.status_mut() = status;
        resp
    })
}
