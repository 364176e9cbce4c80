use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Uri};
use uuid::Uuid;

use crate::{
    config::models::{MatchRule, MatchRuleKind},
    ports::http_server::{GatewayError, RequestModifier, RouteMeta},
};

/// Drop the first `depth` segments of `path`.
///
/// Keeps everything from the `depth + 1`-th slash; when there is no such
/// slash the result is `/`.
pub fn rewrite_path(path: &str, depth: usize) -> &str {
    if depth == 0 {
        return path;
    }
    match path.match_indices('/').nth(depth) {
        Some((idx, _)) => &path[idx..],
        None => "/",
    }
}

/// Rewrites the request path and tags the request with [`RouteMeta`]
pub struct PathRewrite {
    service_id: String,
    depth: usize,
}

impl PathRewrite {
    pub fn new(service_id: impl Into<String>, depth: usize) -> Self {
        Self {
            service_id: service_id.into(),
            depth,
        }
    }
}

#[async_trait]
impl RequestModifier for PathRewrite {
    async fn modify_request(&self, req: &mut Request<AxumBody>) -> Result<(), GatewayError> {
        let routed_path = rewrite_path(req.uri().path(), self.depth).to_string();
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{routed_path}?{query}"),
            None => routed_path.clone(),
        };

        let mut parts = req.uri().clone().into_parts();
        parts.path_and_query = Some(
            path_and_query
                .parse()
                .map_err(|e| GatewayError::BadRequest(format!("rewritten path: {e}")))?,
        );
        *req.uri_mut() = Uri::from_parts(parts)
            .map_err(|e| GatewayError::BadRequest(format!("rewritten uri: {e}")))?;

        req.extensions_mut().insert(RouteMeta {
            service_id: self.service_id.clone(),
            routed_path,
            request_id: Uuid::new_v4().simple().to_string(),
        });
        Ok(())
    }
}

/// The handler implied by a match rule, if it does anything.
pub fn create_rule_handler(service_id: &str, rule: &MatchRule) -> Option<Arc<dyn RequestModifier>> {
    match rule.kind {
        MatchRuleKind::PathRewrite { depth } if depth > 0 => {
            Some(Arc::new(PathRewrite::new(service_id, depth)))
        }
        MatchRuleKind::PathRewrite { .. } => {
            tracing::warn!(
                "Path rewrite of {} has no usable depth, forwarding {} unchanged",
                service_id,
                rule.path
            );
            None
        }
        MatchRuleKind::Plain => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_path() {
        assert_eq!(rewrite_path("/api/orders/list", 0), "/api/orders/list");
        assert_eq!(rewrite_path("/api/orders/list", 1), "/orders/list");
        assert_eq!(rewrite_path("/api/orders/list", 2), "/list");
        assert_eq!(rewrite_path("/api/orders/list", 3), "/");
        assert_eq!(rewrite_path("/api/orders/", 2), "/");
        assert_eq!(rewrite_path("/api", 1), "/");
        assert_eq!(rewrite_path("/", 4), "/");
    }

    #[tokio::test]
    async fn test_path_rewrite_keeps_query_and_tags_request() {
        let handler = create_rule_handler("orders", &MatchRule::path_rewrite("/orders/*", 1))
            .unwrap();
        let mut req = Request::builder()
            .uri("http://gateway.local/orders/v1/items?page=2")
            .body(AxumBody::empty())
            .unwrap();

        handler.modify_request(&mut req).await.unwrap();

        assert_eq!(req.uri().path(), "/v1/items");
        assert_eq!(req.uri().query(), Some("page=2"));
        assert_eq!(req.uri().host(), Some("gateway.local"));
        let meta = req.extensions().get::<RouteMeta>().unwrap();
        assert_eq!(meta.service_id, "orders");
        assert_eq!(meta.routed_path, "/v1/items");
        assert_eq!(meta.request_id.len(), 32);
        assert!(meta.request_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_origin_form_uri() {
        let handler = PathRewrite::new("users", 2);
        let mut req = Request::builder()
            .uri("/api/users")
            .body(AxumBody::empty())
            .unwrap();
        handler.modify_request(&mut req).await.unwrap();
        assert_eq!(req.uri(), "/");
    }

    #[test]
    fn test_only_rewrite_rules_with_depth_get_handlers() {
        assert!(create_rule_handler("a", &MatchRule::plain("/a/*")).is_none());
        assert!(create_rule_handler("a", &MatchRule::path_rewrite("/a/*", 0)).is_none());
        assert!(create_rule_handler("a", &MatchRule::path_rewrite("/a/*", 1)).is_some());
    }
}
