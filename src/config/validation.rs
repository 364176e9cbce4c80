#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr};

use eyre::Result;

use crate::config::models::{
    GantryConfig, MatchRuleKind, RouteItem, RouterTableConfig, ServerConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
    if errors.len() == 1 {
        return errors[0].to_string();
    }
    let lines: Vec<String> = errors
        .iter()
        .enumerate()
        .map(|(i, e)| format!("  {}. {e}", i + 1))
        .collect();
    format!("{} errors:\n{}", errors.len(), lines.join("\n"))
}

fn finish(errors: Vec<ValidationError>) -> ValidationResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::ValidationFailed {
            message: format_multiple_errors(errors),
        })
    }
}

/// Application configuration validator
pub struct GantryConfigValidator;

impl GantryConfigValidator {
    /// Validate the entire application configuration
    pub fn validate(config: &GantryConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.app.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "app.name".to_string(),
            });
        }

        if config.app.graceful_exit_timeout_mills == 0 {
            errors.push(ValidationError::InvalidField {
                field: "app.graceful_exit_timeout_mills".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if let Some(addr) = &config.app.advertise_addr {
            if addr.parse::<SocketAddr>().is_err() {
                errors.push(ValidationError::InvalidField {
                    field: "app.advertise_addr".to_string(),
                    message: format!("'{addr}' must be in format 'IP:PORT'"),
                });
            }
        }

        errors.extend(Self::validate_server(&config.server));

        if config.routing_table.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routing_table".to_string(),
            });
        }

        if config
            .dynamic_config
            .as_deref()
            .is_some_and(|path| path.trim().is_empty())
        {
            errors.push(ValidationError::InvalidField {
                field: "dynamic_config".to_string(),
                message: "Path cannot be empty when set".to_string(),
            });
        }

        for (service, instances) in &config.discovery.services {
            if service.is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: "discovery.services".to_string(),
                    message: "Service names cannot be empty".to_string(),
                });
            }
            for instance in instances {
                if instance.ip.is_empty() || instance.port == 0 {
                    errors.push(ValidationError::InvalidField {
                        field: format!("discovery.services.{service}"),
                        message: format!("Instance '{}' needs an ip and a non-zero port", instance),
                    });
                }
            }
        }

        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&config.log.level) {
            errors.push(ValidationError::InvalidField {
                field: "log.level".to_string(),
                message: e.to_string(),
            });
        }

        finish(errors)
    }

    fn validate_server(server: &ServerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let address = server.listen_addr();
        if address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidListenAddress {
                address,
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }

        for (field, value) in [
            ("server.reload_shutdown_timeout_mills", server.reload_shutdown_timeout_mills),
            ("server.request_timeout_mills", server.request_timeout_mills),
            ("server.body_limit", server.body_limit as u64),
            ("server.concurrency", server.concurrency as u64),
        ] {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }
        errors
    }
}

/// Routing-table document validator
pub struct RouterTableValidator;

impl RouterTableValidator {
    /// Validate a routing-table document and its decoded route items
    pub fn validate(config: &RouterTableConfig) -> ValidationResult<()> {
        let items = config.to_route_items();
        if items.is_empty() {
            return Err(ValidationError::MissingField {
                field: "tables".to_string(),
            });
        }
        Self::validate_items(&items)
    }

    pub fn validate_items(items: &[RouteItem]) -> ValidationResult<()> {
        let mut errors = Vec::new();
        let mut services = HashSet::new();
        let mut paths = HashSet::new();

        for item in items {
            if item.service_name.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("tables[path={}].id", item.match_rule.path),
                });
            } else if !services.insert(item.service_name.as_str()) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("service '{}' is routed more than once", item.service_name),
                });
            }

            let path = item.match_rule.path.as_str();
            if !path.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("route path: {path}"),
                    message: "Route paths must start with '/'".to_string(),
                });
            } else if !paths.insert(path) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("path '{path}' is used by more than one route"),
                });
            }

            if let MatchRuleKind::PathRewrite { depth: 0 } = item.match_rule.kind {
                tracing::warn!(
                    "Route '{}' uses path_rewrite without a usable depth; the path is forwarded unchanged",
                    path
                );
            }

            if item.host_client.max_conns == 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{path}' maxConns"),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        finish(errors)
    }
}
