//! Configuration data structures for Gantry.
//!
//! Two documents live here. The application config (`GantryConfig`) is loaded
//! from YAML / JSON / TOML by the `config` crate and uses snake_case keys. The
//! routing-table document (`RouterTableConfig`) is the camelCase JSON published
//! by the configuration center and is decoded into typed [`RouteItem`]s before
//! anything else sees it.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ports::discovery::{DiscoveryExtra, Instance};

pub const DEFAULT_MAX_CONNS: usize = 256;
pub const DEFAULT_MAX_IDLE_CONN_DURATION_MILLS: u64 = 120_000;
pub const DEFAULT_MAX_CONN_DURATION_MILLS: u64 = 150_000;
pub const DEFAULT_READ_TIMEOUT_MILLS: u64 = 10_500;
pub const DEFAULT_WRITE_TIMEOUT_MILLS: u64 = 10_500;
pub const DEFAULT_MAX_CONN_WAIT_TIMEOUT_MILLS: u64 = 5_000;
pub const DEFAULT_MAX_RESPONSE_BODY_SIZE: usize = 2 * 1024 * 1024;

/// Extra time granted on top of the slower of read/write timeouts for a whole exchange.
pub const UPSTREAM_TIMEOUT_SLACK: Duration = Duration::from_millis(1_500);

/// Match rule type that strips leading path segments.
pub const PATH_REWRITE_RULE_TYPE: &str = "path_rewrite";

// ---------------------------------------------------------------------------
// Routing-table document
// ---------------------------------------------------------------------------

/// Per-upstream transport parameters as they appear on the wire. Zero means "inherit".
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct UpstreamClientConfig {
    pub max_conns: usize,
    pub max_idle_conn_duration_mills: u64,
    pub max_conn_duration_mills: u64,
    pub read_timeout_mills: u64,
    pub write_timeout_mills: u64,
    pub max_response_body_size: usize,
    pub max_conn_wait_timeout_mills: u64,
}

fn or_default<T: PartialEq + Default>(value: T, fallback: T) -> T {
    if value == T::default() { fallback } else { value }
}

impl UpstreamClientConfig {
    /// Fill every zero field with the built-in default.
    pub fn with_defaults(self) -> Self {
        Self {
            max_conns: or_default(self.max_conns, DEFAULT_MAX_CONNS),
            max_idle_conn_duration_mills: or_default(
                self.max_idle_conn_duration_mills,
                DEFAULT_MAX_IDLE_CONN_DURATION_MILLS,
            ),
            max_conn_duration_mills: or_default(
                self.max_conn_duration_mills,
                DEFAULT_MAX_CONN_DURATION_MILLS,
            ),
            read_timeout_mills: or_default(self.read_timeout_mills, DEFAULT_READ_TIMEOUT_MILLS),
            write_timeout_mills: or_default(self.write_timeout_mills, DEFAULT_WRITE_TIMEOUT_MILLS),
            max_response_body_size: or_default(
                self.max_response_body_size,
                DEFAULT_MAX_RESPONSE_BODY_SIZE,
            ),
            max_conn_wait_timeout_mills: or_default(
                self.max_conn_wait_timeout_mills,
                DEFAULT_MAX_CONN_WAIT_TIMEOUT_MILLS,
            ),
        }
    }

    /// Resolve a per-route config against the (already defaulted) common config.
    ///
    /// Only one level of merge happens: a zero field takes the common value.
    pub fn resolve(&self, common: &UpstreamClientConfig) -> HostClientConfig {
        HostClientConfig {
            max_conns: or_default(self.max_conns, common.max_conns),
            max_idle_conn_duration: Duration::from_millis(or_default(
                self.max_idle_conn_duration_mills,
                common.max_idle_conn_duration_mills,
            )),
            max_conn_duration: Duration::from_millis(or_default(
                self.max_conn_duration_mills,
                common.max_conn_duration_mills,
            )),
            read_timeout: Duration::from_millis(or_default(
                self.read_timeout_mills,
                common.read_timeout_mills,
            )),
            write_timeout: Duration::from_millis(or_default(
                self.write_timeout_mills,
                common.write_timeout_mills,
            )),
            max_response_body_size: or_default(
                self.max_response_body_size,
                common.max_response_body_size,
            ),
            max_conn_wait_timeout: Duration::from_millis(or_default(
                self.max_conn_wait_timeout_mills,
                common.max_conn_wait_timeout_mills,
            )),
        }
    }
}

/// Wire form of a match rule: `{type, path, args}`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RouteMatchRule {
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub rule_type: String,
    pub path: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub args: serde_json::Map<String, Value>,
}

/// One entry of the routing-table document.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TableItem {
    /// Upstream service name
    pub id: String,
    pub match_rule: RouteMatchRule,
    pub upstream_client_config: UpstreamClientConfig,
}

/// The routing-table document published under `router-tables.json`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RouterTableConfig {
    #[serde(
        rename = "commonUpstreamClientCfg",
        alias = "commonUpstreamClientConfig"
    )]
    pub common_upstream_client_config: UpstreamClientConfig,
    pub tables: Vec<TableItem>,
}

impl RouterTableConfig {
    /// Decode the wire document into typed route items.
    ///
    /// Returns an empty list when the document has no tables.
    pub fn to_route_items(&self) -> Vec<RouteItem> {
        if self.tables.is_empty() {
            return Vec::new();
        }

        let common = self.common_upstream_client_config.with_defaults();
        self.tables
            .iter()
            .map(|table| RouteItem {
                service_name: table.id.clone(),
                match_rule: MatchRule::from_wire(&table.match_rule),
                host_client: table.upstream_client_config.resolve(&common),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Typed routing model
// ---------------------------------------------------------------------------

/// Resolved transport parameters of one upstream service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostClientConfig {
    pub max_conns: usize,
    pub max_idle_conn_duration: Duration,
    pub max_conn_duration: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_response_body_size: usize,
    pub max_conn_wait_timeout: Duration,
}

impl Default for HostClientConfig {
    fn default() -> Self {
        UpstreamClientConfig::default().resolve(&UpstreamClientConfig::default().with_defaults())
    }
}

impl HostClientConfig {
    /// Upper bound for a whole request/response exchange.
    pub fn exchange_timeout(&self) -> Duration {
        self.read_timeout.max(self.write_timeout) + UPSTREAM_TIMEOUT_SLACK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchRuleKind {
    /// Forward the path unchanged
    #[default]
    Plain,
    /// Strip the first `depth` path segments before forwarding
    PathRewrite { depth: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRule {
    pub path: String,
    pub kind: MatchRuleKind,
}

impl MatchRule {
    pub fn plain(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: MatchRuleKind::Plain,
        }
    }

    pub fn path_rewrite(path: impl Into<String>, depth: usize) -> Self {
        Self {
            path: path.into(),
            kind: MatchRuleKind::PathRewrite { depth },
        }
    }

    pub fn from_wire(rule: &RouteMatchRule) -> Self {
        let kind = if rule.rule_type == PATH_REWRITE_RULE_TYPE {
            MatchRuleKind::PathRewrite {
                depth: depth_from_args(&rule.args),
            }
        } else {
            MatchRuleKind::Plain
        };

        Self {
            path: rule.path.clone(),
            kind,
        }
    }
}

/// `depth` may be a JSON number or a numeric string; anything else is 0.
fn depth_from_args(args: &serde_json::Map<String, Value>) -> usize {
    match args.get("depth") {
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                v as usize
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f > 0.0)
                    .map_or(0, |f| f as usize)
            }
        }
        Some(Value::String(s)) => s.trim().parse::<usize>().unwrap_or(0),
        _ => 0,
    }
}

/// A typed routing entry: one upstream service behind one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteItem {
    pub service_name: String,
    pub match_rule: MatchRule,
    pub host_client: HostClientConfig,
}

/// Runtime-tunable document published under `dynamic-config.yaml`.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DynamicConfig {
    /// Module path to level, e.g. `gantry::core: debug`
    #[serde(rename = "log-level")]
    pub log_level: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Application config
// ---------------------------------------------------------------------------

/// Load balancing strategy for selecting connections
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Round-robin selection
    #[default]
    RoundRobin,
    /// Random selection
    Random,
}

/// What a non-empty RPC pool does when discovery reports zero instances.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmptySnapshotPolicy {
    /// Keep the existing connections
    #[default]
    KeepStale,
    /// Close every connection and report `NoInstance` until instances return
    CloseAll,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Dev,
    Test,
    Prod,
}

impl Profile {
    /// Error details are only exposed to clients outside production.
    pub fn is_dev(self) -> bool {
        !matches!(self, Profile::Prod)
    }
}

/// Application identity and shutdown budget
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub profile: Profile,
    /// Budget for pre-hooks, finalizer release and post-hooks together
    pub graceful_exit_timeout_mills: u64,
    /// `ip:port` to register this gateway under; registration is skipped when absent
    pub advertise_addr: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "gantry".to_string(),
            profile: Profile::Dev,
            graceful_exit_timeout_mills: 30_000,
            advertise_addr: None,
        }
    }
}

impl AppConfig {
    pub fn graceful_exit_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_exit_timeout_mills)
    }
}

/// Hot-reload dispatcher settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds an ephemeral port
    pub port: u16,
    /// How long a replaced handler table may keep draining in-flight requests
    pub reload_shutdown_timeout_mills: u64,
    pub request_timeout_mills: u64,
    pub body_limit: usize,
    pub concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            reload_shutdown_timeout_mills: 30_000,
            request_timeout_mills: 11_000,
            body_limit: 2 * 1024 * 1024,
            concurrency: 256 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reload_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.reload_shutdown_timeout_mills)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_mills)
    }
}

/// Settings shared by every pooled RPC client
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RpcClientConfig {
    pub dial_timeout_mills: u64,
    pub load_balance: LoadBalanceStrategy,
    pub empty_snapshot_policy: EmptySnapshotPolicy,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout_mills: 3_000,
            load_balance: LoadBalanceStrategy::RoundRobin,
            empty_snapshot_policy: EmptySnapshotPolicy::KeepStale,
        }
    }
}

impl RpcClientConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_mills)
    }
}

/// Discovery scoping plus statically seeded instances
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub cluster_name: String,
    pub group_name: String,
    pub services: HashMap<String, Vec<Instance>>,
}

impl DiscoveryConfig {
    pub fn extra(&self) -> DiscoveryExtra {
        DiscoveryExtra {
            cluster_name: self.cluster_name.clone(),
            group_name: self.group_name.clone(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `info,gantry::core=debug`
    pub level: String,
    /// JSON lines instead of the pretty console format
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Root application configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GantryConfig {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub discovery: DiscoveryConfig,
    /// Path of the routing-table JSON document
    pub routing_table: String,
    /// Optional path of the runtime-tunable YAML document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_config: Option<String>,
    pub log: LogConfig,
}

impl Default for GantryConfig {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            server: ServerConfig::default(),
            discovery: DiscoveryConfig::default(),
            routing_table: "router-tables.json".to_string(),
            dynamic_config: None,
            log: LogConfig::default(),
        }
    }
}
