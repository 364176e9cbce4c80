//! Gantry - a discovery-driven runtime for microservices.
//!
//! Gantry keeps three things in sync with a service-discovery backend:
//!
//! - an HTTP gateway whose whole routing table can be swapped at runtime
//!   without dropping in-flight requests,
//! - pooled RPC clients with one live connection per discovered instance,
//! - an ordered finalizer that tears everything down in reverse acquisition
//!   order under a single deadline.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use gantry::{
//!     adapters::{HyperTransportFactory, InMemoryDiscovery, default_error_responder},
//!     config::{ServerConfig, loader::load_router_table},
//!     core::{ErrorReporter, GatewayOptions, GatewayRouter},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let table = load_router_table("router-tables.json").await?;
//! let (reporter, _errors) = ErrorReporter::channel(8);
//! let options = GatewayOptions::new(
//!     Arc::new(InMemoryDiscovery::new()),
//!     Arc::new(HyperTransportFactory),
//!     default_error_responder(true),
//! );
//! let router = GatewayRouter::start(
//!     table.to_route_items(),
//!     &ServerConfig::default(),
//!     reporter,
//!     options,
//! )
//! .await?;
//! println!("listening on {:?}", router.local_addr());
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! **ports** hold the traits of external collaborators (discovery, registry,
//! RPC transport, upstream HTTP transport, configuration center). **adapters**
//! implement them. The algorithms (reconciliation, pools, load balancing,
//! hot reload, finalizer) live in **core**. [`app::AppContext`] is the
//! composition root used by the `gantry` binary.
//!
//! # Error Handling
//! Every module has its own `thiserror` enum; the binary and the composition
//! root work with `eyre::Result`.
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap`, hot-swapped state uses `arc_swap`.
pub mod app;
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::{
    app::{AppContext, ExitReason, ShutdownReport},
    core::{ConnectionPool, Finalizer, GatewayRouter, Lifecycle, RpcClientFactory},
    ports::discovery::{Discovery, Instance},
    utils::GracefulShutdown,
};
