pub mod backend_pool;
pub mod connection_pool;
pub mod hot_reload;
pub mod lifecycle;
pub mod load_balancer;
pub mod match_rule;
pub mod reconcile;
pub mod router;
pub mod rpc;
pub mod rpc_factory;

pub use backend_pool::BackendPool;
pub use connection_pool::{ConnectionPool, PooledConnection};
pub use hot_reload::{DispatcherError, HandlerTable, HotReloadServer};
pub use lifecycle::{ErrorReporter, Finalizer, Lifecycle, LifecycleError, ReleaseOutcome};
pub use load_balancer::LoadBalancerFactory;
pub use router::{GatewayOptions, GatewayRouter, RouterError};
pub use rpc_factory::RpcClientFactory;
