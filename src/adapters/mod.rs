pub mod auto_registration;
pub mod config_receiver;
pub mod file_config;
pub mod hyper_transport;
pub mod in_memory_discovery;
pub mod modifiers;

/// Re-export commonly used types from adapters
pub use auto_registration::AutoRegistration;
pub use config_receiver::{ConfigStore, GatewayConfigurationReceiver};
pub use file_config::FileConfigProvider;
pub use hyper_transport::{HyperHostClient, HyperTransportFactory};
pub use in_memory_discovery::InMemoryDiscovery;
pub use modifiers::{RequestIdHeader, RpcAuth, default_error_responder};
