pub mod config_provider;
pub mod discovery;
pub mod http_client;
pub mod http_server;
pub mod registry;
pub mod rpc;
