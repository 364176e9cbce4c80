pub mod graceful_shutdown;
pub mod observer;

pub use graceful_shutdown::{GracefulShutdown, ShutdownReason};
pub use observer::{Observer, ObserverRegistry};
