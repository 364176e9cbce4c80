pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{load_config, parse_dynamic_config, parse_router_table};
pub use models::*;
pub use validation::{
    GantryConfigValidator, RouterTableValidator, ValidationError, ValidationResult,
};
