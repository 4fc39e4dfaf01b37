pub mod mapping;
pub mod models;

pub use mapping::{Mapping, MappingError};
pub use models::{ConfigError, RunConfig, KEEPALIVE_PERIOD, SHUTDOWN_GRACE};
