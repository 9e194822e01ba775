pub mod env;
pub mod error;

pub use env::{
    AppConfig, BusConfig, LoggingConfig, StackConfig, StoreConfig, DEFAULT_EVENT_BINDINGS,
};
pub use error::ConfigError;
