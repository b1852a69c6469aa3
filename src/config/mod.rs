// ABOUTME: Engine configuration and logging setup
// ABOUTME: Configuration is injected into the runtime; nothing here is global besides the subscriber

pub mod error;
pub mod logging;
pub mod settings;

pub use error::ConfigError;
pub use logging::init_logging;
pub use settings::{EngineConfig, LoggingConfig};
