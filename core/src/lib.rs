//! Top-level orchestration: the single-flight refresh controller, the
//! background import tracker, and application configuration.

pub mod config;
pub mod import;
pub mod refresh;

pub use config::{Config, ConfigError};
pub use import::ImportTracker;
pub use refresh::RefreshController;
