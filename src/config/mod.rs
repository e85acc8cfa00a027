//! Configuration Management Module
//!
//! Loads the console config file: gateway, pool, session and monitoring
//! settings plus the host list for the built-in registry.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_path, ConfigError, ConfigStorage, CONFIG_ENV};
pub use types::{ConsoleConfig, CONFIG_VERSION};
