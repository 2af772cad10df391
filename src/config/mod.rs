//! Configuration loading and layering.
//!
//! Handles TOML config loading, environment variable resolution,
//! and validation. Configuration is read once at startup.

pub mod loader;

pub use loader::{
    CacheConfig, ConcurrencyConfig, Config, ConfigError, LogFormat, LoggingConfig, ServerConfig,
    ToolConfig,
};
