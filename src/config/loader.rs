//! Config struct and loading logic.
//!
//! Priority (highest to lowest):
//! 1. CLI flags (applied by the binary)
//! 2. Environment variables
//! 3. The config file (`--config`, else `config/config.toml` when present)
//! 4. Built-in defaults

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::AnalysisDefinition;
use crate::env::Env;

/// Errors during config loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tool: ToolConfig,
    pub concurrency: ConcurrencyConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub analyses: Vec<AnalysisDefinition>,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body, in MiB.
    pub max_upload_mb: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_upload_mb: 100,
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        usize::try_from(self.max_upload_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

/// External tool and sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub executable_path: PathBuf,
    /// Directory under which per-invocation sandboxes are created.
    pub sandbox_root: PathBuf,
    /// Directory where validated uploads are persisted.
    pub upload_dir: PathBuf,
    /// Hard wall-clock limit for one invocation.
    pub timeout_secs: u64,
    /// Output files larger than this (MiB) are discarded.
    pub max_output_mb: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            executable_path: PathBuf::from("network"),
            sandbox_root: PathBuf::from("./workspace/sandbox"),
            upload_dir: PathBuf::from("./workspace/uploads"),
            timeout_secs: 300,
            max_output_mb: 100,
        }
    }
}

impl ToolConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_output_bytes(&self) -> u64 {
        self.max_output_mb.saturating_mul(1024 * 1024)
    }
}

/// Admission and worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_workers: usize,
    pub max_queue_size: usize,
    /// Token refill rate per client, in requests per second.
    pub rate_limit_per_ip: f64,
    /// Bucket capacity per client. Defaults to twice the refill rate.
    pub burst: Option<u32>,
    /// Global cap on in-flight analysis requests.
    pub max_concurrent: usize,
    /// Tracked-client count above which the sweep reclaims limiter state.
    pub max_tracked_clients: usize,
    pub client_sweep_interval_secs: u64,
    /// Route executions through the bounded worker pool.
    pub use_worker_pool: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_queue_size: 1000,
            rate_limit_per_ip: 10.0,
            burst: None,
            max_concurrent: 50,
            max_tracked_clients: 1000,
            client_sweep_interval_secs: 300,
            use_worker_pool: false,
        }
    }
}

impl ConcurrencyConfig {
    /// Effective bucket capacity: the configured burst, or twice the rate.
    pub fn effective_burst(&self) -> u32 {
        self.burst
            .unwrap_or_else(|| (self.rate_limit_per_ip * 2.0).ceil().max(1.0) as u32)
    }

    pub fn client_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.client_sweep_interval_secs)
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Entry lifetime. Zero disables expiry.
    pub ttl_secs: u64,
    pub shards: usize,
    /// Background expiry sweep interval. Zero disables the sweeper.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            shards: 32,
            sweep_interval_secs: 0,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl Config {
    /// Load configuration with proper layering.
    ///
    /// An explicit `path` must exist. Without one, the default config path
    /// is used when present and built-in defaults otherwise. Environment
    /// overrides are applied last.
    pub fn load(path: Option<&Path>, env: &Env) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::load_file(p)?,
            None => {
                let default_path = Path::new(crate::constants::DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load_file(default_path)?
                } else {
                    Config::default()
                }
            }
        };

        config.apply_env_vars(env);
        Ok(config)
    }

    /// Load a config from a specific file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Look up an analysis definition by name.
    pub fn analysis(&self, name: &str) -> Option<&AnalysisDefinition> {
        self.analyses.iter().find(|a| a.name == name)
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.cache.shards == 0 {
            return invalid("cache.shards must be at least 1".into());
        }
        if self.concurrency.max_workers == 0 {
            return invalid("concurrency.max_workers must be at least 1".into());
        }
        if self.concurrency.max_queue_size == 0 {
            return invalid("concurrency.max_queue_size must be at least 1".into());
        }
        if self.concurrency.max_concurrent == 0 {
            return invalid("concurrency.max_concurrent must be at least 1".into());
        }
        let rate = self.concurrency.rate_limit_per_ip;
        if rate.is_nan() || rate <= 0.0 {
            return invalid("concurrency.rate_limit_per_ip must be positive".into());
        }
        if self.concurrency.effective_burst() == 0 {
            return invalid("concurrency.burst must be at least 1".into());
        }
        if self.concurrency.client_sweep_interval_secs == 0 {
            return invalid("concurrency.client_sweep_interval_secs must be at least 1".into());
        }
        if self.tool.timeout_secs == 0 {
            return invalid("tool.timeout_secs must be at least 1".into());
        }

        let mut seen = HashSet::new();
        for analysis in &self.analyses {
            analysis
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !seen.insert(analysis.name.as_str()) {
                return invalid(format!("duplicate analysis name: {}", analysis.name));
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides.
    fn apply_env_vars(&mut self, env: &Env) {
        use crate::constants::{
            ENV_EXECUTABLE, ENV_HOST, ENV_LOG_LEVEL, ENV_PORT, ENV_TIMEOUT_SECS,
        };

        if let Ok(val) = env.var(ENV_HOST) {
            self.server.host = val;
        }
        match env.parsed::<u16>(ENV_PORT) {
            Some(Ok(port)) => self.server.port = port,
            Some(Err(raw)) => tracing::warn!("ignoring invalid {ENV_PORT} value: {raw}"),
            None => {}
        }
        if let Ok(val) = env.var(ENV_EXECUTABLE) {
            self.tool.executable_path = PathBuf::from(val);
        }
        match env.parsed::<u64>(ENV_TIMEOUT_SECS) {
            Some(Ok(secs)) => self.tool.timeout_secs = secs,
            Some(Err(raw)) => tracing::warn!("ignoring invalid {ENV_TIMEOUT_SECS} value: {raw}"),
            None => {}
        }
        if let Ok(val) = env.var(ENV_LOG_LEVEL) {
            self.logging.level = val;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> Env {
        Env::mock(Vec::<(&str, &str)>::new())
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.tool.executable_path, PathBuf::from("network"));
        assert_eq!(config.tool.timeout(), Duration::from_secs(300));
        assert_eq!(config.cache.shards, 32);
        assert_eq!(config.cache.ttl(), Duration::from_secs(3600));
        assert_eq!(config.concurrency.max_concurrent, 50);
        assert_eq!(config.concurrency.effective_burst(), 20);
        assert!(config.concurrency.max_workers >= 1);
        assert!(config.analyses.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
port = 9000

[tool]
executable_path = "/opt/zeo/network"
timeout_secs = 60

[concurrency]
rate_limit_per_ip = 2.5
burst = 4
use_worker_pool = true

[cache]
ttl_secs = 0
shards = 8

[logging]
format = "pretty"

[[analyses]]
name = "pore_diameter"
args = ["-res", "output.res"]
outputs = ["output.res"]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.tool.executable_path, PathBuf::from("/opt/zeo/network"));
        assert_eq!(config.tool.timeout_secs, 60);
        assert_eq!(config.concurrency.effective_burst(), 4);
        assert!(config.concurrency.use_worker_pool);
        assert_eq!(config.cache.shards, 8);
        assert_eq!(config.cache.ttl_secs, 0);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.analyses.len(), 1);
        assert_eq!(config.analysis("pore_diameter").unwrap().outputs, vec!["output.res"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn burst_defaults_to_twice_the_rate() {
        let mut config = ConcurrencyConfig::default();
        config.rate_limit_per_ip = 0.4;
        assert_eq!(config.effective_burst(), 1);
        config.rate_limit_per_ip = 3.0;
        assert_eq!(config.effective_burst(), 6);
    }

    #[test]
    fn load_file_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid {{ toml").unwrap();

        let result = Config::load_file(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("parse"));
    }

    #[test]
    fn load_explicit_missing_file_errors() {
        let result = Config::load(Some(Path::new("/tmp/zeo_gateway_missing.toml")), &no_env());
        assert!(result.unwrap_err().to_string().contains("read"));
    }

    #[test]
    fn load_explicit_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 7000\nhost = \"127.0.0.1\"\n").unwrap();

        let env = Env::mock([
            ("ZEO_GATEWAY_PORT", "7100"),
            ("ZEO_GATEWAY_EXECUTABLE", "/usr/local/bin/network"),
            ("ZEO_GATEWAY_TIMEOUT_SECS", "12"),
            ("ZEO_GATEWAY_LOG_LEVEL", "debug"),
        ]);
        let config = Config::load(Some(&path), &env).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7100);
        assert_eq!(
            config.tool.executable_path,
            PathBuf::from("/usr/local/bin/network")
        );
        assert_eq!(config.tool.timeout_secs, 12);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env_vars(&Env::mock([
            ("ZEO_GATEWAY_PORT", "not-a-port"),
            ("ZEO_GATEWAY_TIMEOUT_SECS", "-3"),
        ]));
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.tool.timeout_secs, 300);
    }

    #[test]
    fn validate_rejects_zero_shards_and_slots() {
        let mut config = Config::default();
        config.cache.shards = 0;
        assert!(config.validate().unwrap_err().to_string().contains("shards"));

        let mut config = Config::default();
        config.concurrency.max_concurrent = 0;
        assert!(config.validate().unwrap_err().to_string().contains("max_concurrent"));

        let mut config = Config::default();
        config.concurrency.rate_limit_per_ip = 0.0;
        assert!(config.validate().unwrap_err().to_string().contains("rate_limit"));
    }

    #[test]
    fn validate_rejects_zero_client_sweep_interval() {
        let config: Config = toml::from_str("[concurrency]\nclient_sweep_interval_secs = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("client_sweep_interval_secs"));

        let mut config = Config::default();
        config.concurrency.client_sweep_interval_secs = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_analyses() {
        let mut config = Config::default();
        let def = AnalysisDefinition {
            name: "sa".into(),
            description: None,
            args: vec!["-sa".into(), "1.21".into(), "out.sa".into()],
            outputs: vec!["out.sa".into()],
            params: Vec::new(),
        };
        config.analyses = vec![def.clone(), def];
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn server_limits() {
        let server = ServerConfig::default();
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(server.max_upload_bytes(), 100 * 1024 * 1024);
        assert_eq!(ToolConfig::default().max_output_bytes(), 100 * 1024 * 1024);
    }
}
