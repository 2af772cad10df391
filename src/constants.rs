//! App-wide constants.
//!
//! Centralises the service name, config paths, environment variable names,
//! and the fixed limits of the admission and execution layers so a change
//! only requires touching this file.

use std::time::Duration;

/// Display name of the service (lowercase).
pub const APP_NAME: &str = "zeo-gateway";

/// Human-readable service title used on the landing endpoint.
pub const APP_TITLE: &str = "Zeo++ Analysis API";

/// Crate version baked in at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Config file consulted when no `--config` flag is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Multipart field carrying the uploaded structure file.
pub const UPLOAD_FIELD: &str = "structure_file";

// ── Admission ───────────────────────────────────────────────────────

/// Advisory retry interval returned with a per-client rate-limit rejection.
pub const RATE_LIMIT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Advisory retry interval returned when the global slot pool is exhausted.
pub const OVERLOAD_RETRY_AFTER: Duration = Duration::from_secs(5);

// ── Execution ───────────────────────────────────────────────────────

/// Upper bound on combined stdout/stderr read back from a run (1 MiB).
pub const MAX_CAPTURE_BYTES: u64 = 1024 * 1024;

/// Name of the combined-output capture file inside a sandbox.
pub const CAPTURE_FILENAME: &str = ".combined-output.log";

/// Uploads older than this are removed by the startup sweep.
pub const STALE_UPLOAD_AGE: Duration = Duration::from_secs(24 * 60 * 60);

// ── Environment variable names ──────────────────────────────────────

pub const ENV_HOST: &str = "ZEO_GATEWAY_HOST";
pub const ENV_PORT: &str = "ZEO_GATEWAY_PORT";
pub const ENV_EXECUTABLE: &str = "ZEO_GATEWAY_EXECUTABLE";
pub const ENV_TIMEOUT_SECS: &str = "ZEO_GATEWAY_TIMEOUT_SECS";
pub const ENV_LOG_LEVEL: &str = "ZEO_GATEWAY_LOG_LEVEL";
