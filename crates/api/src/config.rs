use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use meshgen_pipeline::pool::PoolConfig;
use meshgen_pipeline::status_table::RetentionPolicy;
use meshgen_pipeline::worker::WorkerSettings;

/// Base64 inflates images by a third; 32 MiB admits roughly 24 MB images.
const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development next to a
/// ComfyUI instance on the default port.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8001`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Largest accepted request body in bytes (default: 32 MiB).
    pub max_body_bytes: usize,
    /// Grace period for running jobs during shutdown (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Directory ComfyUI writes models into, served under `/static`.
    pub output_dir: PathBuf,
    /// Parent of the per-request staging directories.
    pub staging_dir: PathBuf,
    /// ComfyUI `host:port`.
    pub comfyui_address: String,
    pub workflow_path: PathBuf,
    pub workflow_seed_node: String,
    pub workflow_image_node: String,
    pub max_workers: usize,
    pub queue_capacity: usize,
    /// Accepted bearer tokens. Empty rejects every request.
    pub valid_tokens: HashSet<String>,
    pub completion_timeout_secs: u64,
    pub settle_delay_ms: u64,
    pub status_ttl_secs: u64,
    pub status_capacity: usize,
}

/// A malformed configuration value.
#[derive(Debug, thiserror::Error)]
#[error("{var} has invalid value '{value}': {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                                       |
    /// |--------------------------|-----------------------------------------------|
    /// | `HOST`                   | `0.0.0.0`                                     |
    /// | `PORT`                   | `8001`                                        |
    /// | `CORS_ORIGINS`           | `http://localhost:5173,http://localhost:3000` |
    /// | `REQUEST_TIMEOUT_SECS`   | `30`                                          |
    /// | `MAX_BODY_BYTES`         | `33554432`                                    |
    /// | `SHUTDOWN_TIMEOUT_SECS`  | `30`                                          |
    /// | `LOCAL_OUTPUT_DIR`       | `/output`                                     |
    /// | `STAGING_DIR`            | `/tmp`                                        |
    /// | `COMFYUI_SERVER_ADDRESS` | `127.0.0.1:8188`                              |
    /// | `WORKFLOW_PATH`          | `workflow.json`                               |
    /// | `WORKFLOW_SEED_NODE`     | `7`                                           |
    /// | `WORKFLOW_IMAGE_NODE`    | `2`                                           |
    /// | `MAX_WORKERS`            | `4`                                           |
    /// | `QUEUE_CAPACITY`         | `64`                                          |
    /// | `VALID_TOKENS`           | *(empty)*                                     |
    /// | `COMPLETION_TIMEOUT_SECS`| `600`                                         |
    /// | `SETTLE_DELAY_MS`        | `3000`                                        |
    /// | `STATUS_TTL_SECS`        | `86400`                                       |
    /// | `STATUS_CAPACITY`        | `10000`                                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |var: &str, default: &str| lookup(var).unwrap_or_else(|| default.to_string());

        Ok(Self {
            host: string("HOST", "0.0.0.0"),
            port: parse(&lookup, "PORT", 8001)?,
            cors_origins: list(&string(
                "CORS_ORIGINS",
                "http://localhost:5173,http://localhost:3000",
            )),
            request_timeout_secs: parse(&lookup, "REQUEST_TIMEOUT_SECS", 30)?,
            max_body_bytes: parse(&lookup, "MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?,
            shutdown_timeout_secs: parse(&lookup, "SHUTDOWN_TIMEOUT_SECS", 30)?,
            output_dir: string("LOCAL_OUTPUT_DIR", "/output").into(),
            staging_dir: string("STAGING_DIR", "/tmp").into(),
            comfyui_address: string("COMFYUI_SERVER_ADDRESS", "127.0.0.1:8188"),
            workflow_path: string("WORKFLOW_PATH", "workflow.json").into(),
            workflow_seed_node: string("WORKFLOW_SEED_NODE", "7"),
            workflow_image_node: string("WORKFLOW_IMAGE_NODE", "2"),
            max_workers: parse(&lookup, "MAX_WORKERS", 4)?,
            queue_capacity: parse(&lookup, "QUEUE_CAPACITY", 64)?,
            valid_tokens: list(&string("VALID_TOKENS", "")).into_iter().collect(),
            completion_timeout_secs: parse(&lookup, "COMPLETION_TIMEOUT_SECS", 600)?,
            settle_delay_ms: parse(&lookup, "SETTLE_DELAY_MS", 3000)?,
            status_ttl_secs: parse(&lookup, "STATUS_TTL_SECS", 86_400)?,
            status_capacity: parse(&lookup, "STATUS_CAPACITY", 10_000)?,
        })
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            staging_root: self.staging_dir.clone(),
            output_dir: self.output_dir.clone(),
            completion_timeout: Duration::from_secs(self.completion_timeout_secs),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_workers: self.max_workers,
            queue_capacity: self.queue_capacity,
            shutdown_grace: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            ttl: Duration::from_secs(self.status_ttl_secs),
            capacity: self.status_capacity,
        }
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

/// Split a comma-separated list, dropping blanks.
fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 8001);
        assert_eq!(config.comfyui_address, "127.0.0.1:8188");
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.completion_timeout_secs, 600);
        assert_eq!(config.cors_origins.len(), 2);
        assert_eq!(config.max_body_bytes, 33_554_432);
        assert!(config.valid_tokens.is_empty());
        assert_eq!(config.worker_settings().settle_delay, Duration::from_secs(3));
    }

    #[test]
    fn tokens_are_split_and_trimmed() {
        let config = config_from(&[("VALID_TOKENS", "alpha, beta,,")]).unwrap();
        assert_eq!(config.valid_tokens.len(), 2);
        assert!(config.valid_tokens.contains("alpha"));
        assert!(config.valid_tokens.contains("beta"));
    }

    #[test]
    fn body_limit_is_configurable() {
        let config = config_from(&[("MAX_BODY_BYTES", "1048576")]).unwrap();
        assert_eq!(config.max_body_bytes, 1_048_576);
    }

    #[test]
    fn bad_number_is_an_error() {
        let err = config_from(&[("MAX_WORKERS", "many")]).unwrap_err();
        assert_eq!(err.var, "MAX_WORKERS");
        assert_eq!(err.value, "many");
    }
}
