//! Configuration Module
//!
//! Handles loading and managing server configuration from environment variables.

use std::env;

/// Server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port
    pub server_port: u16,
    /// Cleanup sweep interval in seconds
    pub cleanup_interval: u64,
    /// Redis connection URL; empty disables the durable backend entirely
    pub redis_url: Option<String>,
    /// Namespace prefix for durable cache keys
    pub cache_prefix: String,
    /// Default lifetime of a freshly issued pickup code, in seconds
    pub default_code_ttl: u64,
    /// Default usage limit for a pickup code (999 = unlimited)
    pub default_limit_count: u32,
    /// Seconds an upload buffer may sit idle before the sweep drops it
    pub upload_idle_secs: i64,
    /// Seconds a download window may sit idle before the sweep drops it
    pub download_idle_secs: i64,
    /// Chunks read ahead of the receiver's position on a single-chunk download
    pub preload_count: u32,
    /// Chunks read ahead after a batch download
    pub batch_preload_count: u32,
    /// Lifetime of a negative ("known dead") mapping entry, in seconds
    pub negative_mapping_ttl: i64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SERVER_PORT` - HTTP server port (default: 8000)
    /// - `CLEANUP_INTERVAL` - Sweep frequency in seconds (default: 60)
    /// - `REDIS_URL` - Durable backend URL (default: unset, in-process only)
    /// - `CACHE_PREFIX` - Durable key namespace (default: "flashdrop")
    /// - `DEFAULT_CODE_TTL` - Pickup code lifetime in seconds (default: 1800)
    /// - `DEFAULT_LIMIT_COUNT` - Pickup code usage limit (default: 3)
    /// - `UPLOAD_IDLE_SECS` - Upload buffer inactivity window (default: 3600)
    /// - `DOWNLOAD_IDLE_SECS` - Download window inactivity window (default: 600)
    /// - `PRELOAD_COUNT` - Read-ahead depth per chunk download (default: 10)
    /// - `BATCH_PRELOAD_COUNT` - Read-ahead depth after a batch (default: 25)
    /// - `NEGATIVE_MAPPING_TTL` - Negative mapping entry lifetime (default: 60)
    pub fn from_env() -> Self {
        Self {
            server_port: parse_env("SERVER_PORT", 8000),
            cleanup_interval: parse_env("CLEANUP_INTERVAL", 60),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            cache_prefix: env::var("CACHE_PREFIX").unwrap_or_else(|_| "flashdrop".to_string()),
            default_code_ttl: parse_env("DEFAULT_CODE_TTL", 1800),
            default_limit_count: parse_env("DEFAULT_LIMIT_COUNT", 3),
            upload_idle_secs: parse_env("UPLOAD_IDLE_SECS", 3600),
            download_idle_secs: parse_env("DOWNLOAD_IDLE_SECS", 600),
            preload_count: parse_env("PRELOAD_COUNT", 10),
            batch_preload_count: parse_env("BATCH_PRELOAD_COUNT", 25),
            negative_mapping_ttl: parse_env("NEGATIVE_MAPPING_TTL", 60),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 8000,
            cleanup_interval: 60,
            redis_url: None,
            cache_prefix: "flashdrop".to_string(),
            default_code_ttl: 1800,
            default_limit_count: 3,
            upload_idle_secs: 3600,
            download_idle_secs: 600,
            preload_count: 10,
            batch_preload_count: 25,
            negative_mapping_ttl: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server_port, 8000);
        assert_eq!(config.cleanup_interval, 60);
        assert!(config.redis_url.is_none());
        assert_eq!(config.cache_prefix, "flashdrop");
        assert_eq!(config.default_limit_count, 3);
        assert_eq!(config.preload_count, 10);
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        env::remove_var("SERVER_PORT");
        env::remove_var("CLEANUP_INTERVAL");
        env::remove_var("REDIS_URL");
        env::remove_var("CACHE_PREFIX");

        let config = Config::from_env();
        assert_eq!(config.server_port, 8000);
        assert_eq!(config.cleanup_interval, 60);
        assert!(config.redis_url.is_none());
        assert_eq!(config.cache_prefix, "flashdrop");
    }
}
