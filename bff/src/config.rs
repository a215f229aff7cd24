// src/config.rs
use crate::error::BffResult;
use serde::Deserialize;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen host (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 8080)
    pub port: u16,

    /// Worker threads, one event loop per core (default: CPU count)
    pub workers: usize,

    /// Connection records per worker (default: 4096)
    pub max_connections: usize,

    /// Records in the shared fallback pool (default: 4096)
    pub fallback_connections: usize,

    /// Request-phase timeout in milliseconds (default: 5000)
    pub request_timeout_ms: u64,

    /// Keep-alive idle timeout in milliseconds (default: 10000)
    pub keep_alive_timeout_ms: u64,

    /// Repeated-byte flood heuristic; policy, off by default
    pub repeat_guard: bool,
}

/// The subset of configuration each worker's event loop consumes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_connections: usize,
    pub request_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub repeat_guard: bool,
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> BffResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        Ok(Config {
            host: std::env::var("BFF_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("BFF_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            workers: std::env::var("BFF_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or_else(num_cpus::get),
            max_connections: std::env::var("BFF_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "4096".to_string())
                .parse()
                .unwrap_or(4096),
            fallback_connections: std::env::var("BFF_FALLBACK_CONNECTIONS")
                .unwrap_or_else(|_| "4096".to_string())
                .parse()
                .unwrap_or(4096),
            request_timeout_ms: std::env::var("BFF_REQUEST_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .unwrap_or(5000),
            keep_alive_timeout_ms: std::env::var("BFF_KEEPALIVE_TIMEOUT_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .unwrap_or(10000),
            repeat_guard: std::env::var("BFF_REPEAT_GUARD")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_connections: self.max_connections,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            keep_alive_timeout: Duration::from_millis(self.keep_alive_timeout_ms),
            repeat_guard: self.repeat_guard,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: num_cpus::get(),
            max_connections: 4096,
            fallback_connections: 4096,
            request_timeout_ms: 5000,
            keep_alive_timeout_ms: 10_000,
            repeat_guard: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.request_timeout_ms, 5000);
        assert_eq!(cfg.keep_alive_timeout_ms, 10_000);
        assert!(!cfg.repeat_guard);

        let engine = cfg.engine();
        assert_eq!(engine.request_timeout, Duration::from_secs(5));
        assert_eq!(engine.keep_alive_timeout, Duration::from_secs(10));
    }
}
