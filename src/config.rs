use std::env;
use std::path::PathBuf;

use dotenvy::dotenv;

use crate::constants::DEFAULT_CLIENT_ID;
use crate::error::ProxyError;

/// CORS configuration mode
#[derive(Debug, Clone)]
pub enum CorsMode {
    /// Only allow localhost origins (default, for local development)
    LocalhostOnly,
    /// Allow all origins (for deployments fronted by client API keys)
    AllowAll,
    /// Allow specific origins (comma-separated list)
    AllowList(Vec<String>),
}

/// Per-candidate retry policy for 5xx/network failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1000,
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry `k` (0-based): delay_ms * backoff^k.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let ms = self.delay_ms as f64 * self.backoff.powi(attempt as i32);
        std::time::Duration::from_millis(ms as u64)
    }
}

/// Selector algorithm. Only session affinity is supported in v1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Session,
}

pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub client_id: String,
    pub strategy: Strategy,
    pub session_duration_ms: u64,
    pub retry: RetryPolicy,
    pub data_retention_days: u32,
    pub request_retention_days: u32,
    pub default_agent_model: Option<String>,
    pub max_body_bytes: usize,
    pub cors_mode: CorsMode,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, ProxyError> {
        dotenv().ok();

        let host = env::var("LLM_BALANCER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("LLM_BALANCER_PORT", 8080);

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llm-balancer");

        let client_id =
            env::var("LLM_BALANCER_CLIENT_ID").unwrap_or_else(|_| DEFAULT_CLIENT_ID.to_string());

        let strategy = match env::var("LLM_BALANCER_STRATEGY").as_deref() {
            Ok("session") | Err(_) => Strategy::Session,
            Ok(other) => {
                return Err(ProxyError::ConfigError(format!(
                    "unsupported strategy {other:?}; only \"session\" is supported"
                )));
            }
        };

        let retry = RetryPolicy {
            attempts: env_parse("LLM_BALANCER_RETRY_ATTEMPTS", 3),
            delay_ms: env_parse("LLM_BALANCER_RETRY_DELAY_MS", 1000),
            backoff: env_parse("LLM_BALANCER_RETRY_BACKOFF", 2.0),
        };

        // CORS configuration: "localhost" (default), "*" (allow all), or comma-separated origins
        let cors_mode = match env::var("LLM_BALANCER_CORS_ORIGINS").as_deref() {
            Ok("*") => CorsMode::AllowAll,
            Ok(origins) if !origins.is_empty() => {
                CorsMode::AllowList(origins.split(',').map(|s| s.trim().to_string()).collect())
            }
            _ => CorsMode::LocalhostOnly,
        };

        Ok(Self {
            host,
            port,
            data_dir,
            client_id,
            strategy,
            session_duration_ms: env_parse("LLM_BALANCER_SESSION_DURATION_MS", 5 * 60 * 60 * 1000),
            retry,
            data_retention_days: env_parse("LLM_BALANCER_DATA_RETENTION_DAYS", 7),
            request_retention_days: env_parse("LLM_BALANCER_REQUEST_RETENTION_DAYS", 30),
            default_agent_model: env::var("LLM_BALANCER_DEFAULT_AGENT_MODEL").ok(),
            max_body_bytes: env_parse("LLM_BALANCER_MAX_BODY_BYTES", 10 * 1024 * 1024),
            cors_mode,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("balancer.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_exponentially() {
        let policy = RetryPolicy {
            attempts: 3,
            delay_ms: 100,
            backoff: 2.0,
        };
        assert_eq!(policy.delay_for(0).as_millis(), 100);
        assert_eq!(policy.delay_for(1).as_millis(), 200);
        assert_eq!(policy.delay_for(2).as_millis(), 400);
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.delay_ms, 1000);
    }
}
