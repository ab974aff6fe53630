use std::{env, fmt::Display, fs::read_to_string, str::FromStr, time::Duration};

use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend {other:?}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub questions_path: Option<String>,
    pub token_pepper: String,
    /// Reverse proxies in front of the server that append to `X-Forwarded-For`.
    /// Zero means the header is ignored and the socket peer is the client.
    pub trusted_proxy_hops: usize,

    pub rate_limit_budget: u32,
    pub rate_limit_window: Duration,
    pub request_timeout: Duration,

    pub stats_ttl: Duration,
    pub stats_debounce: Duration,
    pub stats_max_batch: usize,
    pub stats_retry: Duration,

    pub queue_capacity: usize,
    pub queue_workers: usize,
    pub job_max_attempts: u32,
    pub job_retry: Duration,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: try_load("RUST_PORT", "1111"),
            store_backend: try_load("STORE_BACKEND", "redis"),
            redis_url: try_load("REDIS_URL", "redis://redis:6379"),
            questions_path: var("QUESTIONS_PATH").ok(),
            token_pepper: read_secret("TOKEN_PEPPER").unwrap_or_default(),
            trusted_proxy_hops: try_load("TRUSTED_PROXY_HOPS", "0"),

            rate_limit_budget: try_load("RATE_LIMIT_BUDGET", "100"),
            rate_limit_window: Duration::from_secs(try_load("RATE_LIMIT_WINDOW_SECS", "86400")),
            request_timeout: Duration::from_millis(try_load("REQUEST_TIMEOUT_MS", "2000")),

            stats_ttl: Duration::from_secs(try_load("STATS_TTL_SECS", "300")),
            stats_debounce: Duration::from_millis(try_load("STATS_DEBOUNCE_MS", "5000")),
            stats_max_batch: try_load("STATS_MAX_BATCH", "50"),
            stats_retry: Duration::from_millis(try_load("STATS_RETRY_MS", "1000")),

            queue_capacity: try_load("QUEUE_CAPACITY", "1024"),
            queue_workers: try_load("QUEUE_WORKERS", "4"),
            job_max_attempts: try_load("JOB_MAX_ATTEMPTS", "3"),
            job_retry: Duration::from_millis(try_load("JOB_RETRY_MS", "500")),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1111,
            store_backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            questions_path: None,
            token_pepper: String::new(),
            trusted_proxy_hops: 0,

            rate_limit_budget: 100,
            rate_limit_window: Duration::from_secs(24 * 60 * 60),
            request_timeout: Duration::from_secs(2),

            stats_ttl: Duration::from_secs(5 * 60),
            stats_debounce: Duration::from_secs(5),
            stats_max_batch: 50,
            stats_retry: Duration::from_secs(1),

            queue_capacity: 1024,
            queue_workers: 4,
            job_max_attempts: 3,
            job_retry: Duration::from_millis(500),
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}

fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            warn!("Failed to read {secret_name} from file: {e}");
        })
        .ok()
}

#[cfg(test)]
mod tests {
    use super::StoreBackend;

    #[test]
    fn test_store_backend_parsing() {
        assert_eq!("redis".parse::<StoreBackend>(), Ok(StoreBackend::Redis));
        assert_eq!(" Memory ".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert!("postgres".parse::<StoreBackend>().is_err());
    }
}
