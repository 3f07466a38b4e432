// Configuration constants for the server

use std::path::PathBuf;
use std::time::Duration;

use stream_core::{AggregatorConfig, SessionConfig};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub voices_dir: PathBuf,
    pub piper_config: PathBuf,
    pub examples_dir: PathBuf,
    pub min_chunk_secs: f64,
    pub max_wait_secs: f64,
    pub join_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            rate_limit_per_minute: 60,
            // Non-streaming generation of a long script takes minutes.
            request_timeout_secs: 600,
            cors_allowed_origins: None,
            voices_dir: PathBuf::from("voices"),
            piper_config: PathBuf::from("models/voice.onnx.json"),
            examples_dir: PathBuf::from("text_examples"),
            min_chunk_secs: 30.0,
            max_wait_secs: 15.0,
            join_timeout_secs: 5,
            poll_interval_ms: 200,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = env_or("PORT", defaults.port);
        let rate_limit_per_minute = env_or("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute);
        let request_timeout_secs = env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs);

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect()
            });

        let voices_dir = std::env::var("VOICES_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.voices_dir);
        let piper_config = std::env::var("PIPER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or(defaults.piper_config);
        let examples_dir = std::env::var("EXAMPLES_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.examples_dir);

        Self {
            port,
            rate_limit_per_minute,
            request_timeout_secs,
            cors_allowed_origins,
            voices_dir,
            piper_config,
            examples_dir,
            min_chunk_secs: env_or("MIN_CHUNK_SECS", defaults.min_chunk_secs),
            max_wait_secs: env_or("MAX_WAIT_SECS", defaults.max_wait_secs),
            join_timeout_secs: env_or("JOIN_TIMEOUT_SECS", defaults.join_timeout_secs),
            poll_interval_ms: env_or("POLL_INTERVAL_MS", defaults.poll_interval_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Streaming parameters for every session this server runs.
    pub fn session_config(&self) -> SessionConfig {
        let aggregator = AggregatorConfig::default()
            .with_min_chunk(secs_f64(self.min_chunk_secs))
            .with_max_wait(secs_f64(self.max_wait_secs));
        SessionConfig::default()
            .with_aggregator(aggregator)
            .with_join_timeout(Duration::from_secs(self.join_timeout_secs))
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms.max(1)))
    }
}

/// Negative or non-finite values fall back to zero.
fn secs_f64(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_session_config() {
        let config = ServerConfig::default().session_config();
        assert_eq!(config.aggregator.min_chunk, Duration::from_secs(30));
        assert_eq!(config.aggregator.max_wait, Duration::from_secs(15));
        assert_eq!(config.join_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_invalid_durations_clamp() {
        assert_eq!(secs_f64(-1.0), Duration::ZERO);
        assert_eq!(secs_f64(f64::NAN), Duration::ZERO);
        assert_eq!(secs_f64(1.5), Duration::from_millis(1500));
    }
}
