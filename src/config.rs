//! Runtime configuration (§6 knob table), loaded from a layered `config::Config` source: defaults
//! baked into this module, an optional `config/*.toml` file, then `SCRIBEQ_*` environment
//! variables, highest priority last.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis_url: Option<String>,
    pub queue_names: Vec<String>,
    pub workers_per_queue: usize,
    #[serde(with = "humantime_serde_millis")]
    pub poll_interval: Duration,
    pub max_retries_default: u32,
    #[serde(with = "humantime_serde_millis")]
    pub downstream_timeout: Duration,
    pub breaker_failure_threshold: usize,
    pub breaker_success_threshold: usize,
    #[serde(with = "humantime_serde_millis")]
    pub breaker_open_timeout: Duration,
    #[serde(with = "humantime_serde_millis")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde_millis")]
    pub worker_stale_after: Duration,
    pub consecutive_failure_kill: u32,
    #[serde(with = "humantime_serde_millis")]
    pub job_retention: Duration,
    #[serde(with = "humantime_serde_millis")]
    pub dlq_retention: Duration,
    pub metric_ring_size: usize,
    #[serde(with = "humantime_serde_millis")]
    pub alert_eval_interval: Duration,
    pub transcription_service_url: String,
    pub agent_service_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: None,
            queue_names: vec![
                "audio_processing".to_string(),
                "text_processing".to_string(),
                "transcription_only".to_string(),
            ],
            workers_per_queue: 4,
            poll_interval: Duration::from_millis(500),
            max_retries_default: 3,
            downstream_timeout: Duration::from_secs(30),
            breaker_failure_threshold: 5,
            breaker_success_threshold: 1,
            breaker_open_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            worker_stale_after: Duration::from_secs(60),
            consecutive_failure_kill: 5,
            job_retention: Duration::from_secs(24 * 3600),
            dlq_retention: Duration::from_secs(7 * 24 * 3600),
            metric_ring_size: 10_000,
            alert_eval_interval: Duration::from_secs(60),
            transcription_service_url: "http://localhost:8001".to_string(),
            agent_service_url: "http://localhost:8002".to_string(),
        }
    }
}

impl Config {
    /// Load from (in ascending priority): built-in defaults, an optional `config/default.toml`
    /// and `config/local.toml`, then `SCRIBEQ__`-prefixed environment variables
    /// (double underscore nests, e.g. `SCRIBEQ__WORKERS_PER_QUEUE=8`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("SCRIBEQ").separator("__"));

        builder.build()?.try_deserialize()
    }
}

/// `humantime_serde`-style (de)serialization for `Duration` as milliseconds, since `config`'s
/// environment-source values arrive as strings and plain integers round-trip most predictably.
mod humantime_serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
