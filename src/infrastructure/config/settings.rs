use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub producer: ProducerSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub input: InputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerSettings {
    /// Client name reported to the broker
    #[serde(default = "default_name")]
    pub name: String,
    /// Broker addresses (required)
    #[serde(default)]
    pub brokers: Vec<String>,
    /// SASL user
    #[serde(default)]
    pub user: Option<String>,
    /// SASL password
    #[serde(default)]
    pub password: Option<String>,
    /// Broker protocol version, e.g. "2.1.0.0"
    #[serde(default)]
    pub version: Option<String>,
    /// Number of sending workers
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Capacity of the in-memory ingestion queue
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Directory of the overflow store; overflow is dropped when unset
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    /// Seconds between overflow replays
    #[serde(default = "default_replay_interval")]
    pub replay_interval_secs: u64,
    /// Largest message the in-process broker accepts
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Prefix of every metric name
    #[serde(default = "default_metrics_namespace")]
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Topic that stdin lines are sent to
    #[serde(default = "default_input_topic")]
    pub topic: String,
}

fn default_name() -> String {
    "buffered-producer".to_string()
}

fn default_num_workers() -> usize {
    1
}

fn default_queue_size() -> usize {
    1
}

fn default_replay_interval() -> u64 {
    10 // 10 seconds
}

fn default_max_message_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_metrics_namespace() -> String {
    "producer".to_string()
}

fn default_input_topic() -> String {
    "events".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("producer.name", default_name())?
            .set_default("producer.num_workers", 1)?
            .set_default("producer.queue_size", 1)?
            .set_default("producer.replay_interval_secs", 10)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // PRODUCER__BROKERS, PRODUCER__QUEUE_SIZE, LOGGING__LEVEL, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("producer.brokers"),
            );

        builder.build()?.try_deserialize()
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            brokers: vec![],
            user: None,
            password: None,
            version: None,
            num_workers: default_num_workers(),
            queue_size: default_queue_size(),
            cache_path: None,
            replay_interval_secs: default_replay_interval(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: default_metrics_namespace(),
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            topic: default_input_topic(),
        }
    }
}
