mod settings;

pub use settings::{InputConfig, LoggingConfig, MetricsConfig, ProducerSettings, Settings};
