// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;

// Storage and broker capability
pub mod broker;
pub mod message;
pub mod store;

// Pipeline
pub mod producer;
pub mod tasks;

// Supporting modules
pub mod shutdown;
pub mod telemetry;

pub use message::Message;
pub use producer::{Producer, ProducerOptions, SendOutcome};
pub use shutdown::ShutdownReport;
