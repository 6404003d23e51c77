use std::sync::Arc;

use anyhow::Result;
use prometheus::Registry;
use tokio::io::{AsyncBufReadExt, BufReader};

use buffered_producer::broker::{MemoryBroker, MemoryBrokerConfig};
use buffered_producer::config::Settings;
use buffered_producer::metrics::{encode_metrics, ProducerMetrics};
use buffered_producer::shutdown::wait_for_signal;
use buffered_producer::telemetry::init_tracing;
use buffered_producer::{Producer, ProducerOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    init_tracing(&settings.logging)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Configuration loaded");

    let registry = Registry::new();
    let metrics = ProducerMetrics::new(&settings.metrics.namespace)?;
    metrics.register(&registry)?;

    let broker = MemoryBroker::new(MemoryBrokerConfig {
        max_message_bytes: settings.producer.max_message_bytes,
        ..Default::default()
    });

    let options = ProducerOptions::from(settings.producer.clone());
    let producer = Producer::new(options, Arc::new(broker.clone()), metrics).await?;
    producer.start()?;

    let topic = settings.input.topic.clone();
    tracing::info!(topic = %topic, "Forwarding stdin lines");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = wait_for_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => match line? {
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    producer.send(topic.as_str(), line);
                }
                None => {
                    tracing::info!("End of input");
                    break;
                }
            },
        }
    }

    let report = producer.close().await;
    tracing::info!(
        delivered = report.delivered,
        dropped = report.dropped,
        cached = report.cached,
        pending_overflow = ?report.pending_overflow,
        broker_total = broker.delivered_count(),
        "Shutdown complete"
    );

    print!("{}", encode_metrics(&registry)?);
    Ok(())
}
