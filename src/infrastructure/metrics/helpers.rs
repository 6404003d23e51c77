//! Metrics helpers for exposition and read-back

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, Registry, TextEncoder};

/// Encode all metrics in `registry` to Prometheus text format
pub fn encode_metrics(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Sum every series of `counter` whose labels match all of `filters`
pub fn sum_counter(counter: &IntCounterVec, filters: &[(&str, &str)]) -> u64 {
    counter
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .filter(|metric| {
            filters.iter().all(|(name, value)| {
                metric
                    .get_label()
                    .iter()
                    .any(|pair| pair.get_name() == *name && pair.get_value() == *value)
            })
        })
        .map(|metric| metric.get_counter().get_value() as u64)
        .sum()
}
