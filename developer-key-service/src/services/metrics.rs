use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

pub struct Metrics {
    pub registry: Registry,
    pub tool_management_total: IntCounterVec,
    pub tool_management_errors_total: IntCounterVec,
    pub tool_management_latency_ms: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

const LATENCY_BUCKETS_MS: &[f64] = &[
    10.0, 50.0, 100.0, 500.0, 1_000.0, 5_000.0, 30_000.0, 60_000.0, 300_000.0,
];

fn counter(name: &str, help: &str) -> IntCounterVec {
    match IntCounterVec::new(Opts::new(name, help), &["action"]) {
        Ok(metric) => metric,
        Err(e) => {
            tracing::error!("Failed to create {} metric: {}", name, e);
            panic!("Failed to initialize metrics: {}", e);
        }
    }
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let tool_management_total = counter(
            "developer_key_manage_external_tools_total",
            "Tool management jobs run per shard",
        );
        let tool_management_errors_total = counter(
            "developer_key_manage_external_tools_errors_total",
            "Tool management jobs that failed on a shard",
        );
        let tool_management_latency_ms = match HistogramVec::new(
            HistogramOpts::new(
                "developer_key_manage_external_tools_latency_ms",
                "Milliseconds from scheduling a tool management action to finishing it on a shard",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["action", "outcome"],
        ) {
            Ok(metric) => metric,
            Err(e) => {
                tracing::error!(
                    "Failed to create developer_key_manage_external_tools_latency_ms metric: {}",
                    e
                );
                panic!("Failed to initialize metrics: {}", e);
            }
        };

        for collector in [
            Box::new(tool_management_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(tool_management_errors_total.clone()),
            Box::new(tool_management_latency_ms.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                tracing::error!("Failed to register collector: {}", e);
                panic!("Failed to initialize metrics: {}", e);
            }
        }

        Self {
            registry,
            tool_management_total,
            tool_management_errors_total,
            tool_management_latency_ms,
        }
    }
}

pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Count one shard-level tool management run and its latency since the
/// action was scheduled.
pub fn record_tool_management(action: &str, latency_ms: u64, failed: bool) {
    let metrics = init_metrics();
    let outcome = if failed { "error" } else { "ok" };

    if failed {
        metrics
            .tool_management_errors_total
            .with_label_values(&[action])
            .inc();
    } else {
        metrics
            .tool_management_total
            .with_label_values(&[action])
            .inc();
    }
    metrics
        .tool_management_latency_ms
        .with_label_values(&[action, outcome])
        .observe(latency_ms as f64);
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let Some(metrics) = METRICS.get() else {
        tracing::error!("Metrics registry not initialized");
        return "# Metrics registry not initialized\n".to_string();
    };

    let metric_families = metrics.registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_actions_are_exported() {
        record_tool_management("disable", 42, false);
        record_tool_management("restore", 7, true);

        let exported = get_metrics();
        assert!(exported.contains("developer_key_manage_external_tools_total{action=\"disable\"}"));
        assert!(exported
            .contains("developer_key_manage_external_tools_errors_total{action=\"restore\"}"));
    }
}
