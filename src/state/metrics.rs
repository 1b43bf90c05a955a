use crate::error::ErrorKind;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

pub struct Metrics {
    registry: Registry,

    // Control plane
    pub control_messages_total: IntCounter,
    pub control_failures_total: IntCounterVec,
    pub active_plugins: IntGauge,

    // Plugins
    pub plugin_operations_total: IntCounter,
    pub plugin_failures_total: IntCounter,
    pub plugin_operation_duration: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let control_messages_total = IntCounter::new(
            "pipeline_control_messages_total",
            "Total number of control messages processed",
        )
        .expect("metric creation failed");
        let control_failures_total = IntCounterVec::new(
            Opts::new(
                "pipeline_control_failures_total",
                "Control messages rejected, by error kind",
            ),
            &["kind"],
        )
        .expect("metric creation failed");
        let active_plugins = IntGauge::new(
            "pipeline_active_plugins",
            "Number of plugins currently registered",
        )
        .expect("metric creation failed");

        let plugin_operations_total = IntCounter::new(
            "pipeline_plugin_operations_total",
            "Total number of messages transformed by plugins",
        )
        .expect("metric creation failed");
        let plugin_failures_total = IntCounter::new(
            "pipeline_plugin_failures_total",
            "Total number of failed plugin message transforms",
        )
        .expect("metric creation failed");
        let plugin_operation_duration = Histogram::with_opts(HistogramOpts::new(
            "pipeline_plugin_operation_duration_seconds",
            "Plugin message processing duration in seconds",
        ))
        .expect("metric creation failed");

        for collector in [
            Box::new(control_messages_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(control_failures_total.clone()),
            Box::new(active_plugins.clone()),
            Box::new(plugin_operations_total.clone()),
            Box::new(plugin_failures_total.clone()),
            Box::new(plugin_operation_duration.clone()),
        ] {
            registry.register(collector).expect("metric registration failed");
        }

        Self {
            registry,
            control_messages_total,
            control_failures_total,
            active_plugins,
            plugin_operations_total,
            plugin_failures_total,
            plugin_operation_duration,
        }
    }

    pub fn record_control_message(&self) {
        self.control_messages_total.inc();
    }

    pub fn record_control_failure(&self, kind: ErrorKind) {
        self.control_failures_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn set_active_plugins(&self, count: usize) {
        self.active_plugins.set(count as i64);
    }

    pub fn record_plugin_operation(&self, duration: Duration) {
        self.plugin_operations_total.inc();
        self.plugin_operation_duration
            .observe(duration.as_secs_f64());
    }

    pub fn record_plugin_failure(&self) {
        self.plugin_failures_total.inc();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition format of every registered metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
