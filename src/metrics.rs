//! Prometheus metrics for plugin loads and unloads.

use prometheus::{Counter, Histogram, IntGauge, Registry};

use crate::error::{Error, Result};

/// Configuration for plugin metrics collection.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric prefix for all plugin metrics.
    pub prefix: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "live_plugin".to_string(),
        }
    }
}

impl MetricsConfig {
    /// Create a new metrics configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Plugin metrics collector.
pub struct PluginMetrics {
    config: MetricsConfig,
    registry: Registry,
    loads: Counter,
    unloads: Counter,
    load_failures: Counter,
    duplicate_rejections: Counter,
    resident_modules: IntGauge,
    load_duration: Histogram,
}

impl PluginMetrics {
    /// Create a new metrics collector with the given configuration.
    pub fn new(config: MetricsConfig) -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| {
            Counter::new(format!("{}_{}", config.prefix, name), help).map_err(metrics_error)
        };

        let loads = counter("loads_total", "Total number of plugins loaded")?;
        let unloads = counter("unloads_total", "Total number of plugins unloaded")?;
        let load_failures = counter(
            "load_failures_total",
            "Total number of plugins that failed to initialize",
        )?;
        let duplicate_rejections = counter(
            "duplicate_rejections_total",
            "Total number of loads rejected as duplicate modules",
        )?;

        let resident_modules = IntGauge::new(
            format!("{}_resident_modules", config.prefix),
            "Number of modules resident in the process",
        )
        .map_err(metrics_error)?;

        let load_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                format!("{}_load_duration_seconds", config.prefix),
                "Module load duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(loads.clone())).ok();
        registry.register(Box::new(unloads.clone())).ok();
        registry.register(Box::new(load_failures.clone())).ok();
        registry.register(Box::new(duplicate_rejections.clone())).ok();
        registry.register(Box::new(resident_modules.clone())).ok();
        registry.register(Box::new(load_duration.clone())).ok();

        Ok(Self {
            config,
            registry,
            loads,
            unloads,
            load_failures,
            duplicate_rejections,
            resident_modules,
            load_duration,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a module load that took `duration_secs`.
    pub fn record_module_load(&self, duration_secs: f64, resident: usize) {
        self.load_duration.observe(duration_secs);
        self.resident_modules.set(resident as i64);
    }

    /// Record a registered plugin.
    pub fn record_load(&self) {
        self.loads.inc();
    }

    /// Record an unloaded plugin.
    pub fn record_unload(&self) {
        self.unloads.inc();
    }

    /// Record a plugin that failed to construct or initialize.
    pub fn record_failure(&self) {
        self.load_failures.inc();
    }

    /// Record a duplicate rejection.
    pub fn record_duplicate(&self) {
        self.duplicate_rejections.inc();
    }

    /// Total number of plugins loaded.
    pub fn loads_total(&self) -> u64 {
        self.loads.get() as u64
    }

    /// Total number of plugins unloaded.
    pub fn unloads_total(&self) -> u64 {
        self.unloads.get() as u64
    }

    /// Total number of load failures.
    pub fn load_failures_total(&self) -> u64 {
        self.load_failures.get() as u64
    }

    /// Total number of duplicate rejections.
    pub fn duplicate_rejections_total(&self) -> u64 {
        self.duplicate_rejections.get() as u64
    }

    /// Number of resident modules at the last load.
    pub fn resident_modules(&self) -> i64 {
        self.resident_modules.get()
    }
}

fn metrics_error(err: prometheus::Error) -> Error {
    Error::Metrics(err.to_string())
}

impl std::fmt::Debug for PluginMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginMetrics")
            .field("config", &self.config)
            .field("loads", &self.loads_total())
            .field("unloads", &self.unloads_total())
            .field("load_failures", &self.load_failures_total())
            .field("duplicate_rejections", &self.duplicate_rejections_total())
            .finish()
    }
}
