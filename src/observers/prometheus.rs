//! Prometheus exporter for [`StatsSnapshot`] using the official `prometheus` crate.
//!
//! # Feature Flag
//!
//! This module requires the `prometheus` feature:
//!
//! ```toml
//! [dependencies]
//! contatori-store = { version = "0.1", features = ["prometheus"] }
//! ```
//!
//! # Exported Metrics
//!
//! Every statistic becomes an integer counter named after it with a `_total`
//! suffix (`cache_hits_total`, `increments_total`, ...). When at least one
//! `count` call was made, `cache_hit_ratio` is exported as a gauge.
//!
//! # Examples
//!
//! ```rust
//! use contatori_store::observers::prometheus::PrometheusObserver;
//! use contatori_store::snapshot::StatsSnapshot;
//!
//! let snapshot = StatsSnapshot {
//!     increments: 42,
//!     ..Default::default()
//! };
//!
//! let observer = PrometheusObserver::new()
//!     .with_namespace("myapp")
//!     .with_const_label("instance", "localhost:8080");
//! let output = observer.render(&snapshot)?;
//!
//! assert!(output.contains(r#"myapp_increments_total{instance="localhost:8080"} 42"#));
//! # Ok::<(), contatori_store::observers::ObserverError>(())
//! ```

use std::collections::HashMap;

use prometheus::{Encoder, Gauge, IntCounter, Opts, Registry, TextEncoder};

use super::Result;
use crate::snapshot::StatsSnapshot;

/// Help text for each exported statistic.
fn default_help(name: &str) -> &'static str {
    match name {
        "cache_hits" => "Count calls answered from the cache",
        "cache_misses" => "Count calls that aggregated shards",
        "cache_errors" => "Cache failures ignored by the service",
        "aggregations" => "Completed shard aggregation scans",
        "increments" => "Committed shard increments",
        "fanout_increases" => "Fan-out changes written",
        _ => "Counter service statistic",
    }
}

/// Renders service statistics in the Prometheus text exposition format.
#[derive(Debug, Clone, Default)]
pub struct PrometheusObserver {
    namespace: Option<String>,
    subsystem: Option<String>,
    const_labels: HashMap<String, String>,
}

impl PrometheusObserver {
    /// Creates an observer with no namespace and no labels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the namespace (prefix) for all metrics.
    ///
    /// For example, namespace "myapp" + metric "increments_total" =
    /// "myapp_increments_total".
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(sanitize_name(namespace));
        self
    }

    /// Sets the subsystem, placed between namespace and metric name.
    pub fn with_subsystem(mut self, subsystem: &str) -> Self {
        self.subsystem = Some(sanitize_name(subsystem));
        self
    }

    /// Adds a constant label to all metrics.
    pub fn with_const_label(mut self, name: &str, value: &str) -> Self {
        self.const_labels.insert(name.to_string(), value.to_string());
        self
    }

    /// Registers metrics for `snapshot` into an existing registry.
    ///
    /// # Errors
    ///
    /// Fails if a metric with the same name is already registered.
    pub fn register(&self, registry: &Registry, snapshot: &StatsSnapshot) -> Result<()> {
        for (name, value) in snapshot.entries() {
            let counter =
                IntCounter::with_opts(self.opts(&format!("{name}_total"), default_help(name)))?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        if let Some(ratio) = snapshot.cache_hit_ratio() {
            let gauge = Gauge::with_opts(self.opts(
                "cache_hit_ratio",
                "Fraction of count calls answered from the cache",
            ))?;
            gauge.set(ratio);
            registry.register(Box::new(gauge))?;
        }
        Ok(())
    }

    /// Renders `snapshot` to the text exposition format.
    pub fn render(&self, snapshot: &StatsSnapshot) -> Result<String> {
        let registry = Registry::new();
        self.register(&registry, snapshot)?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Renders `snapshot` to bytes (useful for HTTP responses).
    pub fn render_bytes(&self, snapshot: &StatsSnapshot) -> Result<Vec<u8>> {
        Ok(self.render(snapshot)?.into_bytes())
    }

    fn opts(&self, name: &str, help: &str) -> Opts {
        let mut opts = Opts::new(name, help).const_labels(self.const_labels.clone());
        if let Some(namespace) = &self.namespace {
            opts = opts.namespace(namespace.as_str());
        }
        if let Some(subsystem) = &self.subsystem {
            opts = opts.subsystem(subsystem.as_str());
        }
        opts
    }
}

/// Makes a name component Prometheus-compatible: `[a-zA-Z_:][a-zA-Z0-9_:]*`.
fn sanitize_name(name: &str) -> String {
    let mut result: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if result.starts_with(|c: char| c.is_ascii_digit()) {
        result.insert(0, '_');
    }
    result
}
