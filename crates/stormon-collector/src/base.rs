//! State shared by every collector: template, matrix, plugin pipeline, and
//! the metadata matrix that reports per-task timings and status.

use crate::error::{PollError, Result};
use crate::{CollectorKind, Task};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use stormon_api::{ConnectionConfig, Credentials, Stats};
use stormon_common::matrix::Matrix;
use stormon_common::template::{Counter, Template};
use stormon_plugins::{Pipeline, PluginContext, PluginRegistry};

/// Everything a collector needs from its poller.
#[derive(Clone)]
pub struct CollectorContext {
    pub poller: String,
    pub connection: ConnectionConfig,
    pub credentials: Arc<Credentials>,
    /// Global labels such as `datacenter`.
    pub labels: BTreeMap<String, String>,
    pub registry: Arc<PluginRegistry>,
}

impl CollectorContext {
    pub fn new(poller: &str, connection: ConnectionConfig) -> Self {
        let credentials = Arc::new(Credentials::new(&connection));
        Self {
            poller: poller.to_string(),
            connection,
            credentials,
            labels: BTreeMap::new(),
            registry: Arc::new(PluginRegistry::default()),
        }
    }

    /// Client timeout: the template's `client_timeout` wins over the
    /// poller's.
    pub fn timeout(&self, template: &Template) -> Duration {
        template.client_timeout.unwrap_or(self.connection.client_timeout)
    }
}

/// Metrics kept per task in the metadata matrix.
pub const METADATA_METRICS: [&str; 9] = [
    "api_time",
    "parse_time",
    "plugin_time",
    "calc_time",
    "poll_time",
    "count",
    "instances",
    "metrics",
    "status",
];

/// Per-task bookkeeping: one instance per [`Task`], times in
/// microseconds. Writes never fail.
#[derive(Debug, Clone)]
pub struct Metadata {
    matrix: Matrix,
}

impl Metadata {
    pub fn new(poller: &str, collector: &str, object: &str) -> Self {
        let mut matrix = Matrix::new(&format!("{collector}.{object}.metadata"), "metadata_collector", object);
        matrix.set_global_label("poller", poller);
        matrix.set_global_label("collector", collector);
        matrix.set_global_label("object", object);
        for task in Task::ALL {
            matrix.instance_or_insert(task.as_str()).set_label("task", task.as_str());
        }
        for key in METADATA_METRICS {
            matrix.metric_or_insert(key);
        }
        // consumed by liveness dashboards, not by series exporters
        if let Some(status) = matrix.metric_mut("status") {
            status.set_exportable(false);
        }
        Self { matrix }
    }

    pub fn set(&mut self, task: Task, metric: &str, value: f64) {
        self.matrix.lazy_set_value_float64(metric, task.as_str(), value);
    }

    pub fn value(&self, task: Task, metric: &str) -> Option<f64> {
        self.matrix.value_float64(metric, task.as_str())
    }

    /// Transport time accumulated during one task.
    pub fn record_stats(&mut self, task: Task, stats: &Stats) {
        self.set(task, "api_time", stats.api_time.as_micros() as f64);
        self.set(task, "parse_time", stats.parse_time.as_micros() as f64);
    }

    pub fn record_success(&mut self, task: Task) {
        self.set(task, "status", 0.0);
        if let Some(instance) = self.matrix.instance_mut(task.as_str()) {
            instance.set_label("status", "ok");
            instance.remove_label("reason");
        }
    }

    pub fn record_failure(&mut self, task: Task, err: &PollError) {
        self.set(task, "status", 1.0);
        if let Some(instance) = self.matrix.instance_mut(task.as_str()) {
            instance.set_label("status", err.kind());
            instance.set_label("reason", &err.to_string());
        }
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }
}

/// Template, matrix, and plugin chain of one collector.
pub struct CollectorCore {
    pub kind: CollectorKind,
    pub poller: String,
    pub template: Template,
    /// The collector's own matrix. Perf collectors keep raw values of the
    /// previous poll here.
    pub matrix: Matrix,
    pub metadata: Metadata,
    pipeline: Pipeline,
}

impl CollectorCore {
    pub fn new(kind: CollectorKind, ctx: &CollectorContext, template: Template) -> Result<Self> {
        let object = template.object.clone();
        let mut matrix = Matrix::new(&format!("{kind}.{object}"), &object, &object);
        matrix.set_global_labels(&ctx.labels);
        matrix.set_export_options(template.export_options.clone());

        for lint in &template.lints {
            tracing::warn!(
                template = %template.name,
                line = lint.line,
                counter = %lint.counter,
                column = lint.column,
                expected = lint.expected,
                "misaligned arrow in counters"
            );
        }

        let plugin_ctx = PluginContext {
            collector: kind.to_string(),
            object: object.clone(),
            template: template.root().clone(),
        };
        let pipeline = ctx.registry.pipeline(&template.plugins, &plugin_ctx)?;

        Ok(Self {
            kind,
            poller: ctx.poller.clone(),
            metadata: Metadata::new(&ctx.poller, kind.as_str(), &object),
            template,
            matrix,
            pipeline,
        })
    }

    /// Stamps appliance identity on every exported row.
    pub fn set_cluster(&mut self, name: &str) {
        if !name.is_empty() {
            self.matrix.set_global_label("cluster", name);
        }
    }

    /// Requires at least one `^^` counter.
    pub fn require_keys(&self) -> Result<()> {
        if self.template.keys().next().is_none() {
            return Err(PollError::MissingParam(format!(
                "{}: no instance keys (^^) in counters",
                self.template.name
            )));
        }
        Ok(())
    }

    /// Runs the plugin chain over `data` and assembles what the exporter
    /// receives: the collector matrix (unless `export_data` is off), every
    /// derived matrix, and the metadata.
    pub fn publish(&mut self, mut data: Matrix) -> Vec<Matrix> {
        let output = self.pipeline.run(&mut data);
        self.metadata
            .set(Task::Data, "plugin_time", output.plugin_time.as_micros() as f64);
        self.metadata
            .set(Task::Data, "instances", data.instance_count() as f64);
        self.metadata
            .set(Task::Data, "metrics", data.metric_count() as f64);

        let mut out = Vec::with_capacity(output.matrices.len() + 2);
        if self.template.export_data {
            out.push(data);
        } else {
            tracing::trace!(object = %self.template.object, "export_data disabled, publishing derived matrices only");
        }
        out.extend(output.matrices);
        out.push(self.metadata.matrix().clone());
        out
    }
}

/// Instance key from the values of the `^^` counters: each value prefixed
/// with `-`, so `[a]` gives `-a` and `[a, b]` gives `-a-b`.
///
/// Returns `None` when a key value is missing or there are no keys.
///
/// ```rust
/// use stormon_collector::base::instance_key;
/// use stormon_common::template::parse_counter;
///
/// let keys = [parse_counter("^^name => volume", ""), parse_counter("^^svm.name => svm", "")];
/// let key = instance_key(&keys, |c| Some(c.name.to_uppercase()));
/// assert_eq!(key.as_deref(), Some("-NAME-SVM.NAME"));
/// ```
pub fn instance_key<'a, I, F>(keys: I, mut lookup: F) -> Option<String>
where
    I: IntoIterator<Item = &'a Counter>,
    F: FnMut(&Counter) -> Option<String>,
{
    let mut key = String::new();
    let mut any = false;
    for counter in keys {
        any = true;
        let value = lookup(counter)?;
        key.push('-');
        key.push_str(&value);
    }
    any.then_some(key)
}

/// Parses a scalar as a metric value. Booleans count as 0/1.
pub fn parse_number(raw: &str) -> Option<f64> {
    match raw.trim() {
        "" => None,
        "true" => Some(1.0),
        "false" => Some(0.0),
        s => s.parse().ok(),
    }
}

/// Adds a float metric per template counter, keyed by its path and named
/// by its display name. Overrides set unit and property.
pub(crate) fn add_template_metrics<'a>(
    matrix: &mut Matrix,
    template: &Template,
    counters: impl IntoIterator<Item = &'a Counter>,
) {
    for counter in counters.into_iter().filter(|c| c.is_metric()) {
        let metric = matrix.metric_or_insert(&counter.path);
        metric.set_name(&counter.display);
        if let Some(over) = template.override_for(&counter.name) {
            if let Some(unit) = &over.unit {
                metric.set_unit(unit);
            }
            if let Some(property) = &over.property {
                metric.set_property(property);
            }
        }
    }
}

/// Drops instances not in `seen` and returns how many were removed.
pub(crate) fn remove_unseen(matrix: &mut Matrix, seen: &std::collections::HashSet<String>) -> usize {
    let stale: Vec<String> = matrix
        .instance_keys()
        .into_iter()
        .filter(|k| !seen.contains(k))
        .collect();
    for key in &stale {
        matrix.remove_instance(key);
        tracing::debug!(object = %matrix.object, key = %key, "removed instance");
    }
    stale.len()
}
