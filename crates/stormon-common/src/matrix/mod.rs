//! In-memory instance × metric table.
//!
//! A [`Matrix`] holds one row per [`Instance`] and one dense column per
//! [`Metric`]. Every column has exactly one slot per instance; removing an
//! instance removes its slot from every column in the same call.

mod export;
mod instance;
mod metric;
mod view;


pub use export::{ExportOptions, ExportRow};
pub use instance::Instance;
pub use metric::{Metric, MetricType};
pub use view::MatrixView;

use std::collections::{BTreeMap, HashMap};

/// Errors from structural matrix operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatrixError {
    #[error("instance [{0}] already exists")]
    DuplicateInstance(String),

    #[error("metric [{0}] already exists")]
    DuplicateMetric(String),

    #[error("instance [{0}] not found")]
    InstanceNotFound(String),

    #[error("metric [{0}] not found")]
    MetricNotFound(String),

    #[error("metric [{0}] is not a derived metric")]
    NotDerived(String),

    #[error("value [{value}] for metric [{metric}] is not numeric")]
    NotNumeric { metric: String, value: String },
}

impl From<MatrixError> for crate::error::PollError {
    fn from(e: MatrixError) -> Self {
        crate::error::PollError::InvalidItem(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MatrixError>;

/// Selects what [`Matrix::clone_with`] copies.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloneOptions {
    /// Copy metric values (requires `metrics` and `instances`).
    pub data: bool,
    /// Copy metric definitions.
    pub metrics: bool,
    /// Copy instance rows and labels.
    pub instances: bool,
    /// Keep each instance's exportable flag instead of resetting it to true.
    pub export_instances: bool,
}

impl CloneOptions {
    pub fn all() -> Self {
        Self {
            data: true,
            metrics: true,
            instances: true,
            export_instances: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Matrix {
    pub uuid: String,
    pub object: String,
    pub identifier: String,
    global_labels: BTreeMap<String, String>,
    instances: HashMap<String, Instance>,
    metrics: BTreeMap<String, Metric>,
    export_options: ExportOptions,
    exportable: bool,
}

impl Matrix {
    pub fn new(uuid: &str, object: &str, identifier: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            object: object.to_string(),
            identifier: identifier.to_string(),
            global_labels: BTreeMap::new(),
            instances: HashMap::new(),
            metrics: BTreeMap::new(),
            export_options: ExportOptions::default(),
            exportable: true,
        }
    }

    pub fn set_global_label(&mut self, key: &str, value: &str) {
        self.global_labels
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_global_labels(&mut self, labels: &BTreeMap<String, String>) {
        for (k, v) in labels {
            self.set_global_label(k, v);
        }
    }

    pub fn global_labels(&self) -> &BTreeMap<String, String> {
        &self.global_labels
    }

    pub fn export_options(&self) -> &ExportOptions {
        &self.export_options
    }

    pub fn set_export_options(&mut self, options: ExportOptions) {
        self.export_options = options;
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    // ---- instances ----

    pub fn new_instance(&mut self, key: &str) -> Result<&mut Instance> {
        if self.instances.contains_key(key) {
            return Err(MatrixError::DuplicateInstance(key.to_string()));
        }
        let index = self.instances.len();
        for metric in self.metrics.values_mut() {
            metric.push_slot();
        }
        Ok(self
            .instances
            .entry(key.to_string())
            .or_insert_with(|| Instance::new(index)))
    }

    /// Returns the row for `key`, creating it when absent.
    pub fn instance_or_insert(&mut self, key: &str) -> &mut Instance {
        let index = self.instances.len();
        if !self.instances.contains_key(key) {
            for metric in self.metrics.values_mut() {
                metric.push_slot();
            }
        }
        self.instances
            .entry(key.to_string())
            .or_insert_with(|| Instance::new(index))
    }

    pub fn instance(&self, key: &str) -> Option<&Instance> {
        self.instances.get(key)
    }

    pub fn instance_mut(&mut self, key: &str) -> Option<&mut Instance> {
        self.instances.get_mut(key)
    }

    pub fn has_instance(&self, key: &str) -> bool {
        self.instances.contains_key(key)
    }

    /// Removes the row and its slot in every column.
    pub fn remove_instance(&mut self, key: &str) -> Option<Instance> {
        let removed = self.instances.remove(key)?;
        let index = removed.index;
        for metric in self.metrics.values_mut() {
            metric.remove_slot(index);
        }
        for instance in self.instances.values_mut() {
            if instance.index > index {
                instance.index -= 1;
            }
        }
        Some(removed)
    }

    /// Drops every row, keeping metric definitions.
    pub fn purge_instances(&mut self) {
        self.instances.clear();
        for metric in self.metrics.values_mut() {
            metric.values.clear();
        }
    }

    /// Clears values, keeping rows and columns.
    pub fn reset(&mut self) {
        for metric in self.metrics.values_mut() {
            metric.reset();
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Instance keys ordered by row index.
    pub fn instance_keys(&self) -> Vec<String> {
        self.ordered_instances()
            .into_iter()
            .map(|(k, _)| k.to_string())
            .collect()
    }

    /// Rows ordered by index.
    pub fn ordered_instances(&self) -> Vec<(&str, &Instance)> {
        let mut rows: Vec<(&str, &Instance)> = self
            .instances
            .iter()
            .map(|(k, i)| (k.as_str(), i))
            .collect();
        rows.sort_by_key(|(_, i)| i.index);
        rows
    }

    pub fn instances(&self) -> impl Iterator<Item = (&String, &Instance)> {
        self.instances.iter()
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = (&String, &mut Instance)> {
        self.instances.iter_mut()
    }

    /// Keys of rows whose key ends with `suffix`, ordered by index.
    pub fn instances_by_suffix(&self, suffix: &str) -> Vec<String> {
        self.ordered_instances()
            .into_iter()
            .filter(|(k, _)| k.ends_with(suffix))
            .map(|(k, _)| k.to_string())
            .collect()
    }

    pub fn set_instance_exportable(&mut self, key: &str, exportable: bool) -> Result<()> {
        let instance = self
            .instances
            .get_mut(key)
            .ok_or_else(|| MatrixError::InstanceNotFound(key.to_string()))?;
        instance.set_exportable(exportable);
        Ok(())
    }

    pub fn is_instance_exportable(&self, key: &str) -> bool {
        self.instances.get(key).is_some_and(Instance::is_exportable)
    }

    // ---- metrics ----

    pub fn new_metric(&mut self, key: &str, data_type: MetricType) -> Result<&mut Metric> {
        if self.metrics.contains_key(key) {
            return Err(MatrixError::DuplicateMetric(key.to_string()));
        }
        let slots = self.instances.len();
        Ok(self
            .metrics
            .entry(key.to_string())
            .or_insert_with(|| Metric::new(key, data_type, slots)))
    }

    pub fn new_metric_float64(&mut self, key: &str) -> Result<&mut Metric> {
        self.new_metric(key, MetricType::Float64)
    }

    pub fn new_metric_int64(&mut self, key: &str) -> Result<&mut Metric> {
        self.new_metric(key, MetricType::Int64)
    }

    pub fn new_metric_uint64(&mut self, key: &str) -> Result<&mut Metric> {
        self.new_metric(key, MetricType::Uint64)
    }

    pub fn new_metric_uint8(&mut self, key: &str) -> Result<&mut Metric> {
        self.new_metric(key, MetricType::Uint8)
    }

    /// Returns the column for `key`, creating a float64 one when absent.
    pub fn metric_or_insert(&mut self, key: &str) -> &mut Metric {
        let slots = self.instances.len();
        self.metrics
            .entry(key.to_string())
            .or_insert_with(|| Metric::new(key, MetricType::Float64, slots))
    }

    pub fn metric(&self, key: &str) -> Option<&Metric> {
        self.metrics.get(key)
    }

    pub fn metric_mut(&mut self, key: &str) -> Option<&mut Metric> {
        self.metrics.get_mut(key)
    }

    pub fn has_metric(&self, key: &str) -> bool {
        self.metrics.contains_key(key)
    }

    /// Finds a metric by its display name.
    pub fn display_metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.values().find(|m| m.display_name == name)
    }

    /// Key of the metric whose display name is `name`.
    pub fn display_metric_key(&self, name: &str) -> Option<String> {
        self.display_metric(name).map(|m| m.key.clone())
    }

    pub fn metrics(&self) -> impl Iterator<Item = (&String, &Metric)> {
        self.metrics.iter()
    }

    pub fn metrics_mut(&mut self) -> impl Iterator<Item = (&String, &mut Metric)> {
        self.metrics.iter_mut()
    }

    pub fn metric_keys(&self) -> Vec<String> {
        self.metrics.keys().cloned().collect()
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    pub fn remove_metric(&mut self, key: &str) -> Option<Metric> {
        self.metrics.remove(key)
    }

    /// Removes every metric except `key`.
    pub fn retain_metric(&mut self, key: &str) {
        self.metrics.retain(|k, _| k == key);
    }

    // ---- values ----

    fn slot(&self, metric: &str, instance: &str) -> Result<usize> {
        if !self.metrics.contains_key(metric) {
            return Err(MatrixError::MetricNotFound(metric.to_string()));
        }
        self.instances
            .get(instance)
            .map(|i| i.index)
            .ok_or_else(|| MatrixError::InstanceNotFound(instance.to_string()))
    }

    pub fn set_value_float64(&mut self, metric: &str, instance: &str, value: f64) -> Result<()> {
        let index = self.slot(metric, instance)?;
        if let Some(m) = self.metrics.get_mut(metric) {
            m.set_value(index, value);
        }
        Ok(())
    }

    pub fn set_value_int64(&mut self, metric: &str, instance: &str, value: i64) -> Result<()> {
        self.set_value_float64(metric, instance, value as f64)
    }

    pub fn set_value_uint8(&mut self, metric: &str, instance: &str, value: u8) -> Result<()> {
        self.set_value_float64(metric, instance, f64::from(value))
    }

    /// Parses `value` as a float and stores it.
    pub fn set_value_string(&mut self, metric: &str, instance: &str, value: &str) -> Result<()> {
        let parsed: f64 = value
            .trim()
            .parse()
            .map_err(|_| MatrixError::NotNumeric {
                metric: metric.to_string(),
                value: value.to_string(),
            })?;
        self.set_value_float64(metric, instance, parsed)
    }

    pub fn add_value_float64(&mut self, metric: &str, instance: &str, value: f64) -> Result<()> {
        let index = self.slot(metric, instance)?;
        if let Some(m) = self.metrics.get_mut(metric) {
            m.add_value(index, value);
        }
        Ok(())
    }

    /// Value at (metric, instance); `None` when the slot is empty or
    /// either key is unknown.
    pub fn value_float64(&self, metric: &str, instance: &str) -> Option<f64> {
        let index = self.instances.get(instance)?.index;
        self.metrics.get(metric)?.value(index)
    }

    pub fn unset_value(&mut self, metric: &str, instance: &str) {
        if let Ok(index) = self.slot(metric, instance) {
            if let Some(m) = self.metrics.get_mut(metric) {
                m.unset(index);
            }
        }
    }

    /// Sets a value, creating the metric and instance if needed.
    /// Used for bookkeeping matrices where a missing slot must never fail.
    pub fn lazy_set_value_float64(&mut self, metric: &str, instance: &str, value: f64) {
        self.instance_or_insert(instance);
        self.metric_or_insert(metric);
        // both keys exist at this point
        let _ = self.set_value_float64(metric, instance, value);
    }

    pub fn lazy_set_value_int64(&mut self, metric: &str, instance: &str, value: i64) {
        self.lazy_set_value_float64(metric, instance, value as f64);
    }

    pub fn lazy_add_value_float64(&mut self, metric: &str, instance: &str, value: f64) {
        self.instance_or_insert(instance);
        self.metric_or_insert(metric);
        let _ = self.add_value_float64(metric, instance, value);
    }

    // ---- perf arithmetic ----

    /// Replaces `metric` with its difference from the same row in
    /// `previous`. Rows absent from `previous`, empty slots, and negative
    /// differences (counter reset) become empty. Returns how many rows were
    /// skipped.
    pub fn delta(&mut self, metric: &str, previous: &Matrix) -> Result<usize> {
        let prev_metric = previous
            .metrics
            .get(metric)
            .ok_or_else(|| MatrixError::MetricNotFound(metric.to_string()))?;
        let rows: Vec<(usize, Option<f64>)> = self
            .instances
            .iter()
            .map(|(key, inst)| {
                let prev = previous
                    .instances
                    .get(key)
                    .and_then(|p| prev_metric.value(p.index));
                (inst.index, prev)
            })
            .collect();
        let current = self
            .metrics
            .get_mut(metric)
            .ok_or_else(|| MatrixError::MetricNotFound(metric.to_string()))?;
        let mut skipped = 0;
        for (index, prev) in rows {
            match (current.value(index), prev) {
                (Some(cur), Some(prev)) if cur >= prev => {
                    current.set_value(index, cur - prev);
                }
                _ => {
                    current.unset(index);
                    skipped += 1;
                }
            }
        }
        Ok(skipped)
    }

    /// Divides `metric` by `base` row-wise. A zero base yields zero; an
    /// empty base slot empties the row.
    pub fn divide(&mut self, metric: &str, base: &str) -> Result<()> {
        self.divide_with_threshold(metric, base, 0.0)
    }

    /// Like [`divide`](Self::divide), but rows whose base is below
    /// `threshold` become zero.
    pub fn divide_with_threshold(&mut self, metric: &str, base: &str, threshold: f64) -> Result<()> {
        let base_values = self
            .metrics
            .get(base)
            .ok_or_else(|| MatrixError::MetricNotFound(base.to_string()))?
            .values
            .clone();
        let m = self
            .metrics
            .get_mut(metric)
            .ok_or_else(|| MatrixError::MetricNotFound(metric.to_string()))?;
        for (index, base) in base_values.into_iter().enumerate() {
            let Some(value) = m.value(index) else {
                continue;
            };
            match base {
                Some(b) if b != 0.0 && b >= threshold => {
                    m.set_value(index, value / b);
                }
                Some(_) => {
                    m.set_value(index, 0.0);
                }
                None => m.unset(index),
            }
        }
        Ok(())
    }

    pub fn multiply_by_scalar(&mut self, metric: &str, factor: f64) -> Result<()> {
        self.metrics
            .get_mut(metric)
            .ok_or_else(|| MatrixError::MetricNotFound(metric.to_string()))?
            .multiply_by_scalar(factor);
        Ok(())
    }

    // ---- cloning ----

    /// Selective copy used by plugins that republish data.
    pub fn clone_with(&self, options: CloneOptions) -> Matrix {
        let mut clone = Matrix::new(&self.uuid, &self.object, &self.identifier);
        clone.global_labels = self.global_labels.clone();
        clone.export_options = self.export_options.clone();
        clone.exportable = self.exportable;

        if options.instances {
            clone.instances = self.instances.clone();
            if !options.export_instances {
                for instance in clone.instances.values_mut() {
                    instance.set_exportable(true);
                }
            }
        }
        if options.metrics {
            let slots = clone.instances.len();
            for (key, metric) in &self.metrics {
                let mut copy = metric.clone_definition(options.data && options.instances);
                if !options.instances {
                    copy.values = vec![None; slots];
                }
                clone.metrics.insert(key.clone(), copy);
            }
        }
        clone
    }

    /// Flattens the matrix into rows for exporters.
    pub fn export_rows(&self) -> Vec<ExportRow> {
        export::export_rows(self)
    }

    /// Plugin-facing handle; see [`MatrixView`].
    pub fn view(&mut self) -> MatrixView<'_> {
        MatrixView::new(self)
    }

    pub(crate) fn metrics_map_mut(&mut self) -> &mut BTreeMap<String, Metric> {
        &mut self.metrics
    }
}
