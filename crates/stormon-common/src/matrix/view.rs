use super::{Instance, Matrix, MatrixError, Metric, MetricType, Result};

/// Mutable handle given to plugins.
///
/// Plugins may rewrite instance labels, toggle per-instance export, and
/// create or write metrics of their own. Metric definitions that came from
/// the template stay read-only.
pub struct MatrixView<'a> {
    inner: &'a mut Matrix,
}

impl<'a> MatrixView<'a> {
    pub(super) fn new(inner: &'a mut Matrix) -> Self {
        Self { inner }
    }

    /// Read-only access to the whole matrix.
    pub fn matrix(&self) -> &Matrix {
        self.inner
    }

    pub fn object(&self) -> &str {
        &self.inner.object
    }

    pub fn instance_keys(&self) -> Vec<String> {
        self.inner.instance_keys()
    }

    pub fn instance(&self, key: &str) -> Option<&Instance> {
        self.inner.instance(key)
    }

    /// Label and export-flag access for one row.
    pub fn instance_mut(&mut self, key: &str) -> Option<&mut Instance> {
        self.inner.instance_mut(key)
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = (&String, &mut Instance)> {
        self.inner.instances_mut()
    }

    pub fn value_float64(&self, metric: &str, instance: &str) -> Option<f64> {
        self.inner.value_float64(metric, instance)
    }

    /// Creates a plugin-owned metric, or returns it if this or an earlier
    /// run already created it.
    pub fn derive_metric(&mut self, key: &str, data_type: MetricType) -> Result<&mut Metric> {
        let slots = self.inner.instance_count();
        let metrics = self.inner.metrics_map_mut();
        match metrics.get(key) {
            Some(existing) if !existing.is_derived() => {
                return Err(MatrixError::DuplicateMetric(key.to_string()));
            }
            _ => {}
        }
        Ok(metrics.entry(key.to_string()).or_insert_with(|| {
            let mut m = Metric::new(key, data_type, slots);
            m.derived = true;
            m
        }))
    }

    pub fn set_derived_value(&mut self, metric: &str, instance: &str, value: f64) -> Result<()> {
        match self.inner.metric(metric) {
            Some(m) if m.is_derived() => self.inner.set_value_float64(metric, instance, value),
            Some(_) => Err(MatrixError::NotDerived(metric.to_string())),
            None => Err(MatrixError::MetricNotFound(metric.to_string())),
        }
    }
}
