use super::Matrix;
use serde::{Deserialize, Serialize};

/// Which labels a matrix surfaces downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Labels that identify a series.
    #[serde(default)]
    pub instance_keys: Vec<String>,
    /// Informational labels.
    #[serde(default)]
    pub instance_labels: Vec<String>,
    /// Export every instance label regardless of the lists above.
    #[serde(default = "default_include_all_labels")]
    pub include_all_labels: bool,
}

fn default_include_all_labels() -> bool {
    true
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            instance_keys: Vec::new(),
            instance_labels: Vec::new(),
            include_all_labels: true,
        }
    }
}

impl ExportOptions {
    pub fn with_keys(keys: &[&str]) -> Self {
        Self {
            instance_keys: keys.iter().map(|s| s.to_string()).collect(),
            instance_labels: Vec::new(),
            include_all_labels: false,
        }
    }

    fn selects(&self, label: &str) -> bool {
        self.include_all_labels
            || self.instance_keys.iter().any(|k| k == label)
            || self.instance_labels.iter().any(|k| k == label)
    }
}

/// One exported sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub object: String,
    pub instance_key: String,
    pub labels: Vec<(String, String)>,
    pub metric: String,
    pub value: f64,
}

pub(super) fn export_rows(matrix: &Matrix) -> Vec<ExportRow> {
    let mut rows = Vec::new();
    if !matrix.is_exportable() {
        return rows;
    }
    let options = matrix.export_options();

    for (key, instance) in matrix.ordered_instances() {
        if !instance.is_exportable() {
            continue;
        }

        // instance labels win; globals only fill gaps
        let mut labels: Vec<(String, String)> = instance
            .labels()
            .iter()
            .filter(|(k, _)| options.selects(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in matrix.global_labels() {
            if !labels.iter().any(|(lk, _)| lk == k) {
                labels.push((k.clone(), v.clone()));
            }
        }

        for (_, metric) in matrix.metrics() {
            if !metric.is_exportable() {
                continue;
            }
            let Some(value) = metric.value(instance.index()) else {
                continue;
            };
            let mut metric_labels = labels.clone();
            for (k, v) in metric.labels() {
                metric_labels.push((k.clone(), v.clone()));
            }
            rows.push(ExportRow {
                object: matrix.object.clone(),
                instance_key: key.to_string(),
                labels: metric_labels,
                metric: metric.name().to_string(),
                value,
            });
        }
    }
    rows
}
