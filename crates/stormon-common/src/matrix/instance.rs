use std::collections::BTreeMap;

/// One row of a [`Matrix`](super::Matrix).
#[derive(Debug, Clone)]
pub struct Instance {
    pub(crate) index: usize,
    labels: BTreeMap<String, String>,
    exportable: bool,
}

impl Instance {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            labels: BTreeMap::new(),
            exportable: true,
        }
    }

    /// Position of this row in every metric column.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Label value, or `""` when absent.
    pub fn label_or_empty(&self, key: &str) -> &str {
        self.label(key).unwrap_or("")
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.labels.insert(key.to_string(), value.to_string());
    }

    pub fn remove_label(&mut self, key: &str) -> Option<String> {
        self.labels.remove(key)
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn set_labels(&mut self, labels: BTreeMap<String, String>) {
        self.labels = labels;
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }
}
