use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Numeric representation of a metric column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricType {
    #[default]
    Float64,
    Int64,
    Uint64,
    Uint8,
}

impl MetricType {
    /// Coerces a raw value into the column's domain.
    pub fn coerce(self, value: f64) -> f64 {
        match self {
            MetricType::Float64 => value,
            MetricType::Int64 => value.trunc(),
            MetricType::Uint64 => value.trunc().max(0.0),
            MetricType::Uint8 => value.trunc().clamp(0.0, u8::MAX as f64),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricType::Float64 => "float64",
            MetricType::Int64 => "int64",
            MetricType::Uint64 => "uint64",
            MetricType::Uint8 => "uint8",
        };
        f.write_str(s)
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float64" | "float" => Ok(MetricType::Float64),
            "int64" | "int" => Ok(MetricType::Int64),
            "uint64" | "uint" => Ok(MetricType::Uint64),
            "uint8" => Ok(MetricType::Uint8),
            other => Err(format!("unknown metric type: {other}")),
        }
    }
}

/// One typed column of a [`Matrix`](super::Matrix).
///
/// Slots are aligned with the matrix instance indices. `None` marks a slot
/// that was never written in this cycle, which is distinct from zero.
#[derive(Debug, Clone)]
pub struct Metric {
    pub(crate) key: String,
    pub(crate) display_name: String,
    pub(crate) data_type: MetricType,
    pub(crate) exportable: bool,
    pub(crate) property: String,
    pub(crate) unit: String,
    pub(crate) base_counter: String,
    pub(crate) labels: BTreeMap<String, String>,
    pub(crate) array: bool,
    pub(crate) derived: bool,
    pub(crate) values: Vec<Option<f64>>,
}

impl Metric {
    pub(crate) fn new(key: &str, data_type: MetricType, slots: usize) -> Self {
        Self {
            key: key.to_string(),
            display_name: key.to_string(),
            data_type,
            exportable: true,
            property: String::new(),
            unit: String::new(),
            base_counter: String::new(),
            labels: BTreeMap::new(),
            array: false,
            derived: false,
            values: vec![None; slots],
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Name used on export; defaults to the key.
    pub fn name(&self) -> &str {
        &self.display_name
    }

    pub fn set_name(&mut self, name: &str) {
        self.display_name = name.to_string();
    }

    pub fn data_type(&self) -> MetricType {
        self.data_type
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    /// Counter property (`raw`, `delta`, `rate`, `average`, `percent`).
    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn set_property(&mut self, property: &str) {
        self.property = property.to_string();
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn set_unit(&mut self, unit: &str) {
        self.unit = unit.to_string();
    }

    pub fn base_counter(&self) -> &str {
        &self.base_counter
    }

    pub fn set_base_counter(&mut self, base: &str) {
        self.base_counter = base.to_string();
    }

    /// Sub-labels attached to every exported sample of this metric,
    /// e.g. the bucket of a histogram counter.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.labels.insert(key.to_string(), value.to_string());
    }

    pub fn is_array(&self) -> bool {
        self.array
    }

    pub fn set_array(&mut self, array: bool) {
        self.array = array;
    }

    /// True for metrics created by a plugin rather than the template.
    pub fn is_derived(&self) -> bool {
        self.derived
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied().flatten()
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    /// Writes a slot; returns false if `index` is out of range.
    pub fn set_value(&mut self, index: usize, value: f64) -> bool {
        let coerced = self.data_type.coerce(value);
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = Some(coerced);
                true
            }
            None => false,
        }
    }

    /// Adds to a slot, treating an empty slot as zero.
    pub fn add_value(&mut self, index: usize, value: f64) -> bool {
        let current = self.value(index).unwrap_or(0.0);
        self.set_value(index, current + value)
    }

    pub fn unset(&mut self, index: usize) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = None;
        }
    }

    pub fn reset(&mut self) {
        self.values.iter_mut().for_each(|v| *v = None);
    }

    pub fn multiply_by_scalar(&mut self, factor: f64) {
        for slot in self.values.iter_mut().flatten() {
            *slot *= factor;
        }
    }

    pub(crate) fn push_slot(&mut self) {
        self.values.push(None);
    }

    pub(crate) fn remove_slot(&mut self, index: usize) {
        if index < self.values.len() {
            self.values.remove(index);
        }
    }

    /// Copies the definition, optionally with values.
    pub(crate) fn clone_definition(&self, with_data: bool) -> Self {
        let mut m = self.clone();
        if !with_data {
            m.reset();
        }
        m
    }
}
