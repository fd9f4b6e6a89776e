//! Turning raw performance counters into exported values.
//!
//! Both perf collectors keep the previous poll's raw values as a cache in
//! the collector matrix. Each data poll clones the skeleton, fills in the
//! new raw values, and hands both to [`cook`], which applies the counter
//! properties. The first poll after start only fills the cache.

use crate::base::CollectorCore;
use crate::error::Result;
use crate::Task;
use std::fmt;
use std::time::Instant;
use stormon_common::matrix::{CloneOptions, Matrix};

/// Hidden per-row metric holding the sample time in seconds.
pub const TIMESTAMP: &str = "timestamp";

/// Minimum base-counter delta for latency averages; smaller bases yield 0.
pub const DEFAULT_LATENCY_IO_REQD: f64 = 10.0;

/// How a raw counter becomes an exported value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    /// Exported as read.
    Raw,
    /// Difference from the previous poll.
    Delta,
    /// Delta per second.
    Rate,
    /// Delta divided by the base counter's delta.
    Average,
    /// Average times 100.
    Percent,
}

impl Property {
    pub const ALL: [Property; 5] = [
        Property::Raw,
        Property::Delta,
        Property::Rate,
        Property::Average,
        Property::Percent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Property::Raw => "raw",
            Property::Delta => "delta",
            Property::Rate => "rate",
            Property::Average => "average",
            Property::Percent => "percent",
        }
    }

    /// Finds the property in a description such as `rate,no-display`.
    /// REST counter types use the same words.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.to_ascii_lowercase();
        Property::ALL.into_iter().find(|p| s.contains(p.as_str()))
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of an array counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayLabel {
    /// Appended to the counter name to form the metric key.
    pub suffix: String,
    pub metric: String,
    pub submetric: Option<String>,
}

/// Elements of an array counter from its comma-separated label lists. A
/// second list makes a two-dimensional counter, enumerated row-major.
///
/// ```rust
/// use stormon_collector::perf::array_labels;
///
/// let flat = array_labels("read,write", None);
/// assert_eq!(flat[1].suffix, "write");
///
/// let grid = array_labels("read,write", Some("<1us,<2us"));
/// let suffixes: Vec<&str> = grid.iter().map(|l| l.suffix.as_str()).collect();
/// assert_eq!(suffixes, ["read.<1us", "read.<2us", "write.<1us", "write.<2us"]);
/// ```
pub fn array_labels(first: &str, second: Option<&str>) -> Vec<ArrayLabel> {
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    };
    let outer = split(first);
    match second.map(split).filter(|inner| !inner.is_empty()) {
        None => outer
            .into_iter()
            .map(|metric| ArrayLabel {
                suffix: metric.clone(),
                metric,
                submetric: None,
            })
            .collect(),
        Some(inner) => outer
            .iter()
            .flat_map(|o| {
                inner.iter().map(move |i| ArrayLabel {
                    suffix: format!("{o}.{i}"),
                    metric: o.clone(),
                    submetric: Some(i.clone()),
                })
            })
            .collect(),
    }
}

/// Adds the hidden timestamp metric if missing.
pub(crate) fn ensure_timestamp(matrix: &mut Matrix) {
    let metric = matrix.metric_or_insert(TIMESTAMP);
    metric.set_property(Property::Raw.as_str());
    metric.set_exportable(false);
}

/// Empty copy of the cache for the next batch of raw values.
pub(crate) fn fresh_data(cache: &Matrix) -> Matrix {
    let mut data = cache.clone_with(CloneOptions {
        data: false,
        metrics: true,
        instances: true,
        export_instances: true,
    });
    data.reset();
    data
}

/// Counts of what [`cook`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CookReport {
    pub cooked: usize,
    /// Metrics whose delta failed and were blanked.
    pub failed: usize,
    /// Rows without a usable previous value, summed over metrics.
    pub skipped_rows: usize,
}

/// Applies counter properties to `data` using `previous` raw values.
///
/// Order matters: the timestamp delta comes first, metrics without a
/// base counter before those with one (so bases are already deltas when
/// divided by), and rates last, after averages have used the raw deltas.
pub fn cook(data: &mut Matrix, previous: &Matrix, latency_io_reqd: f64) -> CookReport {
    let mut report = CookReport::default();

    if let Err(e) = data.delta(TIMESTAMP, previous) {
        tracing::error!(object = %data.object, error = %e, "timestamp delta failed");
    }

    let mut ordered: Vec<(String, Property, String, String)> = data
        .metrics()
        .filter(|(key, _)| key.as_str() != TIMESTAMP)
        .filter_map(|(key, metric)| match Property::parse(metric.property()) {
            Some(property) => Some((
                key.clone(),
                property,
                metric.base_counter().to_string(),
                metric.name().to_string(),
            )),
            None => {
                tracing::warn!(
                    object = %data.object,
                    counter = %key,
                    property = %metric.property(),
                    "unknown counter property, exporting raw"
                );
                None
            }
        })
        .collect();
    ordered.sort_by_key(|(_, _, base, _)| !base.is_empty());

    let mut rates = Vec::new();
    for (key, property, base, name) in &ordered {
        if *property == Property::Raw {
            continue;
        }
        match data.delta(key, previous) {
            Ok(skipped) => report.skipped_rows += skipped,
            Err(e) => {
                tracing::warn!(object = %data.object, counter = %key, error = %e, "delta failed, dropping values");
                if let Some(metric) = data.metric_mut(key) {
                    metric.reset();
                }
                report.failed += 1;
                continue;
            }
        }
        match property {
            Property::Raw | Property::Delta => {}
            Property::Rate => rates.push(key.clone()),
            Property::Average | Property::Percent => {
                if base.is_empty() || !data.has_metric(base) {
                    tracing::warn!(object = %data.object, counter = %key, base = %base, "base counter missing");
                    continue;
                }
                let divided = if name.ends_with("latency") {
                    data.divide_with_threshold(key, base, latency_io_reqd)
                } else {
                    data.divide(key, base)
                };
                if let Err(e) = divided {
                    tracing::warn!(object = %data.object, counter = %key, error = %e, "division by base failed");
                    continue;
                }
                if *property == Property::Percent {
                    let _ = data.multiply_by_scalar(key, 100.0);
                }
            }
        }
        report.cooked += 1;
    }

    for key in rates {
        if let Err(e) = data.divide(&key, TIMESTAMP) {
            tracing::warn!(object = %data.object, counter = %key, error = %e, "rate calculation failed");
        }
    }
    report
}

/// Ends a perf data poll: caches the raw values and, unless this is the
/// first poll, cooks and publishes.
pub(crate) fn finish_poll(
    core: &mut CollectorCore,
    mut data: Matrix,
    cache_ready: &mut bool,
    latency_io_reqd: f64,
) -> Result<Vec<Matrix>> {
    let raw = data.clone();
    if !*cache_ready {
        tracing::debug!(object = %core.template.object, "first data poll cached, nothing to publish yet");
        core.matrix = raw;
        *cache_ready = true;
        return Ok(vec![core.metadata.matrix().clone()]);
    }

    let started = Instant::now();
    let report = cook(&mut data, &core.matrix, latency_io_reqd);
    core.matrix = raw;
    core.metadata
        .set(Task::Data, "calc_time", started.elapsed().as_micros() as f64);
    tracing::trace!(
        object = %core.template.object,
        cooked = report.cooked,
        failed = report.failed,
        skipped_rows = report.skipped_rows,
        "cooked counters"
    );
    Ok(core.publish(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(m: &mut Matrix, key: &str, property: &str, base: &str) {
        let metric = m.new_metric_float64(key).unwrap();
        metric.set_property(property);
        metric.set_base_counter(base);
    }

    fn skeleton() -> Matrix {
        let mut m = Matrix::new("u", "volume", "volume");
        ensure_timestamp(&mut m);
        metric(&mut m, "total_ops", "rate", "");
        metric(&mut m, "read_ops", "delta", "");
        metric(&mut m, "read_latency", "average", "read_ops");
        metric(&mut m, "cpu_busy", "percent", "cpu_elapsed");
        metric(&mut m, "cpu_elapsed", "delta", "");
        metric(&mut m, "size", "raw", "");
        m.new_instance("v1").unwrap();
        m
    }

    fn sample(ts: f64, values: &[(&str, f64)]) -> Matrix {
        let mut m = fresh_data(&skeleton());
        m.set_value_float64(TIMESTAMP, "v1", ts).unwrap();
        for (key, v) in values {
            m.set_value_float64(key, "v1", *v).unwrap();
        }
        m
    }

    #[test]
    fn should_parse_properties_from_descriptions() {
        assert_eq!(Property::parse("rate,no-display"), Some(Property::Rate));
        assert_eq!(Property::parse("average"), Some(Property::Average));
        assert_eq!(Property::parse("RAW"), Some(Property::Raw));
        assert_eq!(Property::parse("string"), None);
    }

    #[test]
    fn should_cook_each_property() {
        let previous = sample(
            100.0,
            &[("total_ops", 1000.0), ("read_ops", 500.0), ("read_latency", 10_000.0), ("cpu_busy", 20.0), ("cpu_elapsed", 100.0), ("size", 7.0)],
        );
        let mut current = sample(
            160.0,
            &[("total_ops", 1600.0), ("read_ops", 600.0), ("read_latency", 12_000.0), ("cpu_busy", 70.0), ("cpu_elapsed", 200.0), ("size", 9.0)],
        );

        let report = cook(&mut current, &previous, DEFAULT_LATENCY_IO_REQD);

        assert_eq!(report.failed, 0);
        assert_eq!(current.value_float64("total_ops", "v1"), Some(10.0));
        assert_eq!(current.value_float64("read_ops", "v1"), Some(100.0));
        assert_eq!(current.value_float64("read_latency", "v1"), Some(20.0));
        assert_eq!(current.value_float64("cpu_busy", "v1"), Some(50.0));
        assert_eq!(current.value_float64("size", "v1"), Some(9.0));
        assert_eq!(current.value_float64(TIMESTAMP, "v1"), Some(60.0));
    }

    #[test]
    fn should_zero_latency_below_io_threshold() {
        let previous = sample(0.0, &[("read_ops", 500.0), ("read_latency", 10_000.0)]);
        let mut current = sample(60.0, &[("read_ops", 505.0), ("read_latency", 12_000.0)]);
        cook(&mut current, &previous, DEFAULT_LATENCY_IO_REQD);
        assert_eq!(current.value_float64("read_latency", "v1"), Some(0.0));
    }

    #[test]
    fn should_blank_rows_after_counter_reset() {
        let previous = sample(0.0, &[("read_ops", 500.0)]);
        let mut current = sample(60.0, &[("read_ops", 10.0)]);
        let report = cook(&mut current, &previous, DEFAULT_LATENCY_IO_REQD);
        assert_eq!(current.value_float64("read_ops", "v1"), None);
        assert!(report.skipped_rows >= 1);
    }

    #[test]
    fn should_expand_two_dimensional_labels() {
        let labels = array_labels("read, write", Some("a,b"));
        assert_eq!(labels.len(), 4);
        assert_eq!(labels[3].metric, "write");
        assert_eq!(labels[3].submetric.as_deref(), Some("b"));
        assert!(array_labels("", None).is_empty());
    }
}
