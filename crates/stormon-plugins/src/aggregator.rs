//! Roll-ups of instances that share a label value.
//!
//! Rule syntax, one per line:
//!
//! ```text
//! label[<check_label=value|`regex`>object] [include,labels|...] [count]
//! ```
//!
//! `node` groups volumes by node into object `node_volume`;
//! ``node<style=`flex.*`>flexvol_node`` only rolls up matching instances
//! into `flexvol_node`; `node ...` keeps every label of the first
//! contributing instance; a trailing `count` adds an instance count metric.

use crate::error::{PluginError, Result};
use crate::rule_lines;
use regex::Regex;
use std::collections::HashMap;
use stormon_common::matrix::{CloneOptions, ExportOptions, Instance, Matrix, Metric};
use stormon_common::tree::Node;

/// Name of the metric added by the `count` flag.
pub const COUNT_METRIC: &str = "count";

#[derive(Debug, Clone)]
enum Check {
    Value(String),
    Regex(Regex),
}

/// One grouping rule, shared with [`crate::Max`].
#[derive(Debug, Clone)]
pub(crate) struct GroupRule {
    pub(crate) label: String,
    object: Option<String>,
    check: Option<(String, Check)>,
    include_labels: Vec<String>,
    all_labels: bool,
    pub(crate) count: bool,
}

impl GroupRule {
    pub(crate) fn parse(line: &str) -> Result<Self> {
        let mut fields: Vec<&str> = line.split_whitespace().collect();
        let count = fields.len() > 1 && fields.last() == Some(&COUNT_METRIC);
        if count {
            fields.pop();
        }
        if fields.is_empty() || fields.len() > 2 {
            return Err(PluginError::invalid(line, "expected: label<check>object [labels]"));
        }

        let mut rule = GroupRule {
            label: String::new(),
            object: None,
            check: None,
            include_labels: Vec::new(),
            all_labels: false,
            count,
        };
        let (label, suffix) = match fields[0].split_once('<') {
            Some((label, suffix)) => (label, Some(suffix)),
            None => (fields[0], None),
        };
        rule.label = label.trim().to_string();
        if rule.label.is_empty() {
            return Err(PluginError::invalid(line, "missing label"));
        }

        if let Some(suffix) = suffix {
            let (check, object) = suffix.split_once('>').unwrap_or((suffix, ""));
            let (check_label, value) = match check.split_once('=') {
                Some((l, v)) => (l.to_string(), v),
                None => (rule.label.clone(), check),
            };
            if let Some(pattern) = value.strip_prefix('`') {
                let pattern = pattern.strip_suffix('`').unwrap_or(pattern);
                let regex = Regex::new(pattern).map_err(|e| PluginError::invalid(line, e.to_string()))?;
                rule.check = Some((check_label, Check::Regex(regex)));
            } else if !value.is_empty() {
                rule.check = Some((check_label, Check::Value(value.to_string())));
            }
            if !object.is_empty() {
                rule.object = Some(object.to_lowercase());
            }
        }

        if let Some(labels) = fields.get(1) {
            if labels.trim() == "..." {
                rule.all_labels = true;
            } else {
                rule.include_labels = labels.split(',').map(str::to_string).collect();
            }
        }
        Ok(rule)
    }

    /// Group name for `instance`, when it carries the label and passes the check.
    pub(crate) fn group_of<'a>(&self, instance: &'a Instance) -> Option<&'a str> {
        let name = instance.label(&self.label).filter(|v| !v.is_empty())?;
        let passes = match &self.check {
            None => true,
            Some((label, Check::Value(v))) => instance.label_or_empty(label) == v,
            Some((label, Check::Regex(r))) => r.is_match(instance.label_or_empty(label)),
        };
        passes.then_some(name)
    }

    pub(crate) fn object_name(&self, parent: &str) -> String {
        self.object
            .clone()
            .unwrap_or_else(|| format!("{}_{parent}", self.label.to_lowercase()))
    }

    fn instance_key(&self, name: &str, instance: &Instance) -> String {
        if self.all_labels {
            instance
                .labels()
                .values()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(".")
        } else {
            let mut key = name.to_string();
            for label in &self.include_labels {
                key.push('.');
                key.push_str(instance.label_or_empty(label));
            }
            key
        }
    }

    pub(crate) fn copy_labels(&self, name: &str, from: &Instance, to: &mut Instance) {
        if self.all_labels {
            to.set_labels(from.labels().clone());
            return;
        }
        for label in &self.include_labels {
            to.set_label(label, from.label_or_empty(label));
        }
        to.set_label(&self.label, name);
    }

    /// Labels surfaced on the derived matrix.
    pub(crate) fn added_labels(&self) -> Vec<String> {
        if self.all_labels {
            return Vec::new();
        }
        let mut labels = vec![self.label.clone()];
        labels.extend(self.include_labels.iter().cloned());
        labels
    }

    pub(crate) fn export_options(&self) -> ExportOptions {
        if self.all_labels {
            return ExportOptions::default();
        }
        let labels = self.added_labels();
        let keys: Vec<&str> = labels.iter().map(String::as_str).collect();
        ExportOptions::with_keys(&keys)
    }
}

pub(crate) fn parse_rules(params: &Node) -> Result<Vec<GroupRule>> {
    let rules = rule_lines(params)
        .iter()
        .map(|line| GroupRule::parse(line))
        .collect::<Result<Vec<_>>>()?;
    if rules.is_empty() {
        return Err(PluginError::MissingParam("rules".to_string()));
    }
    Ok(rules)
}

/// Metrics that are averaged rather than summed.
fn is_average(metric: &Metric) -> bool {
    let name = metric.name();
    matches!(metric.property(), "average" | "percent")
        || name.contains("average_")
        || name.contains("avg_")
        || name.contains("_latency")
}

#[derive(Default)]
struct Sums {
    count: usize,
    weighted: f64,
    weights: f64,
    weighted_count: usize,
}

struct Rollup {
    matrix: Matrix,
    sums: HashMap<(String, String), Sums>,
    count: bool,
}

/// Sums (or averages) metrics per distinct label value into a new matrix
/// per rule.
#[derive(Debug, Clone)]
pub struct Aggregator {
    rules: Vec<GroupRule>,
}

impl Aggregator {
    pub fn new(params: &Node) -> Result<Self> {
        let rules = parse_rules(params)?;
        tracing::debug!(rules = rules.len(), "parsed aggregation rules");
        Ok(Self { rules })
    }

    pub fn new_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for label in self.rules.iter().flat_map(GroupRule::added_labels) {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        labels
    }

    pub fn run(&mut self, data: &Matrix) -> Result<Vec<Matrix>> {
        let mut rollups: Vec<Rollup> = self
            .rules
            .iter()
            .map(|rule| {
                let mut matrix = data.clone_with(CloneOptions {
                    metrics: true,
                    ..Default::default()
                });
                matrix.object = rule.object_name(&data.object);
                matrix.uuid.push_str(".Aggregator");
                matrix.set_export_options(rule.export_options());
                matrix.set_exportable(true);
                let count = rule.count && matrix.new_metric_float64(COUNT_METRIC).is_ok();
                if rule.count && !count {
                    tracing::warn!(object = %matrix.object, "matrix already has a count metric, count disabled");
                }
                Rollup {
                    matrix,
                    sums: HashMap::new(),
                    count,
                }
            })
            .collect();

        for (_, instance) in data.ordered_instances() {
            if !instance.is_exportable() {
                continue;
            }
            for (rule, rollup) in self.rules.iter().zip(rollups.iter_mut()) {
                let Some(name) = rule.group_of(instance) else {
                    continue;
                };
                let key = rule.instance_key(name, instance);
                if !rollup.matrix.has_instance(&key) {
                    let target = rollup.matrix.new_instance(&key)?;
                    rule.copy_labels(name, instance, target);
                }

                for (metric_key, metric) in data.metrics() {
                    let Some(value) = metric.value(instance.index()) else {
                        continue;
                    };
                    rollup.matrix.add_value_float64(metric_key, &key, value)?;
                    let sums = rollup.sums.entry((key.clone(), metric_key.clone())).or_default();
                    sums.count += 1;
                    if is_average(metric) {
                        let base = data
                            .metric(metric.base_counter())
                            .and_then(|b| b.value(instance.index()));
                        if let Some(base) = base {
                            sums.weighted += value * base;
                            sums.weights += base;
                            sums.weighted_count += 1;
                        }
                    }
                }
                if rollup.count {
                    rollup.matrix.add_value_float64(COUNT_METRIC, &key, 1.0)?;
                }
            }
        }

        let mut out = Vec::with_capacity(rollups.len());
        for mut rollup in rollups {
            normalize_averages(&mut rollup)?;
            out.push(rollup.matrix);
        }
        Ok(out)
    }
}

/// Turns summed average-like metrics into averages, weighted by the base
/// counter when every contributing instance had one.
fn normalize_averages(rollup: &mut Rollup) -> Result<()> {
    let averaged: Vec<String> = rollup
        .matrix
        .metrics()
        .filter(|(_, m)| is_average(m))
        .map(|(k, _)| k.clone())
        .collect();
    for metric in averaged {
        for key in rollup.matrix.instance_keys() {
            let Some(sums) = rollup.sums.get(&(key.clone(), metric.clone())) else {
                continue;
            };
            if sums.count == 0 {
                continue;
            }
            let value = if sums.weighted_count == sums.count && sums.weights > 0.0 {
                sums.weighted / sums.weights
            } else {
                match rollup.matrix.value_float64(&metric, &key) {
                    Some(total) => total / sums.count as f64,
                    None => continue,
                }
            };
            rollup.matrix.set_value_float64(&metric, &key, value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(rules: &[&str]) -> Aggregator {
        let mut params = Node::new("Aggregator");
        for r in rules {
            params.new_child("", r);
        }
        Aggregator::new(&params).unwrap()
    }

    fn volumes() -> Matrix {
        let mut m = Matrix::new("cluster1", "volume", "volume");
        m.set_global_label("cluster", "cluster1");
        m.new_metric_float64("size").unwrap();
        m.new_metric_float64("read_latency").unwrap().set_base_counter("read_ops");
        m.new_metric_float64("read_ops").unwrap();
        m.new_metric_float64("used_percent").unwrap().set_property("percent");
        let rows = [
            ("v1", "n1", "flexvol", "s1", 100.0, 2.0, 10.0, 10.0),
            ("v2", "n1", "flexvol", "s2", 300.0, 6.0, 30.0, 30.0),
            ("v3", "n2", "flexgroup", "s1", 50.0, 4.0, 0.0, 50.0),
        ];
        for (key, node, style, svm, size, latency, ops, pct) in rows {
            let instance = m.new_instance(key).unwrap();
            instance.set_label("node", node);
            instance.set_label("style", style);
            instance.set_label("svm", svm);
            m.set_value_float64("size", key, size).unwrap();
            m.set_value_float64("read_latency", key, latency).unwrap();
            m.set_value_float64("read_ops", key, ops).unwrap();
            m.set_value_float64("used_percent", key, pct).unwrap();
        }
        m.new_instance("v4").unwrap().set_label("node", "n2");
        m.set_value_float64("size", "v4", 999.0).unwrap();
        m.set_instance_exportable("v4", false).unwrap();
        m
    }

    #[test]
    fn should_parse_rule_variants() {
        let rule = GroupRule::parse("node<style=`flex.*`>FlexNode svm,style count").unwrap();
        assert_eq!(rule.label, "node");
        assert_eq!(rule.object_name("volume"), "flexnode");
        assert!(rule.count);
        assert_eq!(rule.added_labels(), vec!["node", "svm", "style"]);

        let rule = GroupRule::parse("node<n1>").unwrap();
        assert_eq!(rule.object_name("volume"), "node_volume");
        assert!(matches!(rule.check, Some((ref l, Check::Value(ref v))) if l == "node" && v == "n1"));

        assert!(GroupRule::parse("node a b c").is_err());
        assert!(GroupRule::parse("node<x=`(`>").is_err());
    }

    #[test]
    fn should_sum_and_average_per_label() {
        let mut agg = aggregator(&["node count"]);
        let data = volumes();
        let out = agg.run(&data).unwrap();
        assert_eq!(out.len(), 1);
        let node = &out[0];

        assert_eq!(node.object, "node_volume");
        assert_eq!(node.uuid, "cluster1.Aggregator");
        assert_eq!(node.global_labels().get("cluster").map(String::as_str), Some("cluster1"));
        assert_eq!(node.instance_keys(), vec!["n1", "n2"]);
        assert_eq!(node.export_options().instance_keys, vec!["node"]);

        assert_eq!(node.value_float64("size", "n1"), Some(400.0));
        // v4 is not exportable
        assert_eq!(node.value_float64("size", "n2"), Some(50.0));
        assert_eq!(node.value_float64("read_ops", "n1"), Some(40.0));
        // (2*10 + 6*30) / 40
        assert_eq!(node.value_float64("read_latency", "n1"), Some(5.0));
        // no weight: plain average
        assert_eq!(node.value_float64("read_latency", "n2"), Some(4.0));
        assert_eq!(node.value_float64("used_percent", "n1"), Some(20.0));
        assert_eq!(node.value_float64(COUNT_METRIC, "n1"), Some(2.0));
        assert_eq!(node.value_float64(COUNT_METRIC, "n2"), Some(1.0));
        assert!(!data.has_metric(COUNT_METRIC));
    }

    #[test]
    fn should_filter_and_key_by_included_labels() {
        let mut agg = aggregator(&["node<style=`^flex`>flex_svm svm", "svm<style=flexgroup>"]);
        let out = agg.run(&volumes()).unwrap();

        let by_svm = &out[0];
        assert_eq!(by_svm.object, "flex_svm");
        assert_eq!(by_svm.instance_keys(), vec!["n1.s1", "n1.s2", "n2.s1"]);
        let instance = by_svm.instance("n1.s2").unwrap();
        assert_eq!(instance.label("node"), Some("n1"));
        assert_eq!(instance.label("svm"), Some("s2"));
        assert_eq!(by_svm.export_options().instance_keys, vec!["node", "svm"]);

        assert_eq!(out[1].object, "svm_volume");
        assert_eq!(out[1].instance_keys(), vec!["s1"]);
        assert_eq!(out[1].value_float64("size", "s1"), Some(50.0));
        assert_eq!(agg.new_labels(), vec!["node", "svm"]);
    }

    #[test]
    fn should_keep_all_labels_with_ellipsis() {
        let mut agg = aggregator(&["node ..."]);
        let out = agg.run(&volumes()).unwrap();
        let m = &out[0];
        assert_eq!(m.instance_keys(), vec!["n1.flexvol.s1", "n1.flexvol.s2", "n2.flexgroup.s1"]);
        assert!(m.export_options().include_all_labels);
        assert_eq!(m.instance("n2.flexgroup.s1").unwrap().label("style"), Some("flexgroup"));
    }
}
