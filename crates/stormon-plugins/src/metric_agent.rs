//! Arithmetic over existing metrics.
//!
//! ```yaml
//! plugins:
//!   - MetricAgent:
//!       compute_metric:
//!         - inode_used_percent PERCENT inode_files_used inode_files_total
//!         - space_total ADD space_available space_used
//! ```
//!
//! Operands are metric display names or keys, or numeric literals. The
//! result is written to a new float metric on the same matrix.

use crate::error::{PluginError, Result};
use crate::{rule_lines, DerivedMetric};
use std::str::FromStr;
use stormon_common::matrix::{Matrix, MatrixView, MetricType};
use stormon_common::tree::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Percent,
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ADD" => Ok(Operation::Add),
            "SUB" | "SUBTRACT" => Ok(Operation::Subtract),
            "MUL" | "MULTIPLY" => Ok(Operation::Multiply),
            "DIV" | "DIVIDE" => Ok(Operation::Divide),
            "PERCENT" => Ok(Operation::Percent),
            other => Err(format!("unknown operation [{other}]")),
        }
    }
}

impl Operation {
    /// Division by zero yields zero.
    fn apply(self, acc: f64, v: f64) -> f64 {
        match self {
            Operation::Add => acc + v,
            Operation::Subtract => acc - v,
            Operation::Multiply => acc * v,
            Operation::Divide if v == 0.0 => 0.0,
            Operation::Divide => acc / v,
            Operation::Percent if v == 0.0 => 0.0,
            Operation::Percent => acc / v * 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Metric(String),
    Literal(f64),
}

#[derive(Debug, Clone)]
struct ComputeRule {
    metric: String,
    operation: Operation,
    operands: Vec<Operand>,
    raw: String,
}

#[derive(Debug, Clone)]
pub struct MetricAgent {
    rules: Vec<ComputeRule>,
}

impl MetricAgent {
    pub fn new(params: &Node) -> Result<Self> {
        let mut rules = Vec::new();
        for line in params.child("compute_metric").map(rule_lines).unwrap_or_default() {
            match parse_rule(&line) {
                Ok(rule) => rules.push(rule),
                Err(e) => tracing::warn!(error = %e, "ignoring compute_metric rule"),
            }
        }
        if rules.is_empty() {
            return Err(PluginError::MissingParam("valid rules".to_string()));
        }
        tracing::debug!(rules = rules.len(), "parsed metric agent rules");
        Ok(Self { rules })
    }

    pub fn new_metrics(&self) -> Vec<DerivedMetric> {
        self.rules
            .iter()
            .map(|r| DerivedMetric {
                name: r.metric.clone(),
                source: r.raw.split_whitespace().skip(2).collect::<Vec<_>>().join(", "),
            })
            .collect()
    }

    pub fn run(&mut self, data: &mut MatrixView<'_>) -> Result<()> {
        for rule in &self.rules {
            let Some(operands) = resolve_operands(data.matrix(), rule) else {
                continue;
            };
            data.derive_metric(&rule.metric, MetricType::Float64)?
                .set_property("compute_metric mapping");

            let m = data.matrix();
            let results: Vec<(String, f64)> = m
                .ordered_instances()
                .into_iter()
                .filter_map(|(key, _)| {
                    let value = |op: &Operand| match op {
                        Operand::Literal(v) => Some(*v),
                        Operand::Metric(k) => m.value_float64(k, key),
                    };
                    // the first operand must be present; later ones default to zero
                    let first = value(&operands[0])?;
                    let result = operands[1..]
                        .iter()
                        .fold(first, |acc, op| rule.operation.apply(acc, value(op).unwrap_or(0.0)));
                    Some((key.to_string(), result))
                })
                .collect();
            for (key, value) in results {
                data.set_derived_value(&rule.metric, &key, value)?;
            }
        }
        Ok(())
    }
}

fn parse_rule(line: &str) -> Result<ComputeRule> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(PluginError::invalid(line, "expected: metric OPERATION operand operand..."));
    }
    let operation = fields[1]
        .parse::<Operation>()
        .map_err(|e| PluginError::invalid(line, e))?;
    let operands = fields[2..]
        .iter()
        .map(|f| match f.parse::<f64>() {
            Ok(v) => Operand::Literal(v),
            Err(_) => Operand::Metric(f.to_string()),
        })
        .collect();
    Ok(ComputeRule {
        metric: fields[0].to_string(),
        operation,
        operands,
        raw: line.to_string(),
    })
}

/// Maps operand names to metric keys, looking up display names first.
/// Returns `None` when any named operand is missing.
fn resolve_operands(m: &Matrix, rule: &ComputeRule) -> Option<Vec<Operand>> {
    rule.operands
        .iter()
        .map(|op| match op {
            Operand::Literal(v) => Some(Operand::Literal(*v)),
            Operand::Metric(name) => {
                let key = m
                    .display_metric_key(name)
                    .or_else(|| m.has_metric(name).then(|| name.clone()));
                if key.is_none() {
                    tracing::warn!(metric = %rule.metric, operand = %name, "compute_metric operand not found");
                }
                key.map(Operand::Metric)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(rules: &[&str]) -> Result<MetricAgent> {
        let mut params = Node::new("MetricAgent");
        let child = params.new_child("compute_metric", "");
        for r in rules {
            child.new_child("", r);
        }
        MetricAgent::new(&params)
    }

    fn volume() -> Matrix {
        let mut m = Matrix::new("u", "volume", "volume");
        m.new_metric_float64("files_used").unwrap();
        m.new_metric_float64("files_total").unwrap();
        m.new_metric_float64("space.available")
            .unwrap()
            .set_name("space_available");
        m.new_metric_float64("space.used").unwrap().set_name("space_used");
        for (key, used, total, avail, sp_used) in [("a", 25.0, 100.0, 300.0, 100.0), ("b", 5.0, 0.0, 10.0, 5.0)] {
            m.new_instance(key).unwrap();
            m.set_value_float64("files_used", key, used).unwrap();
            m.set_value_float64("files_total", key, total).unwrap();
            m.set_value_float64("space.available", key, avail).unwrap();
            m.set_value_float64("space.used", key, sp_used).unwrap();
        }
        m.new_instance("c").unwrap();
        m
    }

    #[test]
    fn should_require_rules() {
        assert!(matches!(agent(&[]).unwrap_err(), PluginError::MissingParam(_)));
        assert!(matches!(
            agent(&["x MODULO a b"]).unwrap_err(),
            PluginError::MissingParam(_)
        ));
    }

    #[test]
    fn should_parse_operation_aliases() {
        assert_eq!("add".parse::<Operation>(), Ok(Operation::Add));
        assert_eq!("Sub".parse::<Operation>(), Ok(Operation::Subtract));
        assert_eq!("MULTIPLY".parse::<Operation>(), Ok(Operation::Multiply));
        assert_eq!("div".parse::<Operation>(), Ok(Operation::Divide));
        assert!("pow".parse::<Operation>().is_err());
    }

    #[test]
    fn should_compute_from_display_names_and_keys() {
        let mut a = agent(&[
            "inode_used_percent PERCENT files_used files_total",
            "space_total ADD space_available space.used",
            "space_kb DIVIDE space_total 1024",
        ])
        .unwrap();
        let mut m = volume();
        a.run(&mut m.view()).unwrap();

        assert_eq!(m.value_float64("inode_used_percent", "a"), Some(25.0));
        assert_eq!(m.value_float64("inode_used_percent", "b"), Some(0.0));
        assert_eq!(m.value_float64("space_total", "a"), Some(400.0));
        assert_eq!(m.value_float64("space_total", "b"), Some(15.0));
        assert_eq!(m.value_float64("space_kb", "a"), Some(400.0 / 1024.0));
        assert_eq!(m.value_float64("space_total", "c"), None);
        assert!(m.metric("space_total").unwrap().is_derived());
    }

    #[test]
    fn should_skip_rules_with_unknown_operands() {
        let mut a = agent(&["ratio DIVIDE files_used nope"]).unwrap();
        let mut m = volume();
        a.run(&mut m.view()).unwrap();
        assert!(!m.has_metric("ratio"));
    }

    #[test]
    fn should_declare_derived_metrics() {
        let a = agent(&["space_total ADD space_available space_used"]).unwrap();
        assert_eq!(
            a.new_metrics(),
            vec![DerivedMetric {
                name: "space_total".to_string(),
                source: "space_available, space_used".to_string(),
            }]
        );
    }
}
