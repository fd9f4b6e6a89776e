//! Per-group maximum. Uses the same rule syntax as the aggregator.
//!
//! Each (rule, metric) pair gets its own matrix since the instance holding
//! the maximum may differ per metric; the winning instance's labels are
//! copied onto the result.

use crate::aggregator::{parse_rules, GroupRule};
use crate::error::Result;
use stormon_common::matrix::{CloneOptions, Matrix};
use stormon_common::tree::Node;

#[derive(Debug, Clone)]
pub struct Max {
    rules: Vec<GroupRule>,
}

impl Max {
    pub fn new(params: &Node) -> Result<Self> {
        let rules = parse_rules(params)?;
        tracing::debug!(rules = rules.len(), "parsed max rules");
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
        let metric_keys = data.metric_keys();
        let mut out = Vec::with_capacity(self.rules.len() * metric_keys.len());

        for (i, rule) in self.rules.iter().enumerate() {
            let mut per_metric: Vec<Matrix> = metric_keys
                .iter()
                .map(|key| {
                    let mut m = data.clone_with(CloneOptions {
                        metrics: true,
                        ..Default::default()
                    });
                    m.retain_metric(key);
                    m.object = rule.object_name(&data.object);
                    m.uuid = format!("{}.Max{i}.{key}", data.uuid);
                    m.set_export_options(rule.export_options());
                    m.set_exportable(true);
                    m
                })
                .collect();

            for (_, instance) in data.ordered_instances() {
                if !instance.is_exportable() {
                    continue;
                }
                let Some(name) = rule.group_of(instance) else {
                    continue;
                };
                for (metric_key, target) in metric_keys.iter().zip(per_metric.iter_mut()) {
                    let Some(value) = data
                        .metric(metric_key)
                        .and_then(|m| m.value(instance.index()))
                    else {
                        continue;
                    };
                    if target
                        .value_float64(metric_key, name)
                        .is_some_and(|current| value <= current)
                    {
                        continue;
                    }
                    rule.copy_labels(name, instance, target.instance_or_insert(name));
                    target.set_value_float64(metric_key, name, value)?;
                }
            }
            out.extend(per_metric.into_iter().filter(|m| m.instance_count() > 0));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max(rules: &[&str]) -> Max {
        let mut params = Node::new("Max");
        for r in rules {
            params.new_child("", r);
        }
        Max::new(&params).unwrap()
    }

    fn disks() -> Matrix {
        let mut m = Matrix::new("c1", "disk", "disk");
        m.new_metric_float64("busy").unwrap();
        m.new_metric_float64("temp").unwrap();
        let rows = [
            ("d1", "n1", "shelf1", 10.0, 40.0),
            ("d2", "n1", "shelf2", 70.0, 35.0),
            ("d3", "n2", "shelf3", -5.0, 30.0),
        ];
        for (key, node, shelf, busy, temp) in rows {
            let i = m.new_instance(key).unwrap();
            i.set_label("node", node);
            i.set_label("shelf", shelf);
            m.set_value_float64("busy", key, busy).unwrap();
            m.set_value_float64("temp", key, temp).unwrap();
        }
        m
    }

    #[test]
    fn should_emit_one_matrix_per_metric_with_winning_labels() {
        let mut plugin = max(&["node<>node_disk_max shelf"]);
        let out = plugin.run(&disks()).unwrap();
        assert_eq!(out.len(), 2);

        let busy = out.iter().find(|m| m.has_metric("busy")).unwrap();
        assert_eq!(busy.object, "node_disk_max");
        assert_eq!(busy.metric_count(), 1);
        assert_eq!(busy.value_float64("busy", "n1"), Some(70.0));
        assert_eq!(busy.instance("n1").unwrap().label("shelf"), Some("shelf2"));
        // negative values still produce a maximum
        assert_eq!(busy.value_float64("busy", "n2"), Some(-5.0));

        let temp = out.iter().find(|m| m.has_metric("temp")).unwrap();
        assert_eq!(temp.value_float64("temp", "n1"), Some(40.0));
        assert_eq!(temp.instance("n1").unwrap().label("shelf"), Some("shelf1"));
        assert_ne!(busy.uuid, temp.uuid);
        assert_eq!(plugin.new_labels(), vec!["node", "shelf"]);
    }

    #[test]
    fn should_skip_non_matching_instances() {
        let mut plugin = max(&["node<n2>"]);
        let out = plugin.run(&disks()).unwrap();
        assert!(out.iter().all(|m| m.instance_keys() == vec!["n2"]));
        assert_eq!(out[0].object, "node_disk");
    }
}
