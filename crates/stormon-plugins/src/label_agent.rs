//! Instance label rewriting.
//!
//! Rules are grouped by operation in the template and applied in the order
//! the operations are declared:
//!
//! | operation | rule | effect |
//! |---|---|---|
//! | `split` | ``node `/` ,aggr,plex`` | split a label on a separator into new labels |
//! | `split_regex` | ``node `.*_(ag\d+)_(p\d+)` aggr,plex`` | capture groups into new labels |
//! | `split_pairs` | ``tags ` ` `:` `` | `k:v` pairs into labels |
//! | `join` | ``plex_long `_` aggr,plex`` | join labels into a new one |
//! | `replace` | ``node node_short `node_` `` `` | substring replace into a new label |
//! | `replace_regex` | ``node node `^(node)_(\d+)_.*$` `Node-$2` `` | regex replace with `$n` groups |
//! | `value_mapping` | ``state status up=1,down=0 `unknown` `` | map label values onto a new label |
//! | `value_to_num` | ``status state online ok `0` `` | label value to a uint8 metric |
//! | `value_to_num_regex` | ``status state ^on.*$ ^ok$ `0` `` | same, with regexes |
//! | `exclude_*` / `include_*` | ``type `flexgroup` `` | toggle instance export |

use crate::error::{PluginError, Result};
use crate::{rule_lines, DerivedMetric};
use regex::Regex;
use std::collections::HashMap;
use stormon_common::matrix::{MatrixView, MetricType};
use stormon_common::tree::Node;

#[derive(Debug, Clone)]
enum Match {
    Equals(String),
    Contains(String),
    Regex(Regex),
}

impl Match {
    fn is_match(&self, value: &str) -> bool {
        match self {
            Match::Equals(v) => value == v,
            Match::Contains(v) => value.contains(v.as_str()),
            Match::Regex(r) => r.is_match(value),
        }
    }
}

#[derive(Debug, Clone)]
enum Rule {
    Split {
        source: String,
        sep: String,
        targets: Vec<String>,
    },
    SplitRegex {
        source: String,
        regex: Regex,
        targets: Vec<String>,
    },
    SplitPairs {
        source: String,
        pair_sep: String,
        kv_sep: String,
    },
    Join {
        target: String,
        sep: String,
        sources: Vec<String>,
    },
    Replace {
        source: String,
        target: String,
        old: String,
        new: String,
    },
    ReplaceRegex {
        source: String,
        target: String,
        regex: Regex,
        replacement: String,
    },
    ValueMapping {
        source: String,
        target: String,
        mapping: HashMap<String, String>,
        default: Option<String>,
    },
    ValueToNum {
        metric: String,
        label: String,
        matches: Vec<Match>,
        default: Option<u8>,
    },
    Exclude {
        label: String,
        test: Match,
    },
    Include {
        label: String,
        test: Match,
    },
}

/// Label rewriting plugin. Emits no matrices of its own.
#[derive(Debug, Clone)]
pub struct LabelAgent {
    /// Rules grouped by operation, in declaration order.
    groups: Vec<Vec<Rule>>,
    new_labels: Vec<String>,
}

impl LabelAgent {
    pub fn new(params: &Node) -> Result<Self> {
        let mut agent = Self {
            groups: Vec::new(),
            new_labels: Vec::new(),
        };
        for op in &params.children {
            let mut group = Vec::new();
            for line in rule_lines(op) {
                match agent.parse_rule(&op.name, &line) {
                    Ok(rule) => group.push(rule),
                    // a bad rule is skipped so the rest of the template still applies
                    Err(e) => tracing::warn!(operation = %op.name, error = %e, "ignoring label agent rule"),
                }
            }
            if !group.is_empty() {
                agent.groups.push(group);
            }
        }
        if agent.groups.is_empty() {
            return Err(PluginError::MissingParam("valid rules".to_string()));
        }
        tracing::debug!(
            actions = agent.groups.len(),
            rules = agent.groups.iter().map(Vec::len).sum::<usize>(),
            "parsed label agent rules"
        );
        Ok(agent)
    }

    /// Labels created by split, join, replace, and mapping rules.
    pub fn new_labels(&self) -> &[String] {
        &self.new_labels
    }

    pub fn new_metrics(&self) -> Vec<DerivedMetric> {
        self.groups
            .iter()
            .flatten()
            .filter_map(|rule| match rule {
                Rule::ValueToNum { metric, label, .. } => Some(DerivedMetric {
                    name: metric.clone(),
                    source: label.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    fn add_labels<S: AsRef<str>>(&mut self, labels: &[S]) {
        for label in labels {
            let label = label.as_ref();
            if !label.is_empty() && !self.new_labels.iter().any(|l| l == label) {
                self.new_labels.push(label.to_string());
            }
        }
    }

    fn parse_rule(&mut self, op: &str, line: &str) -> Result<Rule> {
        let rule = match op {
            "split" => {
                let (source, sep, rest) = quoted_middle(line)?;
                let targets = split_list(rest);
                self.add_labels(&targets);
                Rule::Split { source, sep, targets }
            }
            "split_regex" => {
                let (source, pattern, rest) = quoted_middle(line)?;
                let targets = split_list(rest);
                self.add_labels(&targets);
                Rule::SplitRegex {
                    source,
                    regex: compile(line, &pattern)?,
                    targets,
                }
            }
            "split_pairs" => {
                let fields: Vec<&str> = line.split('`').collect();
                if fields.len() != 5 {
                    return Err(PluginError::invalid(line, "expected: label `sep` `kv_sep`"));
                }
                Rule::SplitPairs {
                    source: fields[0].trim().to_string(),
                    pair_sep: fields[1].to_string(),
                    kv_sep: fields[3].to_string(),
                }
            }
            "join" => {
                let (target, sep, rest) = quoted_middle(line)?;
                self.add_labels(&[&target]);
                Rule::Join {
                    target,
                    sep,
                    sources: split_list(rest),
                }
            }
            "replace" | "replace_regex" => {
                let (labels, quoted) = labels_and_quoted(line, 2)?;
                let [source, target] = two(line, &labels)?;
                self.add_labels(&[&target]);
                if op == "replace" {
                    Rule::Replace {
                        source,
                        target,
                        old: quoted[0].clone(),
                        new: quoted[1].clone(),
                    }
                } else {
                    Rule::ReplaceRegex {
                        source,
                        target,
                        regex: compile(line, &quoted[0])?,
                        replacement: replacement_template(line, &quoted[1])?,
                    }
                }
            }
            "value_mapping" => {
                let (head, default) = trailing_quoted(line);
                let fields: Vec<&str> = head.split_whitespace().collect();
                if fields.len() != 3 {
                    return Err(PluginError::invalid(line, "expected: source target old=new,..."));
                }
                let mut mapping = HashMap::new();
                for pair in fields[2].split(',') {
                    let (old, new) = pair
                        .split_once('=')
                        .ok_or_else(|| PluginError::invalid(line, format!("bad mapping [{pair}]")))?;
                    mapping.insert(old.to_string(), new.to_string());
                }
                self.add_labels(&[fields[1]]);
                Rule::ValueMapping {
                    source: fields[0].to_string(),
                    target: fields[1].to_string(),
                    mapping,
                    default,
                }
            }
            "value_to_num" | "value_to_num_regex" => {
                let (head, default) = trailing_quoted(line);
                let fields: Vec<&str> = head.split_whitespace().collect();
                if fields.len() != 4 {
                    return Err(PluginError::invalid(line, "expected: metric label value value [`default`]"));
                }
                let default = default
                    .map(|d| {
                        d.parse::<u8>()
                            .map_err(|e| PluginError::invalid(line, format!("default [{d}]: {e}")))
                    })
                    .transpose()?;
                let matches = if op == "value_to_num" {
                    // `-` joins several values that all map to 1
                    fields[2..]
                        .iter()
                        .flat_map(|f| f.split('-'))
                        .map(|v| Match::Equals(v.to_string()))
                        .collect()
                } else {
                    fields[2..]
                        .iter()
                        .map(|p| compile(line, p).map(Match::Regex))
                        .collect::<Result<Vec<_>>>()?
                };
                Rule::ValueToNum {
                    metric: fields[0].to_string(),
                    label: fields[1].to_string(),
                    matches,
                    default,
                }
            }
            other => {
                let (kind, test) = match other.split_once('_') {
                    Some((kind @ ("exclude" | "include"), test)) => (kind, test),
                    _ => return Err(PluginError::invalid(line, format!("unknown operation [{other}]"))),
                };
                let (label, value) = line
                    .split_once(" `")
                    .ok_or_else(|| PluginError::invalid(line, "expected: label `value`"))?;
                let label = label.trim().to_string();
                let value = value.strip_suffix('`').unwrap_or(value).to_string();
                let test = match test {
                    "equals" => Match::Equals(value),
                    "contains" => Match::Contains(value),
                    "regex" => Match::Regex(compile(line, &value)?),
                    _ => return Err(PluginError::invalid(line, format!("unknown operation [{other}]"))),
                };
                if kind == "exclude" {
                    Rule::Exclude { label, test }
                } else {
                    Rule::Include { label, test }
                }
            }
        };
        Ok(rule)
    }

    pub fn run(&mut self, data: &mut MatrixView<'_>) -> Result<()> {
        for group in &self.groups {
            match group.first() {
                Some(Rule::ValueToNum { .. }) => apply_value_to_num(group, data)?,
                Some(Rule::Include { .. }) => apply_include(group, data),
                Some(Rule::Exclude { .. }) => apply_exclude(group, data),
                Some(_) => apply_label_rules(group, data),
                None => {}
            }
        }
        Ok(())
    }
}

fn apply_label_rules(rules: &[Rule], data: &mut MatrixView<'_>) {
    for (_, instance) in data.instances_mut() {
        for rule in rules {
            match rule {
                Rule::Split { source, sep, targets } => {
                    let value = instance.label_or_empty(source).to_string();
                    let parts: Vec<&str> = value.split(sep.as_str()).collect();
                    if parts.len() >= targets.len() {
                        for (target, part) in targets.iter().zip(&parts) {
                            if !target.is_empty() && !part.is_empty() {
                                instance.set_label(target, part);
                            }
                        }
                    }
                }
                Rule::SplitRegex { source, regex, targets } => {
                    let value = instance.label_or_empty(source).to_string();
                    if let Some(caps) = regex.captures(&value) {
                        if caps.len() == targets.len() + 1 {
                            for (i, target) in targets.iter().enumerate() {
                                let part = caps.get(i + 1).map_or("", |m| m.as_str());
                                if !target.is_empty() && !part.is_empty() {
                                    instance.set_label(target, part);
                                }
                            }
                        }
                    }
                }
                Rule::SplitPairs {
                    source,
                    pair_sep,
                    kv_sep,
                } => {
                    let value = instance.label_or_empty(source).to_string();
                    if value.is_empty() {
                        continue;
                    }
                    for pair in value.split(pair_sep.as_str()) {
                        let kv: Vec<&str> = pair.split(kv_sep.as_str()).collect();
                        if let [k, v] = kv.as_slice() {
                            instance.set_label(k, v);
                        }
                    }
                }
                Rule::Join { target, sep, sources } => {
                    let values: Vec<&str> = sources
                        .iter()
                        .map(|s| instance.label_or_empty(s))
                        .filter(|v| !v.is_empty())
                        .collect();
                    if !values.is_empty() {
                        let joined = values.join(sep.as_str());
                        instance.set_label(target, &joined);
                    }
                }
                Rule::Replace {
                    source,
                    target,
                    old,
                    new,
                } => {
                    let value = instance.label_or_empty(source).to_string();
                    if value.is_empty() {
                        continue;
                    }
                    let replaced = value.replace(old.as_str(), new);
                    if replaced != value {
                        instance.set_label(target, &replaced);
                    }
                }
                Rule::ReplaceRegex {
                    source,
                    target,
                    regex,
                    replacement,
                } => {
                    let value = instance.label_or_empty(source).to_string();
                    if let Some(caps) = regex.captures(&value) {
                        let mut replaced = String::new();
                        caps.expand(replacement, &mut replaced);
                        if !replaced.is_empty() && replaced != value {
                            instance.set_label(target, &replaced);
                        }
                    }
                }
                Rule::ValueMapping {
                    source,
                    target,
                    mapping,
                    default,
                } => {
                    let mapped = mapping
                        .get(instance.label_or_empty(source))
                        .or(default.as_ref())
                        .cloned();
                    if let Some(mapped) = mapped {
                        instance.set_label(target, &mapped);
                    }
                }
                _ => {}
            }
        }
    }
}

fn apply_exclude(rules: &[Rule], data: &mut MatrixView<'_>) {
    for (_, instance) in data.instances_mut() {
        let excluded = rules.iter().any(|rule| match rule {
            Rule::Exclude { label, test } => test.is_match(instance.label_or_empty(label)),
            _ => false,
        });
        if excluded {
            instance.set_exportable(false);
        }
    }
}

fn apply_include(rules: &[Rule], data: &mut MatrixView<'_>) {
    for (_, instance) in data.instances_mut() {
        if !instance.is_exportable() {
            continue;
        }
        let included = rules.iter().any(|rule| match rule {
            Rule::Include { label, test } => test.is_match(instance.label_or_empty(label)),
            _ => false,
        });
        instance.set_exportable(included);
    }
}

fn apply_value_to_num(rules: &[Rule], data: &mut MatrixView<'_>) -> Result<()> {
    for rule in rules {
        let Rule::ValueToNum {
            metric,
            label,
            matches,
            default,
        } = rule
        else {
            continue;
        };
        data.derive_metric(metric, MetricType::Uint8)?
            .set_property("value_to_num mapping");
        let values: Vec<(String, Option<u8>)> = data
            .matrix()
            .ordered_instances()
            .into_iter()
            .map(|(key, instance)| {
                let value = instance.label_or_empty(label);
                let mapped = if matches.iter().any(|m| m.is_match(value)) {
                    Some(1)
                } else {
                    *default
                };
                (key.to_string(), mapped)
            })
            .collect();
        for (key, value) in values {
            if let Some(v) = value {
                data.set_derived_value(metric, &key, f64::from(v))?;
            }
        }
    }
    Ok(())
}

fn compile(rule: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| PluginError::invalid(rule, e.to_string()))
}

fn split_list(s: &str) -> Vec<String> {
    s.trim().split(',').map(|t| t.trim().to_string()).collect()
}

/// `head `middle` rest` into its three parts.
fn quoted_middle(line: &str) -> Result<(String, String, &str)> {
    let (head, tail) = line
        .split_once(" `")
        .ok_or_else(|| PluginError::invalid(line, "missing `separator`"))?;
    let (middle, rest) = tail
        .split_once("` ")
        .ok_or_else(|| PluginError::invalid(line, "missing targets"))?;
    Ok((head.trim().to_string(), middle.to_string(), rest))
}

/// Leading whitespace-separated labels followed by `n` backtick-quoted values.
fn labels_and_quoted(line: &str, n: usize) -> Result<(Vec<String>, Vec<String>)> {
    let parts: Vec<&str> = line.splitn(n + 1, " `").collect();
    if parts.len() != n + 1 {
        return Err(PluginError::invalid(line, format!("expected {n} quoted values")));
    }
    let labels = parts[0].split_whitespace().map(str::to_string).collect();
    let quoted = parts[1..]
        .iter()
        .map(|q| q.trim_end().strip_suffix('`').unwrap_or(q).to_string())
        .collect();
    Ok((labels, quoted))
}

fn two(line: &str, labels: &[String]) -> Result<[String; 2]> {
    match labels {
        [a, b] => Ok([a.clone(), b.clone()]),
        _ => Err(PluginError::invalid(line, "expected: source target")),
    }
}

/// Splits an optional trailing `` `value` `` off a rule.
fn trailing_quoted(line: &str) -> (&str, Option<String>) {
    let line = line.trim();
    if let Some(body) = line.strip_suffix('`') {
        if let Some(start) = body.rfind('`') {
            return (&line[..start], Some(body[start + 1..].to_string()));
        }
    }
    (line, None)
}

/// Validates `$n` references and rewrites them into `${n}` for
/// [`regex::Captures::expand`]. `\$` is a literal dollar.
fn replacement_template(rule: &str, raw: &str) -> Result<String> {
    let mut out = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                out.push_str("$$");
            }
            '$' => {
                let mut num = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    num.push(*d);
                    chars.next();
                }
                match num.parse::<usize>() {
                    Ok(n) if n > 0 => out.push_str(&format!("${{{n}}}")),
                    _ => return Err(PluginError::invalid(rule, "`$` must be followed by a group number")),
                }
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stormon_common::matrix::Matrix;

    fn params(rules: &[(&str, &[&str])]) -> Node {
        let mut root = Node::new("LabelAgent");
        for (op, lines) in rules {
            let child = root.new_child(op, "");
            for line in *lines {
                child.new_child("", line);
            }
        }
        root
    }

    fn matrix(rows: &[(&str, &[(&str, &str)])]) -> Matrix {
        let mut m = Matrix::new("u", "volume", "volume");
        for (key, labels) in rows {
            let instance = m.new_instance(key).unwrap();
            for (k, v) in *labels {
                instance.set_label(k, v);
            }
        }
        m
    }

    fn label<'a>(m: &'a Matrix, key: &str, label: &str) -> Option<&'a str> {
        m.instance(key).and_then(|i| i.label(label))
    }

    #[test]
    fn should_require_at_least_one_valid_rule() {
        let err = LabelAgent::new(&params(&[("split", &["no separators here"])])).unwrap_err();
        assert!(matches!(err, PluginError::MissingParam(_)));
    }

    #[test]
    fn should_split_and_join_labels() {
        let mut agent = LabelAgent::new(&params(&[
            ("split", &["node `/` ,aggr,plex,disk"]),
            ("split_regex", &["volume `^(\\w+)_(\\d+)$` prefix,num"]),
            ("split_pairs", &["tags ` ` `:`"]),
            ("join", &["plex_long `_` aggr,plex"]),
        ]))
        .unwrap();
        let mut m = matrix(&[(
            "a",
            &[("node", "jamaica1/ag1/p1/d1"), ("volume", "vol_12"), ("tags", "env:prod tier:gold")],
        )]);
        agent.run(&mut m.view()).unwrap();

        assert_eq!(label(&m, "a", "aggr"), Some("ag1"));
        assert_eq!(label(&m, "a", "disk"), Some("d1"));
        assert_eq!(label(&m, "a", "prefix"), Some("vol"));
        assert_eq!(label(&m, "a", "num"), Some("12"));
        assert_eq!(label(&m, "a", "env"), Some("prod"));
        assert_eq!(label(&m, "a", "tier"), Some("gold"));
        assert_eq!(label(&m, "a", "plex_long"), Some("ag1_p1"));
        assert_eq!(
            agent.new_labels(),
            ["aggr", "plex", "disk", "prefix", "num", "plex_long"]
        );
    }

    #[test]
    fn should_replace_with_plain_and_regex_rules() {
        let mut agent = LabelAgent::new(&params(&[
            ("replace", &["node node_short `node_` ``"]),
            ("replace_regex", &["node node `^(node)_(\\d+)_.*$` `Node-$2`"]),
        ]))
        .unwrap();
        let mut m = matrix(&[("a", &[("node", "node_10_dc2")])]);
        agent.run(&mut m.view()).unwrap();
        assert_eq!(label(&m, "a", "node_short"), Some("10_dc2"));
        assert_eq!(label(&m, "a", "node"), Some("Node-10"));
    }

    #[test]
    fn should_reject_bad_substitution() {
        let mut agent = LabelAgent::new(&params(&[("replace_regex", &["node x `(a)` `$b`"])]));
        assert!(agent.is_err());
        agent = LabelAgent::new(&params(&[("replace_regex", &["node x `(a)` `\\$1 $1`"])]));
        let mut m = matrix(&[("i", &[("node", "a")])]);
        agent.unwrap().run(&mut m.view()).unwrap();
        assert_eq!(label(&m, "i", "x"), Some("$1 a"));
    }

    #[test]
    fn should_map_values_with_default() {
        let mut agent = LabelAgent::new(&params(&[(
            "value_mapping",
            &["state status online=up,offline=down `unknown`"],
        )]))
        .unwrap();
        let mut m = matrix(&[
            ("a", &[("state", "online")]),
            ("b", &[("state", "offline")]),
            ("c", &[("state", "restricted")]),
        ]);
        agent.run(&mut m.view()).unwrap();
        assert_eq!(label(&m, "a", "status"), Some("up"));
        assert_eq!(label(&m, "b", "status"), Some("down"));
        assert_eq!(label(&m, "c", "status"), Some("unknown"));
    }

    #[test]
    fn should_convert_values_to_numbers() {
        let mut agent = LabelAgent::new(&params(&[
            ("value_to_num", &["new_status state online ok `0`"]),
            ("value_to_num_regex", &["healthy state ^on ^ok$"]),
        ]))
        .unwrap();
        let mut m = matrix(&[
            ("a", &[("state", "online")]),
            ("b", &[("state", "ok")]),
            ("c", &[("state", "offline")]),
        ]);
        agent.run(&mut m.view()).unwrap();

        assert_eq!(m.value_float64("new_status", "a"), Some(1.0));
        assert_eq!(m.value_float64("new_status", "b"), Some(1.0));
        assert_eq!(m.value_float64("new_status", "c"), Some(0.0));
        assert_eq!(m.value_float64("healthy", "a"), Some(1.0));
        assert_eq!(m.value_float64("healthy", "c"), None);
        assert_eq!(m.metric("new_status").unwrap().data_type(), MetricType::Uint8);
        assert_eq!(agent.new_metrics().len(), 2);
    }

    #[test]
    fn should_not_overwrite_template_metrics() {
        let mut agent = LabelAgent::new(&params(&[("value_to_num", &["status state online ok"])])).unwrap();
        let mut m = matrix(&[("a", &[("state", "online")])]);
        m.new_metric_float64("status").unwrap();
        assert!(agent.run(&mut m.view()).is_err());
        assert_eq!(m.value_float64("status", "a"), None);
    }

    #[test]
    fn should_toggle_export_with_exclude_and_include() {
        let mut agent = LabelAgent::new(&params(&[
            ("exclude_equals", &["style `flexgroup_constituent`"]),
            ("exclude_regex", &["volume `^tmp_`"]),
            ("include_contains", &["volume `vol`"]),
        ]))
        .unwrap();
        let mut m = matrix(&[
            ("a", &[("style", "flexgroup_constituent"), ("volume", "vol_a")]),
            ("b", &[("style", "flexvol"), ("volume", "tmp_vol")]),
            ("c", &[("style", "flexvol"), ("volume", "vol_c")]),
            ("d", &[("style", "flexvol"), ("volume", "root")]),
        ]);
        agent.run(&mut m.view()).unwrap();

        assert!(!m.is_instance_exportable("a"));
        assert!(!m.is_instance_exportable("b"));
        assert!(m.is_instance_exportable("c"));
        assert!(!m.is_instance_exportable("d"));
    }

    #[test]
    fn should_apply_operations_in_declaration_order() {
        let mut agent = LabelAgent::new(&params(&[
            ("join", &["full `-` svm,volume"]),
            ("exclude_contains", &["full `s2-`"]),
        ]))
        .unwrap();
        let mut m = matrix(&[
            ("a", &[("svm", "s1"), ("volume", "v1")]),
            ("b", &[("svm", "s2"), ("volume", "v2")]),
        ]);
        agent.run(&mut m.view()).unwrap();
        assert!(m.is_instance_exportable("a"));
        assert!(!m.is_instance_exportable("b"));
    }
}
