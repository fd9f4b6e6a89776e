//! Parsed and validated collector templates.
//!
//! A template binds appliance-side counter names to matrix labels and
//! metrics for one object. Loading goes YAML text → [`Node`] tree →
//! [`Template`], validating required keys and counter syntax on the way.

mod counter;


pub use counter::{
    collapse_array_path, display_name, misaligned_arrows, parse_counter, ArrowLint, Counter,
    CounterKind, MetricHint,
};

use crate::error::{PollError, Result};
use crate::matrix::ExportOptions;
use crate::tree::{load_yaml, to_yaml, Node};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Parent nodes whose scalar children are appended rather than replaced
/// when a custom template is merged over a default one.
pub const APPEND_ON_MERGE: &[&str] = &[
    "LabelAgent",
    "split",
    "split_regex",
    "split_pairs",
    "join",
    "replace",
    "replace_regex",
    "value_mapping",
    "value_to_num",
    "value_to_num_regex",
    "exclude_equals",
    "exclude_contains",
    "exclude_regex",
    "include_equals",
    "include_contains",
    "include_regex",
];

/// Polling cadence of one collector task.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub task: String,
    pub interval: Duration,
}

/// A secondary query contributing labels and metrics to the same
/// instance set.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub query: String,
    pub counters: Vec<Counter>,
}

/// A plugin declared in the template, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSpec {
    pub kind: String,
    pub params: Node,
}

/// Per-counter overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Override {
    pub property: Option<String>,
    pub base_counter: Option<String>,
    pub unit: Option<String>,
}

/// Knobs that shape how a template is parsed.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Counters dropped silently, e.g. histograms a collector cannot
    /// export as a single scalar.
    pub exclude: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub query: String,
    pub object: String,
    pub export_data: bool,
    pub client_timeout: Option<Duration>,
    pub schedule: Vec<ScheduleEntry>,
    pub counters: Vec<Counter>,
    pub endpoints: Vec<Endpoint>,
    pub plugins: Vec<PluginSpec>,
    pub export_options: ExportOptions,
    pub overrides: HashMap<String, Override>,
    pub max_url_size: Option<usize>,
    pub severity: Option<String>,
    pub return_timeout: Option<u32>,
    pub batch_size: Option<usize>,
    pub latency_io_reqd: Option<f64>,
    /// `key=value` filters appended to every query.
    pub filter: Vec<String>,
    pub lints: Vec<ArrowLint>,
    root: Node,
}

/// Interval used when a template omits a task from `schedule`.
pub fn default_interval(task: &str) -> Duration {
    match task {
        "counter" => Duration::from_secs(24 * 3600),
        "instance" => Duration::from_secs(600),
        _ => Duration::from_secs(60),
    }
}

impl Template {
    /// Parses template text.
    pub fn parse(text: &str, options: &ParseOptions) -> Result<Self> {
        let root = load_yaml(text)?;
        let mut template = Self::from_node(root, options)?;
        template.lints = misaligned_arrows(text);
        for lint in &template.lints {
            tracing::warn!(
                template = %template.name,
                line = lint.line,
                counter = %lint.counter,
                column = lint.column,
                expected = lint.expected,
                "misaligned => in counter list"
            );
        }
        Ok(template)
    }

    /// Parses `custom` merged over `base`.
    pub fn parse_merged(base: &str, custom: &str, options: &ParseOptions) -> Result<Self> {
        let mut root = load_yaml(base)?;
        let overlay = load_yaml(custom)?;
        root.merge(&overlay, APPEND_ON_MERGE);
        let mut template = Self::from_node(root, options)?;
        template.lints = misaligned_arrows(base);
        template.lints.extend(misaligned_arrows(custom));
        Ok(template)
    }

    /// Builds a template from an already loaded tree.
    pub fn from_node(root: Node, options: &ParseOptions) -> Result<Self> {
        let name = root.child_content("name").to_string();
        let query = root.child_content("query").to_string();
        let object = root.child_content("object").to_string();

        if name.is_empty() {
            return Err(PollError::MissingParam("name".to_string()));
        }
        if query.is_empty() {
            return Err(PollError::MissingParam("query".to_string()));
        }
        if object.is_empty() && query != "prometheus" {
            return Err(PollError::MissingParam("object".to_string()));
        }

        let export_data = root.child_content("export_data") != "false";
        let client_timeout = match root.child_content("client_timeout") {
            "" => None,
            s => Some(parse_duration("client_timeout", s)?),
        };

        let schedule = match root.child("schedule") {
            Some(node) => parse_schedule(node)?,
            None => Vec::new(),
        };

        let counters = match root.child("counters") {
            Some(node) => flatten_counters(node, options)?,
            None => Vec::new(),
        };

        let mut endpoints = Vec::new();
        if let Some(node) = root.child("endpoints") {
            for item in &node.children {
                let query = item.child_content("query");
                if query.is_empty() {
                    return Err(PollError::MissingParam("endpoints.query".to_string()));
                }
                let counters = match item.child("counters") {
                    Some(c) => flatten_counters(c, options)?,
                    None => Vec::new(),
                };
                endpoints.push(Endpoint {
                    query: query.to_string(),
                    counters,
                });
            }
        }

        let plugins = root
            .child("plugins")
            .map(|p| {
                p.children
                    .iter()
                    .filter(|c| !c.name.is_empty())
                    .map(|c| PluginSpec {
                        kind: c.name.clone(),
                        params: c.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let export_options = root
            .child("export_options")
            .map(parse_export_options)
            .unwrap_or_default();

        let overrides = root
            .child("override")
            .map(parse_overrides)
            .unwrap_or_default();

        let max_url_size = parse_opt(&root, "max_url_size")?;
        let return_timeout = parse_opt(&root, "return_timeout")?;
        let batch_size = parse_opt(&root, "batch_size")?;
        let latency_io_reqd = parse_opt(&root, "latency_io_reqd")?;
        let severity = Some(root.child_content("severity").to_string()).filter(|s| !s.is_empty());
        let filter = match root.child("filter") {
            Some(node) if node.is_leaf() && !node.content.is_empty() => vec![node.content.clone()],
            Some(node) => node
                .all_child_content()
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect(),
            None => Vec::new(),
        };

        Ok(Self {
            name,
            query,
            object,
            export_data,
            client_timeout,
            schedule,
            counters,
            endpoints,
            plugins,
            export_options,
            overrides,
            max_url_size,
            severity,
            return_timeout,
            batch_size,
            latency_io_reqd,
            filter,
            lints: Vec::new(),
            root,
        })
    }

    /// The underlying tree, for collector-specific sections such as
    /// `events`.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Top-level scalar parameter, or `""`.
    pub fn param(&self, key: &str) -> &str {
        self.root.child_content(key)
    }

    pub fn param_usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.param(key) {
            "" => Ok(default),
            s => s
                .parse()
                .map_err(|_| PollError::InvalidParam(format!("{key}={s}"))),
        }
    }

    pub fn param_duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.param(key) {
            "" => Ok(None),
            s => parse_duration(key, s).map(Some),
        }
    }

    /// Interval for `task`, falling back to [`default_interval`].
    pub fn interval(&self, task: &str) -> Duration {
        self.interval_or(task, default_interval(task))
    }

    /// Interval for `task`, or `default` when the template sets none.
    pub fn interval_or(&self, task: &str, default: Duration) -> Duration {
        self.schedule
            .iter()
            .find(|s| s.task == task)
            .map(|s| s.interval)
            .unwrap_or(default)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Counter> {
        self.counters.iter().filter(|c| c.is_key())
    }

    pub fn labels(&self) -> impl Iterator<Item = &Counter> {
        self.counters.iter().filter(|c| c.is_label())
    }

    pub fn metrics(&self) -> impl Iterator<Item = &Counter> {
        self.counters.iter().filter(|c| c.is_metric())
    }

    pub fn override_for(&self, counter: &str) -> Option<&Override> {
        self.overrides.get(counter)
    }

    /// Renders the counter list back to YAML.
    pub fn counters_yaml(&self) -> Result<String> {
        let mut wrapper = Node::new("Root");
        if let Some(counters) = self.root.child("counters") {
            wrapper.add_child(counters.clone());
        }
        to_yaml(&wrapper)
    }
}

pub(crate) fn parse_duration(key: &str, s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim())
        .map_err(|e| PollError::InvalidParam(format!("{key}={s}: {e}")))
}

fn parse_opt<T: std::str::FromStr>(root: &Node, key: &str) -> Result<Option<T>> {
    match root.child_content(key).trim() {
        "" => Ok(None),
        s => s
            .parse()
            .map(Some)
            .map_err(|_| PollError::InvalidParam(format!("{key}={s}"))),
    }
}

fn parse_schedule(node: &Node) -> Result<Vec<ScheduleEntry>> {
    let mut entries = Vec::new();
    for child in &node.children {
        // list form (`- data: 1m`) flattens into named children; map form
        // is identical after loading
        if child.name.is_empty() {
            continue;
        }
        entries.push(ScheduleEntry {
            task: child.name.clone(),
            interval: parse_duration(&child.name, &child.content)?,
        });
    }
    Ok(entries)
}

/// Walks a `counters` subtree into an ordered counter list.
fn flatten_counters(node: &Node, options: &ParseOptions) -> Result<Vec<Counter>> {
    let mut out: Vec<Counter> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    walk_counters(node, "", options, &mut out, &mut seen)?;
    Ok(out)
}

fn walk_counters(
    node: &Node,
    prefix: &str,
    options: &ParseOptions,
    out: &mut Vec<Counter>,
    seen: &mut HashSet<String>,
) -> Result<()> {
    for child in &node.children {
        if child.is_leaf() {
            let raw = if child.name.is_empty() {
                child.content.as_str()
            } else if child.content.is_empty() {
                child.name.as_str()
            } else {
                // `name: display` mapping shorthand is not valid here
                return Err(PollError::InvalidItem(format!(
                    "counter [{}: {}] must be a list entry",
                    child.name, child.content
                )));
            };
            if raw.trim().is_empty() {
                continue;
            }
            let counter = parse_counter(raw, prefix);
            validate_counter(&counter)?;
            if options.exclude.contains(&counter.name) || options.exclude.contains(&counter.path) {
                continue;
            }
            if !seen.insert(counter.path.clone()) {
                return Err(PollError::InvalidItem(format!(
                    "duplicate counter [{}]",
                    counter.path
                )));
            }
            out.push(counter);
        } else {
            let path = match (prefix.is_empty(), child.name.is_empty()) {
                (_, true) => prefix.to_string(),
                (true, false) => child.name.clone(),
                (false, false) => format!("{prefix}.{}", child.name),
            };
            walk_counters(child, &path, options, out, seen)?;
        }
    }
    Ok(())
}

fn validate_counter(counter: &Counter) -> Result<()> {
    if counter.name.is_empty() {
        return Err(PollError::InvalidItem(format!("empty counter in [{}]", counter.raw)));
    }
    if counter.name.ends_with('-') {
        return Err(PollError::InvalidItem(format!(
            "counter [{}] ends with a dash",
            counter.raw
        )));
    }
    if counter.display.contains('-') {
        return Err(PollError::InvalidItem(format!(
            "display name [{}] contains a dash",
            counter.display
        )));
    }
    Ok(())
}

fn parse_export_options(node: &Node) -> ExportOptions {
    let list = |key: &str| {
        node.child(key)
            .map(|c| {
                c.all_child_content()
                    .into_iter()
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    };
    let instance_keys: Vec<String> = list("instance_keys");
    let instance_labels: Vec<String> = list("instance_labels");
    let include_all_labels = match node.child_content("include_all_labels") {
        "true" => true,
        "false" => false,
        // an explicit key list means only those labels are wanted
        _ => instance_keys.is_empty() && instance_labels.is_empty(),
    };
    ExportOptions {
        instance_keys,
        instance_labels,
        include_all_labels,
    }
}

fn parse_overrides(node: &Node) -> HashMap<String, Override> {
    let mut overrides = HashMap::new();
    for child in &node.children {
        if child.name.is_empty() {
            continue;
        }
        let ov = if child.is_leaf() {
            Override {
                property: Some(child.content.clone()),
                ..Default::default()
            }
        } else {
            let opt = |k: &str| Some(child.child_content(k).to_string()).filter(|s| !s.is_empty());
            Override {
                property: opt("type").or_else(|| opt("property")),
                base_counter: opt("base_counter"),
                unit: opt("unit"),
            }
        };
        overrides.insert(child.name.clone(), ov);
    }
    overrides
}
