use regex::Regex;
use std::sync::OnceLock;

/// Role of a template counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// `^^` prefix: part of the instance key (order significant).
    Key,
    /// `^` prefix: instance label.
    Label,
    /// No prefix: numeric metric.
    Metric,
}

/// Type hint in parentheses after a metric, e.g. `uptime(duration)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricHint {
    Duration,
    Timestamp,
    Percent,
    Other(String),
}

impl MetricHint {
    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "" => None,
            "duration" => Some(MetricHint::Duration),
            "timestamp" => Some(MetricHint::Timestamp),
            "percent" => Some(MetricHint::Percent),
            other => Some(MetricHint::Other(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MetricHint::Duration => "duration",
            MetricHint::Timestamp => "timestamp",
            MetricHint::Percent => "percent",
            MetricHint::Other(s) => s,
        }
    }
}

/// One parsed counter entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Counter {
    /// Full dotted path on the appliance side (parents joined with `.`).
    pub path: String,
    /// Leaf name as written, without sigil, arrow, or hint.
    pub name: String,
    /// Exported name.
    pub display: String,
    pub kind: CounterKind,
    pub hint: Option<MetricHint>,
    /// The entry as written in the template.
    pub raw: String,
}

impl Counter {
    pub fn is_key(&self) -> bool {
        self.kind == CounterKind::Key
    }

    pub fn is_label(&self) -> bool {
        self.kind == CounterKind::Label
    }

    pub fn is_metric(&self) -> bool {
        self.kind == CounterKind::Metric
    }
}

fn type_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(.*)\((.*?)\)").expect("valid regex"))
}

fn array_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-zA-Z][\w.]*)(\.[0-9#])").expect("valid regex")
    })
}

/// Default exported name for a counter: `.` and `-` become `_`.
pub fn display_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Collapses list paths to the prefix before the first `#` or numeric
/// index: `ha.partners.0.name` becomes `ha.partners`.
pub fn collapse_array_path(path: &str) -> String {
    match array_regex().captures(path) {
        Some(caps) => caps
            .get(1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| path.to_string()),
        None => path.to_string(),
    }
}

/// Splits `name(hint)` into its parts.
fn split_hint(s: &str) -> (String, Option<MetricHint>) {
    match type_regex().captures(s) {
        Some(caps) => {
            let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or(s);
            let hint = caps.get(2).and_then(|m| MetricHint::parse(m.as_str()));
            (name.to_string(), hint)
        }
        None => (s.trim().to_string(), None),
    }
}

/// Parses one counter entry below `parent_path` (dotted, may be empty).
///
/// Grammar: optional sigil (`^^`, `^`), a path, optional `=> display`,
/// optional trailing `(hint)`.
pub fn parse_counter(raw: &str, parent_path: &str) -> Counter {
    let (left, right) = match raw.split_once("=>") {
        Some((l, r)) => (l.trim(), Some(r.trim())),
        None => (raw.trim(), None),
    };

    let (kind, rest) = if let Some(r) = left.strip_prefix("^^") {
        (CounterKind::Key, r)
    } else if let Some(r) = left.strip_prefix('^') {
        (CounterKind::Label, r)
    } else {
        (CounterKind::Metric, left)
    };

    let (name, mut hint) = split_hint(rest);
    let display = match right {
        Some(r) => {
            let (d, h) = split_hint(r);
            if h.is_some() {
                hint = h;
            }
            d
        }
        None => display_name(&name),
    };

    let path = if parent_path.is_empty() {
        name.clone()
    } else {
        format!("{parent_path}.{name}")
    };

    Counter {
        path,
        name,
        display,
        kind,
        hint: if kind == CounterKind::Metric { hint } else { None },
        raw: raw.to_string(),
    }
}

/// A `=>` arrow whose column differs from its siblings'.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrowLint {
    pub line: usize,
    pub counter: String,
    pub column: usize,
    pub expected: usize,
}

/// Scans raw template text for list entries whose `=>` arrows are not
/// aligned with the first arrow of the same block. Blocks are runs of
/// `- ` entries at the same indentation.
pub fn misaligned_arrows(text: &str) -> Vec<ArrowLint> {
    let mut lints = Vec::new();
    // (indent, expected arrow column)
    let mut block: Option<(usize, usize)> = None;

    for (lineno, line) in text.lines().enumerate() {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        if !trimmed.starts_with("- ") {
            if !trimmed.is_empty() {
                block = None;
            }
            continue;
        }
        if block.is_some_and(|(i, _)| i != indent) {
            block = None;
        }
        let Some(column) = line.find("=>") else {
            continue;
        };
        match block {
            None => block = Some((indent, column)),
            Some((_, expected)) if expected != column => lints.push(ArrowLint {
                line: lineno + 1,
                counter: trimmed.trim_start_matches("- ").trim().to_string(),
                column,
                expected,
            }),
            Some(_) => {}
        }
    }
    lints
}
