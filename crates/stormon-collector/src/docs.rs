//! Metric documentation table.
//!
//! Lists every metric the templates export with the appliance API,
//! endpoint and counter it comes from, its unit and type when known, and
//! the dashboard panels that query it.

use crate::restperf::CounterSchema;
use crate::CollectorKind;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use stormon_api::swagger::SwaggerDoc;
use stormon_common::template::{Counter, Template};
use stormon_plugins::{PluginContext, PluginRegistry};

/// Unit, type and description of one appliance counter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterMeta {
    pub unit: String,
    pub kind: String,
    pub base_counter: String,
    pub description: String,
}

impl From<&CounterSchema> for CounterMeta {
    fn from(schema: &CounterSchema) -> Self {
        Self {
            unit: schema.unit.clone(),
            kind: schema.property.to_string(),
            base_counter: schema.denominator.clone(),
            description: schema.description.clone(),
        }
    }
}

/// Counter metadata keyed by `(query, counter)`.
pub type CounterMetadata = BTreeMap<(String, String), CounterMeta>;

/// A template and the collector kind that reads it.
#[derive(Debug, Clone)]
pub struct DocSource {
    pub kind: CollectorKind,
    /// Template file, as shown in the table.
    pub file: String,
    pub template: Template,
}

#[derive(Debug, Clone)]
pub struct Dashboard {
    pub title: String,
    pub json: Value,
}

/// One row of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterDoc {
    pub metric: String,
    pub api: String,
    pub endpoint: String,
    pub counter: String,
    pub unit: String,
    pub kind: String,
    pub description: String,
    pub template: String,
    /// `dashboard: panel` titles whose queries use the metric.
    pub panels: Vec<String>,
}

impl CounterDoc {
    fn new(source: &DocSource, metric: String, endpoint: &str, counter: &str) -> Self {
        Self {
            metric,
            api: if source.kind.is_legacy() { "ZAPI" } else { "REST" }.to_string(),
            endpoint: endpoint.to_string(),
            counter: counter.to_string(),
            unit: String::new(),
            kind: String::new(),
            description: String::new(),
            template: source.file.clone(),
            panels: Vec::new(),
        }
    }
}

/// Builds one row per exported metric, sorted by metric then API.
pub fn build_counter_docs(
    sources: &[DocSource],
    metadata: &CounterMetadata,
    swagger: Option<&SwaggerDoc>,
    dashboards: &[Dashboard],
) -> Vec<CounterDoc> {
    let registry = PluginRegistry::default();
    let mut docs = Vec::new();
    for source in sources {
        let template = &source.template;
        let object = &template.object;

        if source.kind == CollectorKind::Ems {
            let mut doc = CounterDoc::new(source, format!("{object}_events"), &template.query, "events");
            doc.description = "Active (1) or resolved (0) EMS event".to_string();
            docs.push(doc);
            continue;
        }

        if template.export_data {
            let endpoints = std::iter::once((template.query.as_str(), template.counters.as_slice()))
                .chain(template.endpoints.iter().map(|e| (e.query.as_str(), e.counters.as_slice())));
            for (endpoint, counters) in endpoints {
                for counter in counters.iter().filter(|c| c.is_metric()) {
                    docs.push(counter_doc(source, endpoint, counter, metadata, swagger));
                }
            }
            if template.labels().next().is_some() && !source.kind.is_legacy() && !is_perf(source.kind) {
                let mut doc = CounterDoc::new(source, format!("{object}_labels"), &template.query, "generated");
                doc.description = format!("Labels of {}", template.name);
                docs.push(doc);
            }
        }

        let ctx = PluginContext {
            collector: source.kind.to_string(),
            object: object.clone(),
            template: template.root().clone(),
        };
        match registry.pipeline(&template.plugins, &ctx) {
            Ok(pipeline) => {
                for plugin in pipeline.plugins() {
                    for derived in plugin.derived_metrics() {
                        let mut doc =
                            CounterDoc::new(source, format!("{object}_{}", derived.name), &template.query, &derived.source);
                        doc.description = format!("Computed by {}", plugin.name());
                        docs.push(doc);
                    }
                }
            }
            Err(e) => tracing::warn!(template = %source.file, error = %e, "plugins skipped in docs"),
        }
    }

    for doc in &mut docs {
        doc.panels = panels_using(&doc.metric, dashboards);
    }
    docs.sort_by(|a, b| (&a.metric, &a.api).cmp(&(&b.metric, &b.api)));
    docs.dedup_by(|a, b| a.metric == b.metric && a.api == b.api && a.endpoint == b.endpoint);
    docs
}

fn is_perf(kind: CollectorKind) -> bool {
    matches!(kind, CollectorKind::ZapiPerf | CollectorKind::RestPerf)
}

fn counter_doc(
    source: &DocSource,
    endpoint: &str,
    counter: &Counter,
    metadata: &CounterMetadata,
    swagger: Option<&SwaggerDoc>,
) -> CounterDoc {
    let object = &source.template.object;
    let mut doc = CounterDoc::new(source, format!("{object}_{}", counter.display), endpoint, &counter.path);
    if let Some(meta) = metadata.get(&(endpoint.to_string(), counter.path.clone())) {
        doc.unit = meta.unit.clone();
        doc.kind = meta.kind.clone();
        doc.description = meta.description.clone();
    }
    if let Some(over) = source.template.override_for(&counter.name) {
        if let Some(property) = &over.property {
            doc.kind = property.clone();
        }
        if let Some(unit) = &over.unit {
            doc.unit = unit.clone();
        }
    }
    if doc.description.is_empty() && !source.kind.is_legacy() {
        if let Some(description) = swagger.and_then(|s| s.description(object, &counter.path)) {
            doc.description = description;
        }
    }
    doc
}

/// Panels whose target expressions mention `metric` as a whole word.
pub fn panels_using(metric: &str, dashboards: &[Dashboard]) -> Vec<String> {
    let Ok(word) = Regex::new(&format!(r"\b{}\b", regex::escape(metric))) else {
        return Vec::new();
    };
    let mut found = BTreeSet::new();
    for dashboard in dashboards {
        let mut stack: Vec<&Value> = dashboard
            .json
            .get("panels")
            .and_then(Value::as_array)
            .map(|p| p.iter().collect())
            .unwrap_or_default();
        while let Some(panel) = stack.pop() {
            if let Some(nested) = panel.get("panels").and_then(Value::as_array) {
                stack.extend(nested);
            }
            let uses = panel
                .get("targets")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|t| t.get("expr").and_then(Value::as_str))
                .any(|expr| word.is_match(expr));
            if uses {
                let title = panel.get("title").and_then(Value::as_str).unwrap_or("untitled");
                found.insert(format!("{}: {title}", dashboard.title));
            }
        }
    }
    found.into_iter().collect()
}

/// Markdown table of `docs`, grouped under one heading per metric.
pub fn render_markdown(docs: &[CounterDoc]) -> String {
    let mut by_metric: BTreeMap<&str, Vec<&CounterDoc>> = BTreeMap::new();
    for doc in docs {
        by_metric.entry(doc.metric.as_str()).or_default().push(doc);
    }

    let mut out = String::from("# Metrics\n");
    for (metric, rows) in by_metric {
        let description = rows
            .iter()
            .map(|d| d.description.as_str())
            .find(|d| !d.is_empty())
            .unwrap_or_default();
        let _ = write!(out, "\n### {metric}\n\n");
        if !description.is_empty() {
            let _ = writeln!(out, "{}\n", cell(description));
        }
        out.push_str("| API | Endpoint | Metric | Template |\n|-----|----------|--------|----------|\n");
        for row in &rows {
            let mut counter = format!("`{}`", row.counter);
            if !row.unit.is_empty() {
                let _ = write!(counter, "<br>Unit: {}", row.unit);
            }
            if !row.kind.is_empty() {
                let _ = write!(counter, "<br>Type: {}", row.kind);
            }
            let _ = writeln!(out, "| {} | `{}` | {} | {} |", row.api, row.endpoint, counter, row.template);
        }
        let panels: BTreeSet<&str> = rows.iter().flat_map(|r| r.panels.iter().map(String::as_str)).collect();
        if !panels.is_empty() {
            out.push_str("\nDashboards:\n\n");
            for panel in panels {
                let _ = writeln!(out, "- {panel}");
            }
        }
    }
    out
}

fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::Property;
    use serde_json::json;

    const VOLUME: &str = r#"
name: Volume
query: api/storage/volumes
object: volume
counters:
  - ^^name => volume
  - ^svm.name => svm
  - space.used => size_used
  - space.size => size
plugins:
  - MetricAgent:
      compute_metric:
        - size_used_percent PERCENT size_used size
"#;

    const VOLUME_PERF: &str = r#"
name: Volume
query: volume
object: volume
counters:
  - ^^instance_uuid
  - read_ops
  - read_latency
"#;

    const SWAGGER: &str = r#"
definitions:
  volume:
    properties:
      space:
        properties:
          used:
            description: Space used by the volume
"#;

    fn source(kind: CollectorKind, file: &str, text: &str) -> DocSource {
        DocSource {
            kind,
            file: file.to_string(),
            template: Template::parse(text, &kind.parse_options()).unwrap(),
        }
    }

    fn dashboard() -> Dashboard {
        Dashboard {
            title: "Volume".to_string(),
            json: json!({"panels": [
                {"title": "Used", "targets": [{"expr": "sum(volume_size_used{cluster=\"a\"})"}]},
                {"title": "Row", "type": "row", "panels": [
                    {"title": "Used percent", "targets": [{"expr": "volume_size_used_percent > 90"}]},
                    {"title": "Latency", "targets": [{"expr": "volume_read_latency"}]}
                ]}
            ]}),
        }
    }

    #[test]
    fn should_document_template_plugin_and_perf_metrics() {
        let sources = [
            source(CollectorKind::Rest, "rest/volume.yaml", VOLUME),
            source(CollectorKind::ZapiPerf, "zapiperf/volume.yaml", VOLUME_PERF),
        ];
        let mut metadata = CounterMetadata::new();
        let schema = CounterSchema {
            name: "read_latency".to_string(),
            property: Property::Average,
            unit: "microsec".to_string(),
            denominator: "read_ops".to_string(),
            description: "Average read latency".to_string(),
        };
        metadata.insert(("volume".to_string(), "read_latency".to_string()), CounterMeta::from(&schema));
        let swagger = SwaggerDoc::parse(SWAGGER).unwrap();

        let docs = build_counter_docs(&sources, &metadata, Some(&swagger), &[dashboard()]);
        let metrics: Vec<&str> = docs.iter().map(|d| d.metric.as_str()).collect();
        assert_eq!(
            metrics,
            [
                "volume_labels",
                "volume_read_latency",
                "volume_read_ops",
                "volume_size",
                "volume_size_used",
                "volume_size_used_percent",
            ]
        );

        let used = docs.iter().find(|d| d.metric == "volume_size_used").unwrap();
        assert_eq!(used.api, "REST");
        assert_eq!(used.counter, "space.used");
        assert_eq!(used.description, "Space used by the volume");
        assert_eq!(used.panels, vec!["Volume: Used".to_string()]);

        let latency = docs.iter().find(|d| d.metric == "volume_read_latency").unwrap();
        assert_eq!(latency.api, "ZAPI");
        assert_eq!((latency.unit.as_str(), latency.kind.as_str()), ("microsec", "average"));
        assert_eq!(latency.panels, vec!["Volume: Latency".to_string()]);

        let percent = docs.iter().find(|d| d.metric == "volume_size_used_percent").unwrap();
        assert_eq!(percent.counter, "size_used, size");
        assert_eq!(percent.panels, vec!["Volume: Used percent".to_string()]);
    }

    #[test]
    fn should_match_whole_metric_names_only() {
        let dashboards = [dashboard()];
        assert_eq!(panels_using("volume_size_used", &dashboards), vec!["Volume: Used".to_string()]);
        assert!(panels_using("volume_size", &dashboards).is_empty());
    }

    #[test]
    fn should_render_one_section_per_metric() {
        let sources = [source(CollectorKind::Rest, "rest/volume.yaml", VOLUME)];
        let docs = build_counter_docs(&sources, &CounterMetadata::new(), None, &[dashboard()]);
        let text = render_markdown(&docs);
        assert!(text.starts_with("# Metrics\n"));
        assert!(text.contains("### volume_size_used\n"));
        assert!(text.contains("| REST | `api/storage/volumes` | `space.used` | rest/volume.yaml |"));
        assert!(text.contains("- Volume: Used"));
    }
}
