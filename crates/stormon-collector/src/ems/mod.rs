//! Event collector for the REST EMS endpoint.
//!
//! `poll_instance` intersects the template's events with the appliance's
//! catalogue (querying an unknown event fails the whole request) and
//! evicts stale issuing events. `poll_data` reads events newer than the
//! previous poll's cluster time, in as many requests as `max_url_size`
//! allows. Each event name gets its own matrix with an `events` metric.

pub mod bookend;
pub mod href;

use crate::base::{instance_key, CollectorContext, CollectorCore};
use crate::error::{PollError, Result};
use crate::{CollectorKind, Task};
use bookend::BookendEngine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use stormon_api::rest::{value_at, value_to_label, HrefBuilder, RestClient};
use stormon_common::matrix::Matrix;
use stormon_common::template::{parse_counter, Counter, PluginSpec, Template};
use stormon_common::tree::Node;
use stormon_plugins::{Pipeline, PluginContext};

/// Data poll interval when the template has none.
pub const DEFAULT_DATA_INTERVAL: Duration = Duration::from_secs(3 * 60);

pub const DEFAULT_SEVERITY: &str = "alert|emergency|error|informational|notice";

const CATALOGUE_QUERY: &str = "api/support/ems/messages";
const CLUSTER_DATE_QUERY: &str = "api/private/cli/cluster/date";

/// Labels every event carries, as `path => display`.
const DEFAULT_LABELS: [&str; 5] = [
    "message.name => message",
    "node.name => node",
    "message.severity => severity",
    "time",
    "index",
];

/// Instance keys of events without a bookend.
const DEFAULT_KEYS: [&str; 2] = ["^^index", "^^message.name"];

/// Pairing of an issuing event with the event that closes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveWhen {
    pub name: String,
    pub resolve_after: Duration,
    pub resolve_key: Vec<Counter>,
}

/// One entry of the template's `events` list.
#[derive(Debug, Clone)]
pub struct EventDef {
    pub name: String,
    pub keys: Vec<Counter>,
    pub labels: Vec<Counter>,
    /// Constant labels from the `labels` map.
    pub static_labels: BTreeMap<String, String>,
    /// `(label, value)` pairs; at least one must hold for a record to count.
    pub matches: Vec<(String, String)>,
    pub plugins: Vec<PluginSpec>,
    pub resolve: Option<ResolveWhen>,
}

impl EventDef {
    pub fn parse(node: &Node) -> Result<Self> {
        let name = node.child_content("name").trim().to_string();
        if name.is_empty() {
            return Err(PollError::MissingParam("events.name".to_string()));
        }

        let exports: Vec<Counter> = node
            .child("exports")
            .map(|e| {
                e.all_child_content()
                    .iter()
                    .filter(|raw| !raw.trim().is_empty())
                    .map(|raw| parse_counter(raw, ""))
                    .collect()
            })
            .unwrap_or_default();
        let mut labels: Vec<Counter> = DEFAULT_LABELS.iter().map(|raw| parse_counter(raw, "")).collect();
        for counter in &exports {
            labels.retain(|l| l.path != counter.path);
            labels.push(counter.clone());
        }
        let mut keys: Vec<Counter> = exports.iter().filter(|c| c.is_key()).cloned().collect();

        let matches = node
            .child("matches")
            .map(|m| {
                m.children
                    .iter()
                    .filter_map(|item| {
                        let label = item.child_content("name");
                        let value = item.child_content("value");
                        if label.is_empty() || value.is_empty() {
                            tracing::warn!(event = %name, "incomplete matches entry, skipped");
                            return None;
                        }
                        Some((label.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let static_labels = node
            .child("labels")
            .map(|l| {
                l.children
                    .iter()
                    .filter(|c| !c.name.is_empty() && !c.content.is_empty())
                    .map(|c| (c.name.clone(), c.content.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let plugins = node
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

        let mut resolve = match node.child("resolve_when_ems") {
            Some(r) => {
                // accepts a single mapping or a one-item list of mappings
                let entry = if r.has_child("name") { Some(r) } else { r.children.first() };
                entry.map(|e| ResolveWhen::parse(&name, e)).transpose()?
            }
            None => None,
        };

        if keys.is_empty() {
            if resolve.is_some() {
                tracing::warn!(event = %name, "bookend event without ^^ exports, every record is its own incident");
            }
            keys = DEFAULT_KEYS.iter().map(|raw| parse_counter(raw, "")).collect();
        }
        if let Some(r) = resolve.as_mut().filter(|r| r.resolve_key.is_empty()) {
            r.resolve_key = keys.clone();
        }

        Ok(Self {
            name,
            keys,
            labels,
            static_labels,
            matches,
            plugins,
            resolve,
        })
    }

    /// Row labels for `record`, or `None` when `matches` rejects it.
    fn labels_for(&self, record: &Value) -> Option<BTreeMap<String, String>> {
        let mut labels = BTreeMap::new();
        for counter in &self.labels {
            match lookup(record, &counter.path) {
                Some(value) => {
                    labels.insert(counter.display.clone(), value);
                }
                None => tracing::trace!(event = %self.name, label = %counter.path, "label missing in record"),
            }
        }
        labels.extend(self.static_labels.clone());
        let matched = self.matches.is_empty()
            || self
                .matches
                .iter()
                .any(|(label, value)| labels.get(label).is_some_and(|v| v == value));
        matched.then_some(labels)
    }
}

impl ResolveWhen {
    fn parse(issuing: &str, node: &Node) -> Result<Self> {
        let name = node.child_content("name").trim().to_string();
        if name.is_empty() {
            return Err(PollError::MissingParam(format!("{issuing}: resolve_when_ems.name")));
        }
        let resolve_after = match node.child_content("resolve_after").trim() {
            "" => bookend::DEFAULT_RESOLVE_AFTER,
            s => humantime::parse_duration(s)
                .map_err(|e| PollError::InvalidParam(format!("{issuing}: resolve_after={s}: {e}")))?,
        };
        let resolve_key = node
            .child("resolve_key")
            .map(|k| {
                k.all_child_content()
                    .iter()
                    .filter(|raw| !raw.trim().is_empty())
                    .map(|raw| parse_counter(raw, ""))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            name,
            resolve_after,
            resolve_key,
        })
    }
}

/// Field of an EMS record. `parameters.X` is looked up in the
/// `parameters` list of `{name, value}` pairs.
fn lookup(record: &Value, path: &str) -> Option<String> {
    let value = match path.strip_prefix("parameters.") {
        Some(param) => record
            .get("parameters")?
            .as_array()?
            .iter()
            .find(|p| p.get("name").and_then(Value::as_str) == Some(param))?
            .get("value")?,
        None => value_at(record, path)?,
    };
    Some(value_to_label(value)).filter(|s| !s.is_empty())
}

pub struct EmsCollector {
    pub(crate) core: CollectorCore,
    client: RestClient,
    defs: BTreeMap<String, Vec<EventDef>>,
    pipelines: BTreeMap<String, Pipeline>,
    engine: BookendEngine,
    /// Event matrices rebuilt by every data poll.
    transient: BTreeMap<String, Matrix>,
    /// Configured names the appliance knows, resolvers included.
    event_names: Vec<String>,
    severity_filter: String,
    max_url_size: usize,
    /// Cluster time of the previous data poll.
    last_filter_time: Option<String>,
}

impl EmsCollector {
    pub async fn init(ctx: &CollectorContext, template: Template) -> Result<Self> {
        let mut core = CollectorCore::new(CollectorKind::Ems, ctx, template)?;
        let events = core
            .template
            .root()
            .child("events")
            .filter(|e| !e.children.is_empty())
            .ok_or_else(|| PollError::MissingParam("events".to_string()))?;

        let mut defs: BTreeMap<String, Vec<EventDef>> = BTreeMap::new();
        for node in &events.children {
            let def = EventDef::parse(node)?;
            defs.entry(def.name.clone()).or_default().push(def);
        }

        let mut pipelines = BTreeMap::new();
        for (name, list) in &defs {
            let specs: Vec<PluginSpec> = list.iter().flat_map(|d| d.plugins.clone()).collect();
            if specs.is_empty() {
                continue;
            }
            let plugin_ctx = PluginContext {
                collector: CollectorKind::Ems.to_string(),
                object: name.clone(),
                template: core.template.root().clone(),
            };
            pipelines.insert(name.clone(), ctx.registry.pipeline(&specs, &plugin_ctx)?);
        }

        let severity_filter = format!(
            "message.severity={}",
            core.template.severity.as_deref().unwrap_or(DEFAULT_SEVERITY)
        );
        let max_url_size = core.template.max_url_size.unwrap_or(href::DEFAULT_MAX_URL_SIZE);

        let mut client =
            RestClient::with_timeout(&ctx.connection, ctx.credentials.clone(), ctx.timeout(&core.template)).await?;
        client.init().await?;
        core.set_cluster(&client.cluster().name);

        let mut engine = BookendEngine::new(&core.template.object, core.matrix.global_labels().clone());
        for def in defs.values().flatten() {
            if let Some(r) = &def.resolve {
                engine.register(&def.name, &r.name, r.resolve_after, r.resolve_key.clone());
            }
        }

        let mut collector = Self {
            core,
            client,
            defs,
            pipelines,
            engine,
            transient: BTreeMap::new(),
            event_names: Vec::new(),
            severity_filter,
            max_url_size,
            last_filter_time: None,
        };
        // time filter of the same width as a real one
        let sample = vec![format!("time=>={}", format_time(&Utc::now()))];
        let names = collector.configured_names();
        href::check_fits(&names, max_url_size, |batch| collector.events_href(batch, &sample))?;

        tracing::debug!(
            events = collector.defs.len(),
            bookends = collector.engine.resolving_names().count(),
            max_url_size,
            severity = %collector.severity_filter,
            "ems collector ready"
        );
        Ok(collector)
    }

    /// Issuing and resolving names from the template, in sorted order.
    fn configured_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .defs
            .keys()
            .chain(self.engine.resolving_names())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn events_href(&self, names: &[String], filters: &[String]) -> String {
        let mut all = vec![self.severity_filter.clone()];
        all.extend(filters.iter().cloned());
        all.push(format!("message.name={}", names.join(",")));
        all.push("order_by=index desc".to_string());
        let mut href = HrefBuilder::new()
            .api_path(&self.core.template.query)
            .fields(&["*"])
            .filter(&all);
        if let Some(timeout) = self.core.template.return_timeout {
            href = href.return_timeout(timeout);
        }
        href.build()
    }

    pub fn engine(&self) -> &BookendEngine {
        &self.engine
    }

    /// Names queried by the next data poll.
    pub fn event_names(&self) -> &[String] {
        &self.event_names
    }

    pub async fn poll_instance(&mut self) -> Result<Vec<Matrix>> {
        let before = self.client.stats();
        let href = HrefBuilder::new().api_path(CATALOGUE_QUERY).fields(&["name"]).build();
        let mut catalogue = HashSet::new();
        let total = self
            .client
            .for_each_batch(&href, |batch| {
                catalogue.extend(
                    batch
                        .iter()
                        .filter_map(|r| r.get("name").and_then(Value::as_str))
                        .map(str::to_string),
                );
                Ok(())
            })
            .await?;
        self.core.metadata.record_stats(Task::Instance, &self.client.stats().since(&before));
        if total == 0 {
            return Err(PollError::NoInstance("no ems messages in cluster catalogue".to_string()));
        }

        let (known, missing): (Vec<String>, Vec<String>) = self
            .configured_names()
            .into_iter()
            .partition(|name| catalogue.contains(name));
        if !missing.is_empty() {
            tracing::debug!(skipped = ?missing, "events unknown to cluster");
        }
        self.event_names = known;

        let evicted = self.engine.evict(Utc::now().timestamp_micros());
        tracing::debug!(
            queried = self.event_names.len(),
            evicted,
            active = self.engine.active_count(),
            "ems catalogue refreshed"
        );
        Ok(Vec::new())
    }

    async fn cluster_time(&mut self) -> Result<DateTime<Utc>> {
        let href = HrefBuilder::new()
            .api_path(CLUSTER_DATE_QUERY)
            .fields(&["date"])
            .max_records(1)
            .build();
        let body = self.client.get(&href).await?;
        let date = body
            .pointer("/records/0/date")
            .and_then(Value::as_str)
            .ok_or_else(|| PollError::AttributeNotFound("cluster date".to_string()))?;
        DateTime::parse_from_rfc3339(date)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| PollError::Parse(format!("cluster date {date}: {e}")))
    }

    pub async fn poll_data(&mut self) -> Result<Vec<Matrix>> {
        let before = self.client.stats();
        self.transient.clear();

        let cluster_time = self.cluster_time().await?;
        let from = match &self.last_filter_time {
            Some(t) => t.clone(),
            None => {
                let interval = self.core.template.interval_or("data", DEFAULT_DATA_INTERVAL);
                let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::minutes(3));
                format_time(&(cluster_time - interval))
            }
        };
        let filters = vec![format!("time=>={from}")];
        let hrefs = href::batch_hrefs(&self.event_names, self.max_url_size, |batch| {
            self.events_href(batch, &filters)
        })?;
        if hrefs.is_empty() {
            tracing::info!("no configured events known to cluster, nothing to query");
        }

        let now_us = Utc::now().timestamp_micros();
        let Self {
            core,
            client,
            defs,
            engine,
            transient,
            ..
        } = self;
        let mut records = 0;
        let mut resolved = 0;
        for href in &hrefs {
            records += client
                .for_each_batch(href, |batch| {
                    for record in &batch {
                        resolved += ingest(record, defs, engine, transient, &core.matrix, now_us);
                    }
                    Ok(())
                })
                .await?;
        }
        self.last_filter_time = Some(format_time(&cluster_time));

        let core = &mut self.core;
        core.metadata.record_stats(Task::Data, &self.client.stats().since(&before));
        core.metadata.set(Task::Data, "count", records as f64);
        tracing::debug!(
            records,
            resolved,
            requests = hrefs.len(),
            active = self.engine.active_count(),
            "ems data poll"
        );
        Ok(self.publish())
    }

    /// Event matrices, their plugin output and the metadata.
    fn publish(&mut self) -> Vec<Matrix> {
        let started = Instant::now();
        let export_options = self.core.matrix.export_options().clone();
        let mut events: Vec<(String, Matrix)> = self
            .engine
            .matrices()
            .map(|(name, m)| (name.clone(), m.clone()))
            .chain(self.transient.iter().map(|(name, m)| (name.clone(), m.clone())))
            .collect();
        events.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::new();
        let mut instances = 0;
        let mut metrics = 0;
        for (name, mut matrix) in events {
            matrix.set_export_options(export_options.clone());
            instances += matrix.instance_count();
            metrics += matrix.metric_count();
            if let Some(pipeline) = self.pipelines.get_mut(&name) {
                out.extend(pipeline.run(&mut matrix).matrices);
            }
            if self.core.template.export_data {
                out.push(matrix);
            }
        }
        let metadata = &mut self.core.metadata;
        metadata.set(Task::Data, "plugin_time", started.elapsed().as_micros() as f64);
        metadata.set(Task::Data, "instances", instances as f64);
        metadata.set(Task::Data, "metrics", metrics as f64);
        out.push(metadata.matrix().clone());
        out
    }
}

/// Applies one record. Returns how many issuing rows it resolved.
fn ingest(
    record: &Value,
    defs: &BTreeMap<String, Vec<EventDef>>,
    engine: &mut BookendEngine,
    transient: &mut BTreeMap<String, Matrix>,
    parent: &Matrix,
    now_us: i64,
) -> usize {
    let Some(name) = record.pointer("/message/name").and_then(Value::as_str) else {
        tracing::warn!("ems record without message name, skipped");
        return 0;
    };
    let resolving = engine.is_resolving(name);
    let resolved = if resolving {
        engine.resolve(name, |c| lookup(record, &c.path))
    } else {
        0
    };
    // a resolver may also be configured as an event of its own
    let Some(list) = defs.get(name) else {
        if !resolving {
            tracing::trace!(event = %name, "event not configured, skipped");
        }
        return resolved;
    };

    for def in list {
        let Some(key) = instance_key(&def.keys, |c| lookup(record, &c.path)) else {
            tracing::warn!(event = %name, "ems record without instance key, skipped");
            continue;
        };
        let Some(labels) = def.labels_for(record) else {
            tracing::trace!(event = %name, key = %key, "record rejected by matches");
            continue;
        };
        if def.resolve.is_some() {
            engine.issue(name, &key, labels, now_us);
            continue;
        }
        let matrix = transient.entry(name.to_string()).or_insert_with(|| {
            let mut m = Matrix::new(name, &parent.object, name);
            m.set_global_labels(parent.global_labels());
            m.metric_or_insert(bookend::EVENTS);
            m.metric_or_insert(bookend::TIMESTAMP);
            m
        });
        let row = matrix.instance_or_insert(&key);
        row.set_labels(labels);
        let _ = matrix.set_value_float64(bookend::EVENTS, &key, 1.0);
        let _ = matrix.set_value_float64(bookend::TIMESTAMP, &key, now_us as f64);
    }
    resolved
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests;
