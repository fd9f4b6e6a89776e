//! Performance collector for the REST counter tables.
//!
//! `poll_counter` reads the table's `counter_schemas`, `poll_instance`
//! lists row identities from `rows?fields=properties`, and `poll_data`
//! reads values from `rows?fields=properties,counters`. Array counters
//! arrive as `values` with matching `labels` and become one metric per
//! label.

use crate::base::{instance_key, parse_number, remove_unseen, CollectorContext, CollectorCore};
use crate::error::{PollError, Result};
use crate::perf::{self, Property};
use crate::{CollectorKind, Task};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use stormon_api::rest::{rfc3339_to_unix, value_to_label, HrefBuilder, RestClient};
use stormon_common::matrix::Matrix;
use stormon_common::template::{Counter, Template};

/// One entry of `counter_schemas`.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSchema {
    pub name: String,
    pub property: Property,
    pub unit: String,
    pub denominator: String,
    pub description: String,
}

impl CounterSchema {
    fn from_value(value: &Value) -> Option<Self> {
        let text = |path: &str| value.pointer(path).and_then(Value::as_str).unwrap_or_default().to_string();
        let name = text("/name");
        if name.is_empty() {
            return None;
        }
        let kind = text("/type");
        let Some(property) = Property::parse(&kind) else {
            tracing::debug!(counter = %name, kind = %kind, "counter type without property, skipped");
            return None;
        };
        Some(Self {
            name,
            property,
            unit: text("/unit"),
            denominator: text("/denominator/name"),
            description: text("/description"),
        })
    }
}

pub struct RestPerfCollector {
    pub(crate) core: CollectorCore,
    client: RestClient,
    latency_io_reqd: f64,
    /// Schemas of the counters being collected, keyed by counter name.
    schemas: BTreeMap<String, CounterSchema>,
    /// Counter name to exported name, including hidden denominators.
    wanted: BTreeMap<String, (String, bool)>,
    cache_ready: bool,
}

impl RestPerfCollector {
    pub async fn init(ctx: &CollectorContext, template: Template) -> Result<Self> {
        let mut core = CollectorCore::new(CollectorKind::RestPerf, ctx, template)?;
        core.require_keys()?;
        if core.template.metrics().next().is_none() {
            return Err(PollError::MissingParam(format!(
                "{}: no metric counters",
                core.template.name
            )));
        }

        let mut client =
            RestClient::with_timeout(&ctx.connection, ctx.credentials.clone(), ctx.timeout(&core.template)).await?;
        client.init().await?;
        core.set_cluster(&client.cluster().name);
        perf::ensure_timestamp(&mut core.matrix);

        let latency_io_reqd = core.template.latency_io_reqd.unwrap_or(perf::DEFAULT_LATENCY_IO_REQD);
        Ok(Self {
            core,
            client,
            latency_io_reqd,
            schemas: BTreeMap::new(),
            wanted: BTreeMap::new(),
            cache_ready: false,
        })
    }

    /// Counter schemas read by the last counter poll.
    pub fn schemas(&self) -> &BTreeMap<String, CounterSchema> {
        &self.schemas
    }

    fn href(&self, path: &str, fields: &[&str]) -> String {
        let mut href = HrefBuilder::new().api_path(path).fields(fields);
        if let Some(timeout) = self.core.template.return_timeout {
            href = href.return_timeout(timeout);
        }
        href.build()
    }

    fn rows_path(&self) -> String {
        format!("{}/rows", self.core.template.query.trim_end_matches('/'))
    }

    pub async fn poll_counter(&mut self) -> Result<Vec<Matrix>> {
        let before = self.client.stats();
        let href = self.href(&self.core.template.query, &["counter_schemas"]);
        let body = self.client.get(&href).await?;
        let table = body.pointer("/records/0").unwrap_or(&body);
        let catalogue: BTreeMap<String, CounterSchema> = table
            .get("counter_schemas")
            .and_then(Value::as_array)
            .map(|schemas| {
                schemas
                    .iter()
                    .filter_map(CounterSchema::from_value)
                    .map(|s| (s.name.clone(), s))
                    .collect()
            })
            .unwrap_or_default();
        if catalogue.is_empty() {
            return Err(PollError::NoMetric(format!(
                "no counter schemas for {}",
                self.core.template.query
            )));
        }

        let mut wanted: BTreeMap<String, (String, bool)> = self
            .core
            .template
            .metrics()
            .map(|c| (c.path.clone(), (c.display.clone(), true)))
            .collect();
        let denominators: Vec<String> = wanted
            .keys()
            .filter_map(|name| catalogue.get(name))
            .map(|s| s.denominator.clone())
            .filter(|d| !d.is_empty() && !wanted.contains_key(d))
            .collect();
        for d in denominators {
            tracing::debug!(counter = %d, "adding required denominator");
            wanted.insert(d.clone(), (d, false));
        }

        let mut schemas = BTreeMap::new();
        for (name, (display, exportable)) in &wanted {
            let Some(schema) = catalogue.get(name) else {
                tracing::debug!(counter = %name, "requested counter not in table");
                continue;
            };
            let mut schema = schema.clone();
            if let Some(over) = self.core.template.override_for(name) {
                if let Some(property) = over.property.as_deref().and_then(Property::parse) {
                    schema.property = property;
                }
                if let Some(unit) = &over.unit {
                    schema.unit = unit.clone();
                }
                if let Some(base) = &over.base_counter {
                    schema.denominator = base.clone();
                }
            }
            let metric = self.core.matrix.metric_or_insert(name);
            metric.set_name(display);
            metric.set_property(schema.property.as_str());
            metric.set_unit(&schema.unit);
            metric.set_base_counter(&schema.denominator);
            metric.set_exportable(*exportable);
            schemas.insert(name.clone(), schema);
        }

        let stale: Vec<String> = self
            .core
            .matrix
            .metric_keys()
            .into_iter()
            .filter(|k| k != perf::TIMESTAMP && !schemas.contains_key(array_parent(k)))
            .collect();
        for key in &stale {
            self.core.matrix.remove_metric(key);
            tracing::debug!(metric = %key, "removed metric");
        }
        perf::ensure_timestamp(&mut self.core.matrix);

        self.core.metadata.record_stats(Task::Counter, &self.client.stats().since(&before));
        tracing::debug!(
            object = %self.core.template.object,
            counters = schemas.len(),
            removed = stale.len(),
            "counter schemas refreshed"
        );
        self.schemas = schemas;
        self.wanted = wanted;
        if self.schemas.is_empty() {
            return Err(PollError::NoMetric(format!(
                "none of the requested {} counters exist",
                self.core.template.query
            )));
        }
        Ok(Vec::new())
    }

    pub async fn poll_instance(&mut self) -> Result<Vec<Matrix>> {
        let href = self.href(&self.rows_path(), &["properties"]);
        let Self { core, client, .. } = self;
        let before = client.stats();

        let keys: Vec<Counter> = core.template.keys().cloned().collect();
        let mut seen = HashSet::new();
        let mut added = 0;
        let matrix = &mut core.matrix;
        client
            .for_each_batch(&href, |batch| {
                for record in &batch {
                    let Some(key) = instance_key(&keys, |c| property(record, &c.path)) else {
                        tracing::warn!("row without instance key, skipped");
                        continue;
                    };
                    if !matrix.has_instance(&key) {
                        matrix.instance_or_insert(&key);
                        added += 1;
                    }
                    seen.insert(key);
                }
                Ok(())
            })
            .await?;

        let removed = remove_unseen(&mut core.matrix, &seen);
        core.metadata.record_stats(Task::Instance, &client.stats().since(&before));
        tracing::debug!(
            object = %core.template.object,
            added,
            removed,
            total = core.matrix.instance_count(),
            "instance cache refreshed"
        );
        if core.matrix.instance_count() == 0 {
            return Err(PollError::NoInstance(format!(
                "no {} instances on cluster",
                core.template.object
            )));
        }
        Ok(Vec::new())
    }

    pub async fn poll_data(&mut self) -> Result<Vec<Matrix>> {
        let href = self.href(&self.rows_path(), &["properties", "counters"]);
        let Self {
            core,
            client,
            latency_io_reqd,
            schemas,
            wanted,
            cache_ready,
        } = self;
        let before = client.stats();
        let mut data = perf::fresh_data(&core.matrix);
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1e6;

        let keys: Vec<Counter> = core.template.keys().cloned().collect();
        let labels: Vec<Counter> = core.template.labels().cloned().collect();
        let mut count = 0usize;
        let records = client
            .for_each_batch(&href, |batch| {
                for record in &batch {
                    let Some(key) = instance_key(&keys, |c| property(record, &c.path)) else {
                        continue;
                    };
                    if !data.has_instance(&key) {
                        tracing::trace!(key = %key, "row not in instance cache, skipped");
                        continue;
                    }
                    if let Some(row) = data.instance_mut(&key) {
                        for label in labels.iter().chain(&keys) {
                            if let Some(value) = property(record, &label.path) {
                                row.set_label(&label.display, &value);
                                count += 1;
                            }
                        }
                    }
                    let ts = record
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .and_then(rfc3339_to_unix)
                        .unwrap_or(now);
                    let _ = data.set_value_float64(perf::TIMESTAMP, &key, ts);
                    count += ingest_counters(&mut data, &key, record, schemas, wanted);
                }
                Ok(())
            })
            .await?;

        core.metadata.record_stats(Task::Data, &client.stats().since(&before));
        core.metadata.set(Task::Data, "count", count as f64);
        if records == 0 {
            return Err(PollError::NoInstance(format!(
                "no {} instances on cluster",
                core.template.object
            )));
        }
        perf::finish_poll(core, data, cache_ready, *latency_io_reqd)
    }
}

/// Counter name of a metric key; array elements are keyed `name.label`.
fn array_parent(key: &str) -> &str {
    key.split_once('.').map(|(name, _)| name).unwrap_or(key)
}

/// Value of the row property `name`. `id` is a top-level field; lists
/// are joined with `,`.
fn property(record: &Value, name: &str) -> Option<String> {
    let value = if name == "id" {
        record.get("id")?
    } else {
        record
            .get("properties")?
            .as_array()?
            .iter()
            .find(|p| p.get("name").and_then(Value::as_str) == Some(name))?
            .get("value")?
    };
    Some(value_to_label(value)).filter(|s| !s.is_empty())
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

/// Writes the `counters` of one row. Array elements get their metric on
/// first sight, inheriting the counter's property, unit and base.
fn ingest_counters(
    data: &mut Matrix,
    key: &str,
    record: &Value,
    schemas: &BTreeMap<String, CounterSchema>,
    wanted: &BTreeMap<String, (String, bool)>,
) -> usize {
    let Some(counters) = record.get("counters").and_then(Value::as_array) else {
        return 0;
    };
    let mut count = 0;
    for counter in counters {
        let Some(name) = counter.get("name").and_then(Value::as_str) else {
            continue;
        };
        let (Some(schema), Some((display, exportable))) = (schemas.get(name), wanted.get(name)) else {
            continue;
        };

        if let Some(value) = counter.get("value") {
            if let Some(v) = number(value) {
                if data.set_value_float64(name, key, v).is_ok() {
                    count += 1;
                }
            }
            continue;
        }

        let values = counter.get("values").and_then(Value::as_array);
        let labels = counter.get("labels").and_then(Value::as_array);
        let (Some(values), Some(labels)) = (values, labels) else {
            tracing::debug!(counter = %name, "counter without value, skipped");
            continue;
        };
        if values.len() != labels.len() {
            tracing::warn!(counter = %name, labels = labels.len(), values = values.len(), "array size mismatch, skipped");
            continue;
        }
        if let Some(parent) = data.metric_mut(name) {
            parent.set_exportable(false);
        }
        for (label, value) in labels.iter().zip(values) {
            let label = value_to_label(label);
            let metric_key = format!("{name}.{label}");
            if !data.has_metric(&metric_key) {
                let base = match schema.denominator.as_str() {
                    "" => String::new(),
                    d if data.has_metric(&format!("{d}.{label}")) => format!("{d}.{label}"),
                    d => d.to_string(),
                };
                let metric = data.metric_or_insert(&metric_key);
                metric.set_name(display);
                metric.set_label("metric", &label);
                metric.set_array(true);
                metric.set_property(schema.property.as_str());
                metric.set_unit(&schema.unit);
                metric.set_base_counter(&base);
                metric.set_exportable(*exportable);
            }
            if let Some(v) = number(value) {
                if data.set_value_float64(&metric_key, key, v).is_ok() {
                    count += 1;
                }
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;
    use crate::Collector;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const VOLUME: &str = r#"
name: Volume
query: api/cluster/counter/tables/volume
object: volume
counters:
  - ^^name => volume
  - ^^svm.name => svm
  - ^aggregate.name => aggr
  - total_ops
  - read_ops
  - read_latency
  - read_io_type
  - latency_histogram
"#;

    fn schemas() -> Value {
        json!({"records": [{
            "name": "volume",
            "counter_schemas": [
                {"name": "total_ops", "type": "rate", "unit": "per_sec"},
                {"name": "read_ops", "type": "rate", "unit": "per_sec"},
                {"name": "read_latency", "type": "average", "unit": "microsec", "denominator": {"name": "read_ops"}},
                {"name": "read_io_type", "type": "delta", "unit": "none"},
                {"name": "write_ops", "type": "rate", "unit": "per_sec"},
                {"name": "write_data", "type": "string"}
            ]
        }]})
    }

    fn row(poll: usize) -> Value {
        let (total, read, latency, io) = match poll {
            0 => (1000, 500, 10_000, [1, 2]),
            _ => (1600, 600, 12_000, [4, 6]),
        };
        json!({
            "id": "s1:vol1",
            "timestamp": format!("2024-01-01T00:0{poll}:00Z"),
            "properties": [
                {"name": "name", "value": "vol1"},
                {"name": "svm.name", "value": "s1"},
                {"name": "aggregate.name", "value": "aggr1"}
            ],
            "counters": [
                {"name": "total_ops", "value": total},
                {"name": "read_ops", "value": read},
                {"name": "read_latency", "value": latency},
                {"name": "read_io_type", "values": io, "labels": ["cache", "disk"]}
            ]
        })
    }

    async fn appliance() -> std::net::SocketAddr {
        let polls = Arc::new(AtomicUsize::new(0));
        let rows = move || {
            let polls = polls.clone();
            async move {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                // first request is the instance poll
                Json(json!({"records": [row(n.saturating_sub(1))], "num_records": 1}))
            }
        };
        let router = Router::new()
            .route(
                "/api/cluster",
                get(|| async { Json(json!({"name": "umeng", "uuid": "abc"})) }),
            )
            .route("/api/cluster/counter/tables/volume", get(|| async { Json(schemas()) }))
            .route("/api/cluster/counter/tables/volume/rows", get(rows));
        mock::serve(router).await
    }

    #[test]
    fn should_read_row_properties_and_id() {
        let r = row(0);
        assert_eq!(property(&r, "svm.name").as_deref(), Some("s1"));
        assert_eq!(property(&r, "id").as_deref(), Some("s1:vol1"));
        assert_eq!(property(&r, "node.name"), None);
        assert_eq!(array_parent("read_io_type.cache"), "read_io_type");
        assert_eq!(array_parent("total_ops"), "total_ops");
    }

    #[test]
    fn should_parse_schemas_with_denominators() {
        let s = CounterSchema::from_value(&json!({"name": "read_latency", "type": "average", "unit": "microsec", "denominator": {"name": "read_ops"}})).unwrap();
        assert_eq!(s.property, Property::Average);
        assert_eq!(s.denominator, "read_ops");
        assert!(CounterSchema::from_value(&json!({"name": "write_data", "type": "string"})).is_none());
    }

    #[tokio::test]
    async fn should_cook_rest_counters_across_two_polls() {
        let addr = appliance().await;
        let template = Template::parse(VOLUME, &CollectorKind::RestPerf.parse_options()).unwrap();
        let mut collector = Collector::init(CollectorKind::RestPerf, &mock::context(addr), template)
            .await
            .unwrap();

        collector.poll(Task::Counter).await.unwrap();
        let Collector::RestPerf(inner) = &collector else {
            panic!("wrong variant");
        };
        assert!(inner.schemas().contains_key("read_ops"));
        assert!(!inner.schemas().contains_key("latency_histogram"));
        assert!(!inner.schemas().contains_key("write_ops"));

        collector.poll(Task::Instance).await.unwrap();
        let first = collector.poll(Task::Data).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].object, "metadata_collector");

        let out = collector.poll(Task::Data).await.unwrap();
        let m = &out[0];
        let key = "-vol1-s1";
        assert_eq!(m.value_float64("total_ops", key), Some(10.0));
        assert_eq!(m.value_float64("read_latency", key), Some(20.0));
        assert_eq!(m.value_float64("read_io_type.cache", key), Some(3.0));
        assert_eq!(m.value_float64("read_io_type.disk", key), Some(4.0));
        let disk = m.metric("read_io_type.disk").unwrap();
        assert!(disk.is_array());
        assert_eq!(disk.labels().get("metric").map(String::as_str), Some("disk"));
        assert_eq!(m.instance(key).unwrap().label("aggr"), Some("aggr1"));
        assert_eq!(m.instance(key).unwrap().label("volume"), Some("vol1"));
    }
}
