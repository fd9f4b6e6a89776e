//! Configuration collector for the REST API.
//!
//! The main query owns the instance set. Each `endpoints` entry is a
//! secondary query whose records only add labels and metrics to rows the
//! main query created; a failing endpoint is logged and skipped.

use crate::base::{add_template_metrics, instance_key, remove_unseen, CollectorContext, CollectorCore};
use crate::error::{PollError, Result};
use crate::{CollectorKind, Task};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use stormon_api::rest::{iso8601_duration_seconds, rfc3339_to_unix, value_at, value_to_label, HrefBuilder, RestClient};
use stormon_common::matrix::Matrix;
use stormon_common::template::{collapse_array_path, Counter, MetricHint, Template};

/// One query and the counters read from its records.
#[derive(Debug, Clone)]
struct Query {
    href: String,
    keys: Vec<Counter>,
    counters: Vec<Counter>,
}

impl Query {
    fn new(path: &str, counters: &[Counter], keys: Vec<Counter>, template: &Template) -> Self {
        let fields: Vec<String> = counters.iter().map(|c| collapse_array_path(&c.path)).collect();
        let hidden: Vec<String> = template
            .root()
            .child("hidden_fields")
            .map(|n| n.all_child_content())
            .unwrap_or_default();
        let mut href = HrefBuilder::new()
            .api_path(path)
            .fields(&fields)
            .hidden_fields(&hidden)
            .filter(&template.filter);
        if let Some(timeout) = template.return_timeout {
            href = href.return_timeout(timeout);
        }
        Self {
            href: href.build(),
            keys,
            counters: counters.to_vec(),
        }
    }

    /// Writes the labels and metrics of `record` into row `key`. Returns
    /// how many values were stored.
    fn ingest(&self, matrix: &mut Matrix, key: &str, record: &Value) -> usize {
        let mut stored = 0;
        for counter in &self.counters {
            if counter.is_metric() {
                let Some(value) = value_at(record, &counter.path) else {
                    continue;
                };
                match metric_value(value, counter.hint.as_ref()) {
                    Some(v) if matrix.set_value_float64(&counter.path, key, v).is_ok() => stored += 1,
                    _ => tracing::debug!(key = %key, counter = %counter.path, "unusable metric value"),
                }
            } else if let Some(label) = label_value(record, &counter.path) {
                if let Some(instance) = matrix.instance_mut(key) {
                    instance.set_label(&counter.display, &label);
                    stored += 1;
                }
            }
        }
        stored
    }

    fn key_of(&self, record: &Value) -> Option<String> {
        instance_key(&self.keys, |c| label_value(record, &c.path))
    }
}

pub struct RestCollector {
    pub(crate) core: CollectorCore,
    client: RestClient,
    main: Query,
    endpoints: Vec<Query>,
}

impl RestCollector {
    pub async fn init(ctx: &CollectorContext, template: Template) -> Result<Self> {
        let mut core = CollectorCore::new(CollectorKind::Rest, ctx, template)?;
        core.require_keys()?;

        let mut client =
            RestClient::with_timeout(&ctx.connection, ctx.credentials.clone(), ctx.timeout(&core.template)).await?;
        client.init().await?;
        core.set_cluster(&client.cluster().name);

        let template = &core.template;
        let keys: Vec<Counter> = template.keys().cloned().collect();
        let main = Query::new(&template.query, &template.counters, keys.clone(), template);
        let endpoints: Vec<Query> = template
            .endpoints
            .iter()
            .map(|e| {
                let own: Vec<Counter> = e.counters.iter().filter(|c| c.is_key()).cloned().collect();
                let keys = if own.is_empty() { keys.clone() } else { own };
                Query::new(&e.query, &e.counters, keys, template)
            })
            .collect();

        add_template_metrics(&mut core.matrix, &core.template, &core.template.counters);
        for endpoint in &core.template.endpoints {
            add_template_metrics(&mut core.matrix, &core.template, &endpoint.counters);
        }

        tracing::debug!(
            object = %core.template.object,
            href = %main.href,
            endpoints = endpoints.len(),
            "rest collector ready"
        );
        Ok(Self {
            core,
            client,
            main,
            endpoints,
        })
    }

    /// The instance set is refreshed by every data poll.
    pub async fn poll_instance(&mut self) -> Result<Vec<Matrix>> {
        Ok(Vec::new())
    }

    pub async fn poll_data(&mut self) -> Result<Vec<Matrix>> {
        let Self {
            core,
            client,
            main,
            endpoints,
        } = self;
        let before = client.stats();
        // built aside so a failed poll leaves the last good matrix in place
        let mut fresh = core.matrix.clone();
        fresh.reset();

        let mut seen = HashSet::new();
        let mut count = 0usize;
        let matrix = &mut fresh;
        let records = client
            .for_each_batch(&main.href, |batch| {
                for record in &batch {
                    let Some(key) = main.key_of(record) else {
                        tracing::debug!("record without instance key, skipped");
                        continue;
                    };
                    let instance = matrix.instance_or_insert(&key);
                    instance.set_exportable(true);
                    instance.set_labels(BTreeMap::new());
                    count += main.ingest(matrix, &key, record);
                    seen.insert(key);
                }
                Ok(())
            })
            .await;
        let records = match records {
            Ok(n) => n,
            Err(e) => {
                core.metadata.record_stats(Task::Data, &client.stats().since(&before));
                return Err(e);
            }
        };

        if records == 0 {
            core.matrix.purge_instances();
            core.metadata.record_stats(Task::Data, &client.stats().since(&before));
            return Err(PollError::NoInstance(format!(
                "no {} instances on cluster",
                core.template.object
            )));
        }
        let removed = remove_unseen(&mut fresh, &seen);

        for endpoint in endpoints.iter() {
            match merge_endpoint(client, endpoint, &mut fresh).await {
                Ok(n) => count += n,
                Err(e) => {
                    tracing::warn!(object = %core.template.object, api = %endpoint.href, error = %e, "endpoint failed, skipped");
                }
            }
        }

        let stats = client.stats().since(&before);
        core.metadata.record_stats(Task::Data, &stats);
        core.metadata.set(Task::Data, "count", count as f64);
        tracing::debug!(
            object = %core.template.object,
            records,
            removed,
            calls = stats.num_calls,
            "rest data poll"
        );
        core.matrix = fresh;
        let data = core.matrix.clone();
        Ok(core.publish(data))
    }
}

/// Adds an endpoint's values to rows that already exist.
async fn merge_endpoint(client: &mut RestClient, endpoint: &Query, matrix: &mut Matrix) -> Result<usize> {
    let mut count = 0;
    client
        .for_each_batch(&endpoint.href, |batch| {
            for record in &batch {
                let Some(key) = endpoint.key_of(record) else {
                    continue;
                };
                if matrix.has_instance(&key) {
                    count += endpoint.ingest(matrix, &key, record);
                }
            }
            Ok(())
        })
        .await?;
    Ok(count)
}

/// Label text at `path`. Paths through lists (`a.#.b`) join the values
/// of every item with `,`.
fn label_value(record: &Value, path: &str) -> Option<String> {
    let mut parts = Vec::new();
    collect_labels(record, path.trim_end_matches(".#"), &mut parts);
    Some(parts.join(",")).filter(|s| !s.is_empty())
}

fn collect_labels(value: &Value, path: &str, out: &mut Vec<String>) {
    match path.split_once(".#.") {
        Some((list, rest)) => {
            let items = value_at(value, list).and_then(Value::as_array);
            for item in items.into_iter().flatten() {
                collect_labels(item, rest, out);
            }
        }
        None => {
            if let Some(label) = value_at(value, path).map(value_to_label) {
                if !label.is_empty() {
                    out.push(label);
                }
            }
        }
    }
}

/// Numeric value of a JSON scalar, honoring the counter's type hint.
fn metric_value(value: &Value, hint: Option<&MetricHint>) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => match hint {
            Some(MetricHint::Duration) => iso8601_duration_seconds(s),
            Some(MetricHint::Timestamp) => rfc3339_to_unix(s),
            _ => crate::base::parse_number(s),
        },
        _ => None,
    }
}
