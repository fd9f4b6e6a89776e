//! Performance collector for the legacy XML API.
//!
//! Counter metadata comes from `perf-object-counter-list-info`, the
//! instance set from `perf-object-instance-list-info-iter`, and values
//! from `perf-object-get-instances` in batches of instance ids.

use crate::base::{parse_number, remove_unseen, CollectorContext, CollectorCore};
use crate::error::{is_resource_limit, PollError, Result};
use crate::perf::{self, array_labels, ArrayLabel, Property};
use crate::{CollectorKind, Task};
use std::collections::{BTreeMap, HashMap, HashSet};
use stormon_api::zapi::ZapiClient;
use stormon_common::matrix::Matrix;
use stormon_common::template::Template;
use stormon_common::tree::Node;

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Smallest batch the collector shrinks to after resource-limit errors.
const MIN_BATCH_SIZE: usize = 100;

/// Which instance attribute identifies a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstanceKey {
    Uuid,
    Name,
}

impl InstanceKey {
    fn field(&self) -> &'static str {
        match self {
            InstanceKey::Uuid => "uuid",
            InstanceKey::Name => "name",
        }
    }

    /// Request list element and item names.
    fn request_names(&self) -> (&'static str, &'static str) {
        match self {
            InstanceKey::Uuid => ("instance-uuids", "instance-uuid"),
            InstanceKey::Name => ("instances", "instance"),
        }
    }
}

pub struct ZapiPerfCollector {
    pub(crate) core: CollectorCore,
    client: ZapiClient,
    batch_size: usize,
    instance_key: InstanceKey,
    latency_io_reqd: f64,
    /// String counters exported as labels: counter name to label name.
    instance_labels: BTreeMap<String, String>,
    scalar_counters: Vec<String>,
    /// Array counter name to its metric keys, in value order.
    arrays: BTreeMap<String, Vec<String>>,
    cache_ready: bool,
}

impl ZapiPerfCollector {
    pub async fn init(ctx: &CollectorContext, template: Template) -> Result<Self> {
        let mut core = CollectorCore::new(CollectorKind::ZapiPerf, ctx, template)?;
        if core.template.counters.is_empty() {
            return Err(PollError::MissingParam("counters".to_string()));
        }
        let instance_key = match core.template.param("instance_key") {
            "" | "uuid" => InstanceKey::Uuid,
            "name" => InstanceKey::Name,
            other => return Err(PollError::InvalidParam(format!("instance_key={other}"))),
        };

        let mut client =
            ZapiClient::with_timeout(&ctx.connection, ctx.credentials.clone(), ctx.timeout(&core.template)).await?;
        client.init().await?;
        core.set_cluster(&client.system().name);
        perf::ensure_timestamp(&mut core.matrix);

        let batch_size = core.template.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        let latency_io_reqd = core.template.latency_io_reqd.unwrap_or(perf::DEFAULT_LATENCY_IO_REQD);
        Ok(Self {
            core,
            client,
            batch_size,
            instance_key,
            latency_io_reqd,
            instance_labels: BTreeMap::new(),
            scalar_counters: Vec::new(),
            arrays: BTreeMap::new(),
            cache_ready: false,
        })
    }

    /// Reloads counter metadata: properties, units, base counters and
    /// array labels. Counters the appliance no longer reports are dropped.
    pub async fn poll_counter(&mut self) -> Result<Vec<Matrix>> {
        let before = self.client.stats();
        let mut request = Node::new("perf-object-counter-list-info");
        request.new_child("objectname", &self.core.template.query);
        let response = self.client.invoke(&request).await?;

        let catalogue: HashMap<String, Node> = response
            .child("counters")
            .map(|list| {
                list.children
                    .iter()
                    .filter(|c| !c.child_content("name").is_empty())
                    .map(|c| (c.child_content("name").to_string(), c.clone()))
                    .collect()
            })
            .unwrap_or_default();
        if catalogue.is_empty() {
            return Err(PollError::NoMetric(format!(
                "no counters for {} in response",
                self.core.template.query
            )));
        }

        let wanted: Vec<(String, String, bool)> = self
            .core
            .template
            .counters
            .iter()
            .map(|c| (c.path.clone(), c.display.clone(), !c.is_metric()))
            .collect();

        let mut counters = CounterSet {
            matrix: &mut self.core.matrix,
            arrays: BTreeMap::new(),
            updated: HashSet::new(),
            catalogue: &catalogue,
        };
        let mut labels = BTreeMap::new();
        let mut missing_bases = Vec::new();

        for (name, display, is_label) in &wanted {
            let Some(info) = catalogue.get(name) else {
                tracing::debug!(counter = %name, "requested counter not reported by appliance");
                continue;
            };
            let mut info = info.clone();
            if let Some(property) = self.core.template.override_for(name).and_then(|o| o.property.as_ref()) {
                tracing::debug!(counter = %name, property = %property, "counter property overridden");
                info.set_child_content("properties", property);
            }
            if *is_label || info.child_content("properties").contains("string") {
                labels.insert(name.clone(), display.clone());
                continue;
            }
            if let Some(base) = counters.add(&info, name, display, true) {
                if !wanted.iter().any(|(w, _, _)| *w == base) && !missing_bases.contains(&base) {
                    missing_bases.push(base);
                }
            }
        }
        for base in &missing_bases {
            match catalogue.get(base) {
                Some(info) => {
                    tracing::debug!(counter = %base, "adding required base counter");
                    counters.add(info, base, base, false);
                }
                None => tracing::warn!(counter = %base, "base counter not reported by appliance"),
            }
        }

        let CounterSet { arrays, updated, .. } = counters;
        let stale: Vec<String> = self
            .core
            .matrix
            .metric_keys()
            .into_iter()
            .filter(|k| k != perf::TIMESTAMP && !updated.contains(k))
            .collect();
        for key in &stale {
            self.core.matrix.remove_metric(key);
            tracing::debug!(metric = %key, "removed metric");
        }
        perf::ensure_timestamp(&mut self.core.matrix);

        self.scalar_counters = updated
            .iter()
            .filter(|k| self.core.matrix.metric(k).is_some_and(|m| !m.is_array()))
            .cloned()
            .collect();
        self.scalar_counters.sort();
        self.arrays = arrays;
        self.instance_labels = labels;

        let stats = self.client.stats().since(&before);
        self.core.metadata.record_stats(Task::Counter, &stats);
        tracing::debug!(
            object = %self.core.template.object,
            metrics = self.core.matrix.metric_count(),
            labels = self.instance_labels.len(),
            removed = stale.len(),
            "counter metadata refreshed"
        );
        if self.core.matrix.metric_count() <= 1 {
            return Err(PollError::NoMetric(format!(
                "none of the requested {} counters exist",
                self.core.template.query
            )));
        }
        Ok(Vec::new())
    }

    pub async fn poll_instance(&mut self) -> Result<Vec<Matrix>> {
        let Self {
            core,
            client,
            batch_size,
            instance_key,
            ..
        } = self;
        let before = client.stats();
        let mut request = Node::new("perf-object-instance-list-info-iter");
        request.new_child("objectname", &core.template.query);
        request.new_child("max-records", &batch_size.to_string());

        let mut seen = HashSet::new();
        let mut added = 0;
        let matrix = &mut core.matrix;
        let field = instance_key.field();
        client
            .invoke_stream(&request, |mut results| {
                let Some(list) = results.pop_child("attributes-list") else {
                    return Ok(());
                };
                for info in &list.children {
                    let key = info.child_content(field);
                    if key.is_empty() {
                        continue;
                    }
                    if !matrix.has_instance(key) {
                        matrix.instance_or_insert(key);
                        added += 1;
                    }
                    seen.insert(key.to_string());
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
        let before = self.client.stats();
        let mut data = perf::fresh_data(&self.core.matrix);
        let keys = data.instance_keys();

        let mut request = Node::new("perf-object-get-instances");
        request.new_child("objectname", &self.core.template.query);
        let list = request.new_child("counters", "");
        let requested = self
            .scalar_counters
            .iter()
            .chain(self.arrays.keys())
            .chain(self.instance_labels.keys());
        for name in requested {
            list.new_child("counter", name);
        }

        let (list_name, item_name) = self.instance_key.request_names();
        let mut count = 0usize;
        for chunk in keys.chunks(self.batch_size.max(1)) {
            let mut batch = request.clone();
            let ids = batch.new_child(list_name, "");
            for key in chunk {
                ids.new_child(item_name, key);
            }

            let response = match self.client.invoke(&batch).await {
                Ok(response) => response,
                Err(e) if is_resource_limit(&e) && self.batch_size > MIN_BATCH_SIZE => {
                    let smaller = self.batch_size - MIN_BATCH_SIZE;
                    tracing::warn!(
                        object = %self.core.template.object,
                        old = self.batch_size,
                        new = smaller,
                        "resource limit exceeded, shrinking batch_size"
                    );
                    self.batch_size = smaller;
                    self.core
                        .metadata
                        .record_stats(Task::Data, &self.client.stats().since(&before));
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            let instances = response.child("instances").map(|n| n.children.as_slice()).unwrap_or_default();
            if instances.is_empty() {
                return Err(PollError::NoInstance(format!(
                    "no {} instance data in response",
                    self.core.template.object
                )));
            }
            let ts = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
            for instance in instances {
                count += self.ingest(&mut data, instance, ts);
            }
        }

        let stats = self.client.stats().since(&before);
        self.core.metadata.record_stats(Task::Data, &stats);
        self.core.metadata.set(Task::Data, "count", count as f64);
        perf::finish_poll(&mut self.core, data, &mut self.cache_ready, self.latency_io_reqd)
    }

    /// Writes one `instance-data` element into `data`.
    fn ingest(&self, data: &mut Matrix, instance: &Node, ts: f64) -> usize {
        let key = instance.child_content(self.instance_key.field());
        if key.is_empty() || !data.has_instance(key) {
            tracing::trace!(key = %key, "instance not in cache, skipped");
            return 0;
        }
        let Some(counters) = instance.child("counters") else {
            return 0;
        };
        let _ = data.set_value_float64(perf::TIMESTAMP, key, ts);

        let mut count = 0;
        for counter in &counters.children {
            let name = counter.child_content("name");
            let value = counter.child_content("value");
            if name.is_empty() || value.is_empty() {
                continue;
            }
            if let Some(label) = self.instance_labels.get(name) {
                if let Some(row) = data.instance_mut(key) {
                    row.set_label(label, value);
                }
                count += 1;
            } else if let Some(metric_keys) = self.arrays.get(name) {
                let values: Vec<&str> = value.split(',').collect();
                if values.len() != metric_keys.len() {
                    tracing::warn!(counter = %name, labels = metric_keys.len(), values = values.len(), "array size mismatch, skipped");
                    continue;
                }
                for (metric, raw) in metric_keys.iter().zip(values) {
                    if let Some(v) = parse_number(raw) {
                        if data.set_value_float64(metric, key, v).is_ok() {
                            count += 1;
                        }
                    }
                }
            } else if let Some(v) = parse_number(value) {
                if data.set_value_float64(name, key, v).is_ok() {
                    count += 1;
                }
            }
        }
        count
    }
}

/// Builds metric definitions from counter descriptions.
struct CounterSet<'a> {
    matrix: &'a mut Matrix,
    arrays: BTreeMap<String, Vec<String>>,
    updated: HashSet<String>,
    catalogue: &'a HashMap<String, Node>,
}

impl CounterSet<'_> {
    /// Adds or refreshes the metrics of one counter. Returns its base
    /// counter, if any.
    fn add(&mut self, info: &Node, name: &str, display: &str, exportable: bool) -> Option<String> {
        let properties = info.child_content("properties");
        let Some(property) = Property::parse(properties) else {
            tracing::warn!(counter = %name, properties = %properties, "unknown counter property, skipped");
            return None;
        };
        let base = info.child_content("base-counter").to_string();
        let unit = info.child_content("unit");

        if info.child_content("type") != "array" {
            let metric = self.matrix.metric_or_insert(name);
            metric.set_name(display);
            metric.set_property(property.as_str());
            metric.set_unit(unit);
            metric.set_base_counter(&base);
            metric.set_exportable(exportable);
            self.updated.insert(name.to_string());
            return Some(base).filter(|b| !b.is_empty());
        }

        let labels = match histogram_labels(info) {
            Ok(labels) => labels,
            Err(reason) => {
                tracing::warn!(counter = %name, reason = %reason, "array counter skipped");
                return None;
            }
        };
        let base_labels = match self.catalogue.get(&base) {
            _ if base.is_empty() => Vec::new(),
            Some(b) if b.child_content("type") == "array" => match histogram_labels(b) {
                Ok(bl) if bl.len() == labels.len() => bl,
                _ => {
                    tracing::warn!(counter = %name, base = %base, "array labels differ from base counter, skipped");
                    return None;
                }
            },
            Some(_) => Vec::new(),
            None => {
                tracing::warn!(counter = %name, base = %base, "base counter not found, skipped");
                return None;
            }
        };

        let mut keys = Vec::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            let key = format!("{name}.{}", label.suffix);
            let base_key = match base_labels.get(i) {
                Some(bl) => format!("{base}.{}", bl.suffix),
                None => base.clone(),
            };
            let metric = self.matrix.metric_or_insert(&key);
            metric.set_name(display);
            metric.set_label("metric", &label.metric);
            if let Some(sub) = &label.submetric {
                metric.set_label("submetric", sub);
            }
            metric.set_array(true);
            metric.set_property(property.as_str());
            metric.set_unit(unit);
            metric.set_base_counter(&base_key);
            metric.set_exportable(exportable);
            self.updated.insert(key.clone());
            keys.push(key);
        }
        self.arrays.insert(name.to_string(), keys);
        Some(base).filter(|b| !b.is_empty())
    }
}

/// Labels of an array counter from its one or two `label-info` elements.
fn histogram_labels(info: &Node) -> std::result::Result<Vec<ArrayLabel>, String> {
    let Some(labels) = info.child("labels") else {
        return Err("array labels missing".to_string());
    };
    let labels = match labels.children.as_slice() {
        [one] => array_labels(&one.content, None),
        [one, two] => array_labels(&one.content, Some(&two.content)),
        other => return Err(format!("unexpected array dimensions: {}", other.len())),
    };
    if labels.is_empty() {
        return Err("array labels empty".to_string());
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Recovery;
    use crate::mock;
    use crate::Collector;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use stormon_api::zapi::{ZAPI_NAMESPACE, ZAPI_SERVLET};
    use stormon_common::tree::load_xml;

    const VOLUME: &str = r#"
name: Volume
query: volume
object: volume
counters:
  - instance_name => volume
  - vserver_name => svm
  - read_ops
  - read_latency
  - read_bytes_hist => read_size
"#;

    fn envelope(results: &str) -> String {
        format!("<?xml version='1.0' encoding='UTF-8' ?><netapp version='1.3' xmlns='{ZAPI_NAMESPACE}'>{results}</netapp>")
    }

    const COUNTERS: &str = "<results status=\"passed\"><counters>\
        <counter-info><name>instance_name</name><properties>string</properties></counter-info>\
        <counter-info><name>vserver_name</name><properties>string,no-display</properties></counter-info>\
        <counter-info><name>read_ops</name><properties>rate</properties><unit>per_sec</unit></counter-info>\
        <counter-info><name>read_latency</name><properties>average</properties><unit>microsec</unit><base-counter>read_ops_total</base-counter></counter-info>\
        <counter-info><name>read_ops_total</name><properties>delta</properties><unit>none</unit></counter-info>\
        <counter-info><name>read_bytes_hist</name><properties>delta</properties><type>array</type><labels><label-info>small,large</label-info></labels></counter-info>\
        </counters></results>";

    fn instance_data(poll: usize) -> String {
        let (latency, total, hist) = if poll == 0 { (1000, 100, "1,2") } else { (5000, 300, "4,7") };
        format!(
            "<results status=\"passed\"><instances><instance-data><name>vol1</name><uuid>u-1</uuid><counters>\
             <counter-data><name>instance_name</name><value>vol1</value></counter-data>\
             <counter-data><name>vserver_name</name><value>svm1</value></counter-data>\
             <counter-data><name>read_ops</name><value>{}</value></counter-data>\
             <counter-data><name>read_latency</name><value>{latency}</value></counter-data>\
             <counter-data><name>read_ops_total</name><value>{total}</value></counter-data>\
             <counter-data><name>read_bytes_hist</name><value>{hist}</value></counter-data>\
             </counters></instance-data></instances></results>",
            poll * 10
        )
    }

    async fn appliance(limit_once: bool) -> std::net::SocketAddr {
        let polls = Arc::new(AtomicUsize::new(0));
        let limited = Arc::new(AtomicUsize::new(usize::from(limit_once)));
        let handler = move |body: String| {
            let polls = polls.clone();
            let limited = limited.clone();
            async move {
                let results = if body.contains("<system-get-version") {
                    "<results status=\"passed\"><version>NetApp Release 9.8.0: Mon</version><is-clustered>true</is-clustered></results>".to_string()
                } else if body.contains("<cluster-identity-get") {
                    "<results status=\"passed\"><attributes><cluster-identity-info><cluster-name>umeng</cluster-name></cluster-identity-info></attributes></results>".to_string()
                } else if body.contains("<perf-object-counter-list-info") {
                    COUNTERS.to_string()
                } else if body.contains("<perf-object-instance-list-info-iter") {
                    "<results status=\"passed\"><attributes-list><instance-info><name>vol1</name><uuid>u-1</uuid></instance-info></attributes-list></results>".to_string()
                } else if limited.swap(0, Ordering::SeqCst) == 1 {
                    "<results status=\"failed\" errno=\"13001\" reason=\"resource limit exceeded\"/>".to_string()
                } else {
                    instance_data(polls.fetch_add(1, Ordering::SeqCst))
                };
                envelope(&results)
            }
        };
        mock::serve(Router::new().route(&format!("/{ZAPI_SERVLET}"), post(handler))).await
    }

    async fn collector(addr: std::net::SocketAddr) -> Collector {
        let template = Template::parse(VOLUME, &CollectorKind::ZapiPerf.parse_options()).unwrap();
        Collector::init(CollectorKind::ZapiPerf, &mock::context(addr), template)
            .await
            .unwrap()
    }

    #[test]
    fn should_read_one_and_two_dimensional_labels() {
        let info = load_xml(b"<counter-info><labels><label-info>a,b</label-info><label-info>x,y,z</label-info></labels></counter-info>").unwrap();
        assert_eq!(histogram_labels(&info).unwrap().len(), 6);
        let info = load_xml(b"<counter-info><name>x</name></counter-info>").unwrap();
        assert!(histogram_labels(&info).is_err());
    }

    #[tokio::test]
    async fn should_cache_first_poll_and_cook_second() {
        let addr = appliance(false).await;
        let mut collector = collector(addr).await;
        collector.poll(Task::Counter).await.unwrap();

        let metrics = collector.core().matrix.metric_keys();
        assert!(metrics.contains(&"read_bytes_hist.large".to_string()));
        let base = collector.core().matrix.metric("read_ops_total").unwrap();
        assert!(!base.is_exportable());

        collector.poll(Task::Instance).await.unwrap();
        assert!(collector.core().matrix.has_instance("u-1"));

        let first = collector.poll(Task::Data).await.unwrap();
        assert!(first.iter().all(|m| m.object != "volume"));

        let out = collector.poll(Task::Data).await.unwrap();
        let m = &out[0];
        assert_eq!(m.object, "volume");
        assert_eq!(m.value_float64("read_latency", "u-1"), Some(20.0));
        assert_eq!(m.value_float64("read_bytes_hist.small", "u-1"), Some(3.0));
        assert_eq!(m.value_float64("read_bytes_hist.large", "u-1"), Some(5.0));
        assert!(m.value_float64("read_ops", "u-1").unwrap() > 0.0);
        let hist = m.metric("read_bytes_hist.large").unwrap();
        assert_eq!(hist.name(), "read_size");
        assert_eq!(hist.labels().get("metric").map(String::as_str), Some("large"));
        let row = m.instance("u-1").unwrap();
        assert_eq!(row.label("volume"), Some("vol1"));
        assert_eq!(row.label("svm"), Some("svm1"));
        assert!(collector.core().metadata.value(Task::Data, "calc_time").is_some());
    }

    #[tokio::test]
    async fn should_shrink_batch_size_on_resource_limit() {
        let addr = appliance(true).await;
        let mut collector = collector(addr).await;
        collector.poll(Task::Counter).await.unwrap();
        collector.poll(Task::Instance).await.unwrap();

        let err = collector.poll(Task::Data).await.unwrap_err();
        assert!(is_resource_limit(&err));
        assert_eq!(err.recovery(), Recovery::Retry);
        assert_eq!(collector.core().metadata.value(Task::Data, "status"), Some(1.0));
        let Collector::LegacyPerf(perf) = &collector else {
            panic!("expected legacy perf collector");
        };
        assert_eq!(perf.batch_size, 400);

        // the appliance accepts the smaller batch
        collector.poll(Task::Data).await.unwrap();
        assert_eq!(collector.core().metadata.value(Task::Data, "status"), Some(0.0));
    }
}
