//! Configuration collector for the legacy XML API.
//!
//! One iterator call per data poll. Records are matched against the
//! template's counter paths; `^^` paths form the instance key, `^` paths
//! become labels, everything else is a metric.

use crate::base::{add_template_metrics, instance_key, parse_number, remove_unseen, CollectorContext, CollectorCore};
use crate::error::{PollError, Result};
use crate::{CollectorKind, Task};
use std::collections::{BTreeMap, HashMap, HashSet};
use stormon_api::zapi::ZapiClient;
use stormon_common::matrix::Matrix;
use stormon_common::template::{Counter, Template};
use stormon_common::tree::Node;

/// Default `max-records` per page.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Key of the single row kept when `only_cluster_instance` is set.
const CLUSTER_INSTANCE: &str = "cluster";

pub struct ZapiCollector {
    pub(crate) core: CollectorCore,
    client: ZapiClient,
    request: Node,
    /// Counter path to label name, for keys and labels.
    label_paths: HashMap<String, String>,
    only_cluster_instance: bool,
}

impl ZapiCollector {
    pub async fn init(ctx: &CollectorContext, template: Template) -> Result<Self> {
        let mut core = CollectorCore::new(CollectorKind::Zapi, ctx, template)?;
        let only_cluster_instance = core.template.param("only_cluster_instance") == "true";
        if !only_cluster_instance {
            core.require_keys()?;
        }

        let mut client =
            ZapiClient::with_timeout(&ctx.connection, ctx.credentials.clone(), ctx.timeout(&core.template)).await?;
        client.init().await?;
        core.set_cluster(&client.system().name);

        let counters = core.template.counters.clone();
        add_template_metrics(&mut core.matrix, &core.template, &counters);

        let label_paths = counters
            .iter()
            .filter(|c| !c.is_metric())
            .map(|c| (c.path.clone(), c.display.clone()))
            .collect();

        let batch_size = core.template.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        let mut request = Node::new(&core.template.query);
        if client.system().clustered {
            if core.template.param("no_desired_attributes") != "true" {
                request.add_child(desired_attributes(&counters));
            }
            request.new_child("max-records", &batch_size.to_string());
        }

        tracing::debug!(
            object = %core.template.object,
            query = %core.template.query,
            counters = counters.len(),
            "legacy collector ready"
        );
        Ok(Self {
            core,
            client,
            request,
            label_paths,
            only_cluster_instance,
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
            request,
            label_paths,
            only_cluster_instance,
        } = self;
        let before = client.stats();
        // built aside so a failed poll leaves the last good matrix in place
        let mut fresh = core.matrix.clone();
        fresh.reset();

        let keys: Vec<Counter> = core.template.keys().cloned().collect();
        let mut seen = HashSet::new();
        let mut count = 0usize;
        let matrix = &mut fresh;

        let streamed = client
            .invoke_stream(request, |mut results| {
                let Some(list) = results.pop_child("attributes-list") else {
                    return Ok(());
                };
                for record in &list.children {
                    let key = if *only_cluster_instance {
                        CLUSTER_INSTANCE.to_string()
                    } else {
                        match instance_key(&keys, |c| record_value(record, &c.path)) {
                            Some(key) => key,
                            None => {
                                tracing::debug!(record = %record.name, "record without instance key, skipped");
                                continue;
                            }
                        }
                    };
                    let instance = matrix.instance_or_insert(&key);
                    instance.set_exportable(true);
                    // fields may disappear between polls
                    instance.set_labels(BTreeMap::new());
                    count += ingest_record(matrix, &key, record, label_paths);
                    seen.insert(key);
                    if *only_cluster_instance {
                        break;
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = streamed {
            core.metadata.record_stats(Task::Data, &client.stats().since(&before));
            return Err(e);
        }

        let removed = remove_unseen(&mut fresh, &seen);
        core.matrix = fresh;
        let stats = client.stats().since(&before);
        core.metadata.record_stats(Task::Data, &stats);
        core.metadata.set(Task::Data, "count", count as f64);
        tracing::debug!(
            object = %core.template.object,
            instances = core.matrix.instance_count(),
            removed,
            calls = stats.num_calls,
            "legacy data poll"
        );

        if core.matrix.instance_count() == 0 {
            return Err(PollError::NoInstance(format!(
                "no {} instances on cluster",
                core.template.object
            )));
        }
        let data = core.matrix.clone();
        Ok(core.publish(data))
    }
}

/// Nested `desired-attributes` element requesting every counter path.
fn desired_attributes(counters: &[Counter]) -> Node {
    let mut root = Node::new("desired-attributes");
    for counter in counters {
        let mut node = &mut root;
        for part in counter.path.split('.') {
            let position = node.children.iter().position(|c| c.name == part);
            node = match position {
                Some(i) => &mut node.children[i],
                None => node.new_child(part, ""),
            };
        }
    }
    root
}

/// Content at a counter path. Paths usually start with the record element
/// name itself, which is skipped.
fn record_value(record: &Node, path: &str) -> Option<String> {
    let rest = match path.split_once('.') {
        Some((head, rest)) if head == record.name => rest,
        _ if path == record.name => return Some(record.content.clone()).filter(|s| !s.is_empty()),
        _ => path,
    };
    let node = record.path(rest)?;
    let value = if node.children.is_empty() {
        node.content.clone()
    } else {
        join_list(node)
    };
    Some(value).filter(|s| !s.is_empty())
}

/// Sorted comma list of a list element's item contents.
fn join_list(node: &Node) -> String {
    let mut items: Vec<&str> = node
        .children
        .iter()
        .map(|c| c.content.as_str())
        .filter(|s| !s.is_empty())
        .collect();
    items.sort_unstable();
    items.join(",")
}

/// Writes labels and metric values of one record into row `key`. Returns
/// how many values were stored.
fn ingest_record(matrix: &mut Matrix, key: &str, record: &Node, label_paths: &HashMap<String, String>) -> usize {
    let mut stored = 0;
    let mut leaves = Vec::new();
    collect_leaves(record, "", &mut leaves);
    for (path, value) in leaves {
        if let Some(label) = label_paths.get(&path) {
            if let Some(instance) = matrix.instance_mut(key) {
                let joined = match instance.label(label) {
                    Some(previous) if !previous.is_empty() => {
                        let mut items: Vec<&str> = previous.split(',').chain([value.as_str()]).collect();
                        items.sort_unstable();
                        items.join(",")
                    }
                    _ => value.clone(),
                };
                instance.set_label(label, &joined);
                stored += 1;
            }
        } else if matrix.has_metric(&path) {
            match parse_number(&value) {
                Some(v) if matrix.set_value_float64(&path, key, v).is_ok() => stored += 1,
                _ => tracing::debug!(key = %key, counter = %path, value = %value, "unparsable metric value"),
            }
        }
    }
    stored
}

/// `(path, content)` for every non-empty leaf, paths including `node`'s
/// own name.
fn collect_leaves(node: &Node, prefix: &str, out: &mut Vec<(String, String)>) {
    let path = if prefix.is_empty() {
        node.name.clone()
    } else {
        format!("{prefix}.{}", node.name)
    };
    if node.children.is_empty() {
        if !node.content.is_empty() {
            out.push((path, node.content.clone()));
        }
        return;
    }
    for child in &node.children {
        collect_leaves(child, &path, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;
    use crate::Collector;
    use axum::routing::post;
    use axum::Router;
    use std::sync::{Arc, Mutex};
    use stormon_api::zapi::{ZAPI_NAMESPACE, ZAPI_SERVLET};
    use stormon_common::template::ParseOptions;
    use stormon_common::tree::load_xml;

    const VOLUME: &str = r#"
name: Volume
query: volume-get-iter
object: volume
counters:
  volume-attributes:
    - volume-id-attributes:
      - ^^instance-name => volume
      - ^owning-vserver-name => svm
    - volume-space-attributes:
      - size-used => size_used
"#;

    fn envelope(results: &str) -> String {
        format!("<?xml version='1.0' encoding='UTF-8' ?><netapp version='1.3' xmlns='{ZAPI_NAMESPACE}'>{results}</netapp>")
    }

    fn volume(name: &str, svm: &str, used: u64) -> String {
        format!(
            "<volume-attributes><volume-id-attributes><instance-name>{name}</instance-name>\
             <owning-vserver-name>{svm}</owning-vserver-name></volume-id-attributes>\
             <volume-space-attributes><size-used>{used}</size-used></volume-space-attributes></volume-attributes>"
        )
    }

    async fn appliance(volumes: Arc<Mutex<Vec<String>>>, bodies: Arc<Mutex<Vec<String>>>) -> std::net::SocketAddr {
        let handler = move |body: String| {
            let volumes = volumes.clone();
            let bodies = bodies.clone();
            async move {
                bodies.lock().unwrap().push(body.clone());
                if body.contains("<system-get-version") {
                    envelope(
                        "<results status=\"passed\"><version>NetApp Release 9.8.0: Mon</version>\
                         <is-clustered>true</is-clustered></results>",
                    )
                } else if body.contains("<cluster-identity-get") {
                    envelope(
                        "<results status=\"passed\"><attributes><cluster-identity-info>\
                         <cluster-name>umeng</cluster-name><cluster-uuid>abc</cluster-uuid>\
                         </cluster-identity-info></attributes></results>",
                    )
                } else {
                    let records: String = volumes.lock().unwrap().concat();
                    envelope(&format!(
                        "<results status=\"passed\"><attributes-list>{records}</attributes-list></results>"
                    ))
                }
            }
        };
        let router = Router::new().route(&format!("/{ZAPI_SERVLET}"), post(handler));
        mock::serve(router).await
    }

    fn template() -> Template {
        Template::parse(VOLUME, &CollectorKind::Zapi.parse_options()).unwrap()
    }

    #[test]
    fn should_request_nested_desired_attributes() {
        let desired = desired_attributes(&template().counters);
        let id = desired.path("volume-attributes.volume-id-attributes").unwrap();
        assert_eq!(id.all_child_names(), vec!["instance-name", "owning-vserver-name"]);
        assert!(desired.path("volume-attributes.volume-space-attributes.size-used").is_some());
        assert_eq!(desired.children.len(), 1);
    }

    #[test]
    fn should_read_values_with_or_without_record_prefix() {
        let record = load_xml(
            b"<volume-attributes><volume-id-attributes><name>v1</name></volume-id-attributes>\
              <tags><tag>b</tag><tag>a</tag></tags></volume-attributes>",
        )
        .unwrap();
        assert_eq!(record_value(&record, "volume-attributes.volume-id-attributes.name").as_deref(), Some("v1"));
        assert_eq!(record_value(&record, "volume-id-attributes.name").as_deref(), Some("v1"));
        assert_eq!(record_value(&record, "volume-attributes.tags").as_deref(), Some("a,b"));
        assert_eq!(record_value(&record, "volume-attributes.missing"), None);
    }

    #[tokio::test]
    async fn should_poll_legacy_volumes_into_keyed_rows() {
        let volumes = Arc::new(Mutex::new(vec![volume("a", "s1", 100), volume("b", "s1", 200)]));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let addr = appliance(volumes.clone(), bodies.clone()).await;

        let mut collector = Collector::init(CollectorKind::Zapi, &mock::context(addr), template())
            .await
            .unwrap();
        let out = collector.poll(Task::Data).await.unwrap();

        let m = &out[0];
        assert_eq!(m.object, "volume");
        assert_eq!(m.instance_keys(), vec!["-a", "-b"]);
        let key = "volume-attributes.volume-space-attributes.size-used";
        assert_eq!(m.value_float64(key, "-a"), Some(100.0));
        assert_eq!(m.value_float64(key, "-b"), Some(200.0));
        assert_eq!(m.metric(key).unwrap().name(), "size_used");
        assert_eq!(m.instance("-a").unwrap().label("svm"), Some("s1"));
        assert_eq!(m.instance("-b").unwrap().label("volume"), Some("b"));
        assert_eq!(m.global_labels().get("cluster").map(String::as_str), Some("umeng"));

        let request = bodies.lock().unwrap().last().cloned().unwrap();
        assert!(request.contains("<desired-attributes>"));
        assert!(request.contains("<max-records>500</max-records>"));
        assert_eq!(collector.core().metadata.value(Task::Data, "status"), Some(0.0));
    }

    #[tokio::test]
    async fn should_drop_vanished_instances_and_report_empty_polls() {
        let volumes = Arc::new(Mutex::new(vec![volume("a", "s1", 100), volume("b", "s1", 200)]));
        let addr = appliance(volumes.clone(), Arc::new(Mutex::new(Vec::new()))).await;
        let mut collector = Collector::init(CollectorKind::Zapi, &mock::context(addr), template())
            .await
            .unwrap();
        collector.poll(Task::Data).await.unwrap();

        volumes.lock().unwrap().remove(0);
        let out = collector.poll(Task::Data).await.unwrap();
        assert_eq!(out[0].instance_keys(), vec!["-b"]);

        volumes.lock().unwrap().clear();
        let err = collector.poll(Task::Data).await.unwrap_err();
        assert!(matches!(err, PollError::NoInstance(_)));
        assert_eq!(collector.core().metadata.value(Task::Data, "status"), Some(1.0));
    }

    #[tokio::test]
    async fn should_keep_last_matrix_when_poll_fails() {
        let volumes = Arc::new(Mutex::new(vec![volume("a", "s1", 100), volume("b", "s1", 200)]));
        let addr = appliance(volumes.clone(), Arc::new(Mutex::new(Vec::new()))).await;
        let mut collector = Collector::init(CollectorKind::Zapi, &mock::context(addr), template())
            .await
            .unwrap();
        collector.poll(Task::Data).await.unwrap();

        volumes.lock().unwrap().push("<volume-attributes><unclosed>".to_string());
        let err = collector.poll(Task::Data).await.unwrap_err();
        assert!(matches!(err, PollError::Parse(_)));

        let m = &collector.core().matrix;
        let key = "volume-attributes.volume-space-attributes.size-used";
        assert_eq!(m.instance_keys(), vec!["-a", "-b"]);
        assert_eq!(m.value_float64(key, "-a"), Some(100.0));
        assert_eq!(m.value_float64(key, "-b"), Some(200.0));
    }
}
