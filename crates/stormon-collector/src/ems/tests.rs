use super::*;
use crate::mock;
use crate::Collector;
use axum::extract::RawQuery;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const EMS: &str = r#"
name: EmsEvents
query: api/support/ems/events
object: ems
events:
  - name: LUN.offline
    matches:
      - name: object_type
        value: lun
    exports:
      - ^^node.name => node
      - ^^parameters.object_uuid => object_uuid
      - ^parameters.object_type => object_type
    resolve_when_ems:
      - name: LUN.online
        resolve_after: 672h
        resolve_key:
          - ^^node.name => node
          - ^^parameters.object_uuid => object_uuid
  - name: disk.failed
    exports:
      - ^parameters.disk => disk
    labels:
      team: storage
  - name: fan.missing
"#;

fn lun_event(name: &str, index: u64, node: &str, uuid: &str, kind: &str) -> Value {
    json!({
        "index": index,
        "time": "2024-05-01T09:59:00+00:00",
        "node": {"name": node},
        "message": {"name": name, "severity": "alert"},
        "parameters": [
            {"name": "object_uuid", "value": uuid},
            {"name": "object_type", "value": kind}
        ]
    })
}

fn polls() -> Vec<Vec<Value>> {
    vec![
        vec![
            lun_event("LUN.offline", 10, "nodeA", "lun1", "lun"),
            lun_event("LUN.offline", 11, "nodeB", "lun2", "vol"),
            json!({
                "index": 12,
                "time": "2024-05-01T09:59:30+00:00",
                "node": {"name": "nodeA"},
                "message": {"name": "disk.failed", "severity": "error"},
                "parameters": [{"name": "disk", "value": "1.0.1"}]
            }),
        ],
        vec![lun_event("LUN.online", 20, "nodeA", "lun1", "lun")],
    ]
}

struct Appliance {
    addr: std::net::SocketAddr,
    queries: Arc<Mutex<Vec<String>>>,
}

async fn appliance() -> Appliance {
    let queries = Arc::new(Mutex::new(Vec::new()));
    let seen = queries.clone();
    let count = Arc::new(AtomicUsize::new(0));
    let events = move |RawQuery(query): RawQuery| {
        let seen = seen.clone();
        let count = count.clone();
        async move {
            seen.lock().unwrap().push(decode(&query.unwrap_or_default()));
            let n = count.fetch_add(1, Ordering::SeqCst);
            let records = polls().into_iter().nth(n).unwrap_or_default();
            Json(json!({"records": records, "num_records": records.len()}))
        }
    };
    let router = Router::new()
        .route("/api/cluster", get(|| async { Json(json!({"name": "umeng", "uuid": "abc"})) }))
        .route(
            "/api/support/ems/messages",
            get(|| async {
                Json(json!({"records": [
                    {"name": "LUN.offline"}, {"name": "LUN.online"},
                    {"name": "disk.failed"}, {"name": "other.event"}
                ]}))
            }),
        )
        .route(
            "/api/private/cli/cluster/date",
            get(|| async { Json(json!({"records": [{"date": "2024-05-01T10:00:00+00:00"}]})) }),
        )
        .route("/api/support/ems/events", get(events));
    Appliance {
        addr: mock::serve(router).await,
        queries,
    }
}

fn decode(query: &str) -> String {
    query
        .replace("%3E", ">")
        .replace("%3C", "<")
        .replace("%20", " ")
        .replace("%7C", "|")
}

fn find<'a>(out: &'a [Matrix], uuid: &str) -> Option<&'a Matrix> {
    out.iter().find(|m| m.uuid == uuid)
}

async fn collector(addr: std::net::SocketAddr, text: &str) -> Result<Collector> {
    let template = Template::parse(text, &CollectorKind::Ems.parse_options())?;
    Collector::init(CollectorKind::Ems, &mock::context(addr), template).await
}

#[test]
fn should_parse_bookend_event_definitions() {
    let template = Template::parse(EMS, &CollectorKind::Ems.parse_options()).unwrap();
    let events = template.root().child("events").unwrap();
    let lun = EventDef::parse(&events.children[0]).unwrap();
    assert_eq!(lun.name, "LUN.offline");
    let keys: Vec<&str> = lun.keys.iter().map(|k| k.path.as_str()).collect();
    assert_eq!(keys, ["node.name", "parameters.object_uuid"]);
    assert_eq!(lun.matches, vec![("object_type".to_string(), "lun".to_string())]);
    let resolve = lun.resolve.unwrap();
    assert_eq!(resolve.name, "LUN.online");
    assert_eq!(resolve.resolve_after, Duration::from_secs(672 * 3600));
    assert_eq!(resolve.resolve_key.len(), 2);

    let disk = EventDef::parse(&events.children[1]).unwrap();
    let keys: Vec<&str> = disk.keys.iter().map(|k| k.path.as_str()).collect();
    assert_eq!(keys, ["index", "message.name"]);
    assert_eq!(disk.static_labels.get("team").map(String::as_str), Some("storage"));
    assert!(disk.labels.iter().any(|l| l.display == "message"));
    assert!(disk.resolve.is_none());
}

#[test]
fn should_read_parameters_and_nested_fields() {
    let record = lun_event("LUN.offline", 1, "nodeA", "lun1", "lun");
    assert_eq!(lookup(&record, "parameters.object_uuid").as_deref(), Some("lun1"));
    assert_eq!(lookup(&record, "message.severity").as_deref(), Some("alert"));
    assert_eq!(lookup(&record, "index").as_deref(), Some("1"));
    assert_eq!(lookup(&record, "parameters.missing"), None);
}

#[tokio::test]
async fn should_issue_then_resolve_lun_offline() {
    let appliance = appliance().await;
    let mut collector = collector(appliance.addr, EMS).await.unwrap();

    collector.poll(Task::Instance).await.unwrap();
    let Collector::Ems(ems) = &collector else {
        panic!("wrong variant");
    };
    assert_eq!(ems.event_names(), ["LUN.offline", "LUN.online", "disk.failed"]);

    let out = collector.poll(Task::Data).await.unwrap();
    let lun = find(&out, "LUN.offline").unwrap();
    assert_eq!(lun.instance_count(), 1);
    assert_eq!(lun.value_float64(bookend::EVENTS, "-nodeA-lun1"), Some(1.0));
    let row = lun.instance("-nodeA-lun1").unwrap();
    assert_eq!(row.label("object_type"), Some("lun"));
    assert_eq!(row.label("severity"), Some("alert"));
    assert_eq!(lun.global_labels().get("cluster").map(String::as_str), Some("umeng"));

    let disk = find(&out, "disk.failed").unwrap();
    let row = disk.instance("-12-disk.failed").unwrap();
    assert_eq!(row.label("disk"), Some("1.0.1"));
    assert_eq!(row.label("team"), Some("storage"));
    assert_eq!(row.label("node"), Some("nodeA"));
    assert_eq!(out.last().unwrap().object, "metadata_collector");
    // events and timestamp of LUN.offline and disk.failed
    assert_eq!(collector.core().metadata.value(Task::Data, "metrics"), Some(4.0));

    let out = collector.poll(Task::Data).await.unwrap();
    let lun = find(&out, "LUN.offline").unwrap();
    assert_eq!(lun.value_float64(bookend::EVENTS, "-nodeA-lun1"), Some(0.0));
    assert!(find(&out, "disk.failed").is_none());

    let queries = appliance.queries.lock().unwrap();
    assert_eq!(queries.len(), 2);
    assert!(queries[0].contains("message.severity=alert|emergency|error|informational|notice"));
    assert!(queries[0].contains("time=>=2024-05-01T09:57:00Z"));
    assert!(queries[0].contains("message.name=LUN.offline,LUN.online,disk.failed"));
    assert!(queries[0].contains("order_by=index desc"));
    assert!(queries[1].contains("time=>=2024-05-01T10:00:00Z"));
}

#[tokio::test]
async fn should_reject_url_size_too_small_for_one_event() {
    let appliance = appliance().await;
    let text = EMS.replace("object: ems", "object: ems\nmax_url_size: 100");
    let err = collector(appliance.addr, &text).await.err().unwrap();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("max_url_size=100 is too small"));
}

#[tokio::test]
async fn should_require_events() {
    let appliance = appliance().await;
    let text = "name: EmsEvents\nquery: api/support/ems/events\nobject: ems\n";
    let err = collector(appliance.addr, text).await.err().unwrap();
    assert!(matches!(err, PollError::MissingParam(_)));
}

#[tokio::test]
async fn should_record_resolving_event_that_is_also_configured() {
    let appliance = appliance().await;
    let text = EMS.replace(
        "  - name: fan.missing\n",
        "  - name: fan.missing\n  - name: LUN.online\n    exports:\n      - ^^node.name => node\n",
    );
    let mut collector = collector(appliance.addr, &text).await.unwrap();

    collector.poll(Task::Instance).await.unwrap();
    collector.poll(Task::Data).await.unwrap();
    let out = collector.poll(Task::Data).await.unwrap();

    let lun = find(&out, "LUN.offline").unwrap();
    assert_eq!(lun.value_float64(bookend::EVENTS, "-nodeA-lun1"), Some(0.0));
    let online = find(&out, "LUN.online").unwrap();
    assert_eq!(online.value_float64(bookend::EVENTS, "-nodeA"), Some(1.0));
    assert_eq!(online.instance("-nodeA").unwrap().label("node"), Some("nodeA"));
}
