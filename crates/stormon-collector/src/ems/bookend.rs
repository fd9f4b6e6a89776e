//! Pairing of issuing and resolving events.
//!
//! Every issuing event that names a `resolve_when_ems` partner keeps its
//! own matrix across polls. An issuing record sets `events` to 1 on the
//! row for its bookend key; a resolving record sets `events` to 0 on every
//! row of its issuing events whose key ends with the resolving key. Rows
//! older than the issuing event's `resolve_after` are evicted.

use crate::base::instance_key;
use std::collections::BTreeMap;
use std::time::Duration;
use stormon_common::matrix::Matrix;
use stormon_common::template::Counter;

pub const EVENTS: &str = "events";
/// Sample time of the last issuing record, in microseconds.
pub const TIMESTAMP: &str = "timestamp";

/// Default lifetime of an unresolved issuing event (28 days).
pub const DEFAULT_RESOLVE_AFTER: Duration = Duration::from_secs(672 * 3600);

/// Above this many cached rows the engine warns once per check.
pub const ACTIVE_WARN_LIMIT: usize = 1000;

/// How a resolving event finds its issuing rows.
#[derive(Debug, Clone)]
pub struct Resolver {
    pub issuing: String,
    /// Fields of the resolving record that form the bookend key.
    pub keys: Vec<Counter>,
}

#[derive(Debug, Clone)]
struct Issuing {
    resolve_after: Duration,
    matrix: Option<Matrix>,
}

#[derive(Debug, Clone)]
pub struct BookendEngine {
    object: String,
    global_labels: BTreeMap<String, String>,
    issuing: BTreeMap<String, Issuing>,
    /// Resolving event name to the issuing events it closes.
    resolvers: BTreeMap<String, Vec<Resolver>>,
}

impl BookendEngine {
    pub fn new(object: &str, global_labels: BTreeMap<String, String>) -> Self {
        Self {
            object: object.to_string(),
            global_labels,
            issuing: BTreeMap::new(),
            resolvers: BTreeMap::new(),
        }
    }

    /// Declares that `resolving` closes `issuing`, matching on `keys`
    /// read from the resolving record.
    pub fn register(&mut self, issuing: &str, resolving: &str, resolve_after: Duration, keys: Vec<Counter>) {
        self.issuing.insert(
            issuing.to_string(),
            Issuing {
                resolve_after,
                matrix: None,
            },
        );
        self.resolvers.entry(resolving.to_string()).or_default().push(Resolver {
            issuing: issuing.to_string(),
            keys,
        });
    }

    pub fn is_issuing(&self, name: &str) -> bool {
        self.issuing.contains_key(name)
    }

    pub fn is_resolving(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    /// Names of every resolving event.
    pub fn resolving_names(&self) -> impl Iterator<Item = &String> {
        self.resolvers.keys()
    }

    /// Marks the row `key` of `event` active. Returns false when `event`
    /// is not a registered issuing event.
    pub fn issue(&mut self, event: &str, key: &str, labels: BTreeMap<String, String>, now_us: i64) -> bool {
        let Some(issuing) = self.issuing.get_mut(event) else {
            return false;
        };
        let object = &self.object;
        let global_labels = &self.global_labels;
        let matrix = issuing.matrix.get_or_insert_with(|| {
            let mut m = Matrix::new(event, object, event);
            m.set_global_labels(global_labels);
            m.metric_or_insert(EVENTS);
            m.metric_or_insert(TIMESTAMP);
            m
        });
        let row = matrix.instance_or_insert(key);
        row.set_labels(labels);
        row.set_exportable(true);
        let _ = matrix.set_value_float64(EVENTS, key, 1.0);
        let _ = matrix.set_value_float64(TIMESTAMP, key, now_us as f64);
        true
    }

    /// Closes the issuing rows matching a `resolving` record. `lookup`
    /// reads fields of that record. Returns how many rows were resolved.
    pub fn resolve<F>(&mut self, resolving: &str, mut lookup: F) -> usize
    where
        F: FnMut(&Counter) -> Option<String>,
    {
        let Some(resolvers) = self.resolvers.get(resolving) else {
            return 0;
        };
        let mut resolved = 0;
        for resolver in resolvers {
            let Some(key) = instance_key(&resolver.keys, &mut lookup) else {
                tracing::warn!(event = %resolving, issuing = %resolver.issuing, "resolving record without bookend key");
                continue;
            };
            let Some(matrix) = self
                .issuing
                .get_mut(&resolver.issuing)
                .and_then(|i| i.matrix.as_mut())
            else {
                continue;
            };
            for row in matrix.instances_by_suffix(&key) {
                let _ = matrix.set_value_float64(EVENTS, &row, 0.0);
                let _ = matrix.set_instance_exportable(&row, true);
                tracing::debug!(issuing = %resolver.issuing, resolving = %resolving, key = %row, "event resolved");
                resolved += 1;
            }
        }
        if resolved == 0 {
            tracing::warn!(event = %resolving, "resolving event matched no active issuing event");
        }
        resolved
    }

    /// Drops rows whose last issuing record is older than the event's
    /// `resolve_after`, and matrices left empty. Returns the rows removed.
    pub fn evict(&mut self, now_us: i64) -> usize {
        let mut removed = 0;
        for (name, issuing) in &mut self.issuing {
            let Some(matrix) = issuing.matrix.as_mut() else {
                continue;
            };
            let limit = issuing.resolve_after.as_micros() as f64;
            let expired: Vec<String> = matrix
                .instance_keys()
                .into_iter()
                .filter(|key| {
                    matrix
                        .value_float64(TIMESTAMP, key)
                        .map_or(true, |ts| now_us as f64 - ts > limit)
                })
                .collect();
            for key in &expired {
                matrix.remove_instance(key);
                tracing::debug!(event = %name, key = %key, "evicted issuing event");
            }
            removed += expired.len();
            if matrix.instance_count() == 0 {
                issuing.matrix = None;
            }
        }
        let active = self.active_count();
        if active > ACTIVE_WARN_LIMIT {
            tracing::warn!(active, limit = ACTIVE_WARN_LIMIT, "large number of cached issuing events");
        }
        removed
    }

    /// Rows cached across every issuing event, resolved or not.
    pub fn active_count(&self) -> usize {
        self.issuing
            .values()
            .filter_map(|i| i.matrix.as_ref())
            .map(Matrix::instance_count)
            .sum()
    }

    pub fn matrix(&self, event: &str) -> Option<&Matrix> {
        self.issuing.get(event).and_then(|i| i.matrix.as_ref())
    }

    /// Matrices of issuing events with cached rows.
    pub fn matrices(&self) -> impl Iterator<Item = (&String, &Matrix)> {
        self.issuing
            .iter()
            .filter_map(|(name, i)| i.matrix.as_ref().map(|m| (name, m)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stormon_common::template::parse_counter;

    const HOUR_US: i64 = 3_600_000_000;

    fn keys(raw: &[&str]) -> Vec<Counter> {
        raw.iter().map(|r| parse_counter(r, "")).collect()
    }

    fn record<'a>(fields: &'a [(&'a str, &'a str)]) -> impl FnMut(&Counter) -> Option<String> + 'a {
        move |c| {
            fields
                .iter()
                .find(|(k, _)| *k == c.path)
                .map(|(_, v)| v.to_string())
        }
    }

    fn engine() -> BookendEngine {
        let mut labels = BTreeMap::new();
        labels.insert("cluster".to_string(), "c1".to_string());
        BookendEngine::new("ems", labels)
    }

    #[test]
    fn should_resolve_one_to_one_and_evict_after_deadline() {
        let mut engine = engine();
        engine.register(
            "LUN.offline",
            "LUN.online",
            Duration::from_secs(3600),
            keys(&["^^node.name => node", "^^parameters.object_uuid => uuid"]),
        );

        assert!(engine.issue("LUN.offline", "-nodeA-lun1", BTreeMap::new(), 0));
        let m = engine.matrix("LUN.offline").unwrap();
        assert_eq!(m.value_float64(EVENTS, "-nodeA-lun1"), Some(1.0));
        assert_eq!(m.global_labels().get("cluster").map(String::as_str), Some("c1"));

        let resolved = engine.resolve(
            "LUN.online",
            record(&[("node.name", "nodeA"), ("parameters.object_uuid", "lun1")]),
        );
        assert_eq!(resolved, 1);
        let m = engine.matrix("LUN.offline").unwrap();
        assert_eq!(m.value_float64(EVENTS, "-nodeA-lun1"), Some(0.0));

        assert_eq!(engine.evict(HOUR_US / 2), 0);
        assert_eq!(engine.evict(2 * HOUR_US), 1);
        assert!(engine.matrix("LUN.offline").is_none());
        assert_eq!(engine.active_count(), 0);
    }

    #[test]
    fn should_resolve_every_issuing_event_sharing_a_resolver() {
        let mut engine = engine();
        for issuing in ["monitor.fan.critical", "monitor.fan.failed", "monitor.fan.warning"] {
            engine.register(issuing, "monitor.fan.ok", DEFAULT_RESOLVE_AFTER, keys(&["^^parameters.fan => fan"]));
            engine.issue(issuing, "-node1-fan3", BTreeMap::new(), 10);
        }
        engine.issue("monitor.fan.failed", "-node1-fan4", BTreeMap::new(), 10);

        let resolved = engine.resolve("monitor.fan.ok", record(&[("parameters.fan", "fan3")]));

        assert_eq!(resolved, 3);
        for issuing in ["monitor.fan.critical", "monitor.fan.failed", "monitor.fan.warning"] {
            assert_eq!(engine.matrix(issuing).unwrap().value_float64(EVENTS, "-node1-fan3"), Some(0.0));
        }
        let failed = engine.matrix("monitor.fan.failed").unwrap();
        assert_eq!(failed.value_float64(EVENTS, "-node1-fan4"), Some(1.0));
        assert_eq!(engine.active_count(), 4);
    }

    #[test]
    fn should_keep_one_row_per_bookend_key() {
        let mut engine = engine();
        engine.register("LUN.offline", "LUN.online", DEFAULT_RESOLVE_AFTER, keys(&["^^node.name"]));
        engine.issue("LUN.offline", "-nodeA", BTreeMap::new(), 1);
        engine.resolve("LUN.online", record(&[("node.name", "nodeA")]));
        engine.issue("LUN.offline", "-nodeA", BTreeMap::new(), 2);

        let m = engine.matrix("LUN.offline").unwrap();
        assert_eq!(m.instance_count(), 1);
        assert_eq!(m.value_float64(EVENTS, "-nodeA"), Some(1.0));
        assert_eq!(m.value_float64(TIMESTAMP, "-nodeA"), Some(2.0));
    }

    #[test]
    fn should_ignore_unregistered_events_and_missing_keys() {
        let mut engine = engine();
        engine.register("LUN.offline", "LUN.online", DEFAULT_RESOLVE_AFTER, keys(&["^^node.name"]));
        assert!(!engine.issue("disk.failed", "-x", BTreeMap::new(), 0));
        assert_eq!(engine.resolve("LUN.online", record(&[])), 0);
        assert_eq!(engine.resolve("disk.ok", record(&[("node.name", "a")])), 0);
        assert!(engine.is_resolving("LUN.online"));
        assert!(engine.is_issuing("LUN.offline"));
    }
}
