//! Collectors turn appliance responses into matrices.
//!
//! Every protocol family is one variant of [`Collector`]. The variants share
//! their bookkeeping through [`base::CollectorCore`] and differ only in how
//! they shape requests and parse responses. The scheduler drives them
//! through [`Collector::poll`], one [`Task`] at a time.

pub mod base;
pub mod docs;
pub mod ems;
pub mod error;
pub mod perf;
pub mod rest;
pub mod restperf;
pub mod zapi;
pub mod zapiperf;

#[cfg(test)]
mod mock;

pub use base::{CollectorContext, CollectorCore, Metadata};
pub use ems::EmsCollector;
pub use rest::RestCollector;
pub use restperf::RestPerfCollector;
pub use zapi::ZapiCollector;
pub use zapiperf::ZapiPerfCollector;

use error::{PollError, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use stormon_common::matrix::Matrix;
use stormon_common::template::{ParseOptions, Template};

/// Protocol family of a collector, as named in the poller config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorKind {
    Zapi,
    ZapiPerf,
    Rest,
    RestPerf,
    Ems,
}

impl CollectorKind {
    pub const ALL: [CollectorKind; 5] = [
        CollectorKind::Zapi,
        CollectorKind::ZapiPerf,
        CollectorKind::Rest,
        CollectorKind::RestPerf,
        CollectorKind::Ems,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorKind::Zapi => "Zapi",
            CollectorKind::ZapiPerf => "ZapiPerf",
            CollectorKind::Rest => "Rest",
            CollectorKind::RestPerf => "RestPerf",
            CollectorKind::Ems => "Ems",
        }
    }

    /// Counters the kind cannot export as a single scalar.
    pub fn parse_options(&self) -> ParseOptions {
        let mut options = ParseOptions::default();
        if matches!(self, CollectorKind::RestPerf) {
            // latency histograms are reported per bucket only by the legacy API
            options.exclude.insert("latency_histogram".to_string());
        }
        options
    }

    /// Whether the kind talks to the legacy XML API.
    pub fn is_legacy(&self) -> bool {
        matches!(self, CollectorKind::Zapi | CollectorKind::ZapiPerf)
    }
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectorKind {
    type Err = PollError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CollectorKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PollError::Config(format!("unknown collector kind [{s}]")))
    }
}

/// One of the three polling steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    /// Counter metadata refresh; rare.
    Counter,
    /// Instance set refresh.
    Instance,
    /// Values.
    Data,
}

impl Task {
    pub const ALL: [Task; 3] = [Task::Counter, Task::Instance, Task::Data];

    /// Name used in `schedule` and as the metadata instance key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Counter => "counter",
            Task::Instance => "instance",
            Task::Data => "data",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running collector for one template on one appliance.
///
/// Built with [`Collector::init`], which opens the transport and builds the
/// matrix skeleton. Polls never run concurrently for the same collector.
pub enum Collector {
    LegacyConfig(ZapiCollector),
    LegacyPerf(ZapiPerfCollector),
    RestConfig(RestCollector),
    RestPerf(RestPerfCollector),
    Ems(EmsCollector),
}

impl Collector {
    /// Opens the transport, reads appliance identity, and prepares the
    /// matrices. Template and credential errors surface here.
    pub async fn init(kind: CollectorKind, ctx: &CollectorContext, template: Template) -> Result<Self> {
        let started = Instant::now();
        let collector = match kind {
            CollectorKind::Zapi => Collector::LegacyConfig(ZapiCollector::init(ctx, template).await?),
            CollectorKind::ZapiPerf => Collector::LegacyPerf(ZapiPerfCollector::init(ctx, template).await?),
            CollectorKind::Rest => Collector::RestConfig(RestCollector::init(ctx, template).await?),
            CollectorKind::RestPerf => Collector::RestPerf(RestPerfCollector::init(ctx, template).await?),
            CollectorKind::Ems => Collector::Ems(EmsCollector::init(ctx, template).await?),
        };
        tracing::info!(
            poller = %ctx.poller,
            collector = %kind,
            object = %collector.core().template.object,
            elapsed = ?started.elapsed(),
            "collector initialized"
        );
        Ok(collector)
    }

    pub fn kind(&self) -> CollectorKind {
        match self {
            Collector::LegacyConfig(_) => CollectorKind::Zapi,
            Collector::LegacyPerf(_) => CollectorKind::ZapiPerf,
            Collector::RestConfig(_) => CollectorKind::Rest,
            Collector::RestPerf(_) => CollectorKind::RestPerf,
            Collector::Ems(_) => CollectorKind::Ems,
        }
    }

    pub fn core(&self) -> &CollectorCore {
        match self {
            Collector::LegacyConfig(c) => &c.core,
            Collector::LegacyPerf(c) => &c.core,
            Collector::RestConfig(c) => &c.core,
            Collector::RestPerf(c) => &c.core,
            Collector::Ems(c) => &c.core,
        }
    }

    fn core_mut(&mut self) -> &mut CollectorCore {
        match self {
            Collector::LegacyConfig(c) => &mut c.core,
            Collector::LegacyPerf(c) => &mut c.core,
            Collector::RestConfig(c) => &mut c.core,
            Collector::RestPerf(c) => &mut c.core,
            Collector::Ems(c) => &mut c.core,
        }
    }

    pub async fn poll_counter(&mut self) -> Result<Vec<Matrix>> {
        match self {
            Collector::LegacyPerf(c) => c.poll_counter().await,
            Collector::RestPerf(c) => c.poll_counter().await,
            // config collectors read no counter metadata
            _ => Ok(Vec::new()),
        }
    }

    pub async fn poll_instance(&mut self) -> Result<Vec<Matrix>> {
        match self {
            Collector::LegacyConfig(c) => c.poll_instance().await,
            Collector::LegacyPerf(c) => c.poll_instance().await,
            Collector::RestConfig(c) => c.poll_instance().await,
            Collector::RestPerf(c) => c.poll_instance().await,
            Collector::Ems(c) => c.poll_instance().await,
        }
    }

    pub async fn poll_data(&mut self) -> Result<Vec<Matrix>> {
        match self {
            Collector::LegacyConfig(c) => c.poll_data().await,
            Collector::LegacyPerf(c) => c.poll_data().await,
            Collector::RestConfig(c) => c.poll_data().await,
            Collector::RestPerf(c) => c.poll_data().await,
            Collector::Ems(c) => c.poll_data().await,
        }
    }

    /// Runs one task and records its outcome in the metadata matrix.
    pub async fn poll(&mut self, task: Task) -> Result<Vec<Matrix>> {
        let started = Instant::now();
        let result = match task {
            Task::Counter => self.poll_counter().await,
            Task::Instance => self.poll_instance().await,
            Task::Data => self.poll_data().await,
        };
        let kind = self.kind();
        let core = self.core_mut();
        core.metadata.set(task, "poll_time", started.elapsed().as_micros() as f64);
        match &result {
            Ok(matrices) => {
                core.metadata.record_success(task);
                tracing::debug!(
                    collector = %kind,
                    object = %core.template.object,
                    task = %task,
                    matrices = matrices.len(),
                    elapsed = ?started.elapsed(),
                    "poll finished"
                );
            }
            Err(e) => {
                core.metadata.record_failure(task, e);
                tracing::warn!(
                    collector = %kind,
                    object = %core.template.object,
                    task = %task,
                    status = ?e.status(),
                    elapsed = ?started.elapsed(),
                    error = %e,
                    "poll failed"
                );
            }
        }
        result
    }

    /// Interval for `task`, honoring collector-specific defaults.
    pub fn interval(&self, task: Task) -> std::time::Duration {
        let template = &self.core().template;
        match (self, task) {
            (Collector::Ems(_), Task::Data) => template.interval_or("data", ems::DEFAULT_DATA_INTERVAL),
            _ => template.interval(task.as_str()),
        }
    }

    /// Last published metadata.
    pub fn metadata(&self) -> &Matrix {
        self.core().metadata.matrix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_collector_kinds_case_insensitively() {
        assert_eq!("RestPerf".parse::<CollectorKind>().unwrap(), CollectorKind::RestPerf);
        assert_eq!("zapi".parse::<CollectorKind>().unwrap(), CollectorKind::Zapi);
        assert_eq!("EMS".parse::<CollectorKind>().unwrap(), CollectorKind::Ems);
        assert!(matches!("StatPerf".parse::<CollectorKind>(), Err(PollError::Config(_))));
    }

    #[test]
    fn should_exclude_histograms_for_rest_perf_only() {
        assert!(CollectorKind::RestPerf
            .parse_options()
            .exclude
            .contains("latency_histogram"));
        assert!(CollectorKind::ZapiPerf.parse_options().exclude.is_empty());
    }

    #[test]
    fn should_name_tasks_like_schedule_entries() {
        let names: Vec<&str> = Task::ALL.iter().map(Task::as_str).collect();
        assert_eq!(names, vec!["counter", "instance", "data"]);
    }
}
