//! Drives one collector: counter, instance and data polls on their own
//! intervals, until shutdown or a fatal error.

use crate::exporter::Exporter;
use std::sync::Arc;
use std::time::Duration;
use stormon_collector::error::{PollError, Recovery};
use stormon_collector::{Collector, CollectorContext, CollectorKind, Task};
use stormon_common::matrix::Matrix;
use stormon_common::template::Template;
use tokio::sync::watch;
use tokio::time::Instant;

/// Wait between failed, retryable init attempts.
pub const INIT_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    task: Task,
    interval: Duration,
    next: Instant,
}

/// When each task of a collector is due next.
#[derive(Debug)]
pub struct Schedule {
    entries: Vec<Entry>,
    instances_ready: bool,
}

impl Schedule {
    /// Every task is due at `now`. Entries keep [`Task::ALL`] order.
    pub fn new(intervals: &[(Task, Duration)], now: Instant) -> Self {
        let mut entries: Vec<Entry> = intervals
            .iter()
            .map(|&(task, interval)| Entry {
                task,
                interval,
                next: now,
            })
            .collect();
        entries.sort_by_key(|e| Task::ALL.iter().position(|t| *t == e.task));
        Self {
            entries,
            instances_ready: false,
        }
    }

    pub fn for_collector(collector: &Collector, now: Instant) -> Self {
        let intervals: Vec<(Task, Duration)> = Task::ALL.iter().map(|&t| (t, collector.interval(t))).collect();
        Self::new(&intervals, now)
    }

    fn eligible(&self) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(|e| e.task != Task::Data || self.instances_ready)
    }

    /// Tasks due at `now`, in run order. Data waits for the first
    /// successful instance poll.
    pub fn due(&self, now: Instant) -> Vec<Task> {
        self.eligible().filter(|e| e.next <= now).map(|e| e.task).collect()
    }

    /// Records that `task` ran at `now`.
    pub fn done(&mut self, task: Task, now: Instant, ok: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.task == task) {
            entry.next = now + entry.interval;
        }
        if task == Task::Instance && ok {
            self.instances_ready = true;
        }
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        self.eligible().map(|e| e.next).min()
    }
}

/// Why a collector task ended.
#[derive(Debug)]
pub enum Stopped {
    Shutdown,
    Fatal(PollError),
}

/// Builds the collector, then polls until `shutdown` flips or a poll
/// fails fatally. A poll in flight always completes first.
pub async fn run(
    kind: CollectorKind,
    ctx: CollectorContext,
    template: Template,
    exporter: Arc<dyn Exporter>,
    mut shutdown: watch::Receiver<bool>,
) -> Stopped {
    let mut collector = loop {
        match Collector::init(kind, &ctx, template.clone()).await {
            Ok(c) => break c,
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "collector init failed, giving up");
                return Stopped::Fatal(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, retry_in = ?INIT_RETRY, "collector init failed");
                tokio::select! {
                    _ = tokio::time::sleep(INIT_RETRY) => {}
                    _ = shutdown.changed() => return Stopped::Shutdown,
                }
            }
        }
    };

    let mut schedule = Schedule::for_collector(&collector, Instant::now());
    // data matrices of the last successful data poll, without metadata
    let mut last: Vec<Matrix> = Vec::new();
    loop {
        if *shutdown.borrow() {
            return Stopped::Shutdown;
        }
        for task in schedule.due(Instant::now()) {
            let result = collector.poll(task).await;
            schedule.done(task, Instant::now(), result.is_ok());
            match result {
                Ok(matrices) => {
                    if task == Task::Data {
                        let metadata = &collector.metadata().uuid;
                        last = matrices.iter().filter(|m| &m.uuid != metadata).cloned().collect();
                    }
                    export(exporter.as_ref(), &matrices).await;
                }
                Err(e) => match e.recovery() {
                    Recovery::Fatal => {
                        tracing::error!(task = %task, error = %e, "collector stopped");
                        return Stopped::Fatal(e);
                    }
                    Recovery::Retry => {
                        let mut out = if task == Task::Data { last.clone() } else { Vec::new() };
                        if !out.is_empty() {
                            tracing::debug!(task = %task, matrices = out.len(), "republishing last successful poll");
                        }
                        out.push(collector.metadata().clone());
                        export(exporter.as_ref(), &out).await;
                    }
                    Recovery::Empty => {
                        if task == Task::Data {
                            last.clear();
                        }
                        export(exporter.as_ref(), std::slice::from_ref(collector.metadata())).await;
                    }
                    Recovery::Continue => tracing::debug!(task = %task, error = %e, "continuing"),
                },
            }
        }

        let Some(wakeup) = schedule.next_wakeup() else {
            return Stopped::Shutdown;
        };
        tokio::select! {
            _ = tokio::time::sleep_until(wakeup) => {}
            _ = shutdown.changed() => return Stopped::Shutdown,
        }
    }
}

async fn export(exporter: &dyn Exporter, matrices: &[Matrix]) {
    if matrices.is_empty() {
        return;
    }
    if let Err(e) = exporter.export(matrices).await {
        tracing::warn!(exporter = exporter.name(), error = %e, "export failed");
    }
}
