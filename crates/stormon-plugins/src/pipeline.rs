use crate::Plugin;
use std::time::{Duration, Instant};
use stormon_common::matrix::Matrix;

/// Outcome of one plugin within a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginReport {
    pub plugin: String,
    pub elapsed: Duration,
    pub matrices: usize,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct PipelineOutput {
    /// Matrices derived by every plugin, in declaration order.
    pub matrices: Vec<Matrix>,
    pub plugin_time: Duration,
    pub reports: Vec<PluginReport>,
}

/// Plugins in template order.
///
/// A failing plugin is logged and contributes nothing; later plugins still
/// run and the poll is never aborted.
#[derive(Debug, Default)]
pub struct Pipeline {
    plugins: Vec<Plugin>,
}

impl Pipeline {
    pub fn new(plugins: Vec<Plugin>) -> Self {
        Self { plugins }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    pub fn run(&mut self, data: &mut Matrix) -> PipelineOutput {
        let mut output = PipelineOutput::default();
        let object = data.object.clone();
        for plugin in &mut self.plugins {
            let started = Instant::now();
            let result = plugin.run(&mut data.view());
            let elapsed = started.elapsed();
            output.plugin_time += elapsed;

            let report = match result {
                Ok(matrices) => {
                    tracing::trace!(
                        plugin = plugin.name(),
                        object = %object,
                        derived = matrices.len(),
                        elapsed = ?elapsed,
                        "plugin finished"
                    );
                    let count = matrices.len();
                    output.matrices.extend(matrices);
                    PluginReport {
                        plugin: plugin.name().to_string(),
                        elapsed,
                        matrices: count,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::error!(plugin = plugin.name(), object = %object, error = %e, "plugin failed");
                    PluginReport {
                        plugin: plugin.name().to_string(),
                        elapsed,
                        matrices: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            output.reports.push(report);
        }
        output
    }
}
