//! Post-poll transformations applied to collector matrices.
//!
//! Built-in plugins form the closed [`Plugin`] enum. User-defined plugins
//! plug in through [`registry::PluginRegistry`] as [`Plugin::Custom`].

pub mod aggregator;
pub mod error;
pub mod label_agent;
pub mod max;
pub mod metric_agent;
pub mod pipeline;
pub mod registry;

pub use aggregator::Aggregator;
pub use label_agent::LabelAgent;
pub use max::Max;
pub use metric_agent::MetricAgent;
pub use pipeline::{Pipeline, PipelineOutput, PluginReport};
pub use registry::{CustomPlugin, PluginFactory, PluginRegistry};

use error::Result;
use stormon_common::matrix::{Matrix, MatrixView};
use stormon_common::tree::Node;

/// What a plugin knows about the collector that owns it.
#[derive(Debug, Clone, Default)]
pub struct PluginContext {
    /// Collector kind, e.g. `RestPerf`.
    pub collector: String,
    /// Object of the matrix the plugin runs on.
    pub object: String,
    /// Root of the owning template, for plugins that read collector settings.
    pub template: Node,
}

/// A metric a plugin adds to the matrix it runs on.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedMetric {
    pub name: String,
    /// Operands or label the value is derived from.
    pub source: String,
}

pub enum Plugin {
    LabelAgent(LabelAgent),
    MetricAgent(MetricAgent),
    Aggregator(Aggregator),
    Max(Max),
    Custom(Box<dyn CustomPlugin>),
}

impl Plugin {
    pub fn name(&self) -> &str {
        match self {
            Plugin::LabelAgent(_) => "LabelAgent",
            Plugin::MetricAgent(_) => "MetricAgent",
            Plugin::Aggregator(_) => "Aggregator",
            Plugin::Max(_) => "Max",
            Plugin::Custom(p) => p.name(),
        }
    }

    /// Runs the plugin against `data` and returns the matrices it derives.
    pub fn run(&mut self, data: &mut MatrixView<'_>) -> Result<Vec<Matrix>> {
        match self {
            Plugin::LabelAgent(p) => p.run(data).map(|()| Vec::new()),
            Plugin::MetricAgent(p) => p.run(data).map(|()| Vec::new()),
            Plugin::Aggregator(p) => p.run(data.matrix()),
            Plugin::Max(p) => p.run(data.matrix()),
            Plugin::Custom(p) => p.run(data),
        }
    }

    /// Metrics this plugin adds to its input matrix.
    pub fn derived_metrics(&self) -> Vec<DerivedMetric> {
        match self {
            Plugin::LabelAgent(p) => p.new_metrics(),
            Plugin::MetricAgent(p) => p.new_metrics(),
            _ => Vec::new(),
        }
    }

    /// Labels this plugin adds, either to its input or to the matrices it derives.
    pub fn new_labels(&self) -> Vec<String> {
        match self {
            Plugin::LabelAgent(p) => p.new_labels().to_vec(),
            Plugin::Aggregator(p) => p.new_labels(),
            Plugin::Max(p) => p.new_labels(),
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Plugin").field(&self.name()).finish()
    }
}

/// Rule lines of a plugin parameter node: the content of each nameless
/// child, or the node's own content when it holds a single scalar.
pub(crate) fn rule_lines(node: &Node) -> Vec<String> {
    if node.children.is_empty() {
        let content = node.content.trim();
        return if content.is_empty() {
            Vec::new()
        } else {
            vec![content.to_string()]
        };
    }
    node.children
        .iter()
        .map(|c| c.content.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}
