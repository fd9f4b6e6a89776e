use crate::error::{PluginError, Result};
use crate::pipeline::Pipeline;
use crate::{Aggregator, LabelAgent, Max, MetricAgent, Plugin, PluginContext};
use std::collections::HashMap;
use stormon_common::matrix::{Matrix, MatrixView};
use stormon_common::template::PluginSpec;
use stormon_common::tree::Node;

/// Names of the plugins compiled into [`Plugin`].
pub const BUILTIN_PLUGINS: [&str; 4] = ["LabelAgent", "MetricAgent", "Aggregator", "Max"];

/// A user-defined plugin instance.
pub trait CustomPlugin: Send {
    fn name(&self) -> &str;

    /// Same contract as the built-ins: may rewrite labels and derived
    /// metrics through `data`, and returns any new matrices.
    fn run(&mut self, data: &mut MatrixView<'_>) -> Result<Vec<Matrix>>;
}

/// Creates [`CustomPlugin`]s from template parameters.
pub trait PluginFactory: Send + Sync {
    /// Plugin name as written in templates.
    fn kind(&self) -> &str;

    fn create(&self, params: &Node, ctx: &PluginContext) -> Result<Box<dyn CustomPlugin>>;
}

/// Resolves template plugin declarations into runnable plugins.
///
/// Built-ins are always available; anything else must be registered.
///
/// # Examples
///
/// ```
/// use stormon_plugins::registry::PluginRegistry;
///
/// let registry = PluginRegistry::default();
/// assert!(registry.has_plugin("LabelAgent"));
/// assert!(registry.has_plugin("Aggregator"));
/// assert!(!registry.has_plugin("Histogram"));
/// ```
pub struct PluginRegistry {
    factories: HashMap<String, Box<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers a custom plugin. Built-in names cannot be replaced.
    pub fn register(&mut self, factory: Box<dyn PluginFactory>) {
        let kind = factory.kind().to_string();
        if BUILTIN_PLUGINS.contains(&kind.as_str()) {
            tracing::warn!(plugin = %kind, "ignoring custom plugin that shadows a built-in");
            return;
        }
        self.factories.insert(kind, factory);
    }

    pub fn has_plugin(&self, kind: &str) -> bool {
        BUILTIN_PLUGINS.contains(&kind) || self.factories.contains_key(kind)
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = BUILTIN_PLUGINS.to_vec();
        names.extend(self.factories.keys().map(String::as_str));
        names
    }

    pub fn build(&self, spec: &PluginSpec, ctx: &PluginContext) -> Result<Plugin> {
        let params = &spec.params;
        let plugin = match spec.kind.as_str() {
            "LabelAgent" => Plugin::LabelAgent(LabelAgent::new(params)?),
            "MetricAgent" => Plugin::MetricAgent(MetricAgent::new(params)?),
            "Aggregator" => Plugin::Aggregator(Aggregator::new(params)?),
            "Max" => Plugin::Max(Max::new(params)?),
            other => {
                let factory = self
                    .factories
                    .get(other)
                    .ok_or_else(|| PluginError::UnknownPlugin(other.to_string()))?;
                Plugin::Custom(factory.create(params, ctx)?)
            }
        };
        tracing::debug!(plugin = %spec.kind, object = %ctx.object, "plugin initialized");
        Ok(plugin)
    }

    /// Builds the ordered pipeline for a template's `plugins` list.
    pub fn pipeline(&self, specs: &[PluginSpec], ctx: &PluginContext) -> Result<Pipeline> {
        let plugins = specs
            .iter()
            .map(|spec| self.build(spec, ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(Pipeline::new(plugins))
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stormon_common::matrix::MetricType;

    struct Tagger {
        value: String,
    }

    impl CustomPlugin for Tagger {
        fn name(&self) -> &str {
            "Tagger"
        }

        fn run(&mut self, data: &mut MatrixView<'_>) -> Result<Vec<Matrix>> {
            for (_, instance) in data.instances_mut() {
                instance.set_label("tag", &self.value);
            }
            data.derive_metric("tagged", MetricType::Uint8)?;
            Ok(Vec::new())
        }
    }

    struct TaggerFactory;

    impl PluginFactory for TaggerFactory {
        fn kind(&self) -> &str {
            "Tagger"
        }

        fn create(&self, params: &Node, _ctx: &PluginContext) -> Result<Box<dyn CustomPlugin>> {
            let value = params.child_content("value");
            if value.is_empty() {
                return Err(PluginError::MissingParam("value".to_string()));
            }
            Ok(Box::new(Tagger {
                value: value.to_string(),
            }))
        }
    }

    fn spec(kind: &str, params: Node) -> PluginSpec {
        PluginSpec {
            kind: kind.to_string(),
            params,
        }
    }

    #[test]
    fn should_reject_unknown_plugins() {
        let registry = PluginRegistry::default();
        let err = registry
            .build(&spec("Tagger", Node::new("Tagger")), &PluginContext::default())
            .unwrap_err();
        assert!(matches!(err, PluginError::UnknownPlugin(ref k) if k == "Tagger"));
    }

    #[test]
    fn should_build_registered_custom_plugin() {
        let mut registry = PluginRegistry::default();
        registry.register(Box::new(TaggerFactory));
        assert!(registry.has_plugin("Tagger"));

        let mut params = Node::new("Tagger");
        params.new_child("value", "blue");
        let mut plugin = registry
            .build(&spec("Tagger", params), &PluginContext::default())
            .unwrap();
        assert_eq!(plugin.name(), "Tagger");

        let mut m = Matrix::new("u", "volume", "volume");
        m.new_instance("a").unwrap();
        let out = plugin.run(&mut m.view()).unwrap();
        assert!(out.is_empty());
        assert_eq!(m.instance("a").unwrap().label("tag"), Some("blue"));
        assert!(m.metric("tagged").unwrap().is_derived());
    }

    #[test]
    fn should_propagate_factory_errors() {
        let mut registry = PluginRegistry::default();
        registry.register(Box::new(TaggerFactory));
        let err = registry
            .build(&spec("Tagger", Node::new("Tagger")), &PluginContext::default())
            .unwrap_err();
        assert!(matches!(err, PluginError::MissingParam(_)));
    }

    #[test]
    fn should_keep_builtins_when_shadowed() {
        struct Shadow;
        impl PluginFactory for Shadow {
            fn kind(&self) -> &str {
                "Max"
            }
            fn create(&self, _: &Node, _: &PluginContext) -> Result<Box<dyn CustomPlugin>> {
                Err(PluginError::Custom("should not be called".to_string()))
            }
        }
        let mut registry = PluginRegistry::default();
        registry.register(Box::new(Shadow));

        let mut params = Node::new("Max");
        params.new_child("", "node");
        let plugin = registry
            .build(&spec("Max", params), &PluginContext::default())
            .unwrap();
        assert!(matches!(plugin, Plugin::Max(_)));
    }
}
