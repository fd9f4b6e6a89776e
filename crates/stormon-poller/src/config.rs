use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use stormon_api::ConnectionConfig;
use stormon_collector::{CollectorContext, CollectorKind};
use stormon_common::template::{Template, APPEND_ON_MERGE};
use stormon_common::tree::load_yaml;

#[derive(Debug, Deserialize)]
pub struct PollerFile {
    #[serde(default)]
    pub pollers: Vec<PollerConfig>,
}

/// One monitored appliance.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    pub name: String,
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Global labels added to every exported row.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,
    /// Root of the template tree: `{conf_path}/{kind}/{template}`.
    #[serde(default = "default_conf_path")]
    pub conf_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    pub kind: String,
    pub template: String,
    /// Merged over `template` in order.
    #[serde(default)]
    pub custom_templates: Vec<String>,
}

fn default_conf_path() -> PathBuf {
    PathBuf::from("conf")
}

impl PollerFile {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
        let file: Self = toml::from_str(&content).with_context(|| format!("failed to parse {path}"))?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.pollers.is_empty() {
            bail!("no [[pollers]] configured");
        }
        let mut names = HashSet::new();
        for poller in &self.pollers {
            if !names.insert(poller.name.as_str()) {
                bail!("duplicate poller name [{}]", poller.name);
            }
            if poller.connection.addr.trim().is_empty() {
                bail!("poller [{}] has no addr", poller.name);
            }
            for collector in &poller.collectors {
                collector
                    .kind()
                    .with_context(|| format!("poller [{}]", poller.name))?;
            }
        }
        Ok(())
    }
}

impl PollerConfig {
    pub fn context(&self) -> CollectorContext {
        let mut ctx = CollectorContext::new(&self.name, self.connection.clone());
        ctx.labels = self.labels.clone();
        ctx
    }
}

impl CollectorConfig {
    pub fn kind(&self) -> anyhow::Result<CollectorKind> {
        Ok(self.kind.parse::<CollectorKind>()?)
    }

    /// Reads the template and merges the custom ones over it.
    pub fn load_template(&self, conf_path: &Path) -> anyhow::Result<Template> {
        let kind = self.kind()?;
        let dir = template_dir(conf_path, kind);
        let read = |file: &str| {
            let path = dir.join(file);
            std::fs::read_to_string(&path).with_context(|| format!("failed to read template {}", path.display()))
        };

        let options = kind.parse_options();
        let text = read(&self.template)?;
        if self.custom_templates.is_empty() {
            return Ok(Template::parse(&text, &options)?);
        }
        let mut root = load_yaml(&text)?;
        for custom in &self.custom_templates {
            let overlay = load_yaml(&read(custom)?).with_context(|| format!("failed to parse {custom}"))?;
            root.merge(&overlay, APPEND_ON_MERGE);
        }
        Ok(Template::from_node(root, &options)?)
    }
}

/// Directory holding the templates of `kind`, e.g. `conf/restperf`.
pub fn template_dir(conf_path: &Path, kind: CollectorKind) -> PathBuf {
    conf_path.join(kind.as_str().to_ascii_lowercase())
}
