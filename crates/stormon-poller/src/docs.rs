//! `stormon-poller docs`: metric table for every template under a conf tree.

use crate::config::template_dir;
use anyhow::Context;
use std::path::{Path, PathBuf};
use stormon_api::swagger::SwaggerDoc;
use stormon_collector::docs::{build_counter_docs, render_markdown, CounterMetadata, Dashboard, DocSource};
use stormon_collector::CollectorKind;
use stormon_common::template::Template;

fn files_with_extension(dir: &Path, ext: &str) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == ext))
        .collect();
    files.sort();
    Ok(files)
}

/// Templates of every collector kind found under `conf_path`. Templates
/// that fail to parse are skipped with a warning.
pub fn load_sources(conf_path: &Path) -> anyhow::Result<Vec<DocSource>> {
    let mut sources = Vec::new();
    for kind in CollectorKind::ALL {
        let dir = template_dir(conf_path, kind);
        for path in files_with_extension(&dir, "yaml")? {
            let text = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
            match Template::parse(&text, &kind.parse_options()) {
                Ok(template) => sources.push(DocSource {
                    kind,
                    file: path
                        .strip_prefix(conf_path)
                        .unwrap_or(&path)
                        .display()
                        .to_string(),
                    template,
                }),
                Err(e) => tracing::warn!(template = %path.display(), error = %e, "template skipped"),
            }
        }
    }
    Ok(sources)
}

pub fn load_dashboards(dir: &Path) -> anyhow::Result<Vec<Dashboard>> {
    let mut dashboards = Vec::new();
    for path in files_with_extension(dir, "json")? {
        let text = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let json: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
        let title = json
            .get("title")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_default();
        dashboards.push(Dashboard { title, json });
    }
    Ok(dashboards)
}

/// Renders the metric table for `conf_path`.
pub fn generate(conf_path: &Path, dashboards: Option<&Path>, swagger: Option<&Path>) -> anyhow::Result<String> {
    let sources = load_sources(conf_path)?;
    let dashboards = match dashboards {
        Some(dir) => load_dashboards(dir)?,
        None => Vec::new(),
    };
    let swagger = swagger.map(SwaggerDoc::load).transpose()?;
    let docs = build_counter_docs(&sources, &CounterMetadata::new(), swagger.as_ref(), &dashboards);
    tracing::info!(templates = sources.len(), metrics = docs.len(), "metric docs generated");
    Ok(render_markdown(&docs))
}
