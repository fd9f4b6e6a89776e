mod config;
mod docs;
mod exporter;
mod scheduler;

use anyhow::Result;
use exporter::{Exporter, LogExporter};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("stormon=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("docs") {
        let conf_path = args.get(1).map_or("conf", String::as_str);
        let text = docs::generate(
            Path::new(conf_path),
            args.get(2).map(Path::new),
            args.get(3).map(Path::new),
        )?;
        println!("{text}");
        return Ok(());
    }

    let config_path = args
        .first()
        .cloned()
        .unwrap_or_else(|| "config/poller.toml".to_string());
    let config = config::PollerFile::load(&config_path)?;
    tracing::info!(path = %config_path, pollers = config.pollers.len(), "stormon-poller starting");

    let exporter: Arc<dyn Exporter> = Arc::new(LogExporter);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    for poller in &config.pollers {
        let ctx = poller.context();
        for collector in &poller.collectors {
            let kind = collector.kind()?;
            let template = match collector.load_template(&poller.conf_path) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(poller = %poller.name, collector = %kind, error = %format!("{e:#}"), "template not loaded");
                    continue;
                }
            };
            let span = tracing::info_span!("collector", poller = %poller.name, collector = %kind, object = %template.object);
            let task = scheduler::run(kind, ctx.clone(), template, exporter.clone(), shutdown_rx.clone());
            handles.push(tokio::spawn(task.instrument(span)));
        }
    }

    if handles.is_empty() {
        anyhow::bail!("no collector could be started");
    }
    tracing::info!(collectors = handles.len(), "collectors started");

    signal::ctrl_c().await?;
    tracing::info!("Shutting down, waiting for polls in flight");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        match handle.await {
            Ok(stopped) => tracing::debug!(?stopped, "collector task ended"),
            Err(e) => tracing::warn!(error = %e, "collector task panicked"),
        }
    }
    tracing::info!("stormon-poller stopped");
    Ok(())
}
