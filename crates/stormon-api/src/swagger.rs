//! Per-appliance cache of the REST API's swagger document, used to look up
//! counter descriptions.

use crate::error::{PollError, Result};
use crate::rest::RestClient;
use serde_yaml::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// Downloads older than this are refreshed.
pub const SWAGGER_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 3600);

const SWAGGER_HREF: &str = "docs/api/swagger.yaml";

fn write_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// `{dir}/{addr}-swagger.yaml`, with path separators in `addr` replaced.
pub fn swagger_path(dir: &Path, addr: &str) -> PathBuf {
    let safe: String = addr
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    dir.join(format!("{safe}-swagger.yaml"))
}

fn is_fresh(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    meta.len() > 0
        && meta
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age < SWAGGER_MAX_AGE)
}

/// Returns the cached document path, downloading it first when missing or
/// stale. Only one task writes at a time; the file is replaced atomically.
pub async fn ensure_swagger(client: &mut RestClient, dir: &Path, addr: &str) -> Result<PathBuf> {
    let path = swagger_path(dir, addr);
    let _guard = write_lock().lock().await;
    if is_fresh(&path) {
        tracing::debug!(path = %path.display(), "using cached swagger");
        return Ok(path);
    }

    tracing::info!(addr, path = %path.display(), "downloading swagger");
    let body = match client.download(SWAGGER_HREF).await {
        Ok(body) => body,
        Err(e) => {
            remove_if_empty(&path);
            return Err(e);
        }
    };
    if body.is_empty() {
        remove_if_empty(&path);
        return Err(PollError::Parse(format!("empty swagger document from {addr}")));
    }

    let io = |e: std::io::Error| PollError::Config(format!("failed to write {}: {e}", path.display()));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io)?;
    tmp.write_all(&body).map_err(io)?;
    tmp.persist(&path).map_err(|e| io(e.error))?;
    tracing::info!(bytes = body.len(), path = %path.display(), "swagger saved");
    Ok(path)
}

fn remove_if_empty(path: &Path) {
    if std::fs::metadata(path).is_ok_and(|m| m.len() == 0) {
        let _ = std::fs::remove_file(path);
    }
}

/// Parsed swagger document.
#[derive(Debug, Clone)]
pub struct SwaggerDoc {
    root: Value,
}

impl SwaggerDoc {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self {
            root: serde_yaml::from_str(text)?,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PollError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    fn definition(&self, name: &str) -> Option<&Value> {
        self.root.get("definitions")?.get(name)
    }

    /// Follows `$ref: "#/definitions/x"` and array `items`.
    fn resolve<'a>(&'a self, mut node: &'a Value) -> &'a Value {
        for _ in 0..8 {
            if let Some(target) = node
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix("#/definitions/"))
                .and_then(|name| self.definition(name))
            {
                node = target;
            } else if let Some(items) = node.get("items") {
                node = items;
            } else {
                break;
            }
        }
        node
    }

    /// Description of `counter` (dotted) within definition `object`.
    pub fn description(&self, object: &str, counter: &str) -> Option<String> {
        let mut node = self.resolve(self.definition(object)?);
        for part in counter.split('.') {
            let properties = node.get("properties")?;
            node = self.resolve(properties.get(part)?);
        }
        node.get("description")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
    }
}
