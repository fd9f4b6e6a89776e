//! Credential sources and HTTP client construction.
//!
//! Secrets come from the poller config or from a credentials script. Script
//! output is cached behind an async mutex so only one task runs the script
//! at a time; [`Credentials::expire`] drops the cache after a 401 so the
//! next [`Credentials::get`] re-runs it.

use crate::config::{AuthStyle, ConnectionConfig, ScriptConfig};
use crate::error::{PollError, Result};
use reqwest::{Certificate, Client, Identity, RequestBuilder};
use serde::Deserialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

/// Resolved credentials for one request.
#[derive(Clone)]
pub struct Secret {
    pub username: String,
    password: Zeroizing<String>,
    token: Option<Zeroizing<String>>,
}

impl Secret {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
            token: None,
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().map(String::as_str)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("username", &self.username)
            .field("password", &"***")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ScriptResponse {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "authToken")]
    auth_token: Option<String>,
}

/// Interprets credentials script stdout. Structured output
/// (`{username, password}` or `{authToken}`) is preferred; anything else is
/// taken as the bare password.
pub fn parse_script_output(stdout: &str, default_username: &str) -> Secret {
    let trimmed = stdout.trim();
    let parsed = serde_yaml::from_str::<ScriptResponse>(trimmed)
        .ok()
        .filter(|r| r.password.is_some() || r.auth_token.is_some());
    match parsed {
        Some(resp) => {
            let username = resp
                .username
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| default_username.to_string());
            Secret {
                username,
                password: Zeroizing::new(resp.password.unwrap_or_default()),
                token: resp.auth_token.filter(|t| !t.is_empty()).map(Zeroizing::new),
            }
        }
        None => Secret::new(default_username, trimmed),
    }
}

/// Runs `script` with `args`, returning stdout. Stdin is closed and the
/// child is killed when the timeout elapses.
pub async fn run_script(script: &ScriptConfig, args: &[&str]) -> Result<Zeroizing<String>> {
    let path = script.path.display().to_string();
    let started = Instant::now();
    let child = Command::new(&script.path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PollError::Config(format!("failed to start script {path}: {e}")))?;

    let output = match tokio::time::timeout(script.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(PollError::AuthFailed {
                api: format!("script {path}: {e}"),
            })
        }
        Err(_) => {
            tracing::error!(script = %path, timeout = ?script.timeout, "credentials script timed out");
            return Err(PollError::AuthFailed {
                api: format!("script {path} timed out after {:?}", script.timeout),
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::error!(
            script = %path,
            status = %output.status,
            stderr = %stderr.trim(),
            "credentials script failed"
        );
        return Err(PollError::AuthFailed {
            api: format!("script {path} exited with {}", output.status),
        });
    }
    tracing::debug!(script = %path, elapsed = ?started.elapsed(), "credentials script finished");
    Ok(Zeroizing::new(String::from_utf8_lossy(&output.stdout).into_owned()))
}

struct Cached {
    secret: Secret,
    fetched: Instant,
}

/// Process-wide credential source for one appliance.
pub struct Credentials {
    addr: String,
    style: AuthStyle,
    username: String,
    password: Option<Zeroizing<String>>,
    script: Option<ScriptConfig>,
    cache: Mutex<Option<Cached>>,
}

impl Credentials {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            addr: config.addr.clone(),
            style: config.auth_style,
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone().map(Zeroizing::new),
            script: config.credentials_script.clone(),
            cache: Mutex::new(None),
        }
    }

    pub fn is_cert(&self) -> bool {
        self.style == AuthStyle::CertificateAuth
    }

    /// Whether a 401 can be cured by re-running a script.
    pub fn has_script(&self) -> bool {
        self.script.is_some() && !self.is_cert()
    }

    /// Current secret, running the credentials script when the cache is
    /// empty or stale.
    pub async fn get(&self) -> Result<Secret> {
        let Some(script) = &self.script else {
            return self.static_secret();
        };
        let mut cache = self.cache.lock().await;
        let ttl = script.cache_for();
        if let (Some(cached), Some(ttl)) = (cache.as_ref(), ttl) {
            if cached.fetched.elapsed() < ttl {
                return Ok(cached.secret.clone());
            }
        }
        let stdout = run_script(script, &[&self.addr, &self.username]).await?;
        let secret = parse_script_output(&stdout, &self.username);
        if secret.username.is_empty() && secret.token().is_none() {
            return Err(PollError::MissingParam("username".to_string()));
        }
        *cache = Some(Cached {
            secret: secret.clone(),
            fetched: Instant::now(),
        });
        Ok(secret)
    }

    /// Invalidates the cached secret.
    pub async fn expire(&self) {
        if self.script.is_some() {
            *self.cache.lock().await = None;
        }
    }

    fn static_secret(&self) -> Result<Secret> {
        if self.username.is_empty() {
            return Err(PollError::MissingParam("username".to_string()));
        }
        let password = self
            .password
            .as_ref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| PollError::MissingParam("password".to_string()))?;
        Ok(Secret::new(&self.username, password))
    }

    /// Adds the authorization header for basic or token auth. Certificate
    /// auth is carried by the client's TLS identity instead.
    pub async fn apply(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        if self.is_cert() {
            return Ok(request);
        }
        let secret = self.get().await?;
        Ok(match secret.token() {
            Some(token) => request.bearer_auth(token),
            None => request.basic_auth(&secret.username, Some(secret.password())),
        })
    }
}

/// Builds the HTTP client for one appliance: rustls, per-call timeout,
/// optional CA bundle and client certificate.
pub async fn build_client(config: &ConnectionConfig, timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .danger_accept_invalid_certs(config.use_insecure_tls);

    if let Some(ca) = &config.ca_cert {
        match tokio::fs::read(ca).await {
            Ok(pem) => match Certificate::from_pem(&pem) {
                Ok(cert) => builder = builder.add_root_certificate(cert),
                Err(e) => tracing::error!(ca_cert = %ca.display(), error = %e, "invalid CA certificate"),
            },
            Err(e) => tracing::error!(ca_cert = %ca.display(), error = %e, "failed to read CA certificate"),
        }
    }

    if config.auth_style == AuthStyle::CertificateAuth {
        let pem = certificate_pem(config).await?;
        let identity = Identity::from_pem(pem.as_bytes())
            .map_err(|e| PollError::Config(format!("invalid client certificate: {e}")))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| PollError::Config(format!("failed to build HTTP client: {e}")))
}

async fn certificate_pem(config: &ConnectionConfig) -> Result<Zeroizing<String>> {
    if let Some(script) = &config.certificate_script {
        return run_script(script, &[&config.addr]).await;
    }
    let cert = config
        .ssl_cert
        .as_ref()
        .ok_or_else(|| PollError::MissingParam("ssl_cert".to_string()))?;
    let key = config
        .ssl_key
        .as_ref()
        .ok_or_else(|| PollError::MissingParam("ssl_key".to_string()))?;
    let read = |path: &std::path::Path| {
        std::fs::read_to_string(path)
            .map_err(|e| PollError::Config(format!("failed to read {}: {e}", path.display())))
    };
    let mut pem = Zeroizing::new(read(cert)?);
    pem.push('\n');
    pem.push_str(&Zeroizing::new(read(key)?));
    Ok(pem)
}
