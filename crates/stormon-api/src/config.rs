use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

/// How a poller authenticates against its appliance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStyle {
    #[default]
    BasicAuth,
    CertificateAuth,
}

/// An external program that prints credentials or certificates.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    pub path: PathBuf,
    /// How long a fetched secret is reused; `always` re-runs the script on
    /// every request.
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_script_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl ScriptConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schedule: default_schedule(),
            timeout: default_script_timeout(),
        }
    }

    /// `None` when every request must re-run the script.
    pub fn cache_for(&self) -> Option<Duration> {
        if self.schedule.eq_ignore_ascii_case("always") {
            return None;
        }
        match humantime::parse_duration(&self.schedule) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::warn!(schedule = %self.schedule, error = %e, "invalid credentials_script schedule, using 24h");
                Some(Duration::from_secs(24 * 3600))
            }
        }
    }
}

/// Everything a transport needs to reach one appliance.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub addr: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub credentials_script: Option<ScriptConfig>,
    #[serde(default)]
    pub auth_style: AuthStyle,
    #[serde(default)]
    pub ssl_cert: Option<PathBuf>,
    #[serde(default)]
    pub ssl_key: Option<PathBuf>,
    #[serde(default)]
    pub certificate_script: Option<ScriptConfig>,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub use_insecure_tls: bool,
    #[serde(default = "default_client_timeout", deserialize_with = "deserialize_duration")]
    pub client_timeout: Duration,
    /// `https` in production; tests point clients at plain-HTTP mocks.
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

impl ConnectionConfig {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            username: None,
            password: None,
            credentials_script: None,
            auth_style: AuthStyle::BasicAuth,
            ssl_cert: None,
            ssl_key: None,
            certificate_script: None,
            ca_cert: None,
            use_insecure_tls: false,
            client_timeout: default_client_timeout(),
            scheme: default_scheme(),
        }
    }

    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// `host:port`, adding the default HTTPS port when absent.
    pub fn host_port(&self) -> String {
        let addr = self.addr.trim();
        if addr.parse::<std::net::SocketAddr>().is_ok() {
            return addr.to_string();
        }
        if addr.parse::<std::net::Ipv6Addr>().is_ok() {
            return format!("[{addr}]:443");
        }
        if addr.contains(':') {
            return addr.to_string();
        }
        format!("{addr}:443")
    }

    /// Address formatted for use in a URL authority.
    pub fn url_host(&self) -> String {
        let addr = self.addr.trim();
        if addr.parse::<std::net::Ipv6Addr>().is_ok() {
            format!("[{addr}]")
        } else {
            addr.to_string()
        }
    }
}

fn default_schedule() -> String {
    "24h".to_string()
}

fn default_script_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_client_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_scheme() -> String {
    "https".to_string()
}

/// Deserializes a humantime string such as `"30s"` or `"24h"`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_add_default_port() {
        assert_eq!(ConnectionConfig::new("10.0.0.1").host_port(), "10.0.0.1:443");
        assert_eq!(ConnectionConfig::new("10.0.0.1:8443").host_port(), "10.0.0.1:8443");
        assert_eq!(ConnectionConfig::new("cluster-1").host_port(), "cluster-1:443");
        assert_eq!(ConnectionConfig::new("fd00::1").host_port(), "[fd00::1]:443");
    }

    #[test]
    fn should_treat_always_as_uncached() {
        let mut script = ScriptConfig::new("/bin/creds");
        assert_eq!(script.cache_for(), Some(Duration::from_secs(24 * 3600)));
        script.schedule = "always".to_string();
        assert_eq!(script.cache_for(), None);
        script.schedule = "5m".to_string();
        assert_eq!(script.cache_for(), Some(Duration::from_secs(300)));
    }
}
