use super::HrefBuilder;
use crate::auth::{build_client, Credentials};
use crate::config::ConnectionConfig;
use crate::error::{status_error, transport_error, PollError, Result};
use crate::stats::Stats;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Appliance identity read from `api/cluster`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cluster {
    pub name: String,
    pub uuid: String,
    pub info: String,
    pub version: [u32; 3],
}

impl Cluster {
    pub fn version_string(&self) -> String {
        let [g, ma, mi] = self.version;
        format!("{g}.{ma}.{mi}")
    }
}

/// A REST session with one appliance.
pub struct RestClient {
    client: Client,
    base_url: String,
    credentials: Arc<Credentials>,
    cluster: Cluster,
    stats: Stats,
    timeout: Duration,
}

impl RestClient {
    pub async fn new(config: &ConnectionConfig, credentials: Arc<Credentials>) -> Result<Self> {
        Self::with_timeout(config, credentials, config.client_timeout).await
    }

    pub async fn with_timeout(
        config: &ConnectionConfig,
        credentials: Arc<Credentials>,
        timeout: Duration,
    ) -> Result<Self> {
        if config.addr.trim().is_empty() {
            return Err(PollError::MissingParam("addr".to_string()));
        }
        let client = build_client(config, timeout).await?;
        Ok(Self {
            client,
            base_url: format!("{}://{}/", config.scheme, config.url_host()),
            credentials,
            cluster: Cluster::default(),
            stats: Stats::default(),
            timeout,
        })
    }

    /// Reads cluster identity. A 403 here is fatal.
    pub async fn init(&mut self) -> Result<()> {
        let href = HrefBuilder::new().api_path("cluster").fields(&["*"]).build();
        let body = self.get(&href).await?;
        let str_at = |p: &str| body.pointer(p).and_then(Value::as_str).unwrap_or_default().to_string();
        let num_at = |p: &str| body.pointer(p).and_then(Value::as_u64).unwrap_or_default() as u32;
        self.cluster = Cluster {
            name: str_at("/name"),
            uuid: str_at("/uuid"),
            info: str_at("/version/full"),
            version: [
                num_at("/version/generation"),
                num_at("/version/major"),
                num_at("/version/minor"),
            ],
        };
        tracing::info!(
            cluster = %self.cluster.name,
            version = %self.cluster.version_string(),
            "connected to appliance"
        );
        Ok(())
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `href`, which may start with `/`.
    pub fn url(&self, href: &str) -> String {
        format!("{}{}", self.base_url, href.trim_start_matches('/'))
    }

    /// Raw body download with the same auth and retry rules; used for
    /// non-JSON resources such as the swagger document.
    pub async fn download(&mut self, href: &str) -> Result<Vec<u8>> {
        let url = self.url(href);
        let response = self.send(href, &url).await?;
        let body_started = Instant::now();
        let bytes = response.bytes().await.map_err(|e| transport_error(href, e));
        self.stats.api_time += body_started.elapsed();
        let bytes = bytes?;
        self.stats.record_parse(Duration::ZERO, bytes.len());
        Ok(bytes.to_vec())
    }

    /// One GET returning the decoded JSON body.
    pub async fn get(&mut self, href: &str) -> Result<Value> {
        let url = self.url(href);
        let response = self.send(href, &url).await?;
        let body_started = Instant::now();
        let bytes = response.bytes().await.map_err(|e| transport_error(href, e));
        self.stats.api_time += body_started.elapsed();
        let bytes = bytes?;
        let parse_started = Instant::now();
        let parsed = serde_json::from_slice::<Value>(&bytes);
        self.stats.record_parse(parse_started.elapsed(), bytes.len());
        Ok(parsed?)
    }

    async fn send(&mut self, api: &str, url: &str) -> Result<reqwest::Response> {
        let mut retried = false;
        loop {
            let started = Instant::now();
            let request = self.client.get(url).header(ACCEPT, "application/json");
            let request = self.credentials.apply(request).await?;
            let response = request.send().await;
            self.stats.record_call(started.elapsed());
            let response = response.map_err(|e| {
                tracing::error!(api, elapsed = ?started.elapsed(), error = %e, "request failed");
                transport_error(api, e)
            })?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::UNAUTHORIZED {
                if self.credentials.has_script() && !retried {
                    tracing::warn!(api, status = status.as_u16(), "authentication failed, refreshing credentials");
                    self.credentials.expire().await;
                    retried = true;
                    continue;
                }
                tracing::error!(api, status = status.as_u16(), "authentication failed");
                return Err(PollError::AuthFailed {
                    api: api.to_string(),
                });
            }

            let body = response.bytes().await.unwrap_or_default();
            let error = serde_json::from_slice::<Value>(&body)
                .ok()
                .and_then(|v| v.get("error").cloned())
                .unwrap_or(Value::Null);
            let field = |k: &str| match error.get(k) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => String::new(),
            };
            tracing::error!(
                api,
                elapsed = ?started.elapsed(),
                status = status.as_u16(),
                message = %field("message"),
                "request rejected"
            );
            return Err(status_error(
                api,
                status.as_u16(),
                field("code"),
                field("message"),
                field("target"),
            ));
        }
    }

    /// Follows `_links.next.href`, handing each page's records to `f`.
    /// Returns the total record count.
    pub async fn for_each_batch<F>(&mut self, href: &str, mut f: F) -> Result<usize>
    where
        F: FnMut(Vec<Value>) -> Result<()>,
    {
        let mut current = href.to_string();
        let mut total = 0;
        loop {
            let mut body = self.get(&current).await?;
            let records = match body.get_mut("records").map(Value::take) {
                Some(Value::Array(records)) => records,
                _ => Vec::new(),
            };
            let next = body
                .pointer("/_links/next/href")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            total += records.len();
            if !records.is_empty() {
                f(records)?;
            }
            if next.is_empty() || next.trim_start_matches('/') == current.trim_start_matches('/') {
                break;
            }
            current = next;
        }
        Ok(total)
    }

    /// Collects every page into one list. Zero records is `NoInstance`.
    pub async fn fetch_all(&mut self, href: &str) -> Result<Vec<Value>> {
        let mut records = Vec::new();
        self.for_each_batch(href, |batch| {
            records.extend(batch);
            Ok(())
        })
        .await?;
        if records.is_empty() {
            return Err(PollError::NoInstance(format!("no records from {href}")));
        }
        Ok(records)
    }
}
