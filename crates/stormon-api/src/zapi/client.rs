use super::{SystemInfo, INITIAL_TAG, ZAPI_NAMESPACE, ZAPI_SERVLET, ZAPI_VERSION};
use crate::auth::{build_client, Credentials};
use crate::config::ConnectionConfig;
use crate::error::{status_error, transport_error, PollError, Result};
use crate::stats::Stats;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stormon_common::tree::{load_xml, to_xml, Node};

/// One XML-RPC session with an appliance.
pub struct ZapiClient {
    client: Client,
    url: String,
    credentials: Arc<Credentials>,
    system: SystemInfo,
    stats: Stats,
    timeout: Duration,
}

impl ZapiClient {
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
        let url = format!("{}://{}/{ZAPI_SERVLET}", config.scheme, config.host_port());
        Ok(Self {
            client,
            url,
            credentials,
            system: SystemInfo::default(),
            stats: Stats::default(),
            timeout,
        })
    }

    /// Reads appliance identity; must succeed before polling.
    pub async fn init(&mut self) -> Result<()> {
        self.system = SystemInfo::fetch(self).await?;
        tracing::info!(
            cluster = %self.system.name,
            release = %self.system.release,
            clustered = self.system.clustered,
            "connected to appliance"
        );
        Ok(())
    }

    pub fn system(&self) -> &SystemInfo {
        &self.system
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Serializes `request` inside the `netapp` envelope.
    pub fn envelope(request: &Node) -> String {
        let mut root = Node::new("netapp");
        root.set_attr("xmlns", ZAPI_NAMESPACE);
        root.set_attr("version", ZAPI_VERSION);
        root.add_child(request.clone());
        format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}", to_xml(&root))
    }

    /// Invokes an operation without arguments.
    pub async fn invoke_name(&mut self, name: &str) -> Result<Node> {
        self.invoke(&Node::new(name)).await
    }

    /// Invokes one request and returns its `results` node.
    pub async fn invoke(&mut self, request: &Node) -> Result<Node> {
        let body = Self::envelope(request);
        self.send(&request.name, body).await
    }

    /// One page of an iterator call. Returns the results and the next
    /// cursor (empty when iteration is over).
    pub async fn invoke_batch(&mut self, request: &Node, tag: &str) -> Result<(Node, String)> {
        let mut req = request.clone();
        if tag != INITIAL_TAG {
            req.set_child_content("tag", tag);
        }
        let results = self.invoke(&req).await?;
        let mut next = results.child_content("next-tag").to_string();
        if !next.is_empty() && next == tag {
            tracing::warn!(api = %request.name, tag = %tag, "next-tag equals previous tag, stopping");
            next.clear();
        }
        Ok((results, next))
    }

    /// Pages through an iterator call, handing each batch to `f` as it
    /// arrives. Returns the number of batches.
    pub async fn invoke_stream<F>(&mut self, request: &Node, mut f: F) -> Result<usize>
    where
        F: FnMut(Node) -> Result<()>,
    {
        let mut tag = INITIAL_TAG.to_string();
        let mut batches = 0;
        loop {
            let (results, next) = self.invoke_batch(request, &tag).await?;
            batches += 1;
            f(results)?;
            if next.is_empty() {
                break;
            }
            tag = next;
        }
        Ok(batches)
    }

    /// Collects the children of `list_name` from every page.
    pub async fn invoke_all(&mut self, request: &Node, list_name: &str) -> Result<Vec<Node>> {
        let mut records = Vec::new();
        self.invoke_stream(request, |mut results| {
            if let Some(list) = results.pop_child(list_name) {
                records.extend(list.children);
            }
            Ok(())
        })
        .await?;
        Ok(records)
    }

    async fn send(&mut self, api: &str, body: String) -> Result<Node> {
        let mut retried = false;
        loop {
            let started = Instant::now();
            let request = self
                .client
                .post(&self.url)
                .header(CONTENT_TYPE, "text/xml")
                .body(body.clone());
            let request = self.credentials.apply(request).await?;
            let response = request.send().await;
            self.stats.record_call(started.elapsed());
            let response = response.map_err(|e| {
                tracing::error!(api, elapsed = ?started.elapsed(), error = %e, "request failed");
                transport_error(api, e)
            })?;
            let status = response.status();

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
            if !status.is_success() {
                tracing::error!(api, elapsed = ?started.elapsed(), status = status.as_u16(), "request rejected");
                return Err(status_error(
                    api,
                    status.as_u16(),
                    String::new(),
                    status.canonical_reason().unwrap_or_default().to_string(),
                    String::new(),
                ));
            }

            let body_started = Instant::now();
            let bytes = response.bytes().await.map_err(|e| transport_error(api, e));
            self.stats.api_time += body_started.elapsed();
            let bytes = bytes?;
            let parse_started = Instant::now();
            let parsed = load_xml(&bytes);
            self.stats.record_parse(parse_started.elapsed(), bytes.len());
            return results_of(api, parsed?);
        }
    }
}

/// Extracts `results` and checks its status.
fn results_of(api: &str, mut root: Node) -> Result<Node> {
    let results = root
        .pop_child("results")
        .ok_or_else(|| PollError::Parse(format!("{api}: response has no results element")))?;
    match results.attr("status") {
        Some("passed") => Ok(results),
        Some(_) => {
            let errno = results.attr("errno").unwrap_or_default();
            let reason = results.attr("reason").unwrap_or_default();
            tracing::error!(api, errno, reason, "request rejected by appliance");
            Err(PollError::rejected(api, errno, reason))
        }
        None => Err(PollError::Parse(format!("{api}: missing status attribute"))),
    }
}
