//! Replays a mutating request against every instance of the proxy service
//!
//! The origin does not apply the change in the distributing pass: each
//! sibling, itself included, receives the request with `distribute=false`
//! and applies it locally. Partial failure is reported, never rolled back.

use crate::config::{InstanceConfig, Mode};
use crate::error::{ProxyError, Result};
use crate::registry::RegistryClient;
use crate::service::Query;
use async_trait::async_trait;
use reqwest::Method;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Message of a fully successful distribution
pub const DISTRIBUTED: &str = "Distributed to all instances";

/// A mutating request as received by the frontend
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub method: Method,
    pub path: String,
    pub query: Query,
    pub body: Vec<u8>,
}

impl MutationRequest {
    pub fn new(method: Method, path: impl Into<String>, query: Query) -> Self {
        Self {
            method,
            path: path.into(),
            query,
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// The same request with distribution switched off, so a sibling applies it
    pub fn for_sibling(&self) -> Self {
        let mut request = self.clone();
        request.query.set("distribute", "false");
        request
    }

    fn url(&self, sibling: &str) -> String {
        let query = self.query.encode();
        if query.is_empty() {
            format!("http://{}{}", sibling, self.path)
        } else {
            format!("http://{}{}?{}", sibling, self.path, query)
        }
    }
}

/// Outcome of the call to one sibling
#[derive(Debug, Clone)]
pub struct SiblingResult {
    pub address: String,
    /// HTTP status, absent when the sibling could not be reached
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl SiblingResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.is_some_and(|s| s < 300)
    }
}

/// Cluster-wide result of one distribution
#[derive(Debug, Clone)]
pub struct DistributionOutcome {
    /// 200 when every sibling succeeded, else the worst failing status
    pub status: u16,
    /// Error of the first failing sibling
    pub error: Option<String>,
    pub results: Vec<SiblingResult>,
}

impl DistributionOutcome {
    pub fn aggregate(results: Vec<SiblingResult>) -> Self {
        let failures: Vec<&SiblingResult> = results.iter().filter(|r| !r.is_success()).collect();
        if failures.is_empty() {
            return Self {
                status: 200,
                error: None,
                results,
            };
        }

        // Unreachable siblings count as internal errors
        let status = failures
            .iter()
            .map(|r| r.status.filter(|s| *s >= 300).unwrap_or(500))
            .max()
            .unwrap_or(500);
        let error = failures.first().map(|r| {
            let detail = r.error.clone().unwrap_or_default();
            format!("{}: {}", r.address, detail)
        });
        Self {
            status,
            error,
            results,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status < 300
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProxyError::Distribution(self.error.unwrap_or_else(|| {
                format!("distribution failed with status {}", self.status)
            })))
        }
    }
}

/// Resolves the `host:port` of every instance of the proxy service
#[async_trait]
pub trait SiblingResolver: Send + Sync {
    async fn resolve(&self, port: u16, service_name: &str) -> Result<Vec<String>>;
}

/// Swarm: every task behind `tasks.<service_name>`, self included
pub struct DnsSiblings;

#[async_trait]
impl SiblingResolver for DnsSiblings {
    async fn resolve(&self, port: u16, service_name: &str) -> Result<Vec<String>> {
        let host = format!("tasks.{}:{}", service_name, port);
        let lookup = tokio::net::lookup_host(host.as_str()).await;
        let siblings = match lookup {
            Ok(addrs) => {
                let mut siblings: Vec<String> = addrs.map(|a| a.to_string()).collect();
                siblings.sort();
                siblings.dedup();
                siblings
            }
            Err(e) => {
                warn!(host = %host, error = %e, "Sibling lookup failed");
                Vec::new()
            }
        };
        Ok(siblings)
    }
}

/// Instances registered in the registry catalog
pub struct RegistrySiblings {
    registry: Arc<dyn RegistryClient>,
    addresses: Vec<String>,
}

impl RegistrySiblings {
    pub fn new(registry: Arc<dyn RegistryClient>, addresses: Vec<String>) -> Self {
        Self {
            registry,
            addresses,
        }
    }
}

#[async_trait]
impl SiblingResolver for RegistrySiblings {
    async fn resolve(&self, _port: u16, service_name: &str) -> Result<Vec<String>> {
        self.registry
            .sibling_addresses(&self.addresses, service_name)
            .await
            .map_err(|e| ProxyError::Distribution(format!("failed to resolve siblings: {}", e)))
    }
}

/// Fixed peer list; entries without a port use the instance port
pub struct StaticSiblings {
    peers: Vec<String>,
}

impl StaticSiblings {
    pub fn new(peers: Vec<String>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl SiblingResolver for StaticSiblings {
    async fn resolve(&self, port: u16, _service_name: &str) -> Result<Vec<String>> {
        Ok(self
            .peers
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(|p| with_port(p, port))
            .collect())
    }
}

/// Append `port` unless the peer already names one. Bare IPv6 addresses
/// get bracketed; `[addr]:port` and `host:port` are kept as given.
fn with_port(peer: &str, port: u16) -> String {
    if peer.parse::<SocketAddr>().is_ok() {
        return peer.to_string();
    }
    if let Ok(ip) = peer.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    match peer.rsplit_once(':') {
        Some((_, p)) if p.parse::<u16>().is_ok() => peer.to_string(),
        _ => format!("{}:{}", peer, port),
    }
}

/// Pick the resolver matching the operating mode and configuration
pub fn resolver_for(config: &InstanceConfig, registry: Arc<dyn RegistryClient>) -> Arc<dyn SiblingResolver> {
    if config.mode == Mode::Swarm {
        Arc::new(DnsSiblings)
    } else if config.has_registry() {
        Arc::new(RegistrySiblings::new(registry, config.registry_addresses.clone()))
    } else {
        Arc::new(StaticSiblings::new(config.distribute.peers.clone()))
    }
}

/// Fans mutating requests out to siblings
pub struct Distributor {
    resolver: Arc<dyn SiblingResolver>,
    client: reqwest::Client,
}

impl Distributor {
    /// Every sibling call is bounded by `timeout`
    pub fn new(resolver: Arc<dyn SiblingResolver>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Distribution(e.to_string()))?;
        Ok(Self { resolver, client })
    }

    /// Send `request` to every sibling concurrently and aggregate the results.
    /// Without resolvable siblings the request goes to this instance over loopback.
    pub async fn distribute(
        &self,
        request: &MutationRequest,
        port: u16,
        service_name: &str,
    ) -> Result<DistributionOutcome> {
        let mut siblings = self.resolver.resolve(port, service_name).await?;
        if siblings.is_empty() {
            debug!(port, "No siblings resolved, distributing over loopback");
            siblings.push(format!("127.0.0.1:{}", port));
        }

        let forwarded = request.for_sibling();
        let calls = siblings.iter().map(|sibling| self.send(&forwarded, sibling));
        let outcome = DistributionOutcome::aggregate(futures::future::join_all(calls).await);

        if outcome.is_success() {
            info!(
                path = %request.path,
                siblings = outcome.results.len(),
                "Request distributed"
            );
        } else {
            warn!(
                path = %request.path,
                siblings = outcome.results.len(),
                status = outcome.status,
                error = outcome.error.as_deref().unwrap_or_default(),
                "Distribution failed"
            );
        }
        Ok(outcome)
    }

    async fn send(&self, request: &MutationRequest, sibling: &str) -> SiblingResult {
        let url = request.url(sibling);
        let response = self
            .client
            .request(request.method.clone(), &url)
            .body(request.body.clone())
            .send()
            .await;

        let result = match response {
            Ok(response) => {
                let status = response.status().as_u16();
                let error = if status >= 300 {
                    let body = response.text().await.unwrap_or_default();
                    Some(sibling_message(status, &body))
                } else {
                    None
                };
                SiblingResult {
                    address: sibling.to_string(),
                    status: Some(status),
                    error,
                }
            }
            Err(e) => SiblingResult {
                address: sibling.to_string(),
                status: None,
                error: Some(e.to_string()),
            },
        };
        debug!(
            sibling = %result.address,
            status = ?result.status,
            error = result.error.as_deref().unwrap_or_default(),
            "Sibling answered"
        );
        result
    }
}

/// Prefer the `Message` of the sibling's JSON envelope over the raw body
fn sibling_message(status: u16, body: &str) -> String {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("Message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    if message.is_empty() {
        format!("responded with status {}", status)
    } else {
        format!("responded with status {}: {}", status, message)
    }
}
