//! Client of the orchestrator service listener

use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("listener request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("listener returned {0}")]
    Status(reqwest::StatusCode),
}

/// Service as reported by the listener inventory
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListedService {
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Path")]
    pub path: String,
}

pub struct ListenerClient {
    base_url: String,
    client: reqwest::Client,
}

impl ListenerClient {
    /// `base_url` is the listener root, e.g. `http://swarm-listener:8080`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ListenerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Inventory of every service the listener knows about
    pub async fn services(&self) -> Result<Vec<ListedService>, ListenerError> {
        let url = format!("{}/v1/docker-flow-swarm-listener/services", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ListenerError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    /// Ask the listener to resend a reconfigure request for every service
    pub async fn notify_services(&self) -> Result<(), ListenerError> {
        let url = format!("{}/v1/docker-flow-swarm-listener/notify-services", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ListenerError::Status(response.status()));
        }
        debug!(listener = %self.base_url, "Listener notified");
        Ok(())
    }
}

/// HTML inventory page served by `/v1/docker-flow-proxy/services`
pub fn render_services_page(services: &[ListedService]) -> String {
    if services.is_empty() {
        return "<h2>There are no services deployed in this cluster</h2></p>".to_string();
    }
    let mut page = String::from("<h2>Services deployed in this cluster</h2></p><ul>");
    for service in services {
        page.push_str(&format!("<li>{} --> {}</li>", service.name, service.path));
    }
    page.push_str("</ul>");
    page
}
