//! Load balancing engine: configuration rendering and process lifecycle

pub mod haproxy;
pub mod render;

pub use haproxy::HaProxyController;
pub use render::ConfigRenderer;

use crate::service::ServiceDefinition;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The configuration could not be produced from the service set
    #[error("failed to render configuration: {0}")]
    Render(String),

    /// The engine rejected the rendered configuration
    #[error("configuration rejected by the engine: {0}")]
    Validation(String),

    /// The engine could not be (re)started with the new configuration
    #[error("failed to reload the engine: {0}")]
    Reload(String),

    #[error("engine io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owner of the rendered configuration file and the engine process
#[async_trait]
pub trait EngineController: Send + Sync {
    /// Render the full configuration for `services`, check it with the
    /// engine and put it live. On failure the live configuration is untouched.
    async fn render_and_reload(&self, services: &[ServiceDefinition]) -> Result<(), EngineError>;

    /// Currently live configuration text
    async fn read_config(&self) -> Result<String, EngineError>;

    /// Make a stored certificate available to the next render
    fn add_cert(&self, name: &str, path: &Path);

    /// Certificates known to the engine, by name
    fn get_certs(&self) -> BTreeMap<String, PathBuf>;
}
