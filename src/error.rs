//! Error taxonomy of the control plane and its HTTP status mapping

use crate::certs::CertError;
use crate::engine::EngineError;
use crate::registry::RegistryError;
use hyper::StatusCode;
use serde::Serialize;

/// Stage of the mutation lifecycle a failure occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// The request was checked against the definition invariants
    Validated,
    /// A certificate attached to the request was written
    CertInstalled,
    /// Service attributes were written to (or removed from) the registry
    RegistryPersisted,
    /// The engine configuration was rendered
    ConfigRendered,
    /// The engine accepted and loaded the configuration
    EngineReloaded,
    /// The request was replayed against sibling instances
    Distributed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validated => "validated",
            Stage::CertInstalled => "cert_installed",
            Stage::RegistryPersisted => "registry_persisted",
            Stage::ConfigRendered => "config_rendered",
            Stage::EngineReloaded => "engine_reloaded",
            Stage::Distributed => "distributed",
        }
    }
}

/// Errors surfaced by reconfigure, remove, certificate and distribution requests
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The request does not describe a valid service; caused by the client
    #[error("{0}")]
    InvalidDefinition(String),

    #[error(transparent)]
    Certificate(#[from] CertError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// One or more siblings were unreachable or rejected the request
    #[error("{0}")]
    Distribution(String),
}

impl ProxyError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ProxyError::InvalidDefinition(message.into())
    }

    /// Lifecycle stage the error belongs to
    pub fn stage(&self) -> Stage {
        match self {
            ProxyError::InvalidDefinition(_) => Stage::Validated,
            ProxyError::Certificate(_) => Stage::CertInstalled,
            ProxyError::Registry(_) => Stage::RegistryPersisted,
            ProxyError::Engine(EngineError::Render(_)) | ProxyError::Engine(EngineError::Io(_)) => {
                Stage::ConfigRendered
            }
            ProxyError::Engine(_) => Stage::EngineReloaded,
            ProxyError::Distribution(_) => Stage::Distributed,
        }
    }

    /// HTTP status reported to the caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
