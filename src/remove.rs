use crate::config::InstanceConfig;
use crate::error::{ProxyError, Result};
use crate::reconfigure::ConfigSync;
use crate::service::SERVICE_NAME_MANDATORY_MESSAGE;
use std::sync::Arc;
use tracing::info;

/// A request to drop a service from the instance
#[derive(Debug, Clone, Default)]
pub struct RemoveRequest {
    pub service_name: String,
    /// ACL the service was registered with. Frontend ACLs are regenerated from
    /// the remaining services, so it is only reported back.
    pub acl_name: String,
}

impl RemoveRequest {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            acl_name: String::new(),
        }
    }
}

/// Deletes a service from the registry and rebuilds without it
pub struct Remove {
    config: Arc<InstanceConfig>,
    sync: Arc<ConfigSync>,
}

impl Remove {
    pub fn new(config: Arc<InstanceConfig>, sync: Arc<ConfigSync>) -> Self {
        Self { config, sync }
    }

    /// Removing a service that is not registered succeeds
    pub async fn remove(&self, request: &RemoveRequest) -> Result<()> {
        let name = request.service_name.trim();
        if name.is_empty() {
            return Err(ProxyError::invalid(SERVICE_NAME_MANDATORY_MESSAGE));
        }

        let addresses = &self.config.registry_addresses;
        let instance = &self.config.instance_name;
        self.sync
            .registry()
            .delete_service(addresses, instance, name)
            .await?;
        let remaining = self.sync.rebuild(addresses, instance, self.config.mode).await?;

        info!(service = %name, acl = %request.acl_name, remaining, "Service removed");
        Ok(())
    }
}
