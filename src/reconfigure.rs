//! Service registration and full configuration rebuilds

use crate::certs::{CertError, CertStore};
use crate::config::{InstanceConfig, Mode};
use crate::engine::EngineController;
use crate::error::Result;
use crate::listener::ListenerClient;
use crate::registry::RegistryClient;
use crate::service::ServiceDefinition;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The single read-render-reload boundary of an instance.
///
/// Registry writes happen outside of it; every rebuild reads the complete
/// service set back from the registry while holding the lock, so two
/// rebuilds never interleave.
pub struct ConfigSync {
    registry: Arc<dyn RegistryClient>,
    engine: Arc<dyn EngineController>,
    lock: Mutex<()>,
}

impl ConfigSync {
    pub fn new(registry: Arc<dyn RegistryClient>, engine: Arc<dyn EngineController>) -> Self {
        Self {
            registry,
            engine,
            lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn RegistryClient> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn EngineController> {
        &self.engine
    }

    /// Rebuild the engine configuration from every registered service.
    /// Returns the number of services rendered.
    pub async fn rebuild(&self, addresses: &[String], instance: &str, mode: Mode) -> Result<usize> {
        let _guard = self.lock.lock().await;

        let names = self.registry.list_services(addresses, instance).await?;
        let reads = names
            .iter()
            .map(|name| self.registry.get_service(addresses, instance, name, mode));
        let mut services = Vec::with_capacity(names.len());
        for service in futures::future::join_all(reads).await {
            if let Some(service) = service? {
                services.push(service);
            }
        }

        self.engine.render_and_reload(&services).await?;
        debug!(instance, services = services.len(), "Configuration rebuilt from registry");
        Ok(services.len())
    }
}

/// Applies one service change to this instance
pub struct Reconfigure {
    config: Arc<InstanceConfig>,
    sync: Arc<ConfigSync>,
    certs: Arc<dyn CertStore>,
}

impl Reconfigure {
    pub fn new(config: Arc<InstanceConfig>, sync: Arc<ConfigSync>, certs: Arc<dyn CertStore>) -> Self {
        Self {
            config,
            sync,
            certs,
        }
    }

    /// Validate, install the attached certificate, persist and rebuild.
    ///
    /// Returns the normalized definition as it was stored.
    pub async fn reconfigure(&self, mut service: ServiceDefinition) -> Result<ServiceDefinition> {
        service.normalize();
        service.validate(self.config.mode)?;

        if !service.service_cert.is_empty() {
            let name = service.cert_storage_name().to_string();
            service.cert_name = self.install(&name, service.service_cert.as_bytes())?;
        }

        self.sync
            .registry()
            .put_service(
                &self.config.registry_addresses,
                &self.config.instance_name,
                &service,
            )
            .await?;

        self.rebuild().await?;
        info!(service = %service.service_name, "Service reconfigured");
        Ok(service)
    }

    /// Store a certificate and rebuild so the frontend binds it
    pub async fn install_cert(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let file_name = self.install(name, content)?;
        self.rebuild().await?;
        info!(cert = %file_name, "Certificate installed");
        Ok(self.certs.dir().join(file_name))
    }

    /// Write the bundle and register it with the engine; returns the stored name.
    /// Runs before any rebuild that could reference the certificate.
    fn install(&self, name: &str, content: &[u8]) -> Result<String> {
        let path = self.certs.put_cert(name, content)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| CertError::InvalidName(path.display().to_string()))?;
        self.sync.engine().add_cert(&file_name, &path);
        Ok(file_name)
    }

    async fn rebuild(&self) -> Result<usize> {
        self.sync
            .rebuild(
                &self.config.registry_addresses,
                &self.config.instance_name,
                self.config.mode,
            )
            .await
    }

    /// Rebuild the configuration from registry state alone, then let the
    /// service listener resend its inventory in orchestrator modes.
    pub async fn reload_all_services(
        &self,
        addresses: &[String],
        instance: &str,
        mode: Mode,
        listener_address: Option<&str>,
    ) -> Result<usize> {
        let count = self.sync.rebuild(addresses, instance, mode).await?;
        info!(instance, services = count, "Configuration reloaded from registry");

        if let Some(listener) = listener_address.filter(|a| !a.is_empty()) {
            if mode.requires_port() {
                match ListenerClient::new(listener, self.config.distribute.timeout()) {
                    Ok(client) => {
                        if let Err(e) = client.notify_services().await {
                            warn!(listener, error = %e, "Failed to notify the service listener");
                        }
                    }
                    Err(e) => warn!(listener, error = %e, "Failed to create listener client"),
                }
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::FsCertStore;
    use crate::error::ProxyError;
    use crate::engine::testing::RecordingEngine;
    use crate::error::Stage;
    use crate::registry::MemoryRegistry;
    use crate::service::{Query, MANDATORY_QUERIES_MESSAGE, PORT_MANDATORY_MESSAGE};
    use std::sync::atomic::Ordering;

    struct Fixture {
        registry: Arc<MemoryRegistry>,
        engine: Arc<RecordingEngine>,
        reconfigure: Arc<Reconfigure>,
        _certs_dir: tempfile::TempDir,
    }

    fn fixture(mode: Mode) -> Fixture {
        let certs_dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let engine = Arc::new(RecordingEngine::default());
        let certs = Arc::new(FsCertStore::open(certs_dir.path()).unwrap());
        let config = Arc::new(InstanceConfig {
            mode,
            ..InstanceConfig::default()
        });
        let sync = Arc::new(ConfigSync::new(registry.clone(), engine.clone()));
        Fixture {
            registry,
            engine,
            reconfigure: Arc::new(Reconfigure::new(config, sync, certs)),
            _certs_dir: certs_dir,
        }
    }

    fn definition(query: &str) -> ServiceDefinition {
        ServiceDefinition::from_query(&Query::parse(query), Mode::Default).unwrap()
    }

    #[tokio::test]
    async fn test_empty_name_touches_nothing() {
        let f = fixture(Mode::Default);
        let err = f
            .reconfigure
            .reconfigure(definition("servicePath=/api&port=8080"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::InvalidDefinition(_)));
        assert_eq!(err.stage(), Stage::Validated);
        assert_eq!(f.registry.calls(), 0);
        assert_eq!(f.engine.render_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_path_and_template_is_invalid() {
        let f = fixture(Mode::Default);
        let err = f
            .reconfigure
            .reconfigure(definition("serviceName=web&port=8080"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), MANDATORY_QUERIES_MESSAGE);
        assert_eq!(f.registry.calls(), 0);

        // A custom frontend template stands in for the path
        f.reconfigure
            .reconfigure(definition("serviceName=web&consulTemplateFePath=/t/fe.tmpl&consulTemplateBePath=/t/be.tmpl"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_swarm_mode_requires_port() {
        let f = fixture(Mode::Swarm);
        let err = f
            .reconfigure
            .reconfigure(definition("serviceName=web&servicePath=/api"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), PORT_MANDATORY_MESSAGE);
    }

    #[tokio::test]
    async fn test_reconfigure_renders_every_registered_service() {
        let f = fixture(Mode::Default);
        f.reconfigure
            .reconfigure(definition("serviceName=api&servicePath=/api&port=3000"))
            .await
            .unwrap();
        let stored = f
            .reconfigure
            .reconfigure(definition("serviceName=web&servicePath=/web&port=8080"))
            .await
            .unwrap();

        assert_eq!(stored.acl_name, "web");
        assert_eq!(stored.path_type, "path_beg");
        let names: Vec<String> = f
            .engine
            .last_render()
            .into_iter()
            .map(|s| s.service_name)
            .collect();
        assert_eq!(names, vec!["api", "web"]);
    }

    #[tokio::test]
    async fn test_registry_state_alone_rebuilds_configuration() {
        let f = fixture(Mode::Default);
        f.reconfigure
            .reconfigure(definition("serviceName=web&servicePath=/api,/v2&port=8080"))
            .await
            .unwrap();

        // A fresh engine sees nothing but the registry
        let engine = Arc::new(RecordingEngine::default());
        let sync = Arc::new(ConfigSync::new(f.registry.clone(), engine.clone()));
        let certs_dir = tempfile::tempdir().unwrap();
        let restarted = Reconfigure::new(
            Arc::new(InstanceConfig::default()),
            sync,
            Arc::new(FsCertStore::open(certs_dir.path()).unwrap()),
        );
        let count = restarted
            .reload_all_services(&[], "docker-flow", Mode::Default, None)
            .await
            .unwrap();

        assert_eq!(count, 1);
        let rendered = engine.last_render();
        assert_eq!(rendered[0].service_name, "web");
        assert_eq!(rendered[0].service_path, vec!["/api", "/v2"]);
        assert_eq!(rendered[0].port, "8080");
    }

    #[tokio::test]
    async fn test_registry_failure_is_fatal() {
        let f = fixture(Mode::Default);
        f.registry.set_unavailable(true);
        let err = f
            .reconfigure
            .reconfigure(definition("serviceName=web&servicePath=/api"))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Stage::RegistryPersisted);
        assert_eq!(f.engine.render_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_failure_is_reported_verbatim() {
        let f = fixture(Mode::Default);
        f.engine.fail_with("[ALERT] config : parsing [/cfg/haproxy.cfg:42]");
        let err = f
            .reconfigure
            .reconfigure(definition("serviceName=web&servicePath=/api"))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Stage::EngineReloaded);
        assert!(err.to_string().contains("[ALERT] config : parsing [/cfg/haproxy.cfg:42]"));
    }

    #[tokio::test]
    async fn test_certificate_written_before_render() {
        let f = fixture(Mode::Default);
        let stored = f
            .reconfigure
            .reconfigure(definition(
                "serviceName=web&servicePath=/&serviceDomain=example.com&serviceCert=line1%5Cnline2",
            ))
            .await
            .unwrap();

        assert_eq!(stored.cert_name, "example.com.pem");
        assert_eq!(stored.service_cert, "line1\nline2");
        let certs = f.engine.get_certs();
        let path = certs.get("example.com.pem").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "line1\nline2");
    }

    #[tokio::test]
    async fn test_concurrent_reconfigures_with_certificates() {
        let f = fixture(Mode::Default);
        let mut handles = Vec::new();
        for i in 0..8 {
            let reconfigure = Arc::clone(&f.reconfigure);
            handles.push(tokio::spawn(async move {
                let query = format!("serviceName=svc{}&servicePath=/svc{}&serviceCert=cert-{}", i, i, i);
                reconfigure.reconfigure(definition(&query)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(!f.engine.overlapped.load(Ordering::SeqCst));
        assert_eq!(f.engine.get_certs().len(), 8);
        let rendered = f.engine.last_render();
        assert_eq!(rendered.len(), 8);
        assert!(rendered.iter().all(|s| !s.cert_name.is_empty()));
    }

    #[tokio::test]
    async fn test_install_cert_rebuilds() {
        let f = fixture(Mode::Default);
        let path = f.reconfigure.install_cert("edge.pem", b"bundle").await.unwrap();
        assert!(path.ends_with("edge.pem"));
        assert_eq!(f.engine.render_count(), 1);
        assert!(f.engine.get_certs().contains_key("edge.pem"));

        let err = f.reconfigure.install_cert("../edge", b"bundle").await.unwrap_err();
        assert_eq!(err.stage(), Stage::CertInstalled);
    }
}
