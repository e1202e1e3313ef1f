use super::{ConfigRenderer, EngineController, EngineError};
use crate::config::InstanceConfig;
use crate::service::ServiceDefinition;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CONFIG_FILE: &str = "haproxy.cfg";
const HEADER_TEMPLATE: &str = "haproxy.tmpl";

/// Drives an HAProxy process through its command line
pub struct HaProxyController {
    binary: String,
    templates_path: PathBuf,
    configs_path: PathBuf,
    pid_file: PathBuf,
    command_timeout: Duration,
    certs: RwLock<BTreeMap<String, PathBuf>>,
    swap: Mutex<()>,
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let text = format!("{}\n{}", stdout.trim(), stderr.trim());
    let text = text.trim();
    if text.is_empty() {
        format!("exited with {}", output.status)
    } else {
        text.to_string()
    }
}

fn write_atomic(dir: &Path, target: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

impl HaProxyController {
    pub fn new(config: &InstanceConfig) -> Self {
        Self {
            binary: config.engine.binary.clone(),
            templates_path: config.templates_path.clone(),
            configs_path: config.configs_path.clone(),
            pid_file: config.engine.pid_file.clone(),
            command_timeout: config.engine.command_timeout(),
            certs: RwLock::new(BTreeMap::new()),
            swap: Mutex::new(()),
        }
    }

    /// Path of the live configuration file
    pub fn config_path(&self) -> PathBuf {
        self.configs_path.join(CONFIG_FILE)
    }

    fn template_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.templates_path.join(path)
        }
    }

    async fn renderer(&self) -> Result<ConfigRenderer, EngineError> {
        let path = self.templates_path.join(HEADER_TEMPLATE);
        match tokio::fs::read_to_string(&path).await {
            Ok(header) => Ok(ConfigRenderer::new(header)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigRenderer::default()),
            Err(e) => Err(EngineError::Render(format!("{}: {}", path.display(), e))),
        }
    }

    async fn fragments(
        &self,
        services: &[ServiceDefinition],
    ) -> Result<BTreeMap<String, String>, EngineError> {
        let mut paths: Vec<String> = Vec::new();
        for service in services {
            for path in [service.frontend_template(), service.backend_template()]
                .into_iter()
                .flatten()
            {
                if !paths.iter().any(|p| p == path) {
                    paths.push(path.to_string());
                }
            }
        }

        let mut fragments = BTreeMap::new();
        for path in paths {
            let file = self.template_path(&path);
            let content = tokio::fs::read_to_string(&file)
                .await
                .map_err(|e| EngineError::Render(format!("{}: {}", file.display(), e)))?;
            fragments.insert(path, content);
        }
        Ok(fragments)
    }

    async fn run(&self, args: &[&str]) -> Result<Output, String> {
        debug!(binary = %self.binary, ?args, "Running engine command");
        let command = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.command_timeout, command).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(format!("failed to run {}: {}", self.binary, e)),
            Err(_) => Err(format!(
                "{} did not finish within {:?}",
                self.binary, self.command_timeout
            )),
        }
    }

    async fn check(&self, file: &Path) -> Result<(), EngineError> {
        let file = file.to_string_lossy().into_owned();
        let output = self
            .run(&["-c", "-f", file.as_str()])
            .await
            .map_err(EngineError::Validation)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EngineError::Validation(combined_output(&output)))
        }
    }

    async fn reload(&self) -> Result<(), EngineError> {
        let config = self.config_path().to_string_lossy().into_owned();
        let pid_file = self.pid_file.to_string_lossy().into_owned();
        let old_pid = tokio::fs::read_to_string(&self.pid_file)
            .await
            .ok()
            .map(|pid| pid.trim().to_string())
            .filter(|pid| !pid.is_empty());

        let mut args = vec!["-f", config.as_str(), "-D", "-p", pid_file.as_str()];
        if let Some(pid) = old_pid.as_deref() {
            args.push("-sf");
            args.push(pid);
        }
        let output = self.run(&args).await.map_err(EngineError::Reload)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EngineError::Reload(combined_output(&output)))
        }
    }
}

#[async_trait]
impl EngineController for HaProxyController {
    async fn render_and_reload(&self, services: &[ServiceDefinition]) -> Result<(), EngineError> {
        let _swap = self.swap.lock().await;

        let renderer = self.renderer().await?;
        let fragments = self.fragments(services).await?;
        let certs = self.get_certs();
        let content = renderer.render(services, &certs, &fragments)?;

        std::fs::create_dir_all(&self.configs_path)?;
        let mut candidate = tempfile::NamedTempFile::new_in(&self.configs_path)?;
        candidate.write_all(content.as_bytes())?;
        candidate.flush()?;

        if let Err(e) = self.check(candidate.path()).await {
            warn!(error = %e, "Rendered configuration failed the engine check");
            return Err(e);
        }

        let live = self.config_path();
        let previous = match std::fs::read(&live) {
            Ok(previous) => Some(previous),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        candidate.persist(&live).map_err(|e| EngineError::Io(e.error))?;

        if let Err(e) = self.reload().await {
            warn!(error = %e, "Engine reload failed, restoring previous configuration");
            let restored = match &previous {
                Some(previous) => write_atomic(&self.configs_path, &live, previous),
                None => std::fs::remove_file(&live),
            };
            if let Err(restore) = restored {
                warn!(error = %restore, "Failed to restore previous configuration");
            }
            return Err(e);
        }

        info!(services = services.len(), path = %live.display(), "Engine reloaded");
        Ok(())
    }

    async fn read_config(&self) -> Result<String, EngineError> {
        Ok(tokio::fs::read_to_string(self.config_path()).await?)
    }

    fn add_cert(&self, name: &str, path: &Path) {
        self.certs.write().insert(name.to_string(), path.to_path_buf());
    }

    fn get_certs(&self) -> BTreeMap<String, PathBuf> {
        self.certs.read().clone()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn controller(dir: &Path, binary: &str) -> HaProxyController {
        let config = InstanceConfig {
            templates_path: dir.join("tmpl"),
            configs_path: dir.join("cfg"),
            engine: crate::config::EngineSettings {
                binary: binary.to_string(),
                pid_file: dir.join("haproxy.pid"),
                command_timeout_secs: 5,
            },
            ..InstanceConfig::default()
        };
        HaProxyController::new(&config)
    }

    fn web() -> ServiceDefinition {
        let mut def = ServiceDefinition::named("web");
        def.service_path = vec!["/api".into()];
        def.port = "8080".into();
        def.normalize();
        def
    }

    #[tokio::test]
    async fn test_render_and_reload_writes_config() {
        let dir = tempfile::tempdir().unwrap();
        let engine = controller(dir.path(), "true");

        engine.render_and_reload(&[web()]).await.unwrap();

        let config = engine.read_config().await.unwrap();
        assert!(config.contains("backend web-be8080"));
        assert_eq!(config, std::fs::read_to_string(engine.config_path()).unwrap());
    }

    #[tokio::test]
    async fn test_failed_check_keeps_live_config() {
        let dir = tempfile::tempdir().unwrap();
        let engine = controller(dir.path(), "true");
        engine.render_and_reload(&[web()]).await.unwrap();
        let before = engine.read_config().await.unwrap();

        let failing = controller(dir.path(), "false");
        let err = failing.render_and_reload(&[]).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(failing.read_config().await.unwrap(), before);

        // Only the live file is left behind
        let entries = std::fs::read_dir(dir.path().join("cfg")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_failed_reload_restores_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("engine.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nif [ \"$1\" = \"-c\" ]; then exit 0; fi\necho 'cannot bind socket' >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = controller(dir.path(), "true");
        engine.render_and_reload(&[web()]).await.unwrap();
        let before = engine.read_config().await.unwrap();

        let failing = controller(dir.path(), script.to_str().unwrap());
        let err = failing.render_and_reload(&[]).await.unwrap_err();
        match err {
            EngineError::Reload(message) => assert!(message.contains("cannot bind socket")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(failing.read_config().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_header_template_and_certs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tmpl")).unwrap();
        std::fs::write(dir.path().join("tmpl/haproxy.tmpl"), "global\n    maxconn 10\n").unwrap();
        std::fs::write(dir.path().join("tmpl/web-be.tmpl"), "backend custom-{{.ServiceName}}\n").unwrap();

        let engine = controller(dir.path(), "true");
        engine.add_cert("web.pem", Path::new("/certs/web.pem"));
        assert_eq!(engine.get_certs().len(), 1);

        let mut def = web();
        def.template_be_path = "web-be.tmpl".into();
        engine.render_and_reload(&[def]).await.unwrap();

        let config = engine.read_config().await.unwrap();
        assert!(config.starts_with("global\n    maxconn 10\n"));
        assert!(config.contains("bind *:443 ssl crt /certs/web.pem"));
        assert!(config.contains("backend custom-web"));
    }

    #[tokio::test]
    async fn test_shared_fragment_and_missing_fragment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tmpl")).unwrap();
        std::fs::write(dir.path().join("tmpl/shared-be.tmpl"), "backend shared-{{.ServiceName}}\n").unwrap();
        let engine = controller(dir.path(), "true");

        let mut web = web();
        web.template_be_path = "shared-be.tmpl".into();
        let mut api = ServiceDefinition::named("api");
        api.service_path = vec!["/v1".into()];
        api.port = "9000".into();
        api.consul_template_be_path = "shared-be.tmpl".into();
        api.normalize();

        engine.render_and_reload(&[web.clone(), api]).await.unwrap();
        let config = engine.read_config().await.unwrap();
        assert!(config.contains("backend shared-web"));
        assert!(config.contains("backend shared-api"));

        web.template_be_path = "missing-be.tmpl".into();
        let err = engine.render_and_reload(&[web]).await.unwrap_err();
        assert!(matches!(err, EngineError::Render(ref m) if m.contains("missing-be.tmpl")));
        assert!(engine.read_config().await.unwrap().contains("backend shared-api"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = controller(dir.path(), "/nonexistent/haproxy");
        let err = engine.render_and_reload(&[web()]).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(engine.read_config().await.is_err());
    }
}
