use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Operating mode of the proxy instance
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Services are registered by hand or through the registry (default)
    #[default]
    Default,
    /// Docker services, addressed by service name
    Service,
    /// Docker Swarm, siblings discovered through `tasks.<service_name>`
    Swarm,
}

impl Mode {
    /// Parse a mode name, case-insensitively. Unknown names fall back to `Default`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "service" => Mode::Service,
            "swarm" => Mode::Swarm,
            _ => Mode::Default,
        }
    }

    /// Whether reconfigure requests must carry an explicit port
    pub fn requires_port(&self) -> bool {
        matches!(self, Mode::Service | Mode::Swarm)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Default => "default",
            Mode::Service => "service",
            Mode::Swarm => "swarm",
        }
    }
}

/// Per-process configuration shared by every request
#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    /// IP the HTTP frontend listens on (default: 0.0.0.0)
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Port the HTTP frontend listens on (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Operating mode: "default", "service" or "swarm"
    #[serde(default)]
    pub mode: Mode,

    /// Address of the service listener (a swarm service name, e.g. "swarm-listener")
    pub listener_address: Option<String>,

    /// Name of the proxy service; siblings are resolved through it
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Registry namespace of this proxy cluster
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Directory holding haproxy.tmpl and custom template fragments
    #[serde(default = "default_templates_path")]
    pub templates_path: PathBuf,

    /// Directory the rendered haproxy.cfg is written to
    #[serde(default = "default_configs_path")]
    pub configs_path: PathBuf,

    /// Directory certificates are stored in
    #[serde(default = "default_certs_path")]
    pub certs_path: PathBuf,

    /// Directory of the file registry, used when no registry address is configured
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Registry (Consul) endpoints, normalized to carry a scheme
    #[serde(default, deserialize_with = "deserialize_registry_addresses")]
    pub registry_addresses: Vec<String>,

    /// Load balancing engine settings
    #[serde(default)]
    pub engine: EngineSettings,

    /// Sibling distribution settings
    #[serde(default)]
    pub distribute: DistributeSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    /// Engine executable (default: haproxy)
    #[serde(default = "default_engine_binary")]
    pub binary: String,

    /// PID file the engine writes when daemonized
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Upper bound for a single engine invocation (check or reload)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl EngineSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            pid_file: default_pid_file(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DistributeSettings {
    /// Per-sibling transport timeout in seconds (default: 5)
    #[serde(default = "default_distribute_timeout")]
    pub timeout_secs: u64,

    /// Fixed sibling addresses (host:port), used outside swarm mode without a registry
    #[serde(default)]
    pub peers: Vec<String>,
}

impl DistributeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DistributeSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_distribute_timeout(),
            peers: Vec::new(),
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            mode: Mode::default(),
            listener_address: None,
            service_name: default_service_name(),
            instance_name: default_instance_name(),
            templates_path: default_templates_path(),
            configs_path: default_configs_path(),
            certs_path: default_certs_path(),
            state_path: default_state_path(),
            registry_addresses: Vec::new(),
            engine: EngineSettings::default(),
            distribute: DistributeSettings::default(),
        }
    }
}

impl InstanceConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instance_name.trim().is_empty() {
            anyhow::bail!("instance_name must not be empty");
        }
        if self.service_name.trim().is_empty() {
            anyhow::bail!("service_name must not be empty");
        }
        if self.port == 0 {
            anyhow::bail!("port must not be 0");
        }
        Ok(())
    }

    /// Address the HTTP frontend binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Base URL of the service listener, if one is configured
    pub fn listener_url(&self) -> Option<String> {
        self.listener_address
            .as_deref()
            .filter(|a| !a.is_empty())
            .map(|a| format!("http://{}:8080", a))
    }

    /// Replace the registry endpoints from a comma separated list
    pub fn set_registry_addresses(&mut self, raw: &str) {
        self.registry_addresses = normalize_registry_addresses(raw.split(','));
    }

    /// Whether a remote registry is configured
    pub fn has_registry(&self) -> bool {
        !self.registry_addresses.is_empty()
    }
}

/// Trim, drop empty entries and prefix `http://` where no scheme is present
pub fn normalize_registry_addresses<I, S>(addresses: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    addresses
        .into_iter()
        .map(|a| a.as_ref().trim().to_string())
        .filter(|a| !a.is_empty())
        .map(|a| {
            if a.starts_with("http") {
                a
            } else {
                format!("http://{}", a)
            }
        })
        .collect()
}

fn deserialize_registry_addresses<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(normalize_registry_addresses(raw))
}

fn default_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_service_name() -> String {
    "proxy".to_string()
}

fn default_instance_name() -> String {
    "docker-flow".to_string()
}

fn default_templates_path() -> PathBuf {
    PathBuf::from("/cfg/tmpl")
}

fn default_configs_path() -> PathBuf {
    PathBuf::from("/cfg")
}

fn default_certs_path() -> PathBuf {
    PathBuf::from("/certs")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/cfg/registry")
}

fn default_engine_binary() -> String {
    "haproxy".to_string()
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/var/run/haproxy.pid")
}

fn default_command_timeout() -> u64 {
    10
}

fn default_distribute_timeout() -> u64 {
    5
}
