use clap::{Args, Parser, Subcommand};
use flowproxy::api::{ApiServer, AppState};
use flowproxy::certs::{import_from_siblings, CertStore, FsCertStore};
use flowproxy::config::{InstanceConfig, Mode};
use flowproxy::distribute::{resolver_for, Distributor};
use flowproxy::engine::{EngineController, HaProxyController};
use flowproxy::reconfigure::{ConfigSync, Reconfigure};
use flowproxy::registry::{ConsulRegistry, FileRegistry, RegistryClient};
use flowproxy::remove::{Remove, RemoveRequest};
use flowproxy::service::{Query, ServiceDefinition};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "flowproxy", version, about = "Control plane for a cluster of HAProxy instances")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API
    Server {
        #[command(flatten)]
        common: CommonArgs,

        /// IP the API listens on
        #[arg(short, long, env = "IP")]
        ip: Option<String>,

        /// Port the API listens on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// Address of the swarm listener (its service name, e.g. swarm-listener)
        #[arg(short, long, env = "LISTENER_ADDRESS")]
        listener_address: Option<String>,

        /// Name of the proxy service; siblings are resolved through it
        #[arg(short = 'n', long, env = "SERVICE_NAME")]
        service_name: Option<String>,
    },

    /// Apply a single service change and exit
    Reconfigure {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Remove a single service and exit
    Remove {
        #[command(flatten)]
        common: CommonArgs,

        /// Name of the service to remove
        #[arg(short, long)]
        service_name: String,

        /// ACL the service was registered with
        #[arg(long, default_value = "")]
        acl_name: String,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Operating mode: default, service or swarm
    #[arg(short, long, env = "MODE")]
    mode: Option<String>,

    /// Registry namespace of this proxy cluster
    #[arg(long, env = "PROXY_INSTANCE_NAME")]
    proxy_instance_name: Option<String>,

    /// Directory holding haproxy.tmpl and template fragments
    #[arg(short, long, env = "TEMPLATES_PATH")]
    templates_path: Option<PathBuf>,

    /// Directory the rendered configuration is written to
    #[arg(short, long, env = "CONFIGS_PATH")]
    configs_path: Option<PathBuf>,

    /// Directory certificates are stored in
    #[arg(long, env = "CERTS_PATH")]
    certs_path: Option<PathBuf>,

    /// Directory of the file registry
    #[arg(long, env = "STATE_PATH")]
    state_path: Option<PathBuf>,

    /// Comma separated Consul addresses
    #[arg(long, env = "CONSUL_ADDRESS")]
    consul_address: Option<String>,

    /// HAProxy executable
    #[arg(long, env = "ENGINE_BINARY")]
    engine_binary: Option<String>,

    /// Per-sibling timeout in seconds
    #[arg(long, env = "DISTRIBUTE_TIMEOUT")]
    distribute_timeout: Option<u64>,

    /// Comma separated sibling addresses
    #[arg(long, env = "PEERS")]
    peers: Option<String>,
}

impl CommonArgs {
    /// Defaults, then the TOML file, then environment and flags
    fn load(&self) -> anyhow::Result<InstanceConfig> {
        let mut config = match &self.config {
            Some(path) => InstanceConfig::load(path)?,
            None => InstanceConfig::default(),
        };
        if let Some(mode) = &self.mode {
            config.mode = Mode::parse(mode);
        }
        if let Some(name) = &self.proxy_instance_name {
            config.instance_name = name.clone();
        }
        if let Some(path) = &self.templates_path {
            config.templates_path = path.clone();
        }
        if let Some(path) = &self.configs_path {
            config.configs_path = path.clone();
        }
        if let Some(path) = &self.certs_path {
            config.certs_path = path.clone();
        }
        if let Some(path) = &self.state_path {
            config.state_path = path.clone();
        }
        if let Some(addresses) = &self.consul_address {
            config.set_registry_addresses(addresses);
        }
        if let Some(binary) = &self.engine_binary {
            config.engine.binary = binary.clone();
        }
        if let Some(timeout) = self.distribute_timeout {
            config.distribute.timeout_secs = timeout;
        }
        if let Some(peers) = &self.peers {
            config.distribute.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(config)
    }
}

#[derive(Args)]
struct ServiceArgs {
    /// Name of the service
    #[arg(short, long)]
    service_name: String,

    /// Comma separated path prefixes
    #[arg(long)]
    service_path: Option<String>,

    /// Comma separated domains
    #[arg(long)]
    service_domain: Option<String>,

    #[arg(long)]
    service_color: Option<String>,

    /// Certificate bundle, newlines may be escaped as \n
    #[arg(long)]
    service_cert: Option<String>,

    /// Port the service listens on
    #[arg(short, long)]
    port: Option<String>,

    #[arg(long)]
    https_port: Option<String>,

    #[arg(long)]
    path_type: Option<String>,

    #[arg(long)]
    skip_check: bool,

    #[arg(long)]
    outbound_hostname: Option<String>,

    #[arg(long)]
    acl_name: Option<String>,

    /// Comma separated user:password pairs
    #[arg(long)]
    users: Option<String>,

    #[arg(long)]
    req_rep_search: Option<String>,

    #[arg(long)]
    req_rep_replace: Option<String>,

    #[arg(long)]
    template_fe_path: Option<String>,

    #[arg(long)]
    template_be_path: Option<String>,

    #[arg(long)]
    consul_template_fe_path: Option<String>,

    #[arg(long)]
    consul_template_be_path: Option<String>,
}

impl ServiceArgs {
    /// Express the flags as reconfigure query parameters
    fn to_query(&self) -> Query {
        let optional = [
            ("servicePath", &self.service_path),
            ("serviceDomain", &self.service_domain),
            ("serviceColor", &self.service_color),
            ("serviceCert", &self.service_cert),
            ("port", &self.port),
            ("httpsPort", &self.https_port),
            ("pathType", &self.path_type),
            ("outboundHostname", &self.outbound_hostname),
            ("aclName", &self.acl_name),
            ("users", &self.users),
            ("reqRepSearch", &self.req_rep_search),
            ("reqRepReplace", &self.req_rep_replace),
            ("templateFePath", &self.template_fe_path),
            ("templateBePath", &self.template_be_path),
            ("consulTemplateFePath", &self.consul_template_fe_path),
            ("consulTemplateBePath", &self.consul_template_be_path),
        ];
        let mut pairs = vec![("serviceName", self.service_name.clone())];
        pairs.extend(
            optional
                .into_iter()
                .filter_map(|(key, value)| value.clone().map(|v| (key, v))),
        );
        if self.skip_check {
            pairs.push(("skipCheck", "true".to_string()));
        }
        Query::from_pairs(pairs)
    }
}

/// Components shared by every command
struct Runtime {
    config: Arc<InstanceConfig>,
    registry: Arc<dyn RegistryClient>,
    certs: Arc<FsCertStore>,
    engine: Arc<HaProxyController>,
    sync: Arc<ConfigSync>,
    reconfigure: Arc<Reconfigure>,
}

impl Runtime {
    fn build(config: InstanceConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let registry: Arc<dyn RegistryClient> = if config.has_registry() {
            info!(addresses = ?config.registry_addresses, "Using Consul registry");
            Arc::new(ConsulRegistry::new(config.distribute.timeout())?)
        } else {
            info!(path = %config.state_path.display(), "Using file registry");
            Arc::new(FileRegistry::new(config.state_path.clone()))
        };

        let certs = Arc::new(FsCertStore::open(config.certs_path.clone())?);
        let engine = Arc::new(HaProxyController::new(&config));
        register_certs(&certs, engine.as_ref());

        let sync = Arc::new(ConfigSync::new(registry.clone(), engine.clone()));
        let reconfigure = Arc::new(Reconfigure::new(config.clone(), sync.clone(), certs.clone()));

        Ok(Self {
            config,
            registry,
            certs,
            engine,
            sync,
            reconfigure,
        })
    }

    fn remove(&self) -> Remove {
        Remove::new(self.config.clone(), self.sync.clone())
    }
}

fn register_certs(certs: &FsCertStore, engine: &dyn EngineController) {
    for (name, path) in certs.cert_paths() {
        engine.add_cert(&name, &path);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flowproxy=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Server {
            common,
            ip,
            port,
            listener_address,
            service_name,
        } => {
            let mut config = common.load()?;
            if let Some(ip) = ip {
                config.ip = ip;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(listener) = listener_address {
                config.listener_address = Some(listener);
            }
            if let Some(name) = service_name {
                config.service_name = name;
            }
            run_server(config).await
        }
        Command::Reconfigure { common, service } => {
            let runtime = Runtime::build(common.load()?)?;
            let definition = ServiceDefinition::from_query(&service.to_query(), runtime.config.mode)?;
            let stored = runtime.reconfigure.reconfigure(definition).await.map_err(|e| {
                error!(stage = e.stage().as_str(), error = %e, "Reconfigure failed");
                e
            })?;
            info!(service = %stored.service_name, "Reconfigure applied");
            Ok(())
        }
        Command::Remove {
            common,
            service_name,
            acl_name,
        } => {
            let runtime = Runtime::build(common.load()?)?;
            let request = RemoveRequest {
                service_name,
                acl_name,
            };
            runtime.remove().remove(&request).await.map_err(|e| {
                error!(stage = e.stage().as_str(), error = %e, "Remove failed");
                e
            })?;
            Ok(())
        }
    }
}

async fn run_server(config: InstanceConfig) -> anyhow::Result<()> {
    let runtime = Runtime::build(config)?;
    let config = runtime.config.clone();
    info!(
        mode = config.mode.as_str(),
        instance = %config.instance_name,
        service = %config.service_name,
        "Starting flowproxy"
    );

    let resolver = resolver_for(&config, runtime.registry.clone());

    // New instances join with the certificates of the cluster
    if runtime.certs.is_empty() {
        let siblings = match resolver.resolve(config.port, &config.service_name).await {
            Ok(siblings) => siblings,
            Err(e) => {
                warn!(error = %e, "Could not resolve siblings, starting without their certificates");
                Vec::new()
            }
        };
        match import_from_siblings(runtime.certs.as_ref(), &siblings, config.distribute.timeout()).await {
            Ok(0) => {}
            Ok(_) => register_certs(&runtime.certs, runtime.engine.as_ref()),
            Err(e) => warn!(error = %e, "Certificate import failed"),
        }
    }

    let listener_url = config.listener_url();
    runtime
        .reconfigure
        .reload_all_services(
            &config.registry_addresses,
            &config.instance_name,
            config.mode,
            listener_url.as_deref(),
        )
        .await
        .map_err(|e| {
            error!(stage = e.stage().as_str(), error = %e, "Initial configuration failed");
            e
        })?;

    let distributor = Distributor::new(resolver, config.distribute.timeout())?;
    let certs: Arc<dyn CertStore> = runtime.certs.clone();
    let state = Arc::new(AppState {
        config: config.clone(),
        reconfigure: runtime.reconfigure.clone(),
        remove: Arc::new(runtime.remove()),
        distributor: Arc::new(distributor),
        certs,
        engine: runtime.engine.clone(),
    });

    let bind_addr: SocketAddr = config.bind_address().parse()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ApiServer::new(bind_addr, state, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "API server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), server_handle).await.is_err() {
        warn!("API server did not stop in time");
    }
    Ok(())
}
