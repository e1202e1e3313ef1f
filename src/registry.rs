//! Registry access: the durable source of truth for registered services
//!
//! Every service is stored as one key/value pair per attribute under
//! `<instance>/<service>/<attribute>`. Three implementations are provided:
//!
//! - [`ConsulRegistry`] talks to a Consul cluster over its KV HTTP API and
//!   fans every call out over all configured addresses
//! - [`FileRegistry`] keeps one JSON attribute map per service on local disk,
//!   for instances running without a registry
//! - [`MemoryRegistry`] keeps everything in process

use crate::config::Mode;
use crate::service::{ServiceDefinition, ATTRIBUTE_KEYS};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry request to {address} failed: {message}")]
    Request { address: String, message: String },

    #[error("invalid registry key: {0}")]
    InvalidKey(String),

    #[error("registry storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed registry data: {0}")]
    Malformed(String),
}

impl RegistryError {
    fn request(address: &str, message: impl ToString) -> Self {
        RegistryError::Request {
            address: address.to_string(),
            message: message.to_string(),
        }
    }
}

/// Narrow contract over the external key/value registry.
///
/// Every call takes the registry address list; implementations backed by a
/// cluster treat the call as failed only when every address failed.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Store every attribute of `service` under the instance namespace
    async fn put_service(
        &self,
        addresses: &[String],
        instance: &str,
        service: &ServiceDefinition,
    ) -> Result<(), RegistryError>;

    /// Remove all attributes of a service. Removing an absent service succeeds.
    async fn delete_service(
        &self,
        addresses: &[String],
        instance: &str,
        service_name: &str,
    ) -> Result<(), RegistryError>;

    /// Read a single attribute; `None` when it is not stored
    async fn get_service_attribute(
        &self,
        addresses: &[String],
        instance: &str,
        service_name: &str,
        key: &str,
    ) -> Result<Option<String>, RegistryError>;

    /// Names of every service registered for the instance, sorted
    async fn list_services(
        &self,
        addresses: &[String],
        instance: &str,
    ) -> Result<Vec<String>, RegistryError>;

    /// `host:port` of every registered instance of `service_name`
    async fn sibling_addresses(
        &self,
        _addresses: &[String],
        _service_name: &str,
    ) -> Result<Vec<String>, RegistryError> {
        Ok(Vec::new())
    }

    /// Read a whole service back; `None` when no attribute is stored
    async fn get_service(
        &self,
        addresses: &[String],
        instance: &str,
        service_name: &str,
        mode: Mode,
    ) -> Result<Option<ServiceDefinition>, RegistryError> {
        let reads = ATTRIBUTE_KEYS.iter().map(|key| async move {
            self.get_service_attribute(addresses, instance, service_name, key)
                .await
                .map(|value| (key.to_string(), value))
        });
        let mut attributes = BTreeMap::new();
        for result in futures::future::join_all(reads).await {
            if let (key, Some(value)) = result? {
                attributes.insert(key, value);
            }
        }
        if attributes.is_empty() {
            return Ok(None);
        }
        Ok(Some(ServiceDefinition::from_attributes(
            service_name,
            &attributes,
            mode,
        )))
    }
}

/// Service and instance names become path segments
fn check_key(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(RegistryError::InvalidKey(name.to_string()));
    }
    Ok(())
}

/// Run `op` against every address concurrently and wait for all of them.
/// Succeeds with the first successful value; fails with the last error only
/// when no address succeeded.
async fn on_all<T, F, Fut>(addresses: &[String], op: F) -> Result<T, RegistryError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, RegistryError>>,
{
    if addresses.is_empty() {
        return Err(RegistryError::Unavailable(
            "no registry address configured".to_string(),
        ));
    }
    let mut pending: FuturesUnordered<_> = addresses.iter().cloned().map(&op).collect();
    let mut value = None;
    let mut last_error = None;
    while let Some(result) = pending.next().await {
        match result {
            Ok(v) => {
                if value.is_none() {
                    value = Some(v);
                }
            }
            Err(e) => {
                warn!(error = %e, "Registry node failed");
                last_error = Some(e);
            }
        }
    }
    match (value, last_error) {
        (Some(v), _) => Ok(v),
        (None, Some(e)) => Err(e),
        (None, None) => Err(RegistryError::Unavailable("no registry answered".to_string())),
    }
}

/// Race `op` over every address and return the first success
async fn on_first<T, F, Fut>(addresses: &[String], op: F) -> Result<T, RegistryError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, RegistryError>>,
{
    if addresses.is_empty() {
        return Err(RegistryError::Unavailable(
            "no registry address configured".to_string(),
        ));
    }
    let mut pending: FuturesUnordered<_> = addresses.iter().cloned().map(&op).collect();
    let mut last_error = None;
    while let Some(result) = pending.next().await {
        match result {
            Ok(v) => return Ok(v),
            Err(e) => {
                debug!(error = %e, "Registry node failed, waiting for the others");
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| RegistryError::Unavailable("no registry answered".to_string())))
}

/// Consul KV registry
pub struct ConsulRegistry {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogEntry {
    #[serde(default)]
    address: String,
    #[serde(default)]
    service_address: String,
    service_port: u16,
}

impl ConsulRegistry {
    /// Create a client whose every request is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        Ok(Self { client })
    }

    fn kv_url(address: &str, path: &str) -> String {
        format!("{}/v1/kv/{}", address.trim_end_matches('/'), path)
    }

    async fn put_attributes(
        &self,
        address: String,
        prefix: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(), RegistryError> {
        for (key, value) in attributes {
            let url = Self::kv_url(&address, &format!("{}/{}", prefix, key));
            let response = self
                .client
                .put(&url)
                .body(value.clone())
                .send()
                .await
                .map_err(|e| RegistryError::request(&address, e))?;
            if !response.status().is_success() {
                return Err(RegistryError::request(
                    &address,
                    format!("PUT {} returned {}", key, response.status()),
                ));
            }
        }
        Ok(())
    }

    async fn delete_prefix(&self, address: String, prefix: &str) -> Result<(), RegistryError> {
        let url = format!("{}?recurse", Self::kv_url(&address, prefix));
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| RegistryError::request(&address, e))?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(RegistryError::request(
                &address,
                format!("DELETE returned {}", response.status()),
            ))
        }
    }

    async fn get_raw(&self, address: String, path: &str) -> Result<Option<String>, RegistryError> {
        let url = format!("{}?raw", Self::kv_url(&address, path));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RegistryError::request(&address, e))?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .text()
                .await
                .map(Some)
                .map_err(|e| RegistryError::request(&address, e)),
            status => Err(RegistryError::request(&address, format!("GET returned {}", status))),
        }
    }

    async fn list_keys(&self, address: String, instance: &str) -> Result<Vec<String>, RegistryError> {
        let url = format!("{}/?keys&separator=/", Self::kv_url(&address, instance));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RegistryError::request(&address, e))?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => response
                .json::<Vec<String>>()
                .await
                .map_err(|e| RegistryError::Malformed(e.to_string())),
            status => Err(RegistryError::request(&address, format!("GET returned {}", status))),
        }
    }

    async fn catalog(&self, address: String, service_name: &str) -> Result<Vec<String>, RegistryError> {
        let url = format!(
            "{}/v1/catalog/service/{}",
            address.trim_end_matches('/'),
            service_name
        );
        let entries = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RegistryError::request(&address, e))?
            .json::<Vec<CatalogEntry>>()
            .await
            .map_err(|e| RegistryError::Malformed(e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(|e| {
                let host = if e.service_address.is_empty() {
                    e.address
                } else {
                    e.service_address
                };
                format!("{}:{}", host, e.service_port)
            })
            .collect())
    }
}

/// Turn `["docker-flow/web/", "docker-flow/api/"]` into `["api", "web"]`
fn service_names_from_keys(instance: &str, keys: Vec<String>) -> Vec<String> {
    let prefix = format!("{}/", instance);
    let mut names: Vec<String> = keys
        .iter()
        .filter_map(|k| k.strip_prefix(&prefix))
        .filter_map(|rest| rest.strip_suffix('/'))
        .filter(|name| !name.is_empty() && !name.contains('/'))
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}

#[async_trait]
impl RegistryClient for ConsulRegistry {
    async fn put_service(
        &self,
        addresses: &[String],
        instance: &str,
        service: &ServiceDefinition,
    ) -> Result<(), RegistryError> {
        check_key(&service.service_name)?;
        let prefix = format!("{}/{}", instance, service.service_name);
        let attributes = service.to_attributes();
        on_all(addresses, |address| self.put_attributes(address, &prefix, &attributes)).await?;
        debug!(service = %service.service_name, instance, "Service stored in registry");
        Ok(())
    }

    async fn delete_service(
        &self,
        addresses: &[String],
        instance: &str,
        service_name: &str,
    ) -> Result<(), RegistryError> {
        check_key(service_name)?;
        // Trailing slash keeps `recurse` from matching services sharing the name as a prefix
        let prefix = format!("{}/{}/", instance, service_name);
        on_all(addresses, |address| self.delete_prefix(address, &prefix)).await
    }

    async fn get_service_attribute(
        &self,
        addresses: &[String],
        instance: &str,
        service_name: &str,
        key: &str,
    ) -> Result<Option<String>, RegistryError> {
        check_key(service_name)?;
        let path = format!("{}/{}/{}", instance, service_name, key);
        on_first(addresses, |address| self.get_raw(address, &path)).await
    }

    async fn list_services(
        &self,
        addresses: &[String],
        instance: &str,
    ) -> Result<Vec<String>, RegistryError> {
        let keys = on_first(addresses, |address| self.list_keys(address, instance)).await?;
        Ok(service_names_from_keys(instance, keys))
    }

    async fn sibling_addresses(
        &self,
        addresses: &[String],
        service_name: &str,
    ) -> Result<Vec<String>, RegistryError> {
        on_first(addresses, |address| self.catalog(address, service_name)).await
    }
}

/// Registry kept on local disk, one JSON document per service
pub struct FileRegistry {
    root: PathBuf,
}

impl FileRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn instance_dir(&self, instance: &str) -> Result<PathBuf, RegistryError> {
        check_key(instance)?;
        Ok(self.root.join(instance))
    }

    fn service_file(&self, instance: &str, service_name: &str) -> Result<PathBuf, RegistryError> {
        check_key(service_name)?;
        Ok(self.instance_dir(instance)?.join(format!("{}.json", service_name)))
    }

    fn read_attributes(path: &Path) -> Result<Option<BTreeMap<String, String>>, RegistryError> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| RegistryError::Malformed(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RegistryClient for FileRegistry {
    async fn put_service(
        &self,
        _addresses: &[String],
        instance: &str,
        service: &ServiceDefinition,
    ) -> Result<(), RegistryError> {
        let path = self.service_file(instance, &service.service_name)?;
        let dir = self.instance_dir(instance)?;
        std::fs::create_dir_all(&dir)?;
        let content = serde_json::to_vec_pretty(&service.to_attributes())
            .map_err(|e| RegistryError::Malformed(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&content)?;
        tmp.persist(&path).map_err(|e| RegistryError::Io(e.error))?;
        Ok(())
    }

    async fn delete_service(
        &self,
        _addresses: &[String],
        instance: &str,
        service_name: &str,
    ) -> Result<(), RegistryError> {
        let path = self.service_file(instance, service_name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service_attribute(
        &self,
        _addresses: &[String],
        instance: &str,
        service_name: &str,
        key: &str,
    ) -> Result<Option<String>, RegistryError> {
        let path = self.service_file(instance, service_name)?;
        Ok(Self::read_attributes(&path)?.and_then(|mut a| a.remove(key)))
    }

    async fn list_services(
        &self,
        _addresses: &[String],
        instance: &str,
    ) -> Result<Vec<String>, RegistryError> {
        let dir = self.instance_dir(instance)?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get_service(
        &self,
        _addresses: &[String],
        instance: &str,
        service_name: &str,
        mode: Mode,
    ) -> Result<Option<ServiceDefinition>, RegistryError> {
        let path = self.service_file(instance, service_name)?;
        Ok(Self::read_attributes(&path)?
            .map(|attributes| ServiceDefinition::from_attributes(service_name, &attributes, mode)))
    }
}

type Namespace = BTreeMap<String, BTreeMap<String, String>>;

/// In-process registry
#[derive(Default)]
pub struct MemoryRegistry {
    instances: RwLock<BTreeMap<String, Namespace>>,
    unavailable: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the registry were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of calls made against this registry
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable(
                "in-memory registry marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn put_service(
        &self,
        _addresses: &[String],
        instance: &str,
        service: &ServiceDefinition,
    ) -> Result<(), RegistryError> {
        self.enter()?;
        check_key(&service.service_name)?;
        self.instances
            .write()
            .entry(instance.to_string())
            .or_default()
            .insert(service.service_name.clone(), service.to_attributes());
        Ok(())
    }

    async fn delete_service(
        &self,
        _addresses: &[String],
        instance: &str,
        service_name: &str,
    ) -> Result<(), RegistryError> {
        self.enter()?;
        if let Some(namespace) = self.instances.write().get_mut(instance) {
            namespace.remove(service_name);
        }
        Ok(())
    }

    async fn get_service_attribute(
        &self,
        _addresses: &[String],
        instance: &str,
        service_name: &str,
        key: &str,
    ) -> Result<Option<String>, RegistryError> {
        self.enter()?;
        Ok(self
            .instances
            .read()
            .get(instance)
            .and_then(|n| n.get(service_name))
            .and_then(|a| a.get(key))
            .cloned())
    }

    async fn list_services(
        &self,
        _addresses: &[String],
        instance: &str,
    ) -> Result<Vec<String>, RegistryError> {
        self.enter()?;
        Ok(self
            .instances
            .read()
            .get(instance)
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Query;
    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::service::service_fn;
    use hyper::{Method, Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const DEAD_ADDRESS: &str = "http://127.0.0.1:1";

    type Kv = Arc<Mutex<BTreeMap<String, String>>>;

    fn web_service() -> ServiceDefinition {
        let query = Query::parse("serviceName=web&servicePath=/api,/v2&port=8080");
        let mut def = ServiceDefinition::from_query(&query, Mode::Default).unwrap();
        def.normalize();
        def
    }

    fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        Response::builder()
            .status(status)
            .body(Full::new(body.into()))
            .unwrap()
    }

    async fn handle_kv(req: Request<Incoming>, kv: Kv) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let body = req.into_body().collect().await.unwrap().to_bytes();

        if let Some(service) = path.strip_prefix("/v1/catalog/service/") {
            let entries = serde_json::json!([
                {"Address": "10.0.0.1", "ServiceAddress": "", "ServicePort": 8080},
                {"Address": "10.0.0.9", "ServiceAddress": "10.0.0.2", "ServicePort": 8080},
            ]);
            return if service == "proxy" {
                reply(StatusCode::OK, entries.to_string())
            } else {
                reply(StatusCode::OK, "[]")
            };
        }

        let key = path.strip_prefix("/v1/kv/").unwrap_or("").to_string();
        let mut kv = kv.lock();
        match method {
            Method::PUT => {
                kv.insert(key, String::from_utf8_lossy(&body).into_owned());
                reply(StatusCode::OK, "true")
            }
            Method::DELETE => {
                kv.retain(|k, _| !k.starts_with(&key));
                reply(StatusCode::OK, "true")
            }
            Method::GET if query.contains("keys") => {
                let dirs: BTreeSet<String> = kv
                    .keys()
                    .filter_map(|k| k.strip_prefix(&key))
                    .filter_map(|rest| rest.split_once('/'))
                    .map(|(dir, _)| format!("{}{}/", key, dir))
                    .collect();
                if dirs.is_empty() {
                    reply(StatusCode::NOT_FOUND, "")
                } else {
                    reply(StatusCode::OK, serde_json::to_string(&dirs).unwrap())
                }
            }
            Method::GET => match kv.get(&key) {
                Some(value) => reply(StatusCode::OK, value.clone()),
                None => reply(StatusCode::NOT_FOUND, ""),
            },
            _ => reply(StatusCode::METHOD_NOT_ALLOWED, ""),
        }
    }

    async fn spawn_mock_consul() -> (String, Kv) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let kv: Kv = Arc::new(Mutex::new(BTreeMap::new()));
        let shared = Arc::clone(&kv);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let kv = Arc::clone(&shared);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let kv = Arc::clone(&kv);
                        async move { Ok::<_, Infallible>(handle_kv(req, kv).await) }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (format!("http://{}", addr), kv)
    }

    #[test]
    fn test_service_names_from_keys() {
        let keys = vec![
            "docker-flow/web/".to_string(),
            "docker-flow/api/".to_string(),
            "docker-flow/loose-key".to_string(),
            "other/web/".to_string(),
        ];
        assert_eq!(service_names_from_keys("docker-flow", keys), vec!["api", "web"]);
    }

    #[test]
    fn test_check_key() {
        assert!(check_key("web").is_ok());
        assert!(check_key("").is_err());
        assert!(check_key("../etc").is_err());
        assert!(check_key("a/b").is_err());
    }

    #[tokio::test]
    async fn test_memory_registry_round_trip() {
        let registry = MemoryRegistry::new();
        registry.put_service(&[], "docker-flow", &web_service()).await.unwrap();

        assert_eq!(registry.list_services(&[], "docker-flow").await.unwrap(), vec!["web"]);
        assert!(registry.list_services(&[], "other").await.unwrap().is_empty());

        let def = registry
            .get_service(&[], "docker-flow", "web", Mode::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(def.service_path, vec!["/api", "/v2"]);
        assert_eq!(def.port, "8080");

        registry.delete_service(&[], "docker-flow", "web").await.unwrap();
        registry.delete_service(&[], "docker-flow", "web").await.unwrap();
        assert!(registry
            .get_service(&[], "docker-flow", "web", Mode::Default)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_memory_registry_unavailable() {
        let registry = MemoryRegistry::new();
        registry.set_unavailable(true);
        let err = registry
            .put_service(&[], "docker-flow", &web_service())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unavailable(_)));
        assert_eq!(registry.calls(), 1);
    }

    #[tokio::test]
    async fn test_file_registry_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = FileRegistry::new(dir.path());
            registry.put_service(&[], "docker-flow", &web_service()).await.unwrap();
        }

        let registry = FileRegistry::new(dir.path());
        assert_eq!(registry.list_services(&[], "docker-flow").await.unwrap(), vec!["web"]);
        assert_eq!(
            registry
                .get_service_attribute(&[], "docker-flow", "web", "port")
                .await
                .unwrap()
                .as_deref(),
            Some("8080")
        );
        let def = registry
            .get_service(&[], "docker-flow", "web", Mode::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(def.service_path, vec!["/api", "/v2"]);

        registry.delete_service(&[], "docker-flow", "web").await.unwrap();
        registry.delete_service(&[], "docker-flow", "web").await.unwrap();
        assert!(registry.list_services(&[], "docker-flow").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_registry_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path());
        let mut def = web_service();
        def.service_name = "../escape".into();
        let err = registry.put_service(&[], "docker-flow", &def).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_consul_succeeds_when_one_node_is_down() {
        let (address, kv) = spawn_mock_consul().await;
        let registry = ConsulRegistry::new(Duration::from_secs(2)).unwrap();
        let addresses = vec![DEAD_ADDRESS.to_string(), address];

        registry
            .put_service(&addresses, "docker-flow", &web_service())
            .await
            .unwrap();
        assert_eq!(
            kv.lock().get("docker-flow/web/port").map(String::as_str),
            Some("8080")
        );

        assert_eq!(
            registry.list_services(&addresses, "docker-flow").await.unwrap(),
            vec!["web"]
        );
        let def = registry
            .get_service(&addresses, "docker-flow", "web", Mode::Default)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(def.service_path, vec!["/api", "/v2"]);
        assert_eq!(def.acl_name, "web");
    }

    #[tokio::test]
    async fn test_consul_delete_is_idempotent() {
        let (address, kv) = spawn_mock_consul().await;
        let registry = ConsulRegistry::new(Duration::from_secs(2)).unwrap();
        let addresses = vec![address];

        registry
            .put_service(&addresses, "docker-flow", &web_service())
            .await
            .unwrap();
        registry.delete_service(&addresses, "docker-flow", "web").await.unwrap();
        registry.delete_service(&addresses, "docker-flow", "web").await.unwrap();

        assert!(kv.lock().is_empty());
        assert!(registry
            .list_services(&addresses, "docker-flow")
            .await
            .unwrap()
            .is_empty());
        assert!(registry
            .get_service_attribute(&addresses, "docker-flow", "web", "port")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_consul_delete_spares_services_sharing_a_prefix() {
        let (address, kv) = spawn_mock_consul().await;
        let registry = ConsulRegistry::new(Duration::from_secs(2)).unwrap();
        let addresses = vec![address];

        let mut webapp = web_service();
        webapp.service_name = "webapp".into();
        registry
            .put_service(&addresses, "docker-flow", &web_service())
            .await
            .unwrap();
        registry.put_service(&addresses, "docker-flow", &webapp).await.unwrap();

        registry.delete_service(&addresses, "docker-flow", "web").await.unwrap();

        assert_eq!(
            registry.list_services(&addresses, "docker-flow").await.unwrap(),
            vec!["webapp"]
        );
        assert!(kv.lock().keys().all(|k| k.starts_with("docker-flow/webapp/")));
        assert_eq!(
            registry
                .get_service_attribute(&addresses, "docker-flow", "webapp", "port")
                .await
                .unwrap()
                .as_deref(),
            Some("8080")
        );
    }

    #[tokio::test]
    async fn test_consul_fails_when_every_node_is_down() {
        let registry = ConsulRegistry::new(Duration::from_secs(1)).unwrap();
        let addresses = vec![DEAD_ADDRESS.to_string()];
        let err = registry
            .put_service(&addresses, "docker-flow", &web_service())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Request { .. }));

        let err = registry
            .list_services(&[], "docker-flow")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_consul_catalog_siblings() {
        let (address, _kv) = spawn_mock_consul().await;
        let registry = ConsulRegistry::new(Duration::from_secs(2)).unwrap();
        let siblings = registry
            .sibling_addresses(&[address], "proxy")
            .await
            .unwrap();
        assert_eq!(siblings, vec!["10.0.0.1:8080", "10.0.0.2:8080"]);
    }
}
