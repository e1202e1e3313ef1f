//! Certificate storage
//!
//! Certificates are stored verbatim as `<certs_path>/<name>.pem` and mirrored
//! in memory. Nothing here parses or validates the bundles.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("invalid certificate name: {0}")]
    InvalidName(String),

    #[error("certificate {name} is empty")]
    Empty { name: String },

    #[error("failed to write certificate {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate store error: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate import failed: {0}")]
    Import(String),
}

/// One stored certificate bundle, as listed by `GET /certs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertBundle {
    pub name: String,
    pub content: String,
}

/// Body of `GET /v1/docker-flow-proxy/certs`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertsResponse {
    pub status: String,
    pub certs_dir: String,
    pub proxy_service_name: String,
    #[serde(default)]
    pub certs: Vec<CertBundle>,
}

/// Named certificate bundles on durable storage
pub trait CertStore: Send + Sync {
    /// Store a bundle and return the path it was written to
    fn put_cert(&self, name: &str, content: &[u8]) -> Result<PathBuf, CertError>;

    fn get_cert(&self, name: &str) -> Option<CertBundle>;

    /// Every stored bundle, sorted by name
    fn list_certs(&self) -> Vec<CertBundle>;

    /// Name to path of every stored bundle
    fn cert_paths(&self) -> BTreeMap<String, PathBuf>;

    /// Directory the bundles live in
    fn dir(&self) -> &Path;
}

/// Reject anything that could escape the certificate directory
pub fn validate_cert_name(name: &str) -> Result<(), CertError> {
    if name.trim().is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.contains('\0')
    {
        return Err(CertError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn file_name(name: &str) -> String {
    if name.ends_with(".pem") {
        name.to_string()
    } else {
        format!("{}.pem", name)
    }
}

/// Filesystem backed certificate store
pub struct FsCertStore {
    dir: PathBuf,
    certs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl FsCertStore {
    /// Open the store, creating the directory and loading every bundle in it
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CertError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut certs = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // Leftovers of an interrupted write
            if name.starts_with(".tmp") {
                continue;
            }
            certs.insert(name, std::fs::read(entry.path())?);
        }
        info!(dir = %dir.display(), count = certs.len(), "Certificate store opened");

        Ok(Self {
            dir,
            certs: RwLock::new(certs),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.certs.read().is_empty()
    }
}

impl CertStore for FsCertStore {
    fn put_cert(&self, name: &str, content: &[u8]) -> Result<PathBuf, CertError> {
        validate_cert_name(name)?;
        if content.is_empty() {
            return Err(CertError::Empty {
                name: name.to_string(),
            });
        }
        let file_name = file_name(name);
        let path = self.dir.join(&file_name);

        let write = || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(content)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|source| CertError::Write {
            path: path.clone(),
            source,
        })?;

        self.certs.write().insert(file_name, content.to_vec());
        debug!(cert = %name, path = %path.display(), "Certificate stored");
        Ok(path)
    }

    fn get_cert(&self, name: &str) -> Option<CertBundle> {
        let file_name = file_name(name);
        self.certs.read().get(&file_name).map(|content| CertBundle {
            name: file_name.clone(),
            content: String::from_utf8_lossy(content).into_owned(),
        })
    }

    fn list_certs(&self) -> Vec<CertBundle> {
        self.certs
            .read()
            .iter()
            .map(|(name, content)| CertBundle {
                name: name.clone(),
                content: String::from_utf8_lossy(content).into_owned(),
            })
            .collect()
    }

    fn cert_paths(&self) -> BTreeMap<String, PathBuf> {
        self.certs
            .read()
            .keys()
            .map(|name| (name.clone(), self.dir.join(name)))
            .collect()
    }

    fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Copy the certificates of the first sibling that answers into `store`.
///
/// Bundles the store rejects are skipped. Returns the number of imported
/// bundles; zero when no sibling answered.
pub async fn import_from_siblings(
    store: &dyn CertStore,
    siblings: &[String],
    timeout: Duration,
) -> Result<usize, CertError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CertError::Import(e.to_string()))?;

    for sibling in siblings {
        let url = format!("http://{}/v1/docker-flow-proxy/certs", sibling);
        let response = match client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(sibling = %sibling, status = %r.status(), "Sibling did not list certificates");
                continue;
            }
            Err(e) => {
                debug!(sibling = %sibling, error = %e, "Sibling unreachable");
                continue;
            }
        };
        let listing: CertsResponse = match response.json().await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(sibling = %sibling, error = %e, "Malformed certificate listing");
                continue;
            }
        };
        let mut imported = 0;
        for cert in &listing.certs {
            match store.put_cert(&cert.name, cert.content.as_bytes()) {
                Ok(_) => imported += 1,
                Err(e) => warn!(sibling = %sibling, cert = %cert.name, error = %e, "Skipping certificate"),
            }
        }
        info!(sibling = %sibling, count = imported, "Imported certificates");
        return Ok(imported);
    }
    Ok(0)
}
