//! TLS material for secured associations
//!
//! Files are resolved inside the certificate store `{data_dir}/etc/certs/`.
//! Certificates with a `.pem` extension live in the `pem/` subdirectory;
//! the private key is always taken from the store root.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::error::{Result, Tase2Error};

pub const RENEGOTIATION_TIME: Duration = Duration::from_millis(60_000);

/// Certificate file names from the `tls_conf` document
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub own_cert: String,
    #[serde(default, deserialize_with = "cert_files")]
    pub ca_certs: Vec<String>,
    #[serde(default, deserialize_with = "cert_files")]
    pub remote_certs: Vec<String>,
}

#[derive(Deserialize)]
struct CertFileEntry {
    cert_file: Option<String>,
}

/// `[{"cert_file": "x.cer"}, ...]`, entries without a file name are ignored
fn cert_files<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let entries = Vec::<CertFileEntry>::deserialize(deserializer)?;
    Ok(entries.into_iter().filter_map(|e| e.cert_file).collect())
}

/// Certificate store directory layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertStore {
    root: PathBuf,
}

impl CertStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store of a data directory: `{data_dir}/etc/certs`
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("etc").join("certs"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    pub fn cert_path(&self, file: &str) -> PathBuf {
        if file.ends_with(".pem") {
            self.root.join("pem").join(file)
        } else {
            self.root.join(file)
        }
    }
}

/// Loaded key and certificates handed to the protocol library
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub own_key: Vec<u8>,
    pub own_cert: Vec<u8>,
    pub ca_certs: Vec<Vec<u8>>,
    pub allowed_certs: Vec<Vec<u8>>,
    pub chain_validation: bool,
    pub allow_only_known: bool,
    pub renegotiation_time: Duration,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("own_key", &"<redacted>")
            .field("own_cert_len", &self.own_cert.len())
            .field("ca_certs", &self.ca_certs.len())
            .field("allowed_certs", &self.allowed_certs.len())
            .field("chain_validation", &self.chain_validation)
            .field("allow_only_known", &self.allow_only_known)
            .finish()
    }
}

impl TlsMaterial {
    /// Load own key and certificate (mandatory) plus CA and allowed remote
    /// certificates (optional, unreadable files are skipped).
    pub fn load(settings: &TlsSettings, store: &CertStore) -> Result<Self> {
        if settings.private_key.is_empty() || settings.own_cert.is_empty() {
            error!("No private key and/or certificate configured for client");
            return Err(Tase2Error::tls(
                "no private key and/or certificate configured",
            ));
        }

        let key_file = store.key_path(&settings.private_key);
        let own_key = std::fs::read(&key_file).map_err(|e| {
            error!("Failed to access private key file: {} ({})", key_file.display(), e);
            Tase2Error::tls(format!("private key {}: {}", key_file.display(), e))
        })?;

        let cert_file = store.cert_path(&settings.own_cert);
        let own_cert = std::fs::read(&cert_file).map_err(|e| {
            error!(
                "Failed to access client certificate file: {} ({})",
                cert_file.display(),
                e
            );
            Tase2Error::tls(format!("client certificate {}: {}", cert_file.display(), e))
        })?;

        let allowed_certs = load_optional(store, &settings.remote_certs, "remote");
        let ca_certs = load_optional(store, &settings.ca_certs, "CA");

        debug!(
            "TLS material loaded: {} CA, {} remote certificates",
            ca_certs.len(),
            allowed_certs.len()
        );

        Ok(Self {
            own_key,
            own_cert,
            ca_certs,
            allowed_certs,
            chain_validation: !settings.ca_certs.is_empty(),
            allow_only_known: !settings.remote_certs.is_empty(),
            renegotiation_time: RENEGOTIATION_TIME,
        })
    }
}

fn load_optional(store: &CertStore, files: &[String], kind: &str) -> Vec<Vec<u8>> {
    files
        .iter()
        .filter_map(|file| {
            let path = store.cert_path(file);
            match std::fs::read(&path) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(
                        "Failed to access {} certificate file: {} ({}) -> ignore certificate",
                        kind,
                        path.display(),
                        e
                    );
                    None
                },
            }
        })
        .collect()
}
