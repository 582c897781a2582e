//! Trust subsystem configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Common name the proxy engine puts on its CA certificate.
///
/// Store lookups match on this prefix; the engine appends host and date.
pub const DEFAULT_COMMON_NAME: &str = "Cheddar Proxy CA";

/// File name of the CA certificate inside the storage directory.
pub const CA_CERT_FILENAME: &str = "cheddar_proxy_ca.pem";

/// Host the system proxy must point at.
pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";

/// Default proxy engine port.
pub const DEFAULT_PROXY_PORT: u16 = 9090;

/// Configuration for [`TrustService`](crate::TrustService) and the reconciler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Common name of the CA certificate.
    pub common_name: String,
    /// Directory the proxy engine writes its CA into.
    pub storage_dir: PathBuf,
    /// File name of the CA certificate within `storage_dir`.
    pub ca_file_name: String,
    /// Host the OS proxy should point at.
    pub proxy_host: String,
    /// Port used when the engine does not report one.
    pub proxy_port: u16,
    /// How long a computed certificate status stays fresh, in milliseconds.
    pub cert_cache_ttl_ms: u64,
    /// Reconciliation period, in milliseconds.
    pub reconcile_interval_ms: u64,
    /// Where helper scripts and exported certificates are written.
    pub scratch_dir: PathBuf,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            common_name: DEFAULT_COMMON_NAME.to_string(),
            storage_dir: default_storage_dir(),
            ca_file_name: CA_CERT_FILENAME.to_string(),
            proxy_host: DEFAULT_PROXY_HOST.to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            cert_cache_ttl_ms: 60_000,
            reconcile_interval_ms: 5_000,
            scratch_dir: std::env::temp_dir().join("cheddar-trust"),
        }
    }
}

impl TrustConfig {
    /// Creates a configuration rooted at the given storage directory.
    pub fn with_storage_dir(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the scratch directory.
    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    /// Sets the certificate status TTL.
    pub fn with_cert_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cert_cache_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Sets the reconciliation period.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Path of the CA certificate file on disk.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.storage_dir.join(&self.ca_file_name)
    }

    /// Certificate status TTL.
    pub fn cert_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cert_cache_ttl_ms)
    }

    /// `proxy_host` without a scheme, path or surrounding whitespace.
    pub fn proxy_host_name(&self) -> &str {
        let host = self.proxy_host.trim();
        let host = host
            .strip_prefix("http://")
            .or_else(|| host.strip_prefix("https://"))
            .unwrap_or(host);
        host.split('/').next().unwrap_or(host).trim()
    }

    /// Reconciliation period.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }
}

/// Default storage directory for the CA file.
fn default_storage_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "cheddarproxy", "Cheddar Proxy")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("cheddar-proxy"))
}
