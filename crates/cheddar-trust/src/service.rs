//! Caller-facing facade over the trust store, install chain and proxy settings.
//!
//! Every method here turns [`TrustError`]s into a status or boolean after
//! logging them, so callers (the reconciler, the CLI) never see a raw tool
//! failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::cert_info::{self, CertificateInfo};
use crate::config::TrustConfig;
use crate::error::TrustError;
use crate::fingerprint;
use crate::install::{HostTrustChannel, InstallChain};
use crate::platform::Platform;
use crate::process::{ProcessInvoker, TokioProcessInvoker};
use crate::status::{CertificateStatus, Observation, StatusCache};
use crate::store::{self, CertificateStore};
use crate::system_proxy::{self, SystemProxy};

/// Builder for [`TrustService`]. Unset collaborators default to the real OS.
pub struct TrustServiceBuilder {
    config: TrustConfig,
    platform: Platform,
    invoker: Option<Arc<dyn ProcessInvoker>>,
    store: Option<Arc<dyn CertificateStore>>,
    system_proxy: Option<Arc<dyn SystemProxy>>,
    host: Option<Arc<dyn HostTrustChannel>>,
}

impl TrustServiceBuilder {
    /// Overrides the detected platform.
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Sets the process invoker shared by the default adapters.
    pub fn invoker(mut self, invoker: Arc<dyn ProcessInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Sets the certificate store adapter.
    pub fn store(mut self, store: Arc<dyn CertificateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the proxy configurator.
    pub fn system_proxy(mut self, system_proxy: Arc<dyn SystemProxy>) -> Self {
        self.system_proxy = Some(system_proxy);
        self
    }

    /// Wires up the in-process host trust channel.
    pub fn host_channel(mut self, host: Arc<dyn HostTrustChannel>) -> Self {
        self.host = Some(host);
        self
    }

    /// Builds the service.
    pub fn build(self) -> TrustService {
        let invoker = self
            .invoker
            .unwrap_or_else(|| Arc::new(TokioProcessInvoker::new()));
        let store = self.store.unwrap_or_else(|| {
            store::for_platform(self.platform, invoker.clone(), &self.config.scratch_dir)
        });
        let system_proxy = self
            .system_proxy
            .unwrap_or_else(|| system_proxy::for_platform(self.platform, invoker.clone()));

        TrustService {
            cache: StatusCache::new(self.config.cert_cache_ttl()),
            config: self.config,
            platform: self.platform,
            invoker,
            store,
            system_proxy,
            host: self.host,
        }
    }
}

/// Certificate trust and system proxy operations for one CA.
pub struct TrustService {
    config: TrustConfig,
    platform: Platform,
    invoker: Arc<dyn ProcessInvoker>,
    store: Arc<dyn CertificateStore>,
    system_proxy: Arc<dyn SystemProxy>,
    host: Option<Arc<dyn HostTrustChannel>>,
    cache: StatusCache,
}

impl std::fmt::Debug for TrustService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustService")
            .field("platform", &self.platform)
            .field("common_name", &self.config.common_name)
            .field("host_channel", &self.host.is_some())
            .finish()
    }
}

impl TrustService {
    /// Creates a service for the current platform using real OS tools.
    pub fn new(config: TrustConfig) -> Self {
        Self::builder(config).build()
    }

    /// Starts a builder with the detected platform.
    pub fn builder(config: TrustConfig) -> TrustServiceBuilder {
        TrustServiceBuilder {
            config,
            platform: Platform::detect(),
            invoker: None,
            store: None,
            system_proxy: None,
            host: None,
        }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Where the engine writes the CA certificate.
    pub fn default_certificate_path(&self) -> PathBuf {
        self.config.ca_cert_path()
    }

    /// Trust status of the certificate at `disk_path`.
    ///
    /// Within the TTL the cached value is returned unless `force` is set. A
    /// request arriving while another refresh runs waits for it; an unforced
    /// request then takes that result, a forced one checks again.
    pub async fn certificate_status(&self, disk_path: &Path, force: bool) -> CertificateStatus {
        if !force {
            if let Some(status) = self.cache.fresh(disk_path) {
                tracing::debug!("Using cached certificate status: {}", status);
                return status;
            }
        }

        let requested_at = Instant::now();
        let guard = match self.cache.begin_refresh() {
            Some(guard) => guard,
            None => {
                tracing::debug!("Certificate check in flight, waiting for it");
                let guard = self.cache.wait_refresh().await;
                if !force {
                    if let Some(status) = self.cache.checked_since(disk_path, requested_at) {
                        return status;
                    }
                }
                guard
            }
        };

        let status = self.observe(disk_path).await;
        guard.store(disk_path, status);
        status
    }

    async fn observe(&self, disk_path: &Path) -> CertificateStatus {
        let common_name = self.config.common_name.as_str();
        let mut observed = Observation {
            file_present: tokio::fs::try_exists(disk_path).await.unwrap_or(false),
            ..Observation::default()
        };
        if !observed.file_present {
            tracing::debug!("No CA certificate at {:?}", disk_path);
            return observed.status();
        }

        match self.store.lookup(common_name).await {
            Ok(Some(entry)) => {
                observed.in_store = true;
                observed.stored_fingerprint = entry.fingerprint;
            }
            Ok(None) => return observed.status(),
            Err(e) => {
                log_soft("store lookup", &e);
                return observed.status();
            }
        }

        observed.trusted = match self.store.is_trusted(common_name).await {
            Ok(trusted) => trusted,
            Err(e) => {
                log_soft("trust verification", &e);
                false
            }
        };
        if !observed.trusted {
            return observed.status();
        }

        if observed.stored_fingerprint.is_some() {
            observed.file_fingerprint = match fingerprint::of_file(disk_path).await {
                Ok(fp) => Some(fp),
                Err(e) => {
                    log_soft("file fingerprint", &e);
                    None
                }
            };
        }

        let status = observed.status();
        if status == CertificateStatus::Mismatch {
            tracing::warn!(
                stored = ?observed.stored_fingerprint,
                on_disk = ?observed.file_fingerprint,
                "Trusted CA certificate does not match the file on disk"
            );
        }
        status
    }

    /// Installs and trusts the certificate at `path`.
    ///
    /// Returns true only if a store install and a trust tier both succeeded.
    pub async fn trust_and_import_certificate(&self, path: &Path) -> bool {
        if !path.exists() {
            tracing::warn!("Cannot trust missing certificate {:?}", path);
            return false;
        }

        let chain = InstallChain {
            platform: self.platform,
            invoker: self.invoker.as_ref(),
            store: self.store.as_ref(),
            host: self.host.as_deref(),
            common_name: &self.config.common_name,
            scratch_dir: &self.config.scratch_dir,
        };
        let outcome = chain.run(path).await;

        if outcome.trusted {
            self.cache.invalidate();
            tracing::info!("CA certificate trusted");
        } else if let Some(last) = outcome.attempts.last() {
            tracing::warn!(
                strategy = %last.strategy,
                "CA certificate not trusted after {} attempt(s): {}",
                outcome.attempts.len(),
                last.diagnostic
            );
        }
        outcome.trusted
    }

    /// Removes the CA certificate from the store. Absence counts as success.
    pub async fn remove_existing_certificate(&self) -> bool {
        let result = self.store.remove(&self.config.common_name).await;
        self.cache.invalidate();
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to remove CA certificate: {}", e);
                false
            }
        }
    }

    /// True when HTTP and HTTPS both go through the local proxy on `port`.
    pub async fn is_proxy_configured(&self, port: u16) -> bool {
        match self
            .system_proxy
            .is_configured(self.config.proxy_host_name(), port)
            .await
        {
            Ok(configured) => configured,
            Err(e) => {
                log_soft("proxy check", &e);
                false
            }
        }
    }

    /// Routes HTTP and HTTPS through the local proxy on `port`.
    pub async fn enable_system_proxy(&self, port: u16) -> bool {
        match self
            .system_proxy
            .enable(self.config.proxy_host_name(), port)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    "System proxy set to {}:{}",
                    self.config.proxy_host_name(),
                    port
                );
                true
            }
            Err(e) => {
                tracing::warn!("Failed to enable system proxy: {}", e);
                false
            }
        }
    }

    /// Turns the system proxy off.
    pub async fn disable_system_proxy(&self) -> bool {
        match self.system_proxy.disable().await {
            Ok(()) => {
                tracing::info!("System proxy disabled");
                true
            }
            Err(e) => {
                tracing::warn!("Failed to disable system proxy: {}", e);
                false
            }
        }
    }

    /// Subject, issuer, validity and fingerprint of the certificate file.
    pub async fn certificate_info(&self, path: &Path) -> Option<CertificateInfo> {
        match cert_info::read(self.invoker.as_ref(), self.platform, path).await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!("Failed to read certificate info from {:?}: {}", path, e);
                None
            }
        }
    }
}

fn log_soft(operation: &str, error: &TrustError) {
    if error.is_soft() {
        tracing::debug!("{} inconclusive: {}", operation, error);
    } else {
        tracing::warn!("{} failed: {}", operation, error);
    }
}
