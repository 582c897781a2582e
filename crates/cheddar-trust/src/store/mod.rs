//! OS certificate trust store adapters.

mod keychain;
mod unsupported;
mod windows;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::platform::Platform;
use crate::process::ProcessInvoker;

pub use keychain::KeychainStore;
pub use unsupported::UnsupportedStore;
pub use windows::WindowsCertStore;

/// Read and write access to the OS certificate trust store.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Returns true if a certificate with `common_name` is in the store.
    async fn exists(&self, common_name: &str) -> Result<bool>;

    /// Runs an explicit trust verification for the stored certificate.
    async fn is_trusted(&self, common_name: &str) -> Result<bool>;

    /// Fingerprint of the stored certificate, if the store reports one.
    async fn stored_fingerprint(&self, common_name: &str) -> Result<Option<Fingerprint>>;

    /// Adds the certificate to a user-writable store location.
    async fn install(&self, cert_path: &Path) -> Result<()>;

    /// Removes the certificate. Absence is not an error.
    async fn remove(&self, common_name: &str) -> Result<()>;

    /// Looks the certificate up, returning `None` when it is not in the store.
    ///
    /// Adapters whose query tool prints the fingerprint alongside the match
    /// override this to avoid a second process spawn.
    async fn lookup(&self, common_name: &str) -> Result<Option<StoreEntry>> {
        if !self.exists(common_name).await? {
            return Ok(None);
        }
        let fingerprint = match self.stored_fingerprint(common_name).await {
            Ok(fp) => fp,
            Err(e) => {
                tracing::warn!("Could not read stored fingerprint: {}", e);
                None
            }
        };
        Ok(Some(StoreEntry { fingerprint }))
    }
}

/// A certificate found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    /// Fingerprint reported by the store, `None` when it could not be read.
    pub fingerprint: Option<Fingerprint>,
}

/// Builds the store adapter for a platform.
pub fn for_platform(
    platform: Platform,
    invoker: Arc<dyn ProcessInvoker>,
    scratch_dir: &Path,
) -> Arc<dyn CertificateStore> {
    match platform {
        Platform::Keychain => Arc::new(KeychainStore::new(invoker, scratch_dir)),
        Platform::Store => Arc::new(WindowsCertStore::new(invoker)),
        Platform::Unsupported => Arc::new(UnsupportedStore),
    }
}

/// Converts a path for use as a tool argument.
pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
