//! Keychain store adapter (`security` tool).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{path_arg, CertificateStore, StoreEntry};
use crate::error::{Result, TrustError};
use crate::fingerprint::{self, Fingerprint};
use crate::process::ProcessInvoker;

const SECURITY: &str = "security";

/// Upper bound on duplicate entries removed in one call.
const MAX_DELETE_PASSES: usize = 8;

/// Certificate store backed by the user's keychain search list.
pub struct KeychainStore {
    invoker: Arc<dyn ProcessInvoker>,
    scratch_dir: PathBuf,
    export_seq: AtomicU64,
}

impl std::fmt::Debug for KeychainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeychainStore")
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

impl KeychainStore {
    /// Creates a keychain adapter writing exported certificates to `scratch_dir`.
    pub fn new(invoker: Arc<dyn ProcessInvoker>, scratch_dir: impl AsRef<Path>) -> Self {
        Self {
            invoker,
            scratch_dir: scratch_dir.as_ref().to_path_buf(),
            export_seq: AtomicU64::new(0),
        }
    }

    /// Path of the current user's login keychain.
    pub fn login_keychain() -> Result<PathBuf> {
        let Some(home) = std::env::var_os("HOME") else {
            return Err(TrustError::Unsupported(
                "HOME is not set; cannot resolve login keychain".to_string(),
            ));
        };
        Ok(PathBuf::from(home).join("Library/Keychains/login.keychain-db"))
    }

    async fn find(&self, common_name: &str) -> Result<Option<String>> {
        let out = self
            .invoker
            .run(SECURITY, &["find-certificate", "-c", common_name, "-Z"])
            .await?;
        if out.success() && out.stdout.contains(common_name) {
            Ok(Some(out.stdout))
        } else {
            Ok(None)
        }
    }

    fn export_path(&self) -> PathBuf {
        let seq = self.export_seq.fetch_add(1, Ordering::Relaxed);
        self.scratch_dir
            .join(format!("store-export-{}-{}.pem", std::process::id(), seq))
    }
}

#[async_trait]
impl CertificateStore for KeychainStore {
    async fn exists(&self, common_name: &str) -> Result<bool> {
        Ok(self.find(common_name).await?.is_some())
    }

    async fn is_trusted(&self, common_name: &str) -> Result<bool> {
        // verify-cert needs a file, so the stored copy is exported first;
        // verifying the on-disk file would hide a stale store entry.
        let out = self
            .invoker
            .run(SECURITY, &["find-certificate", "-c", common_name, "-p"])
            .await?;
        if !out.success() || !out.stdout.contains("-----BEGIN CERTIFICATE-----") {
            return Ok(false);
        }

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let export = self.export_path();
        tokio::fs::write(&export, out.stdout.as_bytes()).await?;

        let verdict = self
            .invoker
            .run(SECURITY, &["verify-cert", "-c", &path_arg(&export)])
            .await;

        if let Err(e) = tokio::fs::remove_file(&export).await {
            tracing::debug!("Failed to remove exported certificate {:?}: {}", export, e);
        }

        Ok(verdict?.success())
    }

    async fn stored_fingerprint(&self, common_name: &str) -> Result<Option<Fingerprint>> {
        Ok(self
            .find(common_name)
            .await?
            .and_then(|out| fingerprint::of_store_entry(&out)))
    }

    async fn lookup(&self, common_name: &str) -> Result<Option<StoreEntry>> {
        Ok(self.find(common_name).await?.map(|out| StoreEntry {
            fingerprint: fingerprint::of_store_entry(&out),
        }))
    }

    async fn install(&self, cert_path: &Path) -> Result<()> {
        let keychain = Self::login_keychain()?;
        let out = self
            .invoker
            .run(
                SECURITY,
                &[
                    "add-certificates",
                    "-k",
                    &path_arg(&keychain),
                    &path_arg(cert_path),
                ],
            )
            .await?;

        if out.success() || out.combined_lowercase().contains("already exists") {
            tracing::info!("CA certificate present in login keychain");
            return Ok(());
        }
        out.into_success(SECURITY).map(|_| ())
    }

    async fn remove(&self, common_name: &str) -> Result<()> {
        for _ in 0..MAX_DELETE_PASSES {
            let out = self
                .invoker
                .run(SECURITY, &["delete-certificate", "-c", common_name])
                .await?;
            if !out.success() {
                let text = out.combined_lowercase();
                if text.contains("could not be found") || text.contains("not found") {
                    return Ok(());
                }
                return out.into_success(SECURITY).map(|_| ());
            }
            tracing::info!("Removed '{}' from keychain", common_name);
        }
        Ok(())
    }
}
