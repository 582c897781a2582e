//! Certificate store adapter (`certutil`, current-user Root store).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::{path_arg, CertificateStore, StoreEntry};
use crate::error::Result;
use crate::fingerprint::{self, Fingerprint};
use crate::process::ProcessInvoker;

const CERTUTIL: &str = "certutil";
const ROOT_STORE: &str = "Root";

/// Certificate store backed by the current user's Trusted Root store.
///
/// User-store writes need no elevation; the machine store is only touched by
/// the elevated helper tier of the install chain.
pub struct WindowsCertStore {
    invoker: Arc<dyn ProcessInvoker>,
}

impl std::fmt::Debug for WindowsCertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowsCertStore").finish()
    }
}

impl WindowsCertStore {
    /// Creates a new adapter.
    pub fn new(invoker: Arc<dyn ProcessInvoker>) -> Self {
        Self { invoker }
    }

    async fn query(&self, common_name: &str) -> Result<Option<String>> {
        let out = self
            .invoker
            .run(CERTUTIL, &["-user", "-store", ROOT_STORE, common_name])
            .await?;
        // certutil exits 0 even when nothing matched, so the name must show up.
        if out.success() && out.stdout.contains(common_name) {
            Ok(Some(out.stdout))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl CertificateStore for WindowsCertStore {
    async fn exists(&self, common_name: &str) -> Result<bool> {
        Ok(self.query(common_name).await?.is_some())
    }

    async fn is_trusted(&self, common_name: &str) -> Result<bool> {
        let out = self
            .invoker
            .run(CERTUTIL, &["-user", "-verifystore", ROOT_STORE, common_name])
            .await?;
        Ok(out.success())
    }

    async fn stored_fingerprint(&self, common_name: &str) -> Result<Option<Fingerprint>> {
        Ok(self
            .query(common_name)
            .await?
            .and_then(|out| fingerprint::of_store_entry(&out)))
    }

    async fn lookup(&self, common_name: &str) -> Result<Option<StoreEntry>> {
        Ok(self.query(common_name).await?.map(|out| StoreEntry {
            fingerprint: fingerprint::of_store_entry(&out),
        }))
    }

    async fn install(&self, cert_path: &Path) -> Result<()> {
        let out = self
            .invoker
            .run(
                CERTUTIL,
                &["-user", "-addstore", ROOT_STORE, &path_arg(cert_path)],
            )
            .await?;
        let out = out.into_success(CERTUTIL)?;
        if out.stdout.to_lowercase().contains("already in store") {
            tracing::debug!("CA certificate already in user Root store");
        } else {
            tracing::info!("CA certificate added to user Root store");
        }
        Ok(())
    }

    async fn remove(&self, common_name: &str) -> Result<()> {
        let out = self
            .invoker
            .run(CERTUTIL, &["-user", "-delstore", ROOT_STORE, common_name])
            .await?;
        if out.success() {
            tracing::info!("Removed '{}' from user Root store", common_name);
            return Ok(());
        }

        let text = out.combined_lowercase();
        if text.contains("not_found") || text.contains("not found") {
            return Ok(());
        }
        out.into_success(CERTUTIL).map(|_| ())
    }
}
