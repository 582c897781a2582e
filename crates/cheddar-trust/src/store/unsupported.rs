//! Store adapter for platforms without trust store integration.

use std::path::Path;

use async_trait::async_trait;

use super::CertificateStore;
use crate::error::{Result, TrustError};
use crate::fingerprint::Fingerprint;

/// Store that never contains anything and cannot be written.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedStore;

#[async_trait]
impl CertificateStore for UnsupportedStore {
    async fn exists(&self, _common_name: &str) -> Result<bool> {
        Ok(false)
    }

    async fn is_trusted(&self, _common_name: &str) -> Result<bool> {
        Ok(false)
    }

    async fn stored_fingerprint(&self, _common_name: &str) -> Result<Option<Fingerprint>> {
        Ok(None)
    }

    async fn install(&self, _cert_path: &Path) -> Result<()> {
        Err(TrustError::Unsupported(
            "certificate installation is not supported on this platform".into(),
        ))
    }

    async fn remove(&self, _common_name: &str) -> Result<()> {
        Ok(())
    }
}
