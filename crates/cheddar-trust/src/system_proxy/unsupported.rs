//! Proxy configurator for platforms without proxy integration.

use async_trait::async_trait;

use super::SystemProxy;
use crate::error::{Result, TrustError};

/// Never configured; enabling fails, disabling is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedProxy;

#[async_trait]
impl SystemProxy for UnsupportedProxy {
    async fn is_configured(&self, _host: &str, _port: u16) -> Result<bool> {
        Ok(false)
    }

    async fn enable(&self, _host: &str, _port: u16) -> Result<()> {
        Err(TrustError::Unsupported(
            "system proxy configuration is not supported on this platform".into(),
        ))
    }

    async fn disable(&self) -> Result<()> {
        Ok(())
    }
}
