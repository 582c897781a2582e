//! OS-level HTTP/HTTPS proxy configuration.

mod networksetup;
mod registry;
mod unsupported;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, TrustError};
use crate::platform::Platform;
use crate::process::ProcessInvoker;

pub use networksetup::NetworkSetupProxy;
pub use registry::RegistryProxy;
pub use unsupported::UnsupportedProxy;

/// Reads and writes the OS proxy settings.
///
/// `enable` and `disable` run every sub-step in a fixed order even when one
/// fails, and return the first failure once all have run.
#[async_trait]
pub trait SystemProxy: Send + Sync {
    /// True when both the HTTP and HTTPS proxies are enabled at `host:port`.
    async fn is_configured(&self, host: &str, port: u16) -> Result<bool>;

    /// Points the HTTP and HTTPS proxies at `host:port` and enables them.
    async fn enable(&self, host: &str, port: u16) -> Result<()>;

    /// Turns the HTTP and HTTPS proxies off.
    async fn disable(&self) -> Result<()>;
}

/// Builds the proxy configurator for a platform.
pub fn for_platform(platform: Platform, invoker: Arc<dyn ProcessInvoker>) -> Arc<dyn SystemProxy> {
    match platform {
        Platform::Keychain => Arc::new(NetworkSetupProxy::new(invoker)),
        Platform::Store => Arc::new(RegistryProxy::new(invoker)),
        Platform::Unsupported => Arc::new(UnsupportedProxy),
    }
}

/// Runs sub-steps in order, logging failures and keeping the first one.
struct StepRunner<'a> {
    invoker: &'a dyn ProcessInvoker,
    program: &'static str,
    first_error: Option<TrustError>,
}

impl<'a> StepRunner<'a> {
    fn new(invoker: &'a dyn ProcessInvoker, program: &'static str) -> Self {
        Self {
            invoker,
            program,
            first_error: None,
        }
    }

    async fn step(&mut self, args: &[&str]) {
        let result = match self.invoker.run(self.program, args).await {
            Ok(out) => out.into_success(self.program).map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(program = self.program, ?args, "Proxy sub-step failed: {}", e);
            self.first_error.get_or_insert(e);
        }
    }

    fn finish(self) -> Result<()> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
