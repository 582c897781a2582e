//! Certificate trust installation chain.
//!
//! Tiers run in a fixed order until one of the trust tiers succeeds:
//!
//! ```text
//! StoreInstall ──fail──▶ abort (false)
//!      │ ok
//!      ▼
//! HostIntegration ──unavailable/fail──▶ Helper ──fail──▶ Manual (false)
//!      │ ok                               │ ok
//!      ▼                                  ▼
//!    true                               true
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Result, TrustError};
use crate::fingerprint;
use crate::platform::Platform;
use crate::process::ProcessInvoker;
use crate::store::{path_arg, CertificateStore};

/// In-process host trust API (e.g. a native bridge with privileged access).
///
/// Returning [`TrustError::HostIntegrationUnavailable`] means "not wired up"
/// and moves the chain to the helper tier.
#[async_trait]
pub trait HostTrustChannel: Send + Sync {
    /// Marks the certificate at `cert_path` as a trusted root.
    async fn trust_certificate(&self, cert_path: &Path) -> Result<()>;
}

/// One strategy of the install chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustStrategy {
    /// Add the certificate to a user-writable store.
    StoreInstall,
    /// Trust through the in-process host channel.
    HostIntegration,
    /// Trust through a helper program run out of process.
    Helper,
    /// Open the OS certificate viewer for the user.
    Manual,
}

impl TrustStrategy {
    /// Trust tiers tried after the store install, in order.
    pub const TRUST_TIERS: [TrustStrategy; 3] = [Self::HostIntegration, Self::Helper, Self::Manual];

    /// Returns the strategy as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreInstall => "store_install",
            Self::HostIntegration => "host_integration",
            Self::Helper => "helper",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for TrustStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TrustInstallAttempt {
    pub strategy: TrustStrategy,
    pub succeeded: bool,
    pub diagnostic: String,
}

/// Result of a full chain run.
#[derive(Debug, Clone, Default)]
pub(crate) struct InstallOutcome {
    pub trusted: bool,
    pub attempts: Vec<TrustInstallAttempt>,
}

impl InstallOutcome {
    fn record(&mut self, strategy: TrustStrategy, result: &Result<()>) {
        let attempt = match result {
            Ok(()) => TrustInstallAttempt {
                strategy,
                succeeded: true,
                diagnostic: String::from("ok"),
            },
            Err(e) => TrustInstallAttempt {
                strategy,
                succeeded: false,
                diagnostic: e.to_string(),
            },
        };

        if attempt.succeeded {
            tracing::info!(strategy = %strategy, "Trust tier succeeded");
        } else {
            tracing::warn!(strategy = %strategy, "Trust tier failed: {}", attempt.diagnostic);
        }
        self.attempts.push(attempt);
    }

    #[cfg(test)]
    pub fn strategies(&self) -> Vec<TrustStrategy> {
        self.attempts.iter().map(|a| a.strategy).collect()
    }
}

const KEYCHAIN_HELPER: &str = r#"#!/bin/sh
# Marks a certificate as a trusted root in the login keychain.
set -e
exec security add-trusted-cert -r trustRoot -k "$HOME/Library/Keychains/login.keychain-db" "$1"
"#;

const STORE_HELPER: &str = r#"param([Parameter(Mandatory = $true)][string]$CertPath)
# Adds a certificate to the machine Root store through a UAC prompt.
$process = Start-Process -FilePath 'certutil' -ArgumentList '-addstore', 'Root', "`"$CertPath`"" -Verb RunAs -Wait -PassThru -WindowStyle Hidden
exit $process.ExitCode
"#;

/// Runs the ordered install tiers for one certificate.
pub(crate) struct InstallChain<'a> {
    pub platform: Platform,
    pub invoker: &'a dyn ProcessInvoker,
    pub store: &'a dyn CertificateStore,
    pub host: Option<&'a dyn HostTrustChannel>,
    pub common_name: &'a str,
    pub scratch_dir: &'a Path,
}

impl InstallChain<'_> {
    /// Runs the chain. Never fails; the outcome records every tier.
    pub async fn run(&self, cert_path: &Path) -> InstallOutcome {
        let mut outcome = InstallOutcome::default();

        self.replace_stale(cert_path).await;

        let installed = self.store.install(cert_path).await;
        outcome.record(TrustStrategy::StoreInstall, &installed);
        if installed.is_err() {
            return outcome;
        }

        for strategy in TrustStrategy::TRUST_TIERS {
            let result = self.attempt(strategy, cert_path).await;
            outcome.record(strategy, &result);
            if result.is_ok() {
                outcome.trusted = strategy != TrustStrategy::Manual;
                break;
            }
        }
        outcome
    }

    async fn attempt(&self, strategy: TrustStrategy, cert_path: &Path) -> Result<()> {
        match strategy {
            TrustStrategy::StoreInstall => self.store.install(cert_path).await,
            TrustStrategy::HostIntegration => match self.host {
                Some(host) => host.trust_certificate(cert_path).await,
                None => Err(TrustError::HostIntegrationUnavailable),
            },
            TrustStrategy::Helper => self.run_helper(cert_path).await,
            TrustStrategy::Manual => self.open_viewer(cert_path).await,
        }
    }

    /// Removes a store entry whose fingerprint differs from the file.
    async fn replace_stale(&self, cert_path: &Path) {
        let Ok(Some(entry)) = self.store.lookup(self.common_name).await else {
            return;
        };
        let (Some(stored), Ok(on_disk)) =
            (entry.fingerprint, fingerprint::of_file(cert_path).await)
        else {
            return;
        };
        if stored == on_disk {
            return;
        }

        tracing::info!(
            "Removing stale '{}' ({}) before installing {}",
            self.common_name,
            stored,
            on_disk
        );
        if let Err(e) = self.store.remove(self.common_name).await {
            tracing::warn!("Failed to remove stale certificate: {}", e);
        }
    }

    async fn write_helper(&self, file_name: &str, contents: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(self.scratch_dir).await?;
        let path = self.scratch_dir.join(file_name);
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    async fn run_helper(&self, cert_path: &Path) -> Result<()> {
        let cert = path_arg(cert_path);
        let (program, out) = match self.platform {
            Platform::Keychain => {
                let script = self
                    .write_helper("cheddar-trust-helper.sh", KEYCHAIN_HELPER)
                    .await?;
                let out = self
                    .invoker
                    .run("/bin/sh", &[&path_arg(&script), &cert])
                    .await?;
                ("/bin/sh", out)
            }
            Platform::Store => {
                let script = self
                    .write_helper("cheddar-trust-helper.ps1", STORE_HELPER)
                    .await?;
                let out = self
                    .invoker
                    .run(
                        "powershell",
                        &[
                            "-NoProfile",
                            "-ExecutionPolicy",
                            "Bypass",
                            "-File",
                            &path_arg(&script),
                            &cert,
                        ],
                    )
                    .await?;
                ("powershell", out)
            }
            Platform::Unsupported => {
                return Err(TrustError::Unsupported("no trust helper".into()));
            }
        };

        if out.success() {
            return Ok(());
        }
        let text = out.combined_lowercase();
        if text.contains("canceled by the user")
            || text.contains("cancelled by the user")
            || text.contains("authorization")
        {
            return Err(TrustError::ElevationRequired(out.stderr.trim().to_string()));
        }
        out.into_success(program).map(|_| ())
    }

    async fn open_viewer(&self, cert_path: &Path) -> Result<()> {
        let cert = path_arg(cert_path);
        let (program, out) = match self.platform {
            Platform::Keychain => (
                "open",
                self.invoker
                    .run("open", &["-a", "Keychain Access", &cert])
                    .await?,
            ),
            Platform::Store => (
                "rundll32.exe",
                self.invoker
                    .run("rundll32.exe", &["cryptext.dll,CryptExtOpenCER", &cert])
                    .await?,
            ),
            Platform::Unsupported => {
                return Err(TrustError::Unsupported("no certificate viewer".into()));
            }
        };
        out.into_success(program).map(|_| ())
    }
}
