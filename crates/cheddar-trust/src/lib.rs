//! CA certificate trust and system proxy management for Cheddar Proxy.
//!
//! This crate decides whether the locally generated CA certificate is
//! installed and trusted by the OS, installs it through a chain of fallback
//! strategies, points the OS HTTP/HTTPS proxy at the local capture engine, and
//! keeps both converged with the recording state.
//!
//! All OS interaction goes through a [`ProcessInvoker`] running the platform's
//! own tools (`security` and `networksetup`, or `certutil` and `reg`).
//!
//! # Example
//!
//! ```no_run
//! use cheddar_trust::{TrustConfig, TrustService};
//!
//! # async fn demo() {
//! let service = TrustService::new(TrustConfig::default());
//! let path = service.default_certificate_path();
//!
//! if !service.certificate_status(&path, false).await.is_trusted() {
//!     service.trust_and_import_certificate(&path).await;
//! }
//! service.enable_system_proxy(9090).await;
//! # }
//! ```

pub mod cert_info;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod install;
pub mod platform;
pub mod process;
pub mod reconcile;
pub mod service;
pub mod status;
pub mod store;
pub mod system_proxy;

#[cfg(test)]
pub(crate) mod testing;

pub use cert_info::CertificateInfo;
pub use config::TrustConfig;
pub use engine::{EngineConfig, EngineStatus, ProxyEngine, StaticEngine};
pub use error::{EngineError, Result, TrustError};
pub use fingerprint::Fingerprint;
pub use install::{HostTrustChannel, TrustStrategy};
pub use platform::Platform;
pub use process::{ProcessInvoker, ProcessOutput, TokioProcessInvoker};
pub use reconcile::{ProxyDesiredState, Reconciler, ReconcilerHandle, TrustSnapshot};
pub use service::{TrustService, TrustServiceBuilder};
pub use status::CertificateStatus;
pub use store::CertificateStore;
pub use system_proxy::SystemProxy;
