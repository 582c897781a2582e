//! Reconciliation of OS proxy settings and certificate status.
//!
//! Each cycle refreshes the certificate status (subject to the cache TTL) and,
//! concurrently, polls the engine and converges the system proxy:
//!
//! - engine running flag changed: enable/disable the system proxy to match
//! - not recording: the system proxy must be off
//! - recording: the system proxy must point at the engine port
//!
//! One [`TrustSnapshot`] is broadcast per cycle, and only when something
//! observable changed or a correction was made.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::engine::{EngineConfig, ProxyEngine};
use crate::error::EngineError;
use crate::service::TrustService;
use crate::status::CertificateStatus;

/// Recording state the session layer wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProxyDesiredState {
    pub should_be_recording: bool,
    pub port: u16,
}

/// Observable state published after a cycle that changed something.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustSnapshot {
    pub certificate_status: CertificateStatus,
    pub is_recording: bool,
    pub is_system_proxy_enabled: bool,
    pub port: u16,
    /// The engine's running flag disagrees with the desired state.
    pub diverged: bool,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observed {
    certificate_status: CertificateStatus,
    is_recording: bool,
    is_system_proxy_enabled: bool,
    port: u16,
    diverged: bool,
}

impl Observed {
    fn snapshot(self, observed_at: DateTime<Utc>) -> TrustSnapshot {
        TrustSnapshot {
            certificate_status: self.certificate_status,
            is_recording: self.is_recording,
            is_system_proxy_enabled: self.is_system_proxy_enabled,
            port: self.port,
            diverged: self.diverged,
            observed_at,
        }
    }
}

/// What the reconciler last saw of the engine and the system proxy.
#[derive(Debug, Clone, Copy)]
struct Mirror {
    is_recording: bool,
    is_system_proxy_enabled: bool,
    port: u16,
}

/// Clears the toggle flag when the toggle finishes or is dropped.
struct ToggleGuard<'a>(&'a AtomicBool);

impl Drop for ToggleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Converges OS state toward the desired recording state.
pub struct Reconciler {
    service: Arc<TrustService>,
    engine: Arc<dyn ProxyEngine>,
    cert_path: PathBuf,
    desired: RwLock<ProxyDesiredState>,
    mirror: Mutex<Mirror>,
    last_published: Mutex<Option<Observed>>,
    toggling: AtomicBool,
    events: broadcast::Sender<TrustSnapshot>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("cert_path", &self.cert_path)
            .field("desired", &*self.desired.read())
            .field("mirror", &*self.mirror.lock())
            .finish()
    }
}

impl Reconciler {
    /// Creates a reconciler for the service's default certificate path.
    pub fn new(
        service: Arc<TrustService>,
        engine: Arc<dyn ProxyEngine>,
        desired: ProxyDesiredState,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            cert_path: service.default_certificate_path(),
            service,
            engine,
            desired: RwLock::new(desired),
            mirror: Mutex::new(Mirror {
                is_recording: false,
                is_system_proxy_enabled: false,
                port: desired.port,
            }),
            last_published: Mutex::new(None),
            toggling: AtomicBool::new(false),
            events,
        }
    }

    /// Receives a snapshot after every cycle that changed something.
    pub fn subscribe(&self) -> broadcast::Receiver<TrustSnapshot> {
        self.events.subscribe()
    }

    pub fn desired(&self) -> ProxyDesiredState {
        *self.desired.read()
    }

    pub fn set_desired(&self, desired: ProxyDesiredState) {
        *self.desired.write() = desired;
    }

    /// Engine running flag as of the last cycle or toggle.
    pub fn is_recording(&self) -> bool {
        self.mirror.lock().is_recording
    }

    pub fn is_system_proxy_enabled(&self) -> bool {
        self.mirror.lock().is_system_proxy_enabled
    }

    /// Runs one cycle. Returns the snapshot if one was broadcast.
    pub async fn run_cycle(&self) -> Option<TrustSnapshot> {
        let (certificate_status, corrected) = tokio::join!(
            self.service.certificate_status(&self.cert_path, false),
            self.converge_proxy()
        );

        let mirror = *self.mirror.lock();
        let desired = self.desired();
        let observed = Observed {
            certificate_status,
            is_recording: mirror.is_recording,
            is_system_proxy_enabled: mirror.is_system_proxy_enabled,
            port: mirror.port,
            diverged: desired.should_be_recording != mirror.is_recording,
        };

        {
            let mut last = self.last_published.lock();
            if !corrected && *last == Some(observed) {
                return None;
            }
            *last = Some(observed);
        }

        if observed.diverged {
            tracing::warn!(
                desired = desired.should_be_recording,
                actual = observed.is_recording,
                "Engine recording state diverges from desired state"
            );
        }

        let snapshot = observed.snapshot(Utc::now());
        // No subscribers is fine.
        let _ = self.events.send(snapshot.clone());
        Some(snapshot)
    }

    /// Polls the engine and fixes the system proxy. Returns true if a
    /// correction was applied.
    async fn converge_proxy(&self) -> bool {
        if self.toggling.load(Ordering::Acquire) {
            tracing::debug!("Recording toggle in flight, skipping proxy convergence");
            return false;
        }

        let engine = match self.engine.status() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Engine status unavailable, skipping proxy convergence: {}", e);
                return false;
            }
        };

        let prior = *self.mirror.lock();
        let port = if engine.port != 0 {
            engine.port
        } else {
            self.desired().port
        };
        let mut proxy_enabled = prior.is_system_proxy_enabled;
        let mut corrected = false;

        if engine.is_running != prior.is_recording {
            tracing::info!(running = engine.is_running, port, "Engine running state changed");
            if engine.is_running {
                proxy_enabled = self.service.enable_system_proxy(port).await;
                corrected = proxy_enabled;
            } else if self.service.disable_system_proxy().await {
                proxy_enabled = false;
                corrected = true;
            }
        }

        if !engine.is_running {
            if proxy_enabled || self.service.is_proxy_configured(port).await {
                tracing::info!("System proxy on while not recording, disabling");
                if self.service.disable_system_proxy().await {
                    proxy_enabled = false;
                    corrected = true;
                }
            }
        } else if self.service.is_proxy_configured(port).await {
            proxy_enabled = true;
        } else {
            tracing::info!("System proxy does not point at port {}, re-enabling", port);
            proxy_enabled = self.service.enable_system_proxy(port).await;
            corrected |= proxy_enabled;
        }

        let mut mirror = self.mirror.lock();
        mirror.is_recording = engine.is_running;
        mirror.is_system_proxy_enabled = proxy_enabled;
        mirror.port = port;
        corrected
    }

    /// Starts or stops the engine.
    ///
    /// A second call while one is running is rejected with
    /// [`EngineError::Busy`]. The recording flag is flipped up front and
    /// restored if the engine refuses.
    pub async fn set_recording(&self, on: bool) -> Result<(), EngineError> {
        if self
            .toggling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Ignoring recording toggle, another one is in progress");
            return Err(EngineError::Busy);
        }
        let _guard = ToggleGuard(&self.toggling);

        let prior_recording = std::mem::replace(&mut self.mirror.lock().is_recording, on);
        let prior_desired = {
            let mut desired = self.desired.write();
            let prior = *desired;
            desired.should_be_recording = on;
            prior
        };

        let result = if on {
            self.engine
                .start(EngineConfig {
                    bind_address: self.service.config().proxy_host_name().to_string(),
                    port: prior_desired.port,
                })
                .await
        } else {
            self.engine.stop().await
        };

        match &result {
            Ok(()) => tracing::info!(recording = on, "Recording toggled"),
            Err(e) => {
                tracing::warn!("Recording toggle failed, rolling back: {}", e);
                self.mirror.lock().is_recording = prior_recording;
                *self.desired.write() = prior_desired;
            }
        }
        result
    }

    /// Runs a cycle now and then every reconcile interval until shut down.
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let interval = self.service.config().reconcile_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {}
                }
                // Dropping the cycle discards whatever it was waiting on.
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = self.run_cycle() => {}
                }
            }
            tracing::info!("Reconciler stopped");
        });

        ReconcilerHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// Handle to a spawned [`Reconciler`] loop.
pub struct ReconcilerHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signals the loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the loop to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Signals the loop to stop and waits for it.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
