//! Certificate trust status and its TTL cache.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::fingerprint::Fingerprint;

/// Trust state of the CA certificate, in display severity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    /// No file on disk, or no store entry under the common name.
    NotInstalled,
    /// In the store, but trust verification fails.
    NotTrusted,
    /// Trusted, but the store copy differs from the file on disk.
    Mismatch,
    /// Installed, trusted and consistent with the file on disk.
    Trusted,
}

impl CertificateStatus {
    /// Returns the status as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInstalled => "not_installed",
            Self::NotTrusted => "not_trusted",
            Self::Mismatch => "mismatch",
            Self::Trusted => "trusted",
        }
    }

    /// Returns true only for [`CertificateStatus::Trusted`].
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Trusted)
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Facts gathered about the certificate; an unknown fingerprint is `None`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Observation {
    pub file_present: bool,
    pub in_store: bool,
    pub trusted: bool,
    pub stored_fingerprint: Option<Fingerprint>,
    pub file_fingerprint: Option<Fingerprint>,
}

impl Observation {
    pub fn status(&self) -> CertificateStatus {
        if !self.file_present || !self.in_store {
            return CertificateStatus::NotInstalled;
        }
        if !self.trusted {
            return CertificateStatus::NotTrusted;
        }
        match (&self.stored_fingerprint, &self.file_fingerprint) {
            (Some(stored), Some(file)) if stored != file => CertificateStatus::Mismatch,
            _ => CertificateStatus::Trusted,
        }
    }
}

#[derive(Debug, Clone)]
struct Cached {
    path: PathBuf,
    status: CertificateStatus,
    checked_at: Instant,
}

/// Last computed status with a time-to-live.
///
/// Writes happen only while holding the refresh slot, so there is a single
/// writer at a time. Requests that find the slot taken queue on it and can
/// reuse whatever the holder stored.
#[derive(Debug)]
pub(crate) struct StatusCache {
    ttl: Duration,
    entry: Mutex<Option<Cached>>,
    refreshing: AsyncMutex<()>,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
            refreshing: AsyncMutex::new(()),
        }
    }

    /// Cached status for `path` if younger than the TTL.
    pub fn fresh(&self, path: &Path) -> Option<CertificateStatus> {
        self.entry
            .lock()
            .as_ref()
            .filter(|cached| cached.path == path && cached.checked_at.elapsed() < self.ttl)
            .map(|cached| cached.status)
    }

    /// Cached status for `path` if it was computed at or after `instant`.
    pub fn checked_since(&self, path: &Path, instant: Instant) -> Option<CertificateStatus> {
        self.entry
            .lock()
            .as_ref()
            .filter(|cached| cached.path == path && cached.checked_at >= instant)
            .map(|cached| cached.status)
    }

    /// Claims the refresh slot; `None` while another refresh runs.
    pub fn begin_refresh(&self) -> Option<RefreshGuard<'_>> {
        self.refreshing
            .try_lock()
            .ok()
            .map(|slot| RefreshGuard {
                cache: self,
                _slot: slot,
            })
    }

    /// Waits for the refresh slot.
    pub async fn wait_refresh(&self) -> RefreshGuard<'_> {
        let slot = self.refreshing.lock().await;
        RefreshGuard {
            cache: self,
            _slot: slot,
        }
    }

    pub fn invalidate(&self) {
        *self.entry.lock() = None;
    }
}

/// Exclusive right to write the cache. Releases the slot on drop.
pub(crate) struct RefreshGuard<'a> {
    cache: &'a StatusCache,
    _slot: AsyncMutexGuard<'a, ()>,
}

impl RefreshGuard<'_> {
    pub fn store(&self, path: &Path, status: CertificateStatus) {
        *self.cache.entry.lock() = Some(Cached {
            path: path.to_path_buf(),
            status,
            checked_at: Instant::now(),
        });
    }
}
