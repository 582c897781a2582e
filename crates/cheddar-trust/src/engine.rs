//! Interface to the traffic-capture engine.
//!
//! The engine itself lives elsewhere; this crate only starts, stops and polls
//! it. Calls are in-process and cheap.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::EngineError;

/// What the engine reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub is_running: bool,
    pub bind_address: String,
    pub port: u16,
}

/// Settings passed to [`ProxyEngine::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub bind_address: String,
    pub port: u16,
}

/// The traffic-capture engine as seen by the reconciler.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Current running flag and bound port.
    fn status(&self) -> Result<EngineStatus, EngineError>;

    /// Starts capturing on the given address.
    async fn start(&self, config: EngineConfig) -> Result<(), EngineError>;

    /// Stops capturing.
    async fn stop(&self) -> Result<(), EngineError>;
}

/// Engine stand-in that just records what it was told.
///
/// Used when the capture engine runs in another process and only its
/// configured state is known.
#[derive(Debug)]
pub struct StaticEngine {
    status: Mutex<EngineStatus>,
}

impl StaticEngine {
    /// Creates an engine bound to `bind_address:port`.
    pub fn new(bind_address: impl Into<String>, port: u16, running: bool) -> Self {
        Self {
            status: Mutex::new(EngineStatus {
                is_running: running,
                bind_address: bind_address.into(),
                port,
            }),
        }
    }
}

#[async_trait]
impl ProxyEngine for StaticEngine {
    fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(self.status.lock().clone())
    }

    async fn start(&self, config: EngineConfig) -> Result<(), EngineError> {
        let mut status = self.status.lock();
        status.is_running = true;
        status.bind_address = config.bind_address;
        status.port = config.port;
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        self.status.lock().is_running = false;
        Ok(())
    }
}
