//! Platform strategy selection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which family of OS integrations applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Keychain based trust and `networksetup` proxies (macOS).
    Keychain,
    /// Certificate store based trust and registry proxies (Windows).
    Store,
    /// No OS integration available.
    Unsupported,
}

impl Platform {
    /// Detects the platform of the running binary.
    pub const fn detect() -> Self {
        if cfg!(target_os = "macos") {
            Self::Keychain
        } else if cfg!(target_os = "windows") {
            Self::Store
        } else {
            Self::Unsupported
        }
    }

    /// Returns the platform as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keychain => "keychain",
            Self::Store => "store",
            Self::Unsupported => "unsupported",
        }
    }

    /// Returns true when trust and proxy operations can do anything here.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::detect()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
