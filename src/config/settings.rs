use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Host-side settings for a session runtime, usually loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Root of the guest image filesystem; sockets and the prefix live below it.
    pub session_root: PathBuf,
    /// Where the provisioning marker record is persisted.
    pub marker_path: PathBuf,
    pub app_version: String,
    pub image_version: String,
    /// Binary that launches the guest command inside the image.
    pub launcher_program: PathBuf,
    pub use_dri3: bool,
    pub debug: DebugSettings,
    pub capture: CaptureSettings,
    pub log_path: Option<PathBuf>,
    pub log_max_bytes: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            session_root: PathBuf::from("imagefs"),
            marker_path: PathBuf::from("imagefs/.session-markers.json"),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            image_version: "1".to_string(),
            launcher_program: PathBuf::from("imagefs/usr/local/bin/guest-launcher"),
            use_dri3: true,
            debug: DebugSettings::default(),
            capture: CaptureSettings::default(),
            log_path: None,
            log_max_bytes: 1024 * 1024,
        }
    }
}

impl RuntimeSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    pub wine_debug: bool,
    pub wine_debug_channels: String,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            wine_debug: false,
            wine_debug_channels: "warn,err,fixme".to_string(),
        }
    }
}

impl DebugSettings {
    /// `WINEDEBUG` value: `+a,+b` when enabled with channels, `-all` otherwise.
    pub fn winedebug(&self) -> String {
        if self.wine_debug && !self.wine_debug_channels.is_empty() {
            format!("+{}", self.wine_debug_channels.replace(',', ",+"))
        } else {
            "-all".to_string()
        }
    }
}

/// Timings for the pointer-capture state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub poll_interval_ms: u64,
    pub recapture_delay_ms: u64,
    pub drawer_recapture_delay_ms: u64,
    /// Give up polling for focus after this many attempts. `None` polls until
    /// focus arrives or capture is disabled.
    pub max_poll_attempts: Option<u32>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            recapture_delay_ms: 10_000,
            drawer_recapture_delay_ms: 2_000,
            max_poll_attempts: None,
        }
    }
}

impl CaptureSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn recapture_delay(&self) -> Duration {
        Duration::from_millis(self.recapture_delay_ms)
    }

    pub fn drawer_recapture_delay(&self) -> Duration {
        Duration::from_millis(self.drawer_recapture_delay_ms)
    }
}
