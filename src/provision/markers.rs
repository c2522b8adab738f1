//! Persisted provisioning markers: the last successfully installed value of
//! every category, written as one record per provisioning pass.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKey {
    AppVersion,
    ImgVersion,
    MainWrapper,
    DxWrapper,
    DdrawWrapper,
    WinComponents,
    DesktopTheme,
    StartupSelection,
    AudioDriver,
}

impl MarkerKey {
    pub const ALL: [MarkerKey; 9] = [
        MarkerKey::AppVersion,
        MarkerKey::ImgVersion,
        MarkerKey::MainWrapper,
        MarkerKey::DxWrapper,
        MarkerKey::DdrawWrapper,
        MarkerKey::WinComponents,
        MarkerKey::DesktopTheme,
        MarkerKey::StartupSelection,
        MarkerKey::AudioDriver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerKey::AppVersion => "appVersion",
            MarkerKey::ImgVersion => "imgVersion",
            MarkerKey::MainWrapper => "lastInstalledMainWrapper",
            MarkerKey::DxWrapper => "dxwrapper",
            MarkerKey::DdrawWrapper => "ddrawrapper",
            MarkerKey::WinComponents => "wincomponents",
            MarkerKey::DesktopTheme => "desktopTheme",
            MarkerKey::StartupSelection => "startupSelection",
            MarkerKey::AudioDriver => "audioDriver",
        }
    }
}

/// String-keyed marker map. Absent and empty markers read the same.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistedMarkers {
    entries: BTreeMap<String, String>,
}

impl PersistedMarkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: MarkerKey) -> &str {
        self.entries.get(key.as_str()).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, key: MarkerKey, value: impl Into<String>) {
        self.entries.insert(key.as_str().to_string(), value.into());
    }

    pub fn clear(&mut self, key: MarkerKey) {
        self.entries.remove(key.as_str());
    }

    pub fn with(mut self, key: MarkerKey, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// blake3 digest over the sorted `key=value` lines.
    pub fn checksum(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (key, value) in &self.entries {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }
}

#[derive(Debug, Error)]
pub enum MarkerStoreError {
    #[error("marker store I/O during {context} at {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("marker record {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("marker record {} failed checksum (expected {expected}, found {found})", path.display())]
    Checksum {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("failed to encode marker record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unsupported marker record version {0}")]
    Version(u32),
    #[error("marker store poisoned")]
    Poisoned,
}

/// Durable home of [`PersistedMarkers`]. `save` replaces the whole record.
pub trait MarkerStore: Send + Sync {
    fn load(&self) -> Result<PersistedMarkers, MarkerStoreError>;
    fn save(&self, markers: &PersistedMarkers) -> Result<(), MarkerStoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkerRecord {
    version: u32,
    checksum: String,
    markers: PersistedMarkers,
}

/// JSON record on disk, replaced by temp file + fsync + rename.
#[derive(Debug, Clone)]
pub struct FileMarkerStore {
    path: PathBuf,
}

impl FileMarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io(&self, context: &'static str, source: std::io::Error) -> MarkerStoreError {
        MarkerStoreError::Io {
            context,
            path: self.path.clone(),
            source,
        }
    }
}

impl MarkerStore for FileMarkerStore {
    /// A missing record is an empty marker set (first boot).
    fn load(&self) -> Result<PersistedMarkers, MarkerStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedMarkers::new());
            }
            Err(err) => return Err(self.io("read", err)),
        };
        let record: MarkerRecord =
            serde_json::from_str(&raw).map_err(|source| MarkerStoreError::Parse {
                path: self.path.clone(),
                source,
            })?;
        if record.version != RECORD_VERSION {
            return Err(MarkerStoreError::Version(record.version));
        }
        let found = record.markers.checksum();
        if found != record.checksum {
            return Err(MarkerStoreError::Checksum {
                path: self.path.clone(),
                expected: record.checksum,
                found,
            });
        }
        Ok(record.markers)
    }

    fn save(&self, markers: &PersistedMarkers) -> Result<(), MarkerStoreError> {
        let record = MarkerRecord {
            version: RECORD_VERSION,
            checksum: markers.checksum(),
            markers: markers.clone(),
        };
        let json = serde_json::to_vec_pretty(&record).map_err(MarkerStoreError::Encode)?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| self.io("create parent", e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| self.io("create temp", e))?;
        tmp.write_all(&json).map_err(|e| self.io("write temp", e))?;
        tmp.flush().map_err(|e| self.io("flush temp", e))?;
        tmp.as_file().sync_all().map_err(|e| self.io("fsync temp", e))?;
        tmp.persist(&self.path)
            .map_err(|e| self.io("rename", e.error))?;

        File::open(&parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| self.io("fsync parent", e))?;
        Ok(())
    }
}

/// In-memory store counting saves.
#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    markers: Mutex<PersistedMarkers>,
    saves: AtomicUsize,
}

impl MemoryMarkerStore {
    pub fn new(markers: PersistedMarkers) -> Self {
        Self {
            markers: Mutex::new(markers),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> PersistedMarkers {
        self.markers
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn load(&self) -> Result<PersistedMarkers, MarkerStoreError> {
        self.markers
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| MarkerStoreError::Poisoned)
    }

    fn save(&self, markers: &PersistedMarkers) -> Result<(), MarkerStoreError> {
        let mut guard = self.markers.lock().map_err(|_| MarkerStoreError::Poisoned)?;
        *guard = markers.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
