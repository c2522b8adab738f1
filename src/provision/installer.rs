//! Install seams used by the provisioning engine: archive extraction, content
//! profiles, builtin DLL restoration and the windows-component catalog.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::layout::{GuestLayout, rewrite_for_prefix};

pub const ARCHIVE_EXT: &str = "tzst";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("asset `{asset}` not found")]
    AssetMissing { asset: String },
    #[error("extracting `{asset}` into {}: {source}", target.display())]
    Extract {
        asset: String,
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("content profile `{id}` failed: {reason}")]
    ContentProfile { id: String, reason: String },
    #[error("restoring {dll}: {source}")]
    Restore {
        dll: String,
        #[source]
        source: std::io::Error,
    },
    #[error("windows component `{0}` is not in the catalog")]
    UnknownComponent(String),
    #[error("catalog: {0}")]
    Catalog(String),
    #[error("prefix edit of {}: {source}", path.display())]
    Prefix {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Optional per-file path rewrite applied during extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRewrite {
    /// `syswow64/` entries land in `system32/` on 32-bit prefixes.
    FoldSyswow64 { win64: bool },
}

impl PathRewrite {
    pub fn for_layout(layout: &GuestLayout) -> Self {
        PathRewrite::FoldSyswow64 {
            win64: layout.is_win64(),
        }
    }

    pub fn apply(&self, relative: &str) -> String {
        match self {
            PathRewrite::FoldSyswow64 { win64 } => rewrite_for_prefix(relative, *win64),
        }
    }
}

/// One `<category>/<identifier>.tzst` asset to unpack into `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRequest {
    pub category: String,
    pub identifier: String,
    pub target: PathBuf,
    pub rewrite: Option<PathRewrite>,
}

impl ExtractRequest {
    pub fn new(category: &str, identifier: &str, target: impl Into<PathBuf>) -> Self {
        Self {
            category: category.to_string(),
            identifier: identifier.to_string(),
            target: target.into(),
            rewrite: None,
        }
    }

    pub fn with_rewrite(mut self, rewrite: PathRewrite) -> Self {
        self.rewrite = Some(rewrite);
        self
    }

    pub fn asset(&self) -> String {
        format!("{}/{}.{}", self.category, self.identifier, ARCHIVE_EXT)
    }
}

pub trait ArchiveExtractor: Send + Sync {
    fn extract(&self, request: &ExtractRequest) -> Result<(), InstallError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileOutcome {
    Applied,
    NotFound,
}

/// Installed content packages (e.g. downloaded wrapper builds) that take
/// precedence over bundled archives.
pub trait ContentProfiles: Send + Sync {
    fn apply(&self, kind: &str, identifier: &str, target: &Path) -> Result<ProfileOutcome, InstallError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoContentProfiles;

impl ContentProfiles for NoContentProfiles {
    fn apply(&self, _kind: &str, _identifier: &str, _target: &Path) -> Result<ProfileOutcome, InstallError> {
        Ok(ProfileOutcome::NotFound)
    }
}

/// Serves assets unpacked on disk: `<category>/<identifier>.tzst` maps to the
/// directory `<root>/<category>/<identifier>/`, copied file by file.
#[derive(Debug, Clone)]
pub struct DirectoryExtractor {
    root: PathBuf,
}

impl DirectoryExtractor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn copy_tree(
        &self,
        request: &ExtractRequest,
        source_root: &Path,
        dir: &Path,
    ) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.copy_tree(request, source_root, &path)?;
                continue;
            }
            let relative = path
                .strip_prefix(source_root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            let relative = match request.rewrite {
                Some(rewrite) => rewrite.apply(&relative),
                None => relative,
            };
            let dest = request.target.join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&path, &dest)?;
        }
        Ok(())
    }
}

impl ArchiveExtractor for DirectoryExtractor {
    fn extract(&self, request: &ExtractRequest) -> Result<(), InstallError> {
        let source = self.root.join(&request.category).join(&request.identifier);
        if !source.is_dir() {
            return Err(InstallError::AssetMissing {
                asset: request.asset(),
            });
        }
        self.copy_tree(request, &source, &source)
            .map_err(|source| InstallError::Extract {
                asset: request.asset(),
                target: request.target.clone(),
                source,
            })
    }
}

/// Copies builtin DLLs from the wine build back into the prefix, undoing a
/// wrapper install.
#[derive(Debug, Clone)]
pub struct DllRestorer<'a> {
    layout: &'a GuestLayout,
}

impl<'a> DllRestorer<'a> {
    pub fn new(layout: &'a GuestLayout) -> Self {
        Self { layout }
    }

    /// Restore each DLL into `system32` and `syswow64`. Sources absent from
    /// the wine build are skipped. Returns the number of files copied.
    pub fn restore<S: AsRef<str>>(&self, dlls: &[S]) -> Result<usize, InstallError> {
        let targets = [
            (self.layout.builtin_dll_dir_64(), "system32/"),
            (self.layout.builtin_dll_dir_32(), "syswow64/"),
        ];
        let mut copied = 0;
        for dll in dlls {
            let dll = dll.as_ref();
            for (source_dir, subdir) in &targets {
                if !self.layout.is_win64() && *subdir == "system32/" {
                    continue;
                }
                let source = source_dir.join(dll);
                if !source.is_file() {
                    continue;
                }
                let dest = self.layout.windows_path(&format!("{subdir}{dll}"));
                let result = dest
                    .parent()
                    .map(fs::create_dir_all)
                    .unwrap_or(Ok(()))
                    .and_then(|_| fs::copy(&source, &dest));
                result.map_err(|source| InstallError::Restore {
                    dll: dll.to_string(),
                    source,
                })?;
                copied += 1;
            }
        }
        Ok(copied)
    }
}

/// Component name to the DLL (or exe) base names it replaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct WinComponentCatalog {
    entries: BTreeMap<String, Vec<String>>,
}

impl WinComponentCatalog {
    pub fn from_json(raw: &str) -> Result<Self, InstallError> {
        serde_json::from_str(raw).map_err(|e| InstallError::Catalog(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, InstallError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| InstallError::Catalog(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    /// File names for `component`; bare names gain a `.dll` suffix.
    pub fn files(&self, component: &str) -> Result<Vec<String>, InstallError> {
        let names = self
            .entries
            .get(component)
            .ok_or_else(|| InstallError::UnknownComponent(component.to_string()))?;
        Ok(names
            .iter()
            .map(|name| {
                if name.ends_with(".exe") {
                    name.clone()
                } else {
                    format!("{name}.dll")
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_name_follows_category_convention() {
        let request = ExtractRequest::new("dxwrapper", "dxvk-2.3.1", "/prefix");
        assert_eq!(request.asset(), "dxwrapper/dxvk-2.3.1.tzst");
    }

    #[test]
    fn directory_extractor_applies_rewrite() {
        let assets = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let source = assets.path().join("ddrawrapper/cnc-ddraw/syswow64");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("ddraw.dll"), b"cnc").unwrap();

        let extractor = DirectoryExtractor::new(assets.path());
        let request = ExtractRequest::new("ddrawrapper", "cnc-ddraw", target.path())
            .with_rewrite(PathRewrite::FoldSyswow64 { win64: false });
        extractor.extract(&request).unwrap();
        assert!(target.path().join("system32/ddraw.dll").is_file());

        let missing = ExtractRequest::new("ddrawrapper", "nglide", target.path());
        assert!(matches!(
            extractor.extract(&missing),
            Err(InstallError::AssetMissing { .. })
        ));
    }

    #[test]
    fn restorer_copies_available_builtins() {
        let root = tempfile::tempdir().unwrap();
        let layout = GuestLayout::new(root.path(), root.path().join("wine"), false, true);
        fs::create_dir_all(layout.builtin_dll_dir_64()).unwrap();
        fs::create_dir_all(layout.builtin_dll_dir_32()).unwrap();
        fs::write(layout.builtin_dll_dir_64().join("d3d9.dll"), b"64").unwrap();
        fs::write(layout.builtin_dll_dir_32().join("d3d9.dll"), b"32").unwrap();

        let copied = DllRestorer::new(&layout).restore(&["d3d9.dll", "dxgi.dll"]).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(fs::read(layout.system32_dir().join("d3d9.dll")).unwrap(), b"64");
        assert_eq!(fs::read(layout.syswow64_dir().join("d3d9.dll")).unwrap(), b"32");
    }

    #[test]
    fn catalog_appends_dll_suffix() {
        let catalog = WinComponentCatalog::from_json(r#"{"directsound":["dsound","dsdmo"],"wmdecoder":["wmadmod","wmplayer.exe"]}"#).unwrap();
        assert_eq!(catalog.files("directsound").unwrap(), vec!["dsound.dll", "dsdmo.dll"]);
        assert_eq!(catalog.files("wmdecoder").unwrap()[1], "wmplayer.exe");
        assert!(catalog.files("opengl").is_err());
    }
}
