use std::path::{Path, PathBuf};

use crate::config::EffectiveConfig;

/// Paths inside a guest image rooted at `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestLayout {
    root: PathBuf,
    wine_dir: PathBuf,
    arm64ec: bool,
    win64: bool,
}

impl GuestLayout {
    pub fn new(root: impl Into<PathBuf>, wine_dir: impl Into<PathBuf>, arm64ec: bool, win64: bool) -> Self {
        Self {
            root: root.into(),
            wine_dir: wine_dir.into(),
            arm64ec,
            win64,
        }
    }

    /// Layout for the wine build named by `config.wine_version`, installed
    /// under `<root>/opt/<wine_version>`. Builds suffixed `-x86` are 32-bit.
    pub fn for_config(root: impl Into<PathBuf>, config: &EffectiveConfig) -> Self {
        let root = root.into();
        let wine_dir = root.join("opt").join(&config.wine_version);
        let win64 = !config.wine_version.ends_with("-x86");
        Self::new(root, wine_dir, config.is_arm64ec(), win64)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_arm64ec(&self) -> bool {
        self.arm64ec
    }

    pub fn is_win64(&self) -> bool {
        self.win64
    }

    pub fn prefix_dir(&self) -> PathBuf {
        self.root.join("home/xuser/.wine")
    }

    pub fn windows_dir(&self) -> PathBuf {
        self.prefix_dir().join("drive_c/windows")
    }

    pub fn system32_dir(&self) -> PathBuf {
        self.windows_dir().join("system32")
    }

    pub fn syswow64_dir(&self) -> PathBuf {
        self.windows_dir().join("syswow64")
    }

    pub fn share_dir(&self) -> PathBuf {
        self.root.join("usr/share")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("usr/tmp")
    }

    pub fn wine_dir(&self) -> &Path {
        &self.wine_dir
    }

    /// Builtin 64-bit DLLs shipped with the wine build.
    pub fn builtin_dll_dir_64(&self) -> PathBuf {
        let arch = if self.arm64ec { "aarch64-windows" } else { "x86_64-windows" };
        self.wine_dir.join("lib/wine").join(arch)
    }

    pub fn builtin_dll_dir_32(&self) -> PathBuf {
        self.wine_dir.join("lib/wine/i386-windows")
    }

    /// Resolve a path relative to the prefix `drive_c/windows` directory,
    /// folding `syswow64/` into `system32/` on 32-bit prefixes.
    pub fn windows_path(&self, relative: &str) -> PathBuf {
        self.windows_dir().join(rewrite_for_prefix(relative, self.win64))
    }
}

/// 32-bit prefixes have no `syswow64`; their 32-bit DLLs live in `system32`.
pub fn rewrite_for_prefix(relative: &str, win64: bool) -> String {
    if win64 {
        relative.to_string()
    } else {
        relative.replace("syswow64/", "system32/")
    }
}
