use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use super::installer::{
    ArchiveExtractor, ContentProfiles, DllRestorer, ExtractRequest, InstallError, PathRewrite,
    ProfileOutcome, WinComponentCatalog,
};
use super::markers::{MarkerKey, MarkerStore, MarkerStoreError, PersistedMarkers};
use super::prefix::{PrefixEditor, sync_drive_links};
use super::version::compare_versions;
use crate::config::{AudioDriver, EffectiveConfig, KeyValueSet, StartupMode, defaults};
use crate::layout::GuestLayout;
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};

const TARGET: &str = "guest::provision";

/// DLLs a d3d wrapper replaces; restored from the wine build for wined3d.
const D3D_DLLS: [&str; 9] = [
    "d3d10.dll",
    "d3d10_1.dll",
    "d3d10core.dll",
    "d3d11.dll",
    "d3d12.dll",
    "d3d12core.dll",
    "d3d8.dll",
    "d3d9.dll",
    "dxgi.dll",
];
const DDRAW_DLLS: [&str; 2] = ["ddraw.dll", "d3dimm.dll"];
const GLIDE_DLLS: [&str; 6] = [
    "glide.dll",
    "glide2x.dll",
    "glide3x.dll",
    "3DfxSpl.dll",
    "3DfxSpl2.dll",
    "3DfxSpl3.dll",
];
/// dxvk build bundled alongside every vkd3d install.
const VKD3D_COMPANION_DXVK: &str = "dxvk-2.4.1";
const D8VK_VERSION: &str = "1.0";
/// dxvk releases before this lack d3d8 support and ship with d8vk.
const D8VK_CUTOFF: &str = "2.4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    SystemPatches,
    GraphicsWrapper,
    DxWrapper,
    DdrawWrapper,
    WinComponents,
    DesktopTheme,
    StartupMode,
    AudioDriver,
    /// `dosdevices` links; checked every pass, no marker.
    DriveLinks,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::SystemPatches => "system_patches",
            Category::GraphicsWrapper => "graphics_wrapper",
            Category::DxWrapper => "dx_wrapper",
            Category::DdrawWrapper => "ddraw_wrapper",
            Category::WinComponents => "win_components",
            Category::DesktopTheme => "desktop_theme",
            Category::StartupMode => "startup_mode",
            Category::AudioDriver => "audio_driver",
            Category::DriveLinks => "drive_links",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single category's install failure. Non-fatal: the marker stays stale and
/// the category is retried on the next pass.
#[derive(Debug, Error)]
#[error("provisioning {category} failed: {source}")]
pub struct ProvisionError {
    pub category: Category,
    #[source]
    pub source: InstallError,
}

#[derive(Debug)]
pub struct ProvisionReport {
    pub markers: PersistedMarkers,
    pub installed: Vec<Category>,
    pub failed: Vec<ProvisionError>,
    pub first_boot: bool,
    /// Any marker differs from the input set.
    pub staged: bool,
}

impl ProvisionReport {
    pub fn any_installed(&self) -> bool {
        !self.installed.is_empty()
    }

    pub fn failed_categories(&self) -> Vec<Category> {
        self.failed.iter().map(|err| err.category).collect()
    }
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("loading markers: {0}")]
    Load(#[source] MarkerStoreError),
    #[error("persisting markers: {0}")]
    Save(#[source] MarkerStoreError),
}

struct InstallContext<'a> {
    config: &'a EffectiveConfig,
    layout: &'a GuestLayout,
    first_boot: bool,
    previous: &'a str,
}

type CurrentValue = fn(&EffectiveConfig) -> String;
type InstallAction = fn(&ProvisioningEngine, &InstallContext<'_>) -> Result<(), InstallError>;

struct CategoryStep {
    category: Category,
    marker: MarkerKey,
    current: CurrentValue,
    install: InstallAction,
}

const STEPS: [CategoryStep; 7] = [
    CategoryStep {
        category: Category::GraphicsWrapper,
        marker: MarkerKey::MainWrapper,
        current: current_graphics_driver,
        install: ProvisioningEngine::install_graphics_wrapper,
    },
    CategoryStep {
        category: Category::DxWrapper,
        marker: MarkerKey::DxWrapper,
        current: current_dx_wrapper,
        install: ProvisioningEngine::install_dx_wrapper,
    },
    CategoryStep {
        category: Category::DdrawWrapper,
        marker: MarkerKey::DdrawWrapper,
        current: current_ddraw_wrapper,
        install: ProvisioningEngine::install_ddraw_wrapper,
    },
    CategoryStep {
        category: Category::WinComponents,
        marker: MarkerKey::WinComponents,
        current: current_win_components,
        install: ProvisioningEngine::install_win_components,
    },
    CategoryStep {
        category: Category::DesktopTheme,
        marker: MarkerKey::DesktopTheme,
        current: current_desktop_theme,
        install: ProvisioningEngine::install_desktop_theme,
    },
    CategoryStep {
        category: Category::StartupMode,
        marker: MarkerKey::StartupSelection,
        current: current_startup_mode,
        install: ProvisioningEngine::install_startup_mode,
    },
    CategoryStep {
        category: Category::AudioDriver,
        marker: MarkerKey::AudioDriver,
        current: current_audio_driver,
        install: ProvisioningEngine::install_audio_driver,
    },
];

fn current_graphics_driver(config: &EffectiveConfig) -> String {
    config.graphics_driver.clone()
}

fn current_dx_wrapper(config: &EffectiveConfig) -> String {
    config.dx_wrapper_id()
}

fn current_ddraw_wrapper(config: &EffectiveConfig) -> String {
    config.ddraw_wrapper.clone()
}

fn current_win_components(config: &EffectiveConfig) -> String {
    config.win_components.to_string()
}

fn current_desktop_theme(config: &EffectiveConfig) -> String {
    config.desktop_theme_id()
}

fn current_startup_mode(config: &EffectiveConfig) -> String {
    config.startup_mode.code().to_string()
}

fn current_audio_driver(config: &EffectiveConfig) -> String {
    config.audio_driver.as_str().to_string()
}

/// Collaborators an engine installs through.
#[derive(Clone)]
pub struct ProvisionDeps {
    pub extractor: Arc<dyn ArchiveExtractor>,
    pub profiles: Arc<dyn ContentProfiles>,
    pub prefix: Arc<dyn PrefixEditor>,
    pub catalog: WinComponentCatalog,
}

impl fmt::Debug for ProvisionDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionDeps")
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

/// Compares an [`EffectiveConfig`] against persisted markers and installs the
/// categories that changed.
#[derive(Debug)]
pub struct ProvisioningEngine {
    root: PathBuf,
    app_version: String,
    image_version: String,
    deps: ProvisionDeps,
    logger: Option<Logger>,
}

impl ProvisioningEngine {
    pub fn new(
        root: impl Into<PathBuf>,
        app_version: impl Into<String>,
        image_version: impl Into<String>,
        deps: ProvisionDeps,
    ) -> Self {
        Self {
            root: root.into(),
            app_version: app_version.into(),
            image_version: image_version.into(),
            deps,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Run one pass. Category failures are collected in the report; they never
    /// abort the pass or touch other categories' markers.
    pub fn provision(&self, config: &EffectiveConfig, markers: PersistedMarkers) -> ProvisionReport {
        let layout = GuestLayout::for_config(&self.root, config);
        let first_boot = markers.get(MarkerKey::AppVersion).is_empty();
        let mut staged = markers.clone();
        let mut installed = Vec::new();
        let mut failed = Vec::new();

        emit(
            self.logger.as_ref(),
            LogLevel::Info,
            TARGET,
            "pass_started",
            [json_kv("first_boot", first_boot)],
        );

        let patches_due = markers.get(MarkerKey::AppVersion) != self.app_version
            || markers.get(MarkerKey::ImgVersion) != self.image_version;
        if patches_due {
            match self.apply_system_patches(&layout) {
                Ok(()) => {
                    staged.set(MarkerKey::AppVersion, self.app_version.clone());
                    staged.set(MarkerKey::ImgVersion, self.image_version.clone());
                    // Patches overwrite the theme and wrapper files.
                    staged.clear(MarkerKey::MainWrapper);
                    staged.clear(MarkerKey::DesktopTheme);
                    installed.push(Category::SystemPatches);
                }
                Err(source) => {
                    self.log_failure(Category::SystemPatches, &source);
                    failed.push(ProvisionError {
                        category: Category::SystemPatches,
                        source,
                    });
                }
            }
        }

        for step in &STEPS {
            let current = (step.current)(config);
            let previous = staged.get(step.marker).to_string();
            if !first_boot && current == previous {
                continue;
            }
            let ctx = InstallContext {
                config,
                layout: &layout,
                first_boot,
                previous: &previous,
            };
            match (step.install)(self, &ctx) {
                Ok(()) => {
                    emit(
                        self.logger.as_ref(),
                        LogLevel::Info,
                        TARGET,
                        "category_installed",
                        [
                            json_str("category", step.category.as_str()),
                            json_str("value", current.clone()),
                        ],
                    );
                    staged.set(step.marker, current);
                    installed.push(step.category);
                }
                Err(source) => {
                    self.log_failure(step.category, &source);
                    failed.push(ProvisionError {
                        category: step.category,
                        source,
                    });
                }
            }
        }

        match sync_drive_links(&layout.prefix_dir(), layout.root(), &config.drives) {
            Ok(true) => installed.push(Category::DriveLinks),
            Ok(false) => {}
            Err(source) => {
                self.log_failure(Category::DriveLinks, &source);
                failed.push(ProvisionError {
                    category: Category::DriveLinks,
                    source,
                });
            }
        }

        let changed = staged != markers;
        ProvisionReport {
            markers: staged,
            installed,
            failed,
            first_boot,
            staged: changed,
        }
    }

    /// Load markers, run a pass and persist the result in a single write when
    /// anything was staged.
    pub fn provision_and_commit(
        &self,
        config: &EffectiveConfig,
        store: &dyn MarkerStore,
    ) -> Result<ProvisionReport, CommitError> {
        let markers = store.load().map_err(CommitError::Load)?;
        let report = self.provision(config, markers);
        if report.staged {
            store.save(&report.markers).map_err(CommitError::Save)?;
            emit(
                self.logger.as_ref(),
                LogLevel::Debug,
                TARGET,
                "markers_committed",
                [json_str("checksum", report.markers.checksum())],
            );
        }
        Ok(report)
    }

    fn log_failure(&self, category: Category, source: &InstallError) {
        emit(
            self.logger.as_ref(),
            LogLevel::Warn,
            TARGET,
            "category_failed",
            [
                json_str("category", category.as_str()),
                json_str("error", source.to_string()),
            ],
        );
    }

    fn extract(&self, request: ExtractRequest) -> Result<(), InstallError> {
        emit(
            self.logger.as_ref(),
            LogLevel::Debug,
            TARGET,
            "extract",
            [json_str("asset", request.asset())],
        );
        self.deps.extractor.extract(&request)
    }

    /// Apply a content profile when one is installed, otherwise unpack the
    /// bundled archive. Returns whether the archive was used.
    fn profile_or_archive(&self, category: &str, id: &str, layout: &GuestLayout) -> Result<bool, InstallError> {
        let target = layout.windows_dir();
        match self.deps.profiles.apply(category, id, &target)? {
            ProfileOutcome::Applied => Ok(false),
            ProfileOutcome::NotFound => {
                self.extract(ExtractRequest::new(category, id, target).with_rewrite(PathRewrite::for_layout(layout)))?;
                Ok(true)
            }
        }
    }

    fn apply_system_patches(&self, layout: &GuestLayout) -> Result<(), InstallError> {
        self.extract(ExtractRequest::new("patches", "container_pattern_common", layout.root()))?;
        self.extract(ExtractRequest::new(
            "patches",
            "pulseaudio",
            layout.root().join("opt/pulseaudio"),
        ))?;
        // arm64ec builds take xinput from the x86_64 build.
        if layout.is_arm64ec() {
            self.extract(ExtractRequest::new(
                "input_dlls",
                "arm64ec",
                layout.wine_dir().join("lib/wine"),
            ))?;
        }
        Ok(())
    }

    fn install_graphics_wrapper(&self, ctx: &InstallContext<'_>) -> Result<(), InstallError> {
        let id = ctx.config.graphics_driver.to_lowercase();
        if id.starts_with("wrapper") {
            self.extract(ExtractRequest::new("graphics_driver", &id, ctx.layout.root()))?;
        }
        if ctx.first_boot {
            self.extract(ExtractRequest::new("graphics_driver", "extra_libs", ctx.layout.root()))?;
        }
        Ok(())
    }

    fn install_dx_wrapper(&self, ctx: &InstallContext<'_>) -> Result<(), InstallError> {
        let id = ctx.config.dx_wrapper_id();
        let layout = ctx.layout;
        let rewrite = PathRewrite::for_layout(layout);
        match ctx.config.dx_wrapper.as_str() {
            "vkd3d" => {
                self.extract(
                    ExtractRequest::new("dxwrapper", VKD3D_COMPANION_DXVK, layout.windows_dir())
                        .with_rewrite(rewrite),
                )?;
                self.profile_or_archive("dxwrapper", &id, layout)?;
            }
            "dxvk" => {
                let used_archive = self.profile_or_archive("dxwrapper", &id, layout)?;
                let version = ctx
                    .config
                    .dx_wrapper_config
                    .get_or("version", defaults::DXVK_VERSION);
                if used_archive && compare_versions(version, D8VK_CUTOFF).is_lt() {
                    self.extract(
                        ExtractRequest::new("dxwrapper", &format!("d8vk-{D8VK_VERSION}"), layout.windows_dir())
                            .with_rewrite(rewrite),
                    )?;
                }
            }
            "wined3d" => {
                DllRestorer::new(layout).restore(&D3D_DLLS)?;
            }
            _ => {
                self.extract(ExtractRequest::new("dxwrapper", &id, layout.windows_dir()).with_rewrite(rewrite))?;
            }
        }
        Ok(())
    }

    fn install_ddraw_wrapper(&self, ctx: &InstallContext<'_>) -> Result<(), InstallError> {
        let layout = ctx.layout;
        for dll in GLIDE_DLLS {
            let path = layout.windows_path(&format!("syswow64/{dll}"));
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(InstallError::Prefix { path, source });
                }
            }
        }

        let rewrite = PathRewrite::for_layout(layout);
        if ctx.config.ddraw_wrapper == "wined3d" {
            DllRestorer::new(layout).restore(&DDRAW_DLLS)?;
        } else {
            self.extract(
                ExtractRequest::new("ddrawrapper", &ctx.config.ddraw_wrapper, layout.windows_dir())
                    .with_rewrite(rewrite),
            )?;
        }
        self.extract(ExtractRequest::new("ddrawrapper", "nglide", layout.windows_dir()).with_rewrite(rewrite))
    }

    /// Entries are compared by position against the previous marker; only
    /// changed entries are reinstalled unless this is a first boot.
    fn install_win_components(&self, ctx: &InstallContext<'_>) -> Result<(), InstallError> {
        let previous = if ctx.previous.is_empty() {
            KeyValueSet::parse(defaults::FALLBACK_WIN_COMPONENTS)
        } else {
            KeyValueSet::parse(ctx.previous)
        };
        let mut previous_values = previous.iter().map(|(_, value)| value);
        let layout = ctx.layout;
        let mut builtin_files = Vec::new();

        for (name, value) in ctx.config.win_components.iter() {
            let old = previous_values.next();
            if !ctx.first_boot && old == Some(value) {
                continue;
            }
            let native = value == "1";
            if native && name.contains("opengl") && !layout.is_arm64ec() {
                continue;
            }
            let files = self.deps.catalog.files(name)?;
            if native {
                self.extract(
                    ExtractRequest::new("wincomponents", name, layout.windows_dir())
                        .with_rewrite(PathRewrite::for_layout(layout)),
                )?;
            } else {
                builtin_files.extend(files.iter().cloned());
            }
            self.deps.prefix.override_dlls(&files, native)?;
            self.deps.prefix.set_win_component_registry_keys(name, native)?;
        }

        if !builtin_files.is_empty() {
            DllRestorer::new(layout).restore(&builtin_files)?;
        }
        Ok(())
    }

    fn install_desktop_theme(&self, ctx: &InstallContext<'_>) -> Result<(), InstallError> {
        self.deps.prefix.apply_desktop_theme(&ctx.config.desktop_theme)
    }

    fn install_startup_mode(&self, ctx: &InstallContext<'_>) -> Result<(), InstallError> {
        let essential_only = ctx.config.startup_mode != StartupMode::Normal;
        self.deps.prefix.set_essential_services_only(essential_only)
    }

    fn install_audio_driver(&self, ctx: &InstallContext<'_>) -> Result<(), InstallError> {
        match ctx.config.audio_driver {
            AudioDriver::Alsa | AudioDriver::AlsaReflector => self.deps.prefix.set_audio_driver("alsa"),
            AudioDriver::PulseAudio => self.deps.prefix.set_audio_driver("pulse"),
            AudioDriver::None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriveMapping, ProfileSettings, SessionOverrides, resolve};
    use crate::provision::installer::NoContentProfiles;
    use crate::provision::markers::MemoryMarkerStore;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExtractor {
        assets: Mutex<Vec<String>>,
        failing: Mutex<Vec<String>>,
    }

    impl RecordingExtractor {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.assets.lock().unwrap())
        }

        fn fail(&self, asset: &str) {
            self.failing.lock().unwrap().push(asset.to_string());
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }
    }

    impl ArchiveExtractor for RecordingExtractor {
        fn extract(&self, request: &ExtractRequest) -> Result<(), InstallError> {
            let asset = request.asset();
            if self.failing.lock().unwrap().contains(&asset) {
                return Err(InstallError::AssetMissing { asset });
            }
            self.assets.lock().unwrap().push(asset);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPrefix {
        calls: Mutex<Vec<String>>,
    }

    impl PrefixEditor for RecordingPrefix {
        fn set_audio_driver(&self, driver: &str) -> Result<(), InstallError> {
            self.calls.lock().unwrap().push(format!("audio:{driver}"));
            Ok(())
        }

        fn apply_desktop_theme(&self, theme: &str) -> Result<(), InstallError> {
            self.calls.lock().unwrap().push(format!("theme:{theme}"));
            Ok(())
        }

        fn set_essential_services_only(&self, essential_only: bool) -> Result<(), InstallError> {
            self.calls.lock().unwrap().push(format!("services:{essential_only}"));
            Ok(())
        }

        fn override_dlls(&self, files: &[String], native: bool) -> Result<(), InstallError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("override:{}:{native}", files.join("+")));
            Ok(())
        }

        fn set_win_component_registry_keys(&self, component: &str, native: bool) -> Result<(), InstallError> {
            self.calls.lock().unwrap().push(format!("regkeys:{component}:{native}"));
            Ok(())
        }
    }

    struct FoundProfiles;

    impl ContentProfiles for FoundProfiles {
        fn apply(&self, _kind: &str, _id: &str, _target: &Path) -> Result<ProfileOutcome, InstallError> {
            Ok(ProfileOutcome::Applied)
        }
    }

    const CATALOG: &str = r#"{
        "direct3d": ["d3d9", "d3dx9_43"],
        "directsound": ["dsound"],
        "directmusic": ["dmusic"],
        "directshow": ["quartz"],
        "directplay": ["dplayx"],
        "vcrun2010": ["msvcr100"],
        "wmdecoder": ["wmadmod"],
        "opengl": ["opengl32"]
    }"#;

    struct Fixture {
        extractor: Arc<RecordingExtractor>,
        prefix: Arc<RecordingPrefix>,
        engine: ProvisioningEngine,
        _root: tempfile::TempDir,
    }

    fn fixture_with(profiles: Arc<dyn ContentProfiles>) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let extractor = Arc::new(RecordingExtractor::default());
        let prefix = Arc::new(RecordingPrefix::default());
        let deps = ProvisionDeps {
            extractor: extractor.clone(),
            profiles,
            prefix: prefix.clone(),
            catalog: WinComponentCatalog::from_json(CATALOG).unwrap(),
        };
        let engine = ProvisioningEngine::new(root.path(), "7.1", "21", deps);
        Fixture {
            extractor,
            prefix,
            engine,
            _root: root,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(NoContentProfiles))
    }

    fn config(overrides: SessionOverrides) -> Arc<EffectiveConfig> {
        resolve(&ProfileSettings::default(), Some(&overrides)).config
    }

    #[test]
    fn second_pass_with_same_config_installs_nothing() {
        let fx = fixture();
        let config = config(SessionOverrides::new());
        let first = fx.engine.provision(&config, PersistedMarkers::new());
        assert!(first.first_boot);
        assert!(first.failed.is_empty());
        // Patches, seven categories and the drive links.
        assert_eq!(first.installed.len(), 9);
        assert_eq!(first.installed.last(), Some(&Category::DriveLinks));
        assert_eq!(first.markers.get(MarkerKey::AppVersion), "7.1");
        assert_eq!(first.markers.get(MarkerKey::DxWrapper), "dxvk-2.3.1");
        assert_eq!(first.markers.get(MarkerKey::DesktopTheme), "LIGHT,IMAGE,#0277bd,1280x720");
        fx.extractor.take();

        let second = fx.engine.provision(&config, first.markers.clone());
        assert!(!second.any_installed());
        assert!(!second.staged);
        assert!(fx.extractor.take().is_empty());
    }

    #[test]
    fn failed_category_keeps_marker_and_is_retried_alone() {
        let fx = fixture();
        let config = config(SessionOverrides::new());
        fx.extractor.fail("ddrawrapper/nglide.tzst");

        let first = fx.engine.provision(&config, PersistedMarkers::new());
        assert_eq!(first.failed_categories(), vec![Category::DdrawWrapper]);
        assert_eq!(first.markers.get(MarkerKey::DdrawWrapper), "");
        assert_eq!(first.markers.get(MarkerKey::DxWrapper), "dxvk-2.3.1");

        fx.extractor.heal();
        fx.extractor.take();
        let second = fx.engine.provision(&config, first.markers.clone());
        assert_eq!(second.installed, vec![Category::DdrawWrapper]);
        assert_eq!(second.markers.get(MarkerKey::DdrawWrapper), "wined3d");
    }

    #[test]
    fn dx_wrapper_change_runs_only_that_install() {
        let fx = fixture();
        let base = config(SessionOverrides::new().with_extra("dxwrapperConfig", "version=2.3"));
        let first = fx.engine.provision(&base, PersistedMarkers::new());
        fx.extractor.take();
        fx.prefix.calls.lock().unwrap().clear();

        let upgraded = config(SessionOverrides::new().with_extra("dxwrapperConfig", "version=2.4"));
        let second = fx.engine.provision(&upgraded, first.markers.clone());
        assert_eq!(second.installed, vec![Category::DxWrapper]);
        // 2.4 no longer needs the d8vk companion.
        assert_eq!(fx.extractor.take(), vec!["dxwrapper/dxvk-2.4.tzst"]);
        assert!(fx.prefix.calls.lock().unwrap().is_empty());
        for key in [MarkerKey::DdrawWrapper, MarkerKey::WinComponents, MarkerKey::DesktopTheme] {
            assert_eq!(second.markers.get(key), first.markers.get(key));
        }
    }

    #[test]
    fn old_dxvk_bundles_d8vk_unless_profile_applied() {
        let fx = fixture();
        let old = config(SessionOverrides::new().with_extra("dxwrapperConfig", "version=2.3.1"));
        let markers = fx.engine.provision(&old, PersistedMarkers::new()).markers;
        let assets = fx.extractor.take();
        assert!(assets.contains(&"dxwrapper/d8vk-1.0.tzst".to_string()));

        let fx = fixture_with(Arc::new(FoundProfiles));
        let markers = markers.with(MarkerKey::DxWrapper, "dxvk-2.2");
        fx.engine.provision(&old, markers);
        assert!(!fx.extractor.take().iter().any(|a| a.contains("dxvk") || a.contains("d8vk")));
    }

    #[test]
    fn vkd3d_extracts_companion_dxvk_first() {
        let fx = fixture();
        let first = fx.engine.provision(&config(SessionOverrides::new()), PersistedMarkers::new());
        fx.extractor.take();
        let vkd3d = config(SessionOverrides::new().with_extra("dxwrapper", "vkd3d"));
        fx.engine.provision(&vkd3d, first.markers);
        assert_eq!(
            fx.extractor.take(),
            vec!["dxwrapper/dxvk-2.4.1.tzst", "dxwrapper/vkd3d-2.12.tzst"]
        );
    }

    #[test]
    fn win_components_reinstall_only_changed_entries() {
        let fx = fixture();
        let first = fx.engine.provision(&config(SessionOverrides::new()), PersistedMarkers::new());
        fx.extractor.take();
        fx.prefix.calls.lock().unwrap().clear();

        let changed = config(SessionOverrides::new().with_extra(
            "wincomponents",
            "direct3d=1,directsound=0,directmusic=0,directshow=0,directplay=0,vcrun2010=1,wmdecoder=1,opengl=0",
        ));
        let second = fx.engine.provision(&changed, first.markers);
        assert_eq!(second.installed, vec![Category::WinComponents]);
        assert_eq!(
            *fx.prefix.calls.lock().unwrap(),
            vec![
                "override:dsound.dll:false".to_string(),
                "regkeys:directsound:false".to_string(),
            ]
        );
        assert!(fx.extractor.take().is_empty());
    }

    #[test]
    fn commit_writes_once_per_pass() {
        let fx = fixture();
        let store = MemoryMarkerStore::default();
        let config = config(SessionOverrides::new());
        let report = fx.engine.provision_and_commit(&config, &store).unwrap();
        assert!(report.any_installed());
        assert_eq!(store.saves(), 1);
        fx.engine.provision_and_commit(&config, &store).unwrap();
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn system_patch_failure_keeps_first_boot() {
        let fx = fixture();
        fx.extractor.fail("patches/container_pattern_common.tzst");
        let report = fx.engine.provision(&config(SessionOverrides::new()), PersistedMarkers::new());
        assert_eq!(report.failed_categories(), vec![Category::SystemPatches]);
        assert_eq!(report.markers.get(MarkerKey::AppVersion), "");
        assert_eq!(report.installed.len(), 8);
    }

    #[test]
    fn arm64ec_patches_unpack_input_dlls() {
        let fx = fixture();
        let arm64ec = config(SessionOverrides::new());
        assert!(arm64ec.is_arm64ec());
        fx.engine.provision(&arm64ec, PersistedMarkers::new());
        assert!(fx.extractor.take().contains(&"input_dlls/arm64ec.tzst".to_string()));

        let fx = fixture();
        let profile = ProfileSettings {
            wine_version: "wine-9.2-x86_64".into(),
            ..ProfileSettings::default()
        };
        let x86 = resolve(&profile, None).config;
        fx.engine.provision(&x86, PersistedMarkers::new());
        assert!(!fx.extractor.take().iter().any(|a| a.starts_with("input_dlls/")));
    }

    #[test]
    fn drive_links_follow_profile_drives() {
        let fx = fixture();
        let profile = ProfileSettings {
            drives: vec![DriveMapping {
                letter: "D".into(),
                path: "/storage/Download".into(),
            }],
            ..ProfileSettings::default()
        };
        let config = resolve(&profile, None).config;
        let first = fx.engine.provision(&config, PersistedMarkers::new());
        assert!(first.installed.contains(&Category::DriveLinks));

        let layout = GuestLayout::for_config(fx._root.path(), &config);
        let link = layout.prefix_dir().join("dosdevices/d:");
        assert_eq!(std::fs::read_link(link).unwrap(), Path::new("/storage/Download"));

        let second = fx.engine.provision(&config, first.markers);
        assert!(!second.any_installed());
    }

    #[test]
    fn native_components_set_registry_keys() {
        let fx = fixture();
        let builtin_sound = config(SessionOverrides::new().with_extra(
            "wincomponents",
            "direct3d=1,directsound=0,directmusic=0,directshow=0,directplay=0,vcrun2010=1,wmdecoder=1,opengl=0",
        ));
        let first = fx.engine.provision(&builtin_sound, PersistedMarkers::new());
        fx.prefix.calls.lock().unwrap().clear();

        // The stock component set has native directsound.
        fx.engine.provision(&config(SessionOverrides::new()), first.markers);
        assert!(fx
            .prefix
            .calls
            .lock()
            .unwrap()
            .contains(&"regkeys:directsound:true".to_string()));
    }
}
