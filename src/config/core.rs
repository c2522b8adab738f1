use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::kv::KeyValueSet;
use crate::env::EnvVars;

/// Hard-coded values used when neither the session nor the profile sets a field.
pub mod defaults {
    pub const GRAPHICS_DRIVER: &str = "wrapper";
    pub const GRAPHICS_DRIVER_CONFIG: &str =
        "version=System,adrenotoolsTurnip=1,frameSync=Normal,maxDeviceMemory=0";
    pub const WRAPPER_VERSION: &str = "System";
    pub const AUDIO_DRIVER: &str = "alsa";
    pub const DX_WRAPPER: &str = "dxvk";
    pub const DX_WRAPPER_CONFIG: &str =
        "version=2.3.1,framerate=0,async=0,asyncCache=0,vkd3dVersion=2.12,vkd3dLevel=12_1";
    pub const DXVK_VERSION: &str = "2.3.1";
    pub const VKD3D_VERSION: &str = "2.12";
    pub const DDRAW_WRAPPER: &str = "wined3d";
    pub const SCREEN_SIZE: &str = "1280x720";
    pub const LOCALE: &str = "en_US.utf8";
    pub const WIN_COMPONENTS: &str = "direct3d=1,directsound=1,directmusic=0,directshow=0,directplay=0,vcrun2010=1,wmdecoder=1,opengl=0";
    pub const FALLBACK_WIN_COMPONENTS: &str = "direct3d=0,directsound=0,directmusic=0,directshow=0,directplay=0,vcrun2010=0,wmdecoder=0,opengl=0";
    pub const DESKTOP_THEME: &str = "LIGHT,IMAGE,#0277bd";
    pub const STARTUP_SELECTION: &str = "1";
    pub const BOX64_PRESET: &str = "COMPATIBILITY";
    pub const WINE_VERSION: &str = "proton-9.0-arm64ec";
    pub const SHARPNESS_EFFECT: &str = "None";
    pub const SHARPNESS_LEVEL: f64 = 100.0;
}

/// A field that could not be taken from its preferred source.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigResolutionError {
    #[error("malformed value `{value}` for `{field}` ({reason}); using `{fallback}`")]
    Malformed {
        field: &'static str,
        value: String,
        reason: String,
        fallback: String,
    },
    #[error("unsupported value `{value}` for `{field}`; using `{fallback}`")]
    Unsupported {
        field: &'static str,
        value: String,
        fallback: String,
    },
}

impl ConfigResolutionError {
    pub fn field(&self) -> &'static str {
        match self {
            Self::Malformed { field, .. } | Self::Unsupported { field, .. } => field,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }
}

impl FromStr for ScreenSize {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (w, h) = raw
            .trim()
            .split_once('x')
            .ok_or_else(|| "expected WIDTHxHEIGHT".to_string())?;
        let width: u32 = w.trim().parse().map_err(|_| format!("bad width `{w}`"))?;
        let height: u32 = h.trim().parse().map_err(|_| format!("bad height `{h}`"))?;
        if width == 0 || height == 0 {
            return Err("dimensions must be non-zero".to_string());
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for ScreenSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Audio backend served to the guest. `None` starts no audio component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioDriver {
    Alsa,
    AlsaReflector,
    PulseAudio,
    None,
}

impl AudioDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioDriver::Alsa => "alsa",
            AudioDriver::AlsaReflector => "alsa-reflector",
            AudioDriver::PulseAudio => "pulseaudio",
            AudioDriver::None => "none",
        }
    }

    pub fn is_alsa(&self) -> bool {
        matches!(self, AudioDriver::Alsa | AudioDriver::AlsaReflector)
    }
}

impl fmt::Display for AudioDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioDriver {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "alsa" => Ok(AudioDriver::Alsa),
            "alsa-reflector" => Ok(AudioDriver::AlsaReflector),
            "pulseaudio" | "pulse" => Ok(AudioDriver::PulseAudio),
            "none" | "disabled" => Ok(AudioDriver::None),
            other => Err(format!("unknown audio driver `{other}`")),
        }
    }
}

/// Which Windows services run at guest startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    Normal = 0,
    Essential = 1,
    Aggressive = 2,
}

impl StartupMode {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for StartupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for StartupMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().parse::<u8>() {
            Ok(0) => Ok(StartupMode::Normal),
            Ok(1) => Ok(StartupMode::Essential),
            Ok(2) => Ok(StartupMode::Aggressive),
            Ok(other) => Err(format!("startup selection {other} out of range")),
            Err(_) => Err("expected 0, 1 or 2".to_string()),
        }
    }
}

/// vkBasalt post-processing settings, present only when an effect is chosen.
#[derive(Debug, Clone, PartialEq)]
pub struct SharpnessConfig {
    pub effect: String,
    pub level: f64,
    pub denoise: f64,
}

impl SharpnessConfig {
    pub fn to_vkbasalt_config(&self) -> String {
        let effect = self.effect.to_lowercase();
        let level = self.level / 100.0;
        let denoise = self.denoise / 100.0;
        format!(
            "effects={effect};casSharpness={level};dlsSharpness={level};dlsDenoise={denoise};enableOnLaunch=True"
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveMapping {
    pub letter: String,
    pub path: String,
}

/// Per-profile (container) defaults. Empty strings count as unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfileSettings {
    pub name: String,
    pub graphics_driver: String,
    pub graphics_driver_config: String,
    pub audio_driver: String,
    pub dx_wrapper: String,
    pub dx_wrapper_config: String,
    pub ddraw_wrapper: String,
    pub screen_size: String,
    pub lc_all: String,
    pub win_components: String,
    pub desktop_theme: String,
    pub startup_selection: String,
    pub controls_profile: String,
    pub box64_preset: String,
    pub env_vars: String,
    pub drives: Vec<DriveMapping>,
    pub wine_version: String,
    pub gstreamer_workaround: bool,
}

/// Per-session (shortcut) overrides keyed by their extra-data names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOverrides {
    pub shortcut_path: Option<String>,
    extras: BTreeMap<String, String>,
}

impl SessionOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shortcut_path(mut self, path: impl Into<String>) -> Self {
        self.shortcut_path = Some(path.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_extra(key, value);
        self
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extras.insert(key.into(), value.into());
    }

    /// The override for `key`, if present and non-empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extras
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Parse a `.desktop` launcher entry: the guest path comes from the `Exec`
    /// line and overrides from the `[Extra Data]` section.
    pub fn from_desktop_entry(contents: &str) -> Self {
        let mut overrides = Self::new();
        let mut in_extra = false;
        for line in contents.lines() {
            let line = line.trim();
            if line.starts_with('[') {
                in_extra = line == "[Extra Data]";
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if in_extra {
                overrides.set_extra(key.trim(), value.trim());
            } else if key == "Exec" {
                if let Some(idx) = value.rfind("wine ") {
                    let target = value[idx + 5..].trim().trim_matches('"');
                    overrides.shortcut_path = Some(target.replace("\\\\", "\\"));
                }
            }
        }
        overrides
    }
}

/// What the guest launcher should open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    pub shortcut_path: Option<String>,
    pub exec_args: String,
}

/// Immutable per-session snapshot produced by [`resolve`].
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub graphics_driver: String,
    pub graphics_driver_config: KeyValueSet,
    pub wrapper_version: String,
    pub audio_driver: AudioDriver,
    pub dx_wrapper: String,
    pub dx_wrapper_config: KeyValueSet,
    pub ddraw_wrapper: String,
    pub screen_size: ScreenSize,
    pub locale: String,
    pub win_components: KeyValueSet,
    pub desktop_theme: String,
    pub startup_mode: StartupMode,
    pub controls_profile: Option<String>,
    pub box64_preset: String,
    pub binding_paths: Vec<String>,
    /// Drive letters linked under the prefix `dosdevices`.
    pub drives: Vec<DriveMapping>,
    pub wine_version: String,
    pub gstreamer_workaround: bool,
    pub sharpness: Option<SharpnessConfig>,
    pub profile_env: EnvVars,
    pub session_env: EnvVars,
    pub launch: LaunchTarget,
}

impl EffectiveConfig {
    /// Versioned dx-wrapper identifier, e.g. `dxvk-2.3.1`.
    pub fn dx_wrapper_id(&self) -> String {
        match self.dx_wrapper.as_str() {
            "dxvk" => format!(
                "dxvk-{}",
                self.dx_wrapper_config.get_or("version", defaults::DXVK_VERSION)
            ),
            "vkd3d" => format!(
                "vkd3d-{}",
                self.dx_wrapper_config
                    .get_or("vkd3dVersion", defaults::VKD3D_VERSION)
            ),
            other => other.to_string(),
        }
    }

    /// Desktop theme marker value; the theme is rendered for a screen size.
    pub fn desktop_theme_id(&self) -> String {
        format!("{},{}", self.desktop_theme, self.screen_size)
    }

    pub fn is_arm64ec(&self) -> bool {
        self.wine_version.contains("arm64ec")
    }

    /// Build the command line handed to the guest launcher. `extra_exec_args`
    /// applies only when no shortcut is set.
    pub fn guest_command_line(&self, extra_exec_args: Option<&str>) -> String {
        let args = match self.launch.shortcut_path.as_deref() {
            Some(path) => {
                let exec_args = if self.launch.exec_args.is_empty() {
                    String::new()
                } else {
                    format!(" {}", self.launch.exec_args)
                };
                shortcut_args(path, &exec_args)
            }
            None => match extra_exec_args {
                Some(extra) if !extra.is_empty() => format!(" {extra}"),
                _ => "\"wfm.exe\"".to_string(),
            },
        };
        format!(
            "wine explorer /desktop=shell,{} winhandler.exe {}",
            self.screen_size, args
        )
    }
}

fn shortcut_args(path: &str, exec_args: &str) -> String {
    if path.ends_with(".lnk") {
        return format!("\"{path}\"{exec_args}");
    }
    let (dir, mut filename) = match path.rfind(['/', '\\']) {
        Some(idx) => (&path[..idx], path[idx + 1..].to_string()),
        None => ("", path.to_string()),
    };
    let mut exec_args = exec_args.to_string();
    // Arguments embedded after the extension, e.g. `game.exe -windowed`.
    if let Some(dot) = filename.rfind('.') {
        if let Some(space) = filename[dot..].find(' ').map(|offset| dot + offset) {
            exec_args = format!("{}{}", &filename[space + 1..], exec_args);
            filename.truncate(space);
        }
    }
    format!("/dir {} \"{}\"{}", escape_dos_path(dir), filename, exec_args)
}

fn escape_dos_path(path: &str) -> String {
    path.replace('/', "\\").replace(' ', "\\ ")
}

/// Result of a resolve: the snapshot plus every field that fell back.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: Arc<EffectiveConfig>,
    pub fallbacks: Vec<ConfigResolutionError>,
}

struct Layers<'a> {
    overrides: Option<&'a SessionOverrides>,
    fallbacks: Vec<ConfigResolutionError>,
}

impl<'a> Layers<'a> {
    fn raw<'p>(&self, key: &str, profile_value: &'p str) -> Option<&'p str>
    where
        'a: 'p,
    {
        if let Some(value) = self.overrides.and_then(|o| o.get(key)) {
            return Some(value);
        }
        if profile_value.trim().is_empty() {
            None
        } else {
            Some(profile_value)
        }
    }

    fn text(&self, key: &str, profile_value: &str, default: &str) -> String {
        self.raw(key, profile_value)
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&mut self, field: &'static str, profile_value: &str, default: T) -> T
    where
        T: FromStr<Err = String> + fmt::Display,
    {
        let Some(raw) = self.raw(field, profile_value) else {
            return default;
        };
        match raw.parse::<T>() {
            Ok(value) => value,
            Err(reason) => {
                self.fallbacks.push(ConfigResolutionError::Malformed {
                    field,
                    value: raw.to_string(),
                    reason,
                    fallback: default.to_string(),
                });
                default
            }
        }
    }

    fn number(&mut self, field: &'static str, default: f64) -> f64 {
        let Some(raw) = self.overrides.and_then(|o| o.get(field)) else {
            return default;
        };
        match raw.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => value,
            _ => {
                self.fallbacks.push(ConfigResolutionError::Malformed {
                    field,
                    value: raw.to_string(),
                    reason: "expected a number".to_string(),
                    fallback: default.to_string(),
                });
                default
            }
        }
    }
}

fn parse_win_components(raw: &str) -> Result<KeyValueSet, String> {
    let set = KeyValueSet::parse(raw);
    if set.is_empty() {
        return Err("no components listed".to_string());
    }
    for (key, value) in set.iter() {
        if value != "0" && value != "1" {
            return Err(format!("component `{key}` must be 0 or 1"));
        }
    }
    Ok(set)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Merge session overrides over profile values over hard defaults.
///
/// Never fails as a whole: a malformed field is replaced by its default and
/// reported in [`ResolvedConfig::fallbacks`].
pub fn resolve(profile: &ProfileSettings, overrides: Option<&SessionOverrides>) -> ResolvedConfig {
    let mut layers = Layers {
        overrides,
        fallbacks: Vec::new(),
    };

    let graphics_driver = layers.text(
        "graphicsDriver",
        &profile.graphics_driver,
        defaults::GRAPHICS_DRIVER,
    );
    let graphics_driver_config = KeyValueSet::parse(&layers.text(
        "graphicsDriverConfig",
        &profile.graphics_driver_config,
        defaults::GRAPHICS_DRIVER_CONFIG,
    ));
    let wrapper_version = layers.text(
        "wrapperGraphicsDriverVersion",
        graphics_driver_config.get("version").unwrap_or(""),
        defaults::WRAPPER_VERSION,
    );
    let audio_driver = layers.parsed("audioDriver", &profile.audio_driver, AudioDriver::Alsa);

    let dx_wrapper = layers.text("dxwrapper", &profile.dx_wrapper, defaults::DX_WRAPPER);
    let dx_wrapper_config = KeyValueSet::parse(&layers.text(
        "dxwrapperConfig",
        &profile.dx_wrapper_config,
        defaults::DX_WRAPPER_CONFIG,
    ));
    let ddraw_wrapper = layers.text("ddrawrapper", &profile.ddraw_wrapper, defaults::DDRAW_WRAPPER);
    let screen_size = layers.parsed(
        "screenSize",
        &profile.screen_size,
        ScreenSize::new(1280, 720),
    );
    let locale = layers.text("lc_all", &profile.lc_all, defaults::LOCALE);

    let win_components = match layers.raw("wincomponents", &profile.win_components) {
        Some(raw) => parse_win_components(raw).unwrap_or_else(|reason| {
            layers.fallbacks.push(ConfigResolutionError::Malformed {
                field: "wincomponents",
                value: raw.to_string(),
                reason,
                fallback: defaults::WIN_COMPONENTS.to_string(),
            });
            KeyValueSet::parse(defaults::WIN_COMPONENTS)
        }),
        None => KeyValueSet::parse(defaults::WIN_COMPONENTS),
    };

    let desktop_theme = layers.text("desktopTheme", &profile.desktop_theme, defaults::DESKTOP_THEME);
    let mut startup_mode = layers.parsed(
        "startupSelection",
        &profile.startup_selection,
        StartupMode::Essential,
    );
    if startup_mode == StartupMode::Aggressive {
        layers.fallbacks.push(ConfigResolutionError::Unsupported {
            field: "startupSelection",
            value: StartupMode::Aggressive.code().to_string(),
            fallback: StartupMode::Essential.code().to_string(),
        });
        startup_mode = StartupMode::Essential;
    }

    let controls_profile = layers
        .raw("controlsProfile", &profile.controls_profile)
        .map(|value| value.trim().to_string());
    let box64_preset = layers.text("box64Preset", &profile.box64_preset, defaults::BOX64_PRESET);
    let gstreamer_workaround = match overrides.and_then(|o| o.get("gstreamerWorkaround")) {
        Some(value) => parse_flag(value),
        None => profile.gstreamer_workaround,
    };

    let effect = layers.text("sharpnessEffect", "", defaults::SHARPNESS_EFFECT);
    let sharpness = if effect == defaults::SHARPNESS_EFFECT {
        None
    } else {
        Some(SharpnessConfig {
            effect,
            level: layers.number("sharpnessLevel", defaults::SHARPNESS_LEVEL),
            denoise: layers.number("sharpnessDenoise", defaults::SHARPNESS_LEVEL),
        })
    };

    let wine_version = if profile.wine_version.trim().is_empty() {
        defaults::WINE_VERSION.to_string()
    } else {
        profile.wine_version.trim().to_string()
    };

    let config = EffectiveConfig {
        graphics_driver,
        graphics_driver_config,
        wrapper_version,
        audio_driver,
        dx_wrapper,
        dx_wrapper_config,
        ddraw_wrapper,
        screen_size,
        locale,
        win_components,
        desktop_theme,
        startup_mode,
        controls_profile,
        box64_preset,
        binding_paths: profile.drives.iter().map(|d| d.path.clone()).collect(),
        drives: profile.drives.clone(),
        wine_version,
        gstreamer_workaround,
        sharpness,
        profile_env: EnvVars::parse(&profile.env_vars),
        session_env: EnvVars::parse(overrides.and_then(|o| o.get("envVars")).unwrap_or("")),
        launch: LaunchTarget {
            shortcut_path: overrides.and_then(|o| o.shortcut_path.clone()),
            exec_args: overrides
                .and_then(|o| o.get("execArgs"))
                .unwrap_or("")
                .to_string(),
        },
    };

    ResolvedConfig {
        config: Arc::new(config),
        fallbacks: layers.fallbacks,
    }
}
