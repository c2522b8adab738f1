//! Session configuration: per-profile defaults, per-session overrides and the
//! immutable [`EffectiveConfig`] they resolve to, plus the runtime settings file.

pub mod core;
pub mod kv;
pub mod settings;

pub use self::core::{
    AudioDriver, ConfigResolutionError, DriveMapping, EffectiveConfig, LaunchTarget,
    ProfileSettings, ResolvedConfig, ScreenSize, SessionOverrides, SharpnessConfig, StartupMode,
    defaults, resolve,
};
pub use kv::KeyValueSet;
pub use settings::{CaptureSettings, DebugSettings, RuntimeSettings, SettingsError};
