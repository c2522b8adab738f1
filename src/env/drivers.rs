//! Variables derived from the effective configuration and the image layout.

use crate::config::{AudioDriver, DebugSettings, EffectiveConfig};
use crate::layout::{EndpointLayout, GuestLayout};

use super::{EnvLayer, EnvVars, EnvironmentVariableBuilder};

/// Host facts the driver variables depend on.
#[derive(Debug, Clone, Copy)]
pub struct EnvContext<'a> {
    pub layout: &'a GuestLayout,
    pub endpoints: &'a EndpointLayout,
    pub debug: &'a DebugSettings,
    pub use_dri3: bool,
}

/// Builder with every standard layer filled for `config`. One-shot overrides
/// are left for the caller.
pub fn standard_builder(config: &EffectiveConfig, ctx: EnvContext<'_>) -> EnvironmentVariableBuilder {
    let mut builder = EnvironmentVariableBuilder::new();
    builder.merge(EnvLayer::Constants, &constants(ctx.layout));
    builder.merge(EnvLayer::LocaleDebug, &locale_debug(config, ctx.debug));

    let driver = builder.layer_mut(EnvLayer::Driver);
    driver.put_all(&graphics(config, ctx.layout, ctx.use_dri3));
    driver.put_all(&audio(config.audio_driver, ctx.endpoints));
    driver.put_all(&dx_wrapper(config));
    driver.put_all(&ddraw_wrapper(config, ctx.layout));
    if config.gstreamer_workaround {
        driver.put_all(&media_converter(ctx.layout));
    }

    builder.merge(EnvLayer::Profile, &config.profile_env);
    builder.merge(EnvLayer::Session, &config.session_env);
    builder.default_if_unset("WINEESYNC", "1");
    builder
}

pub fn constants(layout: &GuestLayout) -> EnvVars {
    let mut vars = EnvVars::new();
    vars.put("MESA_DEBUG", "silent");
    vars.put("MESA_NO_ERROR", "1");
    vars.put("WINEPREFIX", layout.prefix_dir().display().to_string());
    vars
}

pub fn locale_debug(config: &EffectiveConfig, debug: &DebugSettings) -> EnvVars {
    let mut vars = EnvVars::new();
    vars.put("LC_ALL", config.locale.clone());
    vars.put("WINEDEBUG", debug.winedebug());
    vars
}

pub fn graphics(config: &EffectiveConfig, layout: &GuestLayout, use_dri3: bool) -> EnvVars {
    let mut vars = EnvVars::new();
    let driver_config = &config.graphics_driver_config;

    if !use_dri3 {
        vars.put("MESA_VK_WSI_DEBUG", "sw");
    }

    let native_turnip = config.wrapper_version.to_lowercase().contains("turnip")
        && driver_config.get_or("adrenotoolsTurnip", "1") == "0";
    let icd = if native_turnip {
        "freedreno_icd.aarch64.json"
    } else {
        "wrapper_icd.aarch64.json"
    };
    vars.put(
        "VK_ICD_FILENAMES",
        layout.share_dir().join("vulkan/icd.d").join(icd).display().to_string(),
    );
    vars.put("GALLIUM_DRIVER", "zink");
    vars.put("LIBGL_KOPPER_DISABLE", "true");

    if let Some(blacklist) = driver_config.get("blacklistedExtensions").filter(|v| !v.is_empty()) {
        vars.put("WRAPPER_EXTENSION_BLACKLIST", blacklist);
    }

    if let Ok(max_memory) = driver_config.get_or("maxDeviceMemory", "0").parse::<u64>() {
        if max_memory > 0 {
            vars.put("UTIL_LAYER_VMEM_MAX_SIZE", max_memory.to_string());
        }
    }

    match driver_config.get_or("frameSync", "Normal") {
        "Always" if use_dri3 => vars.put("MESA_VK_WSI_DEBUG", "forcesync"),
        "Never" => vars.put("WRAPPER_DISABLE_PRESENT_WAIT", "1"),
        _ => {}
    }
    vars.put("MESA_VK_WSI_PRESENT_MODE", "mailbox");

    if let Some(sharpness) = &config.sharpness {
        vars.put("ENABLE_VKBASALT", "1");
        vars.put("VKBASALT_CONFIG", sharpness.to_vkbasalt_config());
    }
    vars
}

pub fn audio(driver: AudioDriver, endpoints: &EndpointLayout) -> EnvVars {
    let mut vars = EnvVars::new();
    match driver {
        AudioDriver::Alsa | AudioDriver::AlsaReflector => {
            vars.put("ANDROID_ALSA_SERVER", endpoints.alsa().display().to_string());
            vars.put("ANDROID_ASERVER_USE_SHM", "true");
        }
        AudioDriver::PulseAudio => {
            vars.put("PULSE_SERVER", endpoints.pulse().display().to_string());
        }
        AudioDriver::None => {}
    }
    vars
}

pub fn dx_wrapper(config: &EffectiveConfig) -> EnvVars {
    let mut vars = EnvVars::new();
    let dx = &config.dx_wrapper_config;
    match config.dx_wrapper.as_str() {
        "dxvk" => {
            let framerate = dx.get_or("framerate", "0");
            if framerate != "0" {
                vars.put("DXVK_FRAME_RATE", framerate);
            }
            if dx.get_or("async", "0") == "1" {
                vars.put("DXVK_ASYNC", "1");
            }
            if dx.get_or("asyncCache", "0") == "1" {
                vars.put("DXVK_GPLASYNCCACHE", "1");
            }
        }
        "vkd3d" => {
            vars.put("VKD3D_FEATURE_LEVEL", dx.get_or("vkd3dLevel", "12_1"));
        }
        _ => {}
    }
    vars
}

pub fn ddraw_wrapper(config: &EffectiveConfig, layout: &GuestLayout) -> EnvVars {
    let mut vars = EnvVars::new();
    if config.ddraw_wrapper == "cnc-ddraw" {
        vars.put(
            "CNC_DDRAW_CONFIG_FILE",
            layout.windows_dir().join("syswow64/ddraw.ini").display().to_string(),
        );
    }
    vars
}

/// Dump and transcode caches for the media converter plugin.
pub fn media_converter(layout: &GuestLayout) -> EnvVars {
    let tmp = layout.tmp_dir();
    [
        ("MEDIACONV_AUDIO_DUMP_FILE", "audio.foz"),
        ("MEDIACONV_AUDIO_TRANSCODED_FILE", "transcoded_audio.foz"),
        ("MEDIACONV_VIDEO_DUMP_FILE", "video.foz"),
        ("MEDIACONV_VIDEO_TRANSCODED_FILE", "transcoded_video.foz"),
    ]
    .into_iter()
    .map(|(key, file)| (key, tmp.join(file).display().to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProfileSettings, SessionOverrides, resolve};

    fn build(overrides: SessionOverrides, use_dri3: bool) -> EnvVars {
        let profile = ProfileSettings {
            env_vars: "WINEESYNC=0 DXVK_HUD=fps".into(),
            ..ProfileSettings::default()
        };
        let config = resolve(&profile, Some(&overrides)).config;
        let layout = GuestLayout::for_config("/img", &config);
        let endpoints = EndpointLayout::new("/img");
        let debug = DebugSettings::default();
        let ctx = EnvContext {
            layout: &layout,
            endpoints: &endpoints,
            debug: &debug,
            use_dri3,
        };
        standard_builder(&config, ctx).build()
    }

    #[test]
    fn standard_layers_include_constants_and_audio() {
        let vars = build(SessionOverrides::new(), true);
        assert_eq!(vars.get("MESA_DEBUG"), Some("silent"));
        assert_eq!(vars.get("WINEPREFIX"), Some("/img/home/xuser/.wine"));
        assert_eq!(vars.get("WINEDEBUG"), Some("-all"));
        assert_eq!(vars.get("ANDROID_ALSA_SERVER"), Some("/img/tmp/.sound/AS0"));
        assert_eq!(vars.get("GALLIUM_DRIVER"), Some("zink"));
        assert_eq!(
            vars.get("VK_ICD_FILENAMES"),
            Some("/img/usr/share/vulkan/icd.d/wrapper_icd.aarch64.json")
        );
        // Profile value wins over the computed default.
        assert_eq!(vars.get("WINEESYNC"), Some("0"));
    }

    #[test]
    fn session_env_beats_profile_env() {
        let overrides = SessionOverrides::new().with_extra("envVars", "DXVK_HUD=full");
        let vars = build(overrides, true);
        assert_eq!(vars.get("DXVK_HUD"), Some("full"));
    }

    #[test]
    fn frame_sync_and_dri3() {
        let always = SessionOverrides::new()
            .with_extra("graphicsDriverConfig", "frameSync=Always,maxDeviceMemory=4096");
        let vars = build(always.clone(), true);
        assert_eq!(vars.get("MESA_VK_WSI_DEBUG"), Some("forcesync"));
        assert_eq!(vars.get("UTIL_LAYER_VMEM_MAX_SIZE"), Some("4096"));

        let vars = build(always, false);
        assert_eq!(vars.get("MESA_VK_WSI_DEBUG"), Some("sw"));

        let never = SessionOverrides::new().with_extra("graphicsDriverConfig", "frameSync=Never");
        assert_eq!(build(never, true).get("WRAPPER_DISABLE_PRESENT_WAIT"), Some("1"));
    }

    #[test]
    fn pulse_and_cnc_ddraw() {
        let overrides = SessionOverrides::new()
            .with_extra("audioDriver", "pulseaudio")
            .with_extra("ddrawrapper", "cnc-ddraw");
        let vars = build(overrides, true);
        assert_eq!(vars.get("PULSE_SERVER"), Some("/img/tmp/.sound/PS0"));
        assert!(!vars.has("ANDROID_ALSA_SERVER"));
        assert!(vars.get("CNC_DDRAW_CONFIG_FILE").unwrap().ends_with("syswow64/ddraw.ini"));
    }

    #[test]
    fn sharpness_enables_vkbasalt() {
        let overrides = SessionOverrides::new().with_extra("sharpnessEffect", "DLS");
        let vars = build(overrides, true);
        assert_eq!(vars.get("ENABLE_VKBASALT"), Some("1"));
        assert!(vars.get("VKBASALT_CONFIG").unwrap().starts_with("effects=dls;"));
    }
}
