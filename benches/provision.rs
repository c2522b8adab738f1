use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use guest_session::config::{DebugSettings, ProfileSettings, SessionOverrides, resolve};
use guest_session::env::{EnvContext, EnvVars, standard_builder};
use guest_session::provision::{
    ArchiveExtractor, ExtractRequest, InstallError, MemoryMarkerStore, NoContentProfiles,
    PrefixEditor, ProvisionDeps, ProvisioningEngine, WinComponentCatalog, compare_versions,
};
use guest_session::{EndpointLayout, GuestLayout, MarkerStore};

struct NullExtractor;

impl ArchiveExtractor for NullExtractor {
    fn extract(&self, _request: &ExtractRequest) -> Result<(), InstallError> {
        Ok(())
    }
}

struct NullPrefix;

impl PrefixEditor for NullPrefix {
    fn set_audio_driver(&self, _driver: &str) -> Result<(), InstallError> {
        Ok(())
    }

    fn apply_desktop_theme(&self, _theme: &str) -> Result<(), InstallError> {
        Ok(())
    }

    fn set_essential_services_only(&self, _essential_only: bool) -> Result<(), InstallError> {
        Ok(())
    }

    fn override_dlls(&self, _files: &[String], _native: bool) -> Result<(), InstallError> {
        Ok(())
    }

    fn set_win_component_registry_keys(&self, _component: &str, _native: bool) -> Result<(), InstallError> {
        Ok(())
    }
}

const CATALOG: &str = r#"{
    "direct3d": ["d3d9", "d3d11"], "directsound": ["dsound"], "directmusic": ["dmime"],
    "directshow": ["quartz"], "directplay": ["dplayx"], "vcrun2010": ["msvcr100"],
    "wmdecoder": ["wmvdecod"], "opengl": ["opengl32"]
}"#;

fn version_ordering(c: &mut Criterion) {
    let pairs = [
        ("2.4", "2.4.1"),
        ("2.10", "2.9"),
        ("1.0", "1.0.0"),
        ("proton-9.0", "proton-9.0-arm64ec"),
    ];
    c.bench_function("compare_versions", |b| {
        b.iter(|| {
            for (a, z) in pairs {
                black_box(compare_versions(black_box(a), black_box(z)));
            }
        });
    });
}

fn environment_layering(c: &mut Criterion) {
    let overrides = SessionOverrides::new()
        .with_extra("envVars", "DXVK_HUD=fps WINEESYNC=0")
        .with_extra("dxwrapper", "dxvk");
    let profile = ProfileSettings {
        env_vars: "ZINK_DESCRIPTORS=lazy MESA_SHADER_CACHE_DISABLE=false".into(),
        ..ProfileSettings::default()
    };
    let config = resolve(&profile, Some(&overrides)).config;
    let layout = GuestLayout::for_config("/imagefs", &config);
    let endpoints = EndpointLayout::new("/imagefs");
    let debug = DebugSettings::default();
    c.bench_function("standard_environment", |b| {
        b.iter(|| {
            let ctx = EnvContext {
                layout: &layout,
                endpoints: &endpoints,
                debug: &debug,
                use_dri3: true,
            };
            let mut builder = standard_builder(&config, ctx);
            builder.set_one_shot(EnvVars::parse("WINEDEBUG=-all"));
            black_box(builder.build());
        });
    });
}

fn noop_provision_pass(c: &mut Criterion) {
    let config = resolve(&ProfileSettings::default(), None).config;
    let deps = ProvisionDeps {
        extractor: Arc::new(NullExtractor),
        profiles: Arc::new(NoContentProfiles),
        prefix: Arc::new(NullPrefix),
        catalog: WinComponentCatalog::from_json(CATALOG).expect("catalog"),
    };
    let root = tempfile::tempdir().expect("image root");
    let engine = ProvisioningEngine::new(root.path(), "1.0", "1", deps);
    let store = MemoryMarkerStore::default();
    engine
        .provision_and_commit(&config, &store)
        .expect("first pass");
    let markers = store.load().expect("markers");

    c.bench_function("provision_unchanged", |b| {
        b.iter(|| {
            let report = engine.provision(black_box(&config), markers.clone());
            black_box(report);
        });
    });
}

criterion_group!(benches, version_ordering, environment_layering, noop_provision_pass);
criterion_main!(benches);
