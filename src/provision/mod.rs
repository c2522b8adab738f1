//! Incremental guest provisioning.
//!
//! A pass compares the [`EffectiveConfig`](crate::config::EffectiveConfig)
//! against [`PersistedMarkers`], installs only the categories that changed and
//! returns the updated markers. The caller owns persistence; use
//! [`ProvisioningEngine::provision_and_commit`] to load and save through a
//! [`MarkerStore`] in one step.

mod engine;
pub mod installer;
pub mod markers;
pub mod prefix;
pub mod version;

pub use engine::{Category, CommitError, ProvisionDeps, ProvisionError, ProvisionReport, ProvisioningEngine};
pub use installer::{
    ArchiveExtractor, ContentProfiles, DirectoryExtractor, DllRestorer, ExtractRequest,
    InstallError, NoContentProfiles, PathRewrite, ProfileOutcome, WinComponentCatalog,
};
pub use markers::{FileMarkerStore, MarkerKey, MarkerStore, MarkerStoreError, MemoryMarkerStore, PersistedMarkers};
pub use prefix::{PrefixEditor, RegValue, RegistryFile, WineRegistry, sync_drive_links};
pub use version::{compare_versions, parse_version_number};
