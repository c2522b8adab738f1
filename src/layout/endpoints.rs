use std::path::{Path, PathBuf};

/// Local socket paths served to the guest, relative to the image root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointLayout {
    root: PathBuf,
}

impl EndpointLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shared_memory(&self) -> PathBuf {
        self.root.join("tmp/.sysvshm/SM0")
    }

    pub fn display(&self) -> PathBuf {
        self.root.join("tmp/.X11-unix/X0")
    }

    pub fn alsa(&self) -> PathBuf {
        self.root.join("tmp/.sound/AS0")
    }

    pub fn pulse(&self) -> PathBuf {
        self.root.join("tmp/.sound/PS0")
    }

    /// File the network-info component keeps current for the guest.
    pub fn network_info(&self) -> PathBuf {
        self.root.join("tmp/.network/info.json")
    }
}
