//! Service components the guest talks to, and the orchestrator that starts
//! them in order and stops them in reverse.

mod launcher;
mod network;
mod orchestrator;
mod server;

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::ipc::IpcError;

pub use launcher::{ExitCallback, GuestLauncherComponent, LaunchSpec};
pub use network::NetworkInfoComponent;
pub use orchestrator::{
    ComponentFactory, ComponentOrchestrator, DefaultComponentFactory, EndpointHandlers, Session,
    StartContext,
};
pub use server::ServerComponent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentKind {
    SharedMemory,
    DisplayServer,
    NetworkInfo,
    Audio,
    GuestLauncher,
}

impl ComponentKind {
    /// Start order. The launcher is always last.
    pub const START_ORDER: [ComponentKind; 5] = [
        ComponentKind::SharedMemory,
        ComponentKind::DisplayServer,
        ComponentKind::NetworkInfo,
        ComponentKind::Audio,
        ComponentKind::GuestLauncher,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::SharedMemory => "shared_memory",
            ComponentKind::DisplayServer => "display_server",
            ComponentKind::NetworkInfo => "network_info",
            ComponentKind::Audio => "audio",
            ComponentKind::GuestLauncher => "guest_launcher",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Created,
    Started,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("{kind} endpoint: {source}")]
    Endpoint {
        kind: ComponentKind,
        #[source]
        source: IpcError,
    },
    #[error("launcher binary {} not found", path.display())]
    LauncherMissing { path: PathBuf },
    #[error("{kind}: {context}: {source}")]
    Io {
        kind: ComponentKind,
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{kind} cannot {action} while {state:?}")]
    InvalidState {
        kind: ComponentKind,
        action: &'static str,
        state: ComponentState,
    },
    #[error("{kind} worker panicked")]
    Panicked { kind: ComponentKind },
    #[error("{kind}: {message}")]
    Other { kind: ComponentKind, message: String },
}

/// A start failure. Components started before the failing one were stopped
/// again; failures during that cleanup are carried along.
#[derive(Debug, Error)]
#[error("starting {kind} failed: {source}")]
pub struct ComponentStartError {
    pub kind: ComponentKind,
    #[source]
    pub source: ComponentError,
    pub cleanup: Vec<ComponentStopError>,
}

#[derive(Debug, Error)]
#[error("stopping {kind} failed: {source}")]
pub struct ComponentStopError {
    pub kind: ComponentKind,
    #[source]
    pub source: ComponentError,
}

/// Every stop failure of one teardown.
#[derive(Debug, Default, Error)]
pub struct ComponentStopErrors {
    pub errors: Vec<ComponentStopError>,
}

impl ComponentStopErrors {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn kinds(&self) -> Vec<ComponentKind> {
        self.errors.iter().map(|err| err.kind).collect()
    }
}

impl fmt::Display for ComponentStopErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} component(s) failed to stop", self.errors.len())?;
        for err in &self.errors {
            write!(f, "; {err}")?;
        }
        Ok(())
    }
}

/// Lifecycle contract shared by every component: `Created -> Started -> Stopped`.
pub trait ServiceComponent: Send {
    fn kind(&self) -> ComponentKind;

    fn state(&self) -> ComponentState;

    /// Socket path served to the guest, if any.
    fn endpoint(&self) -> Option<&Path> {
        None
    }

    /// Claim the endpoint ahead of [`start`](Self::start).
    fn bind(&mut self) -> Result<(), ComponentError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), ComponentError>;

    /// Stopping a component that is not running is a no-op.
    fn stop(&mut self) -> Result<(), ComponentError>;
}
