//! Guest compatibility session engine.
//!
//! Resolves an effective run configuration from profile defaults and session
//! overrides, provisions only the guest resources that configuration needs,
//! starts the local service components the guest talks to, and manages
//! exclusive pointer capture while the session runs.

pub mod capture;
pub mod components;
pub mod config;
pub mod env;
pub mod error;
pub mod ipc;
pub mod layout;
pub mod logging;
pub mod metrics;
pub mod provision;
pub mod runtime;

pub use capture::{
    CaptureError, CaptureEvent, CaptureEventLoop, CaptureScheduler, CaptureState, CaptureStats,
    CaptureSurface, CaptureTimings, ManualScheduler, PointerCaptureController,
    TerminalCaptureSurface, ThreadTimer, TimerToken,
};
pub use components::{
    ComponentError, ComponentFactory, ComponentKind, ComponentOrchestrator, ComponentStartError,
    ComponentState, ComponentStopError, ComponentStopErrors, DefaultComponentFactory,
    EndpointHandlers, ExitCallback, GuestLauncherComponent, LaunchSpec, NetworkInfoComponent,
    ServerComponent, ServiceComponent, Session, StartContext,
};
pub use config::{
    AudioDriver, CaptureSettings, ConfigResolutionError, EffectiveConfig, KeyValueSet,
    ProfileSettings, ResolvedConfig, RuntimeSettings, SessionOverrides, resolve,
};
pub use env::{EnvLayer, EnvVars, EnvironmentVariableBuilder};
pub use error::{Result, SessionError};
pub use ipc::{ConnectionHandler, DiscardHandler, EndpointServer, IpcError, LocalEndpoint};
pub use layout::{EndpointLayout, GuestLayout};
pub use logging::{LogEvent, LogFields, LogLevel, Logger, LoggingError, LoggingResult};
pub use metrics::{MetricSnapshot, SessionMetrics};
pub use provision::{
    Category, FileMarkerStore, MarkerKey, MarkerStore, MemoryMarkerStore, PersistedMarkers,
    ProvisionDeps, ProvisionError, ProvisionReport, ProvisioningEngine, compare_versions,
};
pub use runtime::audit::{
    MemoryAudit, NullSessionAudit, SessionAudit, SessionAuditEvent, SessionAuditEventBuilder,
    SessionAuditStage,
};
pub use runtime::{
    BackgroundTask, EXTRA_EXEC_ARGS, PreparedEnvironment, RuntimeConfig, SessionRuntime,
    TeardownReport,
};
