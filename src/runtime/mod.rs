use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Sender;
use serde_json::json;

use crate::capture::{CaptureEvent, CaptureStats};
use crate::components::{
    ComponentFactory, ComponentOrchestrator, ComponentStartError, ComponentStopErrors,
    DefaultComponentFactory, ExitCallback, Session, StartContext,
};
use crate::config::{
    EffectiveConfig, ProfileSettings, RuntimeSettings, SessionOverrides, resolve,
};
use crate::env::{EnvContext, EnvVars, standard_builder};
use crate::layout::{EndpointLayout, GuestLayout};
use crate::logging::{FileSink, LogLevel, Logger, emit, json_kv, json_str};
use crate::metrics::{MetricSnapshot, SessionMetrics};
use crate::provision::{CommitError, FileMarkerStore, ProvisionDeps, ProvisionReport, ProvisioningEngine};
use crate::{Result, SessionError};

pub mod audit;

use audit::{NullSessionAudit, SessionAudit, SessionAuditEventBuilder, SessionAuditStage};

const TARGET: &str = "guest::runtime";
/// One-shot variable carrying extra arguments for a shortcut-less launch.
pub const EXTRA_EXEC_ARGS: &str = "EXTRA_EXEC_ARGS";

/// Configuration knobs for a session runtime.
#[derive(Clone)]
pub struct RuntimeConfig {
    pub settings: RuntimeSettings,
    /// Optional structured logger shared by every component.
    pub logger: Option<Logger>,
    /// Metrics accumulator used for teardown snapshots.
    pub metrics: Option<Arc<Mutex<SessionMetrics>>>,
    pub audit: Arc<dyn SessionAudit>,
    /// Target field used when emitting metrics snapshots.
    pub metrics_target: String,
}

impl RuntimeConfig {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            logger: None,
            metrics: None,
            audit: Arc::new(NullSessionAudit),
            metrics_target: "guest::runtime.metrics".to_string(),
        }
    }

    /// Build from settings, opening the log file when one is configured.
    pub fn from_settings(settings: RuntimeSettings) -> Result<Self> {
        let logger = match settings.log_path.as_ref() {
            Some(path) => Some(Logger::new(FileSink::new(path, settings.log_max_bytes)?)),
            None => None,
        };
        let mut config = Self::new(settings);
        config.logger = logger;
        Ok(config)
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn SessionAudit>) -> Self {
        self.audit = audit;
        self
    }

    /// Enable metrics collection if it has not already been configured.
    pub fn enable_metrics(&mut self) {
        if self.metrics.is_none() {
            self.metrics = Some(Arc::new(Mutex::new(SessionMetrics::new())));
        }
    }

    /// Disable metrics collection and prevent further snapshots.
    pub fn disable_metrics(&mut self) {
        self.metrics = None;
    }

    /// Access the shared metrics handle if metrics are enabled.
    pub fn metrics_handle(&self) -> Option<Arc<Mutex<SessionMetrics>>> {
        self.metrics.as_ref().map(Arc::clone)
    }
}

fn record_metrics(metrics: Option<&Arc<Mutex<SessionMetrics>>>, f: impl FnOnce(&mut SessionMetrics)) {
    if let Some(metrics) = metrics {
        if let Ok(mut guard) = metrics.lock() {
            f(&mut guard);
        }
    }
}

/// Clears the provisioning flag however the worker ends, panics included.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Work running on a background thread. The caller decides when to wait.
#[derive(Debug)]
pub struct BackgroundTask<T> {
    name: &'static str,
    handle: JoinHandle<T>,
}

impl<T> BackgroundTask<T> {
    fn spawn<F>(name: &'static str, work: F) -> Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(work)?;
        Ok(Self { name, handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn wait(self) -> Result<T> {
        self.handle
            .join()
            .map_err(|_| SessionError::WorkerPanicked(self.name))
    }
}

/// Guest variables and the launcher command line for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEnvironment {
    pub env: EnvVars,
    pub command_line: String,
}

/// Outcome of a teardown. Every step runs even when earlier ones fail.
#[derive(Debug)]
pub struct TeardownReport {
    pub stopped: usize,
    pub capture_signalled: bool,
    pub errors: Option<ComponentStopErrors>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_none()
    }

    pub fn into_result(self) -> Result<()> {
        match self.errors {
            Some(errors) => Err(SessionError::Stop(errors)),
            None => Ok(()),
        }
    }
}

/// Ties the session entry points together: resolve, environment, provision,
/// start and stop.
pub struct SessionRuntime {
    config: RuntimeConfig,
    deps: ProvisionDeps,
    factory: Arc<dyn ComponentFactory>,
    one_shot: EnvVars,
    capture: Option<Sender<CaptureEvent>>,
    provisioning: Arc<AtomicBool>,
    started_at: Instant,
}

impl SessionRuntime {
    pub fn new(config: RuntimeConfig, deps: ProvisionDeps, factory: Arc<dyn ComponentFactory>) -> Self {
        emit(
            config.logger.as_ref(),
            LogLevel::Info,
            TARGET,
            "runtime_constructed",
            [json_str("root", config.settings.session_root.display().to_string())],
        );
        Self {
            config,
            deps,
            factory,
            one_shot: EnvVars::new(),
            capture: None,
            provisioning: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    /// Runtime using the stock components and the configured launcher.
    pub fn with_default_components(config: RuntimeConfig, deps: ProvisionDeps) -> Self {
        let factory = DefaultComponentFactory::new(config.settings.launcher_program.clone())
            .with_logger(config.logger.clone());
        Self::new(config, deps, Arc::new(factory))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RuntimeConfig {
        &mut self.config
    }

    pub fn endpoints(&self) -> EndpointLayout {
        EndpointLayout::new(&self.config.settings.session_root)
    }

    fn audit(&self, stage: SessionAuditStage, details: impl IntoIterator<Item = (String, serde_json::Value)>) {
        let mut builder = SessionAuditEventBuilder::new(stage);
        for (key, value) in details {
            builder.detail(key, value);
        }
        self.config.audit.record(builder.finish());
    }

    pub fn resolve_config(
        &self,
        profile: &ProfileSettings,
        overrides: Option<&SessionOverrides>,
    ) -> Arc<EffectiveConfig> {
        let resolved = resolve(profile, overrides);
        for fallback in &resolved.fallbacks {
            emit(
                self.config.logger.as_ref(),
                LogLevel::Warn,
                "guest::config",
                "field_fell_back",
                [
                    json_str("field", fallback.field()),
                    json_str("error", fallback.to_string()),
                ],
            );
        }
        self.audit(
            SessionAuditStage::ConfigResolved,
            [
                json_kv("fallbacks", resolved.fallbacks.len()),
                json_kv("shortcut", overrides.and_then(|o| o.shortcut_path.clone())),
            ],
        );
        resolved.config
    }

    /// Overrides applied to the next [`build_environment`](Self::build_environment)
    /// only.
    pub fn set_one_shot_env(&mut self, vars: EnvVars) {
        self.one_shot = vars;
    }

    pub fn build_environment(&mut self, config: &EffectiveConfig) -> PreparedEnvironment {
        let layout = GuestLayout::for_config(&self.config.settings.session_root, config);
        let endpoints = self.endpoints();
        let ctx = EnvContext {
            layout: &layout,
            endpoints: &endpoints,
            debug: &self.config.settings.debug,
            use_dri3: self.config.settings.use_dri3,
        };
        let mut builder = standard_builder(config, ctx);
        builder.set_one_shot(mem::take(&mut self.one_shot));
        let extra_exec_args = builder.take_one_shot(EXTRA_EXEC_ARGS);
        let env = builder.build();
        let command_line = config.guest_command_line(extra_exec_args.as_deref());

        emit(
            self.config.logger.as_ref(),
            LogLevel::Debug,
            "guest::env",
            "environment_built",
            [json_kv("variables", env.len()), json_str("command", command_line.clone())],
        );
        self.audit(SessionAuditStage::EnvironmentBuilt, [json_kv("variables", env.len())]);
        PreparedEnvironment { env, command_line }
    }

    /// Run one provisioning pass off the calling thread and persist the
    /// markers once. Only one pass may run at a time.
    pub fn provision(
        &self,
        config: Arc<EffectiveConfig>,
    ) -> Result<BackgroundTask<std::result::Result<ProvisionReport, CommitError>>> {
        if self.provisioning.swap(true, Ordering::SeqCst) {
            return Err(SessionError::ProvisionInFlight);
        }
        self.audit(
            SessionAuditStage::ProvisionStarted,
            [json_str("dx_wrapper", config.dx_wrapper_id())],
        );

        let settings = &self.config.settings;
        let mut engine = ProvisioningEngine::new(
            settings.session_root.clone(),
            settings.app_version.clone(),
            settings.image_version.clone(),
            self.deps.clone(),
        );
        if let Some(logger) = self.config.logger.clone() {
            engine = engine.with_logger(logger);
        }
        let store = FileMarkerStore::new(settings.marker_path.clone());
        let in_flight = InFlightGuard(Arc::clone(&self.provisioning));
        let metrics = self.config.metrics_handle();
        let audit = Arc::clone(&self.config.audit);
        let logger = self.config.logger.clone();

        BackgroundTask::spawn("guest-provision", move || {
            let _in_flight = in_flight;
            let result = engine.provision_and_commit(&config, &store);
            let mut builder;
            match &result {
                Ok(report) => {
                    record_metrics(metrics.as_ref(), |m| m.record_provision(report, report.staged));
                    builder = SessionAuditEventBuilder::new(SessionAuditStage::ProvisionCompleted);
                    builder
                        .detail("installed", json!(report.installed.len()))
                        .detail("failed", json!(report.failed.len()))
                        .detail("persisted", json!(report.staged));
                }
                Err(err) => {
                    emit(
                        logger.as_ref(),
                        LogLevel::Error,
                        TARGET,
                        "provision_commit_failed",
                        [json_str("error", err.to_string())],
                    );
                    builder = SessionAuditEventBuilder::new(SessionAuditStage::ProvisionFailed);
                    builder.detail("error", json!(err.to_string()));
                }
            }
            audit.record(builder.finish());
            result
        })
    }

    /// Start every component off the calling thread. The returned task yields
    /// the running session or the start failure after cleanup.
    pub fn start_session(
        &self,
        config: Arc<EffectiveConfig>,
        prepared: PreparedEnvironment,
        on_exit: Option<ExitCallback>,
    ) -> Result<BackgroundTask<std::result::Result<Session, ComponentStartError>>> {
        let mut ctx = StartContext::new(config, prepared.env, self.endpoints())
            .with_command_line(prepared.command_line);
        let audit = Arc::clone(&self.config.audit);
        let exit_audit = Arc::clone(&audit);
        ctx = ctx.on_exit(Box::new(move |status| {
            let mut builder = SessionAuditEventBuilder::new(SessionAuditStage::GuestExited);
            builder.detail("code", json!(status.code()));
            exit_audit.record(builder.finish());
            if let Some(callback) = on_exit {
                callback(status);
            }
        }));

        let orchestrator =
            ComponentOrchestrator::new(Arc::clone(&self.factory)).with_logger(self.config.logger.clone());
        let metrics = self.config.metrics_handle();

        BackgroundTask::spawn("guest-session-start", move || {
            let result = orchestrator.start(ctx);
            match &result {
                Ok(session) => {
                    record_metrics(metrics.as_ref(), |m| m.record_started(session.len()));
                    let mut builder = SessionAuditEventBuilder::new(SessionAuditStage::SessionStarted);
                    builder.detail("components", json!(session.len()));
                    audit.record(builder.finish());
                }
                Err(err) => {
                    let mut builder =
                        SessionAuditEventBuilder::new(SessionAuditStage::SessionStartFailed);
                    builder
                        .detail("component", json!(err.kind.as_str()))
                        .detail("error", json!(err.source.to_string()))
                        .detail("cleanup_failures", json!(err.cleanup.len()));
                    audit.record(builder.finish());
                }
            }
            result
        })
    }

    /// Route teardown to a running capture event loop.
    pub fn attach_capture(&mut self, events: Sender<CaptureEvent>) {
        self.capture = Some(events);
    }

    pub fn record_capture_stats(&self, stats: CaptureStats) {
        record_metrics(self.config.metrics.as_ref(), |m| m.record_capture(stats));
    }

    /// Release capture, then stop every component in reverse order. Nothing
    /// here aborts early; failures end up in the report.
    pub fn stop_session(&mut self, session: &mut Session) -> TeardownReport {
        let capture_signalled = match self.capture.take() {
            Some(events) => events.send(CaptureEvent::Teardown).is_ok(),
            None => false,
        };

        let orchestrator =
            ComponentOrchestrator::new(Arc::clone(&self.factory)).with_logger(self.config.logger.clone());
        let stopped = session.len();
        let errors = orchestrator.stop(session).err();
        record_metrics(self.config.metrics.as_ref(), |m| m.record_stopped(stopped, errors.as_ref()));

        let failed: Vec<&str> = errors
            .as_ref()
            .map(|e| e.errors.iter().map(|err| err.kind.as_str()).collect())
            .unwrap_or_default();
        self.audit(
            SessionAuditStage::SessionStopped,
            [json_kv("stopped", stopped), json_kv("failed", json!(failed))],
        );
        self.emit_metrics();
        TeardownReport {
            stopped,
            capture_signalled,
            errors,
        }
    }

    pub fn metrics_snapshot(&self) -> Option<MetricSnapshot> {
        let metrics = self.config.metrics.as_ref()?;
        let guard = metrics.lock().ok()?;
        Some(guard.snapshot(self.started_at.elapsed()))
    }

    fn emit_metrics(&self) {
        if let (Some(logger), Some(snapshot)) = (self.config.logger.as_ref(), self.metrics_snapshot()) {
            let _ = logger.log_event(snapshot.to_log_event(&self.config.metrics_target));
        }
    }
}
