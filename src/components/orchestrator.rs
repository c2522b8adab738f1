use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{
    ComponentError, ComponentKind, ComponentStartError, ComponentState, ComponentStopError,
    ComponentStopErrors, ExitCallback, GuestLauncherComponent, LaunchSpec, NetworkInfoComponent,
    ServerComponent, ServiceComponent,
};
use crate::config::EffectiveConfig;
use crate::env::EnvVars;
use crate::ipc::{ConnectionHandler, DiscardHandler};
use crate::layout::EndpointLayout;
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};

const TARGET: &str = "guest::components";
const NETWORK_REFRESH: Duration = Duration::from_secs(5);

/// Inputs for one session start.
pub struct StartContext {
    pub config: Arc<EffectiveConfig>,
    pub env: EnvVars,
    pub endpoints: EndpointLayout,
    pub command_line: String,
    /// Handed to the launcher component; fired when the guest exits on its own.
    pub on_exit: Option<ExitCallback>,
}

impl StartContext {
    pub fn new(config: Arc<EffectiveConfig>, env: EnvVars, endpoints: EndpointLayout) -> Self {
        let command_line = config.guest_command_line(None);
        Self {
            config,
            env,
            endpoints,
            command_line,
            on_exit: None,
        }
    }

    pub fn with_command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = command_line.into();
        self
    }

    pub fn on_exit(mut self, callback: ExitCallback) -> Self {
        self.on_exit = Some(callback);
        self
    }
}

/// Builds the component for one kind. `Ok(None)` leaves that slot empty.
pub trait ComponentFactory: Send + Sync {
    fn create(
        &self,
        kind: ComponentKind,
        ctx: &mut StartContext,
    ) -> Result<Option<Box<dyn ServiceComponent>>, ComponentError>;
}

/// Protocol handlers behind each server endpoint.
#[derive(Clone)]
pub struct EndpointHandlers {
    pub shared_memory: Arc<dyn ConnectionHandler>,
    pub display: Arc<dyn ConnectionHandler>,
    pub audio: Arc<dyn ConnectionHandler>,
}

impl Default for EndpointHandlers {
    fn default() -> Self {
        Self {
            shared_memory: Arc::new(DiscardHandler),
            display: Arc::new(DiscardHandler),
            audio: Arc::new(DiscardHandler),
        }
    }
}

pub struct DefaultComponentFactory {
    handlers: EndpointHandlers,
    launcher_program: PathBuf,
    network_interval: Duration,
    logger: Option<Logger>,
}

impl DefaultComponentFactory {
    pub fn new(launcher_program: impl Into<PathBuf>) -> Self {
        Self {
            handlers: EndpointHandlers::default(),
            launcher_program: launcher_program.into(),
            network_interval: NETWORK_REFRESH,
            logger: None,
        }
    }

    pub fn with_handlers(mut self, handlers: EndpointHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_network_interval(mut self, interval: Duration) -> Self {
        self.network_interval = interval;
        self
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }

    fn launch_spec(&self, ctx: &StartContext) -> LaunchSpec {
        let preset = ctx.config.box64_preset.trim();
        LaunchSpec {
            program: self.launcher_program.clone(),
            command_line: ctx.command_line.clone(),
            env: ctx.env.clone(),
            bind_paths: ctx.config.binding_paths.clone(),
            preset: (!preset.is_empty()).then(|| preset.to_string()),
        }
    }
}

impl ComponentFactory for DefaultComponentFactory {
    fn create(
        &self,
        kind: ComponentKind,
        ctx: &mut StartContext,
    ) -> Result<Option<Box<dyn ServiceComponent>>, ComponentError> {
        let logger = self.logger.clone();
        let component: Option<Box<dyn ServiceComponent>> = match kind {
            ComponentKind::SharedMemory => Some(Box::new(
                ServerComponent::shared_memory(&ctx.endpoints, Arc::clone(&self.handlers.shared_memory))
                    .with_logger(logger),
            )),
            ComponentKind::DisplayServer => Some(Box::new(
                ServerComponent::display_server(&ctx.endpoints, Arc::clone(&self.handlers.display))
                    .with_logger(logger),
            )),
            ComponentKind::NetworkInfo => Some(Box::new(
                NetworkInfoComponent::new(ctx.endpoints.network_info(), self.network_interval)
                    .with_logger(logger),
            )),
            ComponentKind::Audio => ServerComponent::audio(
                ctx.config.audio_driver,
                &ctx.endpoints,
                Arc::clone(&self.handlers.audio),
            )
            .map(|server| Box::new(server.with_logger(logger)) as Box<dyn ServiceComponent>),
            ComponentKind::GuestLauncher => {
                let mut launcher =
                    GuestLauncherComponent::new(self.launch_spec(ctx)).with_logger(logger);
                if let Some(callback) = ctx.on_exit.take() {
                    launcher = launcher.on_exit(callback);
                }
                Some(Box::new(launcher))
            }
        };
        Ok(component)
    }
}

/// The started components of one session, in start order.
pub struct Session {
    components: Vec<Box<dyn ServiceComponent>>,
}

impl Session {
    /// The component of `kind`, if it is currently started.
    pub fn lookup(&self, kind: ComponentKind) -> Option<&dyn ServiceComponent> {
        self.components
            .iter()
            .find(|c| c.kind() == kind && c.state() == ComponentState::Started)
            .map(|c| c.as_ref())
    }

    pub fn kinds(&self) -> Vec<ComponentKind> {
        self.components.iter().map(|c| c.kind()).collect()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.components
            .iter()
            .any(|c| c.state() == ComponentState::Started)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for component in self.components.iter_mut().rev() {
            if component.state() == ComponentState::Started {
                let _ = component.stop();
            }
        }
    }
}

/// Starts components strictly in [`ComponentKind::START_ORDER`] and stops
/// them in reverse.
pub struct ComponentOrchestrator {
    factory: Arc<dyn ComponentFactory>,
    logger: Option<Logger>,
}

impl ComponentOrchestrator {
    pub fn new(factory: Arc<dyn ComponentFactory>) -> Self {
        Self {
            factory,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Each component is bound and started before the next one is created,
    /// so the launcher only runs once every endpoint is listening.
    pub fn start(&self, mut ctx: StartContext) -> Result<Session, ComponentStartError> {
        let mut started: Vec<Box<dyn ServiceComponent>> = Vec::new();
        for kind in ComponentKind::START_ORDER {
            let mut component = match self.factory.create(kind, &mut ctx) {
                Ok(Some(component)) => component,
                Ok(None) => {
                    emit(
                        self.logger.as_ref(),
                        LogLevel::Debug,
                        TARGET,
                        "component_skipped",
                        [json_str("component", kind.as_str())],
                    );
                    continue;
                }
                Err(source) => return Err(self.abort(kind, source, None, started)),
            };
            let outcome = component.bind().and_then(|()| component.start());
            if let Err(source) = outcome {
                return Err(self.abort(kind, source, Some(component), started));
            }
            emit(
                self.logger.as_ref(),
                LogLevel::Info,
                TARGET,
                "component_started",
                [json_str("component", kind.as_str())],
            );
            started.push(component);
        }
        Ok(Session {
            components: started,
        })
    }

    fn abort(
        &self,
        kind: ComponentKind,
        source: ComponentError,
        failed: Option<Box<dyn ServiceComponent>>,
        mut started: Vec<Box<dyn ServiceComponent>>,
    ) -> ComponentStartError {
        emit(
            self.logger.as_ref(),
            LogLevel::Error,
            TARGET,
            "component_start_failed",
            [
                json_str("component", kind.as_str()),
                json_str("error", source.to_string()),
            ],
        );
        let mut cleanup = Vec::new();
        // The failing component may already hold its endpoint.
        if let Some(mut component) = failed {
            if let Err(err) = component.stop() {
                cleanup.push(ComponentStopError {
                    kind,
                    source: err,
                });
            }
        }
        cleanup.extend(self.stop_all(&mut started));
        ComponentStartError {
            kind,
            source,
            cleanup,
        }
    }

    fn stop_all(&self, components: &mut [Box<dyn ServiceComponent>]) -> Vec<ComponentStopError> {
        let mut errors = Vec::new();
        for component in components.iter_mut().rev() {
            let kind = component.kind();
            match component.stop() {
                Ok(()) => emit(
                    self.logger.as_ref(),
                    LogLevel::Info,
                    TARGET,
                    "component_stopped",
                    [json_str("component", kind.as_str())],
                ),
                Err(source) => {
                    emit(
                        self.logger.as_ref(),
                        LogLevel::Warn,
                        TARGET,
                        "component_stop_failed",
                        [
                            json_str("component", kind.as_str()),
                            json_str("error", source.to_string()),
                        ],
                    );
                    errors.push(ComponentStopError { kind, source });
                }
            }
        }
        errors
    }

    /// Stop every component in reverse start order. A failure never skips
    /// the remaining stops; all failures are returned together.
    pub fn stop(&self, session: &mut Session) -> Result<(), ComponentStopErrors> {
        let errors = self.stop_all(&mut session.components);
        emit(
            self.logger.as_ref(),
            LogLevel::Info,
            TARGET,
            "session_components_stopped",
            [
                json_kv("components", session.components.len()),
                json_kv("failures", errors.len()),
            ],
        );
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ComponentStopErrors { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioDriver, ProfileSettings, resolve};
    use crate::logging::MemorySink;
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct FakeComponent {
        kind: ComponentKind,
        state: ComponentState,
        journal: Journal,
        fail_start: bool,
        fail_stop: bool,
    }

    impl ServiceComponent for FakeComponent {
        fn kind(&self) -> ComponentKind {
            self.kind
        }

        fn state(&self) -> ComponentState {
            self.state
        }

        fn bind(&mut self) -> Result<(), ComponentError> {
            self.journal.lock().unwrap().push(format!("bind:{}", self.kind));
            Ok(())
        }

        fn start(&mut self) -> Result<(), ComponentError> {
            self.journal.lock().unwrap().push(format!("start:{}", self.kind));
            if self.fail_start {
                return Err(ComponentError::Other {
                    kind: self.kind,
                    message: "refused".into(),
                });
            }
            self.state = ComponentState::Started;
            self.journal.lock().unwrap().push(format!("started:{}", self.kind));
            Ok(())
        }

        fn stop(&mut self) -> Result<(), ComponentError> {
            if self.state == ComponentState::Stopped {
                return Ok(());
            }
            self.state = ComponentState::Stopped;
            self.journal.lock().unwrap().push(format!("stop:{}", self.kind));
            if self.fail_stop {
                return Err(ComponentError::Other {
                    kind: self.kind,
                    message: "stuck".into(),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        journal: Journal,
        fail_start: Vec<ComponentKind>,
        fail_stop: Vec<ComponentKind>,
        skip: Vec<ComponentKind>,
    }

    impl ComponentFactory for FakeFactory {
        fn create(
            &self,
            kind: ComponentKind,
            _ctx: &mut StartContext,
        ) -> Result<Option<Box<dyn ServiceComponent>>, ComponentError> {
            if self.skip.contains(&kind) {
                return Ok(None);
            }
            Ok(Some(Box::new(FakeComponent {
                kind,
                state: ComponentState::Created,
                journal: Arc::clone(&self.journal),
                fail_start: self.fail_start.contains(&kind),
                fail_stop: self.fail_stop.contains(&kind),
            })))
        }
    }

    fn context(root: &std::path::Path) -> StartContext {
        let config = resolve(&ProfileSettings::default(), None).config;
        StartContext::new(config, EnvVars::parse("WINEESYNC=1"), EndpointLayout::new(root))
    }

    fn entries(journal: &Journal, prefix: &str) -> Vec<String> {
        journal
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }

    #[test]
    fn launcher_starts_last_and_stop_reverses_order() {
        let factory = Arc::new(FakeFactory::default());
        let journal = Arc::clone(&factory.journal);
        let orchestrator = ComponentOrchestrator::new(factory);
        let mut session = orchestrator.start(context(std::path::Path::new("/img"))).unwrap();

        let log = journal.lock().unwrap().clone();
        let launcher_start = log.iter().position(|e| e == "start:guest_launcher").unwrap();
        for kind in &ComponentKind::START_ORDER[..4] {
            let done = log.iter().position(|e| *e == format!("started:{kind}")).unwrap();
            assert!(done < launcher_start, "{kind} finished after launcher began");
        }
        assert!(session.lookup(ComponentKind::Audio).is_some());

        orchestrator.stop(&mut session).unwrap();
        let started = entries(&journal, "started:");
        let mut stopped = entries(&journal, "stop:");
        stopped.reverse();
        assert_eq!(started, stopped);
        assert!(session.lookup(ComponentKind::Audio).is_none());
        assert!(!session.is_running());
    }

    #[test]
    fn stop_failures_are_aggregated_without_skipping() {
        let factory = Arc::new(FakeFactory {
            fail_stop: vec![ComponentKind::Audio, ComponentKind::DisplayServer],
            ..FakeFactory::default()
        });
        let journal = Arc::clone(&factory.journal);
        let orchestrator = ComponentOrchestrator::new(factory);
        let mut session = orchestrator.start(context(std::path::Path::new("/img"))).unwrap();

        let err = orchestrator.stop(&mut session).unwrap_err();
        assert_eq!(
            err.kinds(),
            vec![ComponentKind::Audio, ComponentKind::DisplayServer]
        );
        assert_eq!(entries(&journal, "stop:").len(), 5);
    }

    #[test]
    fn start_failure_cleans_up_in_reverse_and_skips_launcher() {
        let factory = Arc::new(FakeFactory {
            fail_start: vec![ComponentKind::Audio],
            ..FakeFactory::default()
        });
        let journal = Arc::clone(&factory.journal);
        let sink = MemorySink::new();
        let orchestrator =
            ComponentOrchestrator::new(factory).with_logger(Some(Logger::new(sink.clone())));

        let err = orchestrator
            .start(context(std::path::Path::new("/img")))
            .err()
            .unwrap();
        assert_eq!(err.kind, ComponentKind::Audio);
        assert!(err.cleanup.is_empty());
        assert_eq!(
            entries(&journal, "stop:"),
            vec!["network_info", "display_server", "shared_memory"]
        );
        assert!(entries(&journal, "start:").iter().all(|k| k != "guest_launcher"));
        assert!(sink
            .messages_for("guest::components")
            .contains(&"component_start_failed".to_string()));
    }

    #[test]
    fn skipped_slot_is_not_part_of_session() {
        let factory = Arc::new(FakeFactory {
            skip: vec![ComponentKind::Audio],
            ..FakeFactory::default()
        });
        let orchestrator = ComponentOrchestrator::new(factory);
        let mut session = orchestrator.start(context(std::path::Path::new("/img"))).unwrap();
        assert_eq!(session.len(), 4);
        assert!(session.lookup(ComponentKind::Audio).is_none());
        orchestrator.stop(&mut session).unwrap();
    }

    #[test]
    fn missing_launcher_unwinds_real_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = EndpointLayout::new(dir.path());
        let factory = DefaultComponentFactory::new(dir.path().join("missing-launcher"))
            .with_network_interval(Duration::from_secs(60));
        let orchestrator = ComponentOrchestrator::new(Arc::new(factory));

        let err = orchestrator.start(context(dir.path())).err().unwrap();
        assert_eq!(err.kind, ComponentKind::GuestLauncher);
        assert!(matches!(err.source, ComponentError::LauncherMissing { .. }));
        assert!(!endpoints.display().exists());
        assert!(!endpoints.shared_memory().exists());
        assert!(!endpoints.alsa().exists());
    }

    #[test]
    fn default_factory_skips_audio_when_disabled() {
        let mut config = (*resolve(&ProfileSettings::default(), None).config).clone();
        config.audio_driver = AudioDriver::None;
        let mut ctx = StartContext::new(Arc::new(config), EnvVars::new(), EndpointLayout::new("/img"));
        let factory = DefaultComponentFactory::new("/bin/launcher");
        assert!(factory.create(ComponentKind::Audio, &mut ctx).unwrap().is_none());
        let launcher = factory.create(ComponentKind::GuestLauncher, &mut ctx).unwrap().unwrap();
        assert_eq!(launcher.kind(), ComponentKind::GuestLauncher);
    }
}
