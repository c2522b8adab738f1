use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{ComponentError, ComponentKind, ComponentState, ServiceComponent};
use crate::config::AudioDriver;
use crate::ipc::{ConnectionHandler, EndpointServer, LocalEndpoint};
use crate::layout::EndpointLayout;
use crate::logging::{LogLevel, Logger, emit, json_str};

const TARGET: &str = "guest::components";

/// A component that listens on one local socket and hands connections to a
/// protocol handler.
pub struct ServerComponent {
    kind: ComponentKind,
    label: &'static str,
    path: PathBuf,
    handler: Arc<dyn ConnectionHandler>,
    state: ComponentState,
    bound: Option<LocalEndpoint>,
    server: Option<EndpointServer>,
    logger: Option<Logger>,
}

impl ServerComponent {
    pub fn new(
        kind: ComponentKind,
        label: &'static str,
        path: impl Into<PathBuf>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            kind,
            label,
            path: path.into(),
            handler,
            state: ComponentState::Created,
            bound: None,
            server: None,
            logger: None,
        }
    }

    pub fn shared_memory(endpoints: &EndpointLayout, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self::new(ComponentKind::SharedMemory, "sysvshm", endpoints.shared_memory(), handler)
    }

    pub fn display_server(endpoints: &EndpointLayout, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self::new(ComponentKind::DisplayServer, "x11", endpoints.display(), handler)
    }

    /// Audio server for `driver`; `None` starts no audio component.
    pub fn audio(
        driver: AudioDriver,
        endpoints: &EndpointLayout,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Option<Self> {
        let (label, path) = match driver {
            AudioDriver::Alsa => ("alsa", endpoints.alsa()),
            AudioDriver::AlsaReflector => ("alsa-reflector", endpoints.alsa()),
            AudioDriver::PulseAudio => ("pulseaudio", endpoints.pulse()),
            AudioDriver::None => return None,
        };
        Some(Self::new(ComponentKind::Audio, label, path, handler))
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.server.as_ref().map(EndpointServer::accepted).unwrap_or(0)
    }

    fn endpoint_err(&self, source: crate::ipc::IpcError) -> ComponentError {
        ComponentError::Endpoint {
            kind: self.kind,
            source,
        }
    }
}

impl ServiceComponent for ServerComponent {
    fn kind(&self) -> ComponentKind {
        self.kind
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn endpoint(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn bind(&mut self) -> Result<(), ComponentError> {
        if self.state != ComponentState::Created {
            return Err(ComponentError::InvalidState {
                kind: self.kind,
                action: "bind",
                state: self.state,
            });
        }
        if self.bound.is_none() {
            let endpoint = LocalEndpoint::bind(&self.path).map_err(|e| self.endpoint_err(e))?;
            self.bound = Some(endpoint);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), ComponentError> {
        match self.state {
            ComponentState::Started => return Ok(()),
            ComponentState::Stopped => {
                return Err(ComponentError::InvalidState {
                    kind: self.kind,
                    action: "start",
                    state: self.state,
                });
            }
            ComponentState::Created => {}
        }
        self.bind()?;
        let Some(endpoint) = self.bound.take() else {
            return Err(ComponentError::Other {
                kind: self.kind,
                message: "endpoint was not bound".to_string(),
            });
        };
        let server = endpoint
            .serve(self.label, Arc::clone(&self.handler), self.logger.clone())
            .map_err(|e| self.endpoint_err(e))?;
        self.server = Some(server);
        self.state = ComponentState::Started;
        emit(
            self.logger.as_ref(),
            LogLevel::Info,
            TARGET,
            "endpoint_listening",
            [
                json_str("component", self.label),
                json_str("path", self.path.display().to_string()),
            ],
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ComponentError> {
        if self.state == ComponentState::Stopped {
            return Ok(());
        }
        self.state = ComponentState::Stopped;
        // A bound-but-never-served endpoint still owns its socket file.
        if self.bound.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
        match self.server.take() {
            Some(mut server) => server.shutdown().map_err(|e| self.endpoint_err(e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::DiscardHandler;
    use std::os::unix::net::UnixStream;

    #[test]
    fn lifecycle_binds_serves_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let endpoints = EndpointLayout::new(dir.path());
        let mut display = ServerComponent::display_server(&endpoints, Arc::new(DiscardHandler));
        assert_eq!(display.state(), ComponentState::Created);

        display.bind().unwrap();
        assert!(UnixStream::connect(endpoints.display()).is_ok());
        display.start().unwrap();
        display.start().unwrap();
        assert_eq!(display.state(), ComponentState::Started);

        display.stop().unwrap();
        display.stop().unwrap();
        assert_eq!(display.state(), ComponentState::Stopped);
        assert!(!endpoints.display().exists());
        assert!(display.start().is_err());
    }

    #[test]
    fn audio_variant_selects_socket() {
        let endpoints = EndpointLayout::new("/img");
        let handler: Arc<dyn ConnectionHandler> = Arc::new(DiscardHandler);
        let pulse = ServerComponent::audio(AudioDriver::PulseAudio, &endpoints, handler.clone()).unwrap();
        assert_eq!(pulse.endpoint(), Some(endpoints.pulse().as_path()));
        let reflector = ServerComponent::audio(AudioDriver::AlsaReflector, &endpoints, handler.clone()).unwrap();
        assert_eq!(reflector.label(), "alsa-reflector");
        assert!(ServerComponent::audio(AudioDriver::None, &endpoints, handler).is_none());
    }
}
