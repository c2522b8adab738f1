use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use super::{ComponentError, ComponentKind, ComponentState, ServiceComponent};
use crate::logging::{LogLevel, Logger, emit, json_str};

const TARGET: &str = "guest::components";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct NetworkInfo {
    hostname: String,
    interfaces: Vec<String>,
}

/// Host network details the guest reads from a file, refreshed periodically.
pub struct NetworkInfoComponent {
    path: PathBuf,
    interval: Duration,
    sys_root: PathBuf,
    state: ComponentState,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    logger: Option<Logger>,
}

impl NetworkInfoComponent {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            sys_root: PathBuf::from("/"),
            state: ComponentState::Created,
            stop_tx: None,
            worker: None,
            logger: None,
        }
    }

    /// Read host details below `root` instead of `/`.
    pub fn with_sys_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sys_root = root.into();
        self
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }
}

fn collect(sys_root: &Path) -> NetworkInfo {
    let hostname = fs::read_to_string(sys_root.join("proc/sys/kernel/hostname"))
        .map(|raw| raw.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    let mut interfaces: Vec<String> = fs::read_dir(sys_root.join("sys/class/net"))
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    interfaces.sort();
    NetworkInfo { hostname, interfaces }
}

fn publish(path: &Path, info: &NetworkInfo) -> std::io::Result<()> {
    let json = serde_json::to_vec(info).map_err(std::io::Error::other)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("tmp");
    fs::write(&staging, json)?;
    fs::rename(&staging, path)
}

fn run_publisher(
    path: PathBuf,
    sys_root: PathBuf,
    interval: Duration,
    stop_rx: Receiver<()>,
    logger: Option<Logger>,
) {
    let mut last: Option<NetworkInfo> = None;
    loop {
        let info = collect(&sys_root);
        if last.as_ref() != Some(&info) {
            match publish(&path, &info) {
                Ok(()) => last = Some(info),
                Err(err) => emit(
                    logger.as_ref(),
                    LogLevel::Warn,
                    TARGET,
                    "network_info_publish_failed",
                    [json_str("error", err.to_string())],
                ),
            }
        }
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

impl ServiceComponent for NetworkInfoComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::NetworkInfo
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn start(&mut self) -> Result<(), ComponentError> {
        match self.state {
            ComponentState::Started => return Ok(()),
            ComponentState::Stopped => {
                return Err(ComponentError::InvalidState {
                    kind: ComponentKind::NetworkInfo,
                    action: "start",
                    state: self.state,
                });
            }
            ComponentState::Created => {}
        }
        // The first snapshot is written before start returns.
        publish(&self.path, &collect(&self.sys_root)).map_err(|source| ComponentError::Io {
            kind: ComponentKind::NetworkInfo,
            context: "publish",
            source,
        })?;

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let path = self.path.clone();
        let sys_root = self.sys_root.clone();
        let interval = self.interval;
        let logger = self.logger.clone();
        let worker = thread::Builder::new()
            .name("guest-network-info".to_string())
            .spawn(move || run_publisher(path, sys_root, interval, stop_rx, logger))
            .map_err(|source| ComponentError::Io {
                kind: ComponentKind::NetworkInfo,
                context: "spawn publisher",
                source,
            })?;
        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        self.state = ComponentState::Started;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ComponentError> {
        if self.state != ComponentState::Started {
            self.state = ComponentState::Stopped;
            return Ok(());
        }
        self.state = ComponentState::Stopped;
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| ComponentError::Panicked {
                kind: ComponentKind::NetworkInfo,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_before_start_returns_and_stops_promptly() {
        let sys = tempfile::tempdir().unwrap();
        fs::create_dir_all(sys.path().join("proc/sys/kernel")).unwrap();
        fs::write(sys.path().join("proc/sys/kernel/hostname"), "guest-host\n").unwrap();
        fs::create_dir_all(sys.path().join("sys/class/net/wlan0")).unwrap();
        fs::create_dir_all(sys.path().join("sys/class/net/lo")).unwrap();

        let out = tempfile::tempdir().unwrap();
        let path = out.path().join("tmp/.network/info.json");
        let mut component = NetworkInfoComponent::new(&path, Duration::from_secs(60))
            .with_sys_root(sys.path());
        component.start().unwrap();

        let published: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(published["hostname"], "guest-host");
        assert_eq!(published["interfaces"], serde_json::json!(["lo", "wlan0"]));

        let started = std::time::Instant::now();
        component.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(component.state(), ComponentState::Stopped);
    }
}
