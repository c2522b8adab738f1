use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{ComponentError, ComponentKind, ComponentState, ServiceComponent};
use crate::env::EnvVars;
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};

const TARGET: &str = "guest::components";
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Invoked once with the guest's exit status when it ends on its own.
pub type ExitCallback = Box<dyn FnOnce(ExitStatus) + Send>;

/// Everything the launcher binary needs to run the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub command_line: String,
    pub env: EnvVars,
    pub bind_paths: Vec<String>,
    pub preset: Option<String>,
}

impl LaunchSpec {
    /// `--bind=<path>...`, `--preset=<id>`, `--`, then the guest command line
    /// as a single argument.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = self
            .bind_paths
            .iter()
            .map(|path| format!("--bind={path}"))
            .collect();
        if let Some(preset) = &self.preset {
            args.push(format!("--preset={preset}"));
        }
        args.push("--".to_string());
        args.push(self.command_line.clone());
        args
    }
}

pub struct GuestLauncherComponent {
    spec: LaunchSpec,
    on_exit: Option<ExitCallback>,
    state: ComponentState,
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    waiter: Option<JoinHandle<io::Result<()>>>,
    logger: Option<Logger>,
}

impl GuestLauncherComponent {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            on_exit: None,
            state: ComponentState::Created,
            pid: None,
            exited: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            waiter: None,
            logger: None,
        }
    }

    pub fn on_exit(mut self, callback: ExitCallback) -> Self {
        self.on_exit = Some(callback);
        self
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn io_err(context: &'static str, source: io::Error) -> ComponentError {
        ComponentError::Io {
            kind: ComponentKind::GuestLauncher,
            context,
            source,
        }
    }
}

/// Poll the child until it exits or a stop arrives. A stop kills the guest
/// and skips the exit callback.
fn wait_for_guest(
    mut child: Child,
    stop_rx: Receiver<()>,
    on_exit: Option<ExitCallback>,
    exited: Arc<AtomicBool>,
    logger: Option<Logger>,
) -> io::Result<()> {
    loop {
        if let Some(status) = child.try_wait()? {
            exited.store(true, Ordering::SeqCst);
            emit(
                logger.as_ref(),
                LogLevel::Info,
                TARGET,
                "guest_exited",
                [json_kv("code", status.code())],
            );
            if let Some(callback) = on_exit {
                callback(status);
            }
            return Ok(());
        }
        match stop_rx.recv_timeout(WAIT_POLL) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                match child.kill() {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
                    Err(err) => return Err(err),
                }
                child.wait()?;
                exited.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }
    }
}

impl ServiceComponent for GuestLauncherComponent {
    fn kind(&self) -> ComponentKind {
        ComponentKind::GuestLauncher
    }

    fn state(&self) -> ComponentState {
        self.state
    }

    fn start(&mut self) -> Result<(), ComponentError> {
        match self.state {
            ComponentState::Started => return Ok(()),
            ComponentState::Stopped => {
                return Err(ComponentError::InvalidState {
                    kind: ComponentKind::GuestLauncher,
                    action: "start",
                    state: self.state,
                });
            }
            ComponentState::Created => {}
        }
        if !self.spec.program.is_file() {
            return Err(ComponentError::LauncherMissing {
                path: self.spec.program.clone(),
            });
        }

        let child = Command::new(&self.spec.program)
            .args(self.spec.args())
            .envs(self.spec.env.iter())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Self::io_err("spawn", e))?;
        let pid = child.id();

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let on_exit = self.on_exit.take();
        let exited = Arc::clone(&self.exited);
        let logger = self.logger.clone();
        let waiter = thread::Builder::new()
            .name("guest-launcher-wait".to_string())
            .spawn(move || wait_for_guest(child, stop_rx, on_exit, exited, logger))
            .map_err(|e| Self::io_err("spawn waiter", e))?;

        self.pid = Some(pid);
        self.stop_tx = Some(stop_tx);
        self.waiter = Some(waiter);
        self.state = ComponentState::Started;
        emit(
            self.logger.as_ref(),
            LogLevel::Info,
            TARGET,
            "guest_launched",
            [
                json_kv("pid", pid),
                json_str("command", self.spec.command_line.clone()),
            ],
        );
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
        match self.waiter.take() {
            Some(waiter) => match waiter.join() {
                Ok(result) => result.map_err(|e| Self::io_err("terminate", e)),
                Err(_) => Err(ComponentError::Panicked {
                    kind: ComponentKind::GuestLauncher,
                }),
            },
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    fn script(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("launcher.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn spec(program: PathBuf) -> LaunchSpec {
        LaunchSpec {
            program,
            command_line: "wine explorer /desktop=shell,800x600 winhandler.exe \"wfm.exe\"".into(),
            env: EnvVars::parse("GUEST_MARK=ready"),
            bind_paths: vec!["/storage/Games".into()],
            preset: Some("COMPATIBILITY".into()),
        }
    }

    #[test]
    fn args_follow_launcher_contract() {
        let args = spec(PathBuf::from("/bin/launcher")).args();
        assert_eq!(
            args[..3],
            ["--bind=/storage/Games", "--preset=COMPATIBILITY", "--"]
        );
        assert!(args[3].starts_with("wine explorer"));
    }

    #[test]
    fn missing_binary_fails_start() {
        let mut launcher = GuestLauncherComponent::new(spec(PathBuf::from("/nonexistent/launcher")));
        assert!(matches!(
            launcher.start(),
            Err(ComponentError::LauncherMissing { .. })
        ));
        assert_eq!(launcher.state(), ComponentState::Created);
    }

    #[test]
    fn natural_exit_reports_status_and_passes_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let program = script(dir.path(), &format!("echo \"$GUEST_MARK $1\" > {}\nexit 3", out.display()));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut launcher = GuestLauncherComponent::new(spec(program))
            .on_exit(Box::new(move |status| {
                let _ = tx.send(status.code());
            }));
        launcher.start().unwrap();

        let code = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(code, Some(3));
        assert!(launcher.has_exited());
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "ready --bind=/storage/Games");
        launcher.stop().unwrap();
    }

    #[test]
    fn stop_kills_guest_without_callback() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "sleep 30");
        let (tx, rx) = crossbeam_channel::bounded::<Option<i32>>(1);
        let mut launcher = GuestLauncherComponent::new(spec(program))
            .on_exit(Box::new(move |status| {
                let _ = tx.send(status.code());
            }));
        launcher.start().unwrap();
        assert!(launcher.pid().is_some());

        let started = Instant::now();
        launcher.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
