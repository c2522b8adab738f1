//! Filesystem-addressed local sockets served to the guest.
//!
//! Binding and serving are separate steps: [`LocalEndpoint::bind`] claims the
//! socket path so the guest can connect as soon as it starts, and
//! [`LocalEndpoint::serve`] hands accepted connections to a
//! [`ConnectionHandler`] on a background accept loop.

use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::logging::{LogLevel, Logger, emit, json_str};

const TARGET: &str = "guest::ipc";
const ACCEPT_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("binding {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("spawning accept loop for {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("accept loop for {} panicked", path.display())]
    Panicked { path: PathBuf },
    #[error("removing socket {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Protocol side of an endpoint. Each accepted connection is handed over on
/// its own thread.
pub trait ConnectionHandler: Send + Sync {
    fn handle(&self, stream: UnixStream);
}

/// Accepts and immediately closes connections. Stand-in until a protocol
/// implementation is plugged in.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardHandler;

impl ConnectionHandler for DiscardHandler {
    fn handle(&self, _stream: UnixStream) {}
}

/// A socket path bound and listening, not yet accepting.
#[derive(Debug)]
pub struct LocalEndpoint {
    path: PathBuf,
    listener: UnixListener,
}

impl LocalEndpoint {
    /// Bind `path`, creating parent directories and removing a stale socket
    /// left by an earlier session.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, IpcError> {
        let path = path.into();
        let bind_err = |source| IpcError::Bind {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(bind_err)?;
        }
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(bind_err(err)),
        }
        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start the accept loop on a named thread.
    pub fn serve(
        self,
        name: &str,
        handler: Arc<dyn ConnectionHandler>,
        logger: Option<Logger>,
    ) -> Result<EndpointServer, IpcError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let accepted = Arc::new(AtomicUsize::new(0));
        let path = self.path.clone();
        let listener = self.listener;

        let loop_shutdown = Arc::clone(&shutdown);
        let loop_accepted = Arc::clone(&accepted);
        let loop_name = name.to_string();
        let loop_logger = logger.clone();
        let handle = thread::Builder::new()
            .name(format!("endpoint-{name}"))
            .spawn(move || {
                accept_loop(listener, &loop_name, handler, loop_shutdown, loop_accepted, loop_logger)
            })
            .map_err(|source| IpcError::Spawn {
                path: path.clone(),
                source,
            })?;

        Ok(EndpointServer {
            path,
            shutdown,
            accepted,
            handle: Some(handle),
        })
    }
}

fn accept_loop(
    listener: UnixListener,
    name: &str,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
    logger: Option<Logger>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                accepted.fetch_add(1, Ordering::SeqCst);
                // Some platforms hand out accepted sockets in the listener's
                // non-blocking mode.
                if let Err(err) = stream.set_nonblocking(false) {
                    emit(
                        logger.as_ref(),
                        LogLevel::Warn,
                        TARGET,
                        "connection_mode_failed",
                        [json_str("endpoint", name), json_str("error", err.to_string())],
                    );
                    continue;
                }
                let handler = Arc::clone(&handler);
                let spawned = thread::Builder::new()
                    .name(format!("endpoint-{name}-conn"))
                    .spawn(move || handler.handle(stream));
                if let Err(err) = spawned {
                    emit(
                        logger.as_ref(),
                        LogLevel::Warn,
                        TARGET,
                        "connection_spawn_failed",
                        [json_str("endpoint", name), json_str("error", err.to_string())],
                    );
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                emit(
                    logger.as_ref(),
                    LogLevel::Warn,
                    TARGET,
                    "accept_failed",
                    [json_str("endpoint", name), json_str("error", err.to_string())],
                );
                thread::sleep(ACCEPT_POLL * 4);
            }
        }
    }
}

/// Running accept loop. Stopping joins the loop and unlinks the socket.
#[derive(Debug)]
pub struct EndpointServer {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
    accepted: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl EndpointServer {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Idempotent.
    pub fn shutdown(&mut self) -> Result<(), IpcError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.shutdown.store(true, Ordering::SeqCst);
        let joined = handle.join();
        let removed = match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(IpcError::Cleanup {
                path: self.path.clone(),
                source,
            }),
        };
        if joined.is_err() {
            return Err(IpcError::Panicked {
                path: self.path.clone(),
            });
        }
        removed
    }
}

impl Drop for EndpointServer {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Instant;

    struct Echo;

    impl ConnectionHandler for Echo {
        fn handle(&self, mut stream: UnixStream) {
            let mut buf = [0u8; 5];
            if stream.read_exact(&mut buf).is_ok() {
                let _ = stream.write_all(&buf);
            }
        }
    }

    #[test]
    fn bind_replaces_stale_socket_and_serves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmp/.X11-unix/X0");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"stale").unwrap();

        let endpoint = LocalEndpoint::bind(&path).unwrap();
        // Connections succeed as soon as the path is bound.
        let mut client = UnixStream::connect(&path).unwrap();
        let mut server = endpoint.serve("display", Arc::new(Echo), None).unwrap();

        client.write_all(b"hello").unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"hello");

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.accepted() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server.accepted(), 1);

        server.shutdown().unwrap();
        assert!(!path.exists());
        server.shutdown().unwrap();
    }

    struct ReportMode(crossbeam_channel::Sender<bool>);

    impl ConnectionHandler for ReportMode {
        fn handle(&self, mut stream: UnixStream) {
            // A blocking read waits for the client's late write.
            let mut buf = [0u8; 4];
            let _ = self.0.send(stream.read_exact(&mut buf).is_ok() && &buf == b"late");
        }
    }

    #[test]
    fn handlers_receive_blocking_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tmp/.sound/AS0");
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut server = LocalEndpoint::bind(&path)
            .unwrap()
            .serve("alsa", Arc::new(ReportMode(tx)), None)
            .unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        thread::sleep(Duration::from_millis(100));
        client.write_all(b"late").unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        server.shutdown().unwrap();
    }

    #[test]
    fn bind_fails_when_parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("tmp");
        fs::write(&blocker, b"not a dir").unwrap();
        let err = LocalEndpoint::bind(blocker.join(".sound/AS0")).unwrap_err();
        assert!(matches!(err, IpcError::Bind { .. }));
    }
}
