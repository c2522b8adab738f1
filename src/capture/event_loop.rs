use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use super::{
    CaptureEvent, CaptureScheduler, CaptureState, CaptureStats, CaptureSurface, CaptureTimings,
    PointerCaptureController, TimerToken,
};
use crate::logging::{LogLevel, Logger, emit, json_str};

const TARGET: &str = "guest::capture";

/// Sleeps on a short-lived named thread, then posts `TimerFired` to the loop.
#[derive(Clone)]
pub struct ThreadTimer {
    events: Sender<CaptureEvent>,
    logger: Option<Logger>,
}

impl ThreadTimer {
    pub fn new(events: Sender<CaptureEvent>) -> Self {
        Self {
            events,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }
}

impl CaptureScheduler for ThreadTimer {
    fn schedule(&mut self, delay: Duration, token: TimerToken) {
        let events = self.events.clone();
        let spawned = thread::Builder::new()
            .name("capture-timer".to_string())
            .spawn(move || {
                thread::sleep(delay);
                // The loop may already be gone.
                let _ = events.send(CaptureEvent::TimerFired(token));
            });
        if let Err(err) = spawned {
            emit(
                self.logger.as_ref(),
                LogLevel::Warn,
                TARGET,
                "timer_spawn_failed",
                [json_str("error", err.to_string())],
            );
        }
    }
}

/// Runs a controller on one thread, fed by a channel of events.
pub struct CaptureEventLoop<S> {
    controller: PointerCaptureController<S, ThreadTimer>,
    events: Receiver<CaptureEvent>,
}

impl<S: CaptureSurface> CaptureEventLoop<S> {
    /// The returned sender is how focus, navigation and teardown reach the
    /// controller.
    pub fn new(
        surface: S,
        timings: CaptureTimings,
        logger: Option<Logger>,
    ) -> (Self, Sender<CaptureEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let timer = ThreadTimer::new(tx.clone()).with_logger(logger.clone());
        let controller = PointerCaptureController::new(surface, timer, timings).with_logger(logger);
        (
            Self {
                controller,
                events: rx,
            },
            tx,
        )
    }

    pub fn state(&self) -> CaptureState {
        self.controller.state()
    }

    /// Process events until `Teardown` arrives, returning the final stats.
    pub fn run(mut self) -> CaptureStats {
        while let Ok(event) = self.events.recv() {
            self.controller.handle(event);
            if event == CaptureEvent::Teardown {
                break;
            }
        }
        self.controller.stats()
    }
}

impl<S: CaptureSurface + Send + 'static> CaptureEventLoop<S> {
    pub fn spawn(self) -> io::Result<JoinHandle<CaptureStats>> {
        thread::Builder::new()
            .name("capture-events".to_string())
            .spawn(move || self.run())
    }
}
