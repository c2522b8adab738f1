//! Exclusive relative-pointer capture.
//!
//! [`PointerCaptureController`] is a state machine driven by [`CaptureEvent`]s
//! on a single thread. Deferred work (focus polling, auto-recapture) goes
//! through a [`CaptureScheduler`] which later feeds a
//! [`CaptureEvent::TimerFired`] back in; every scheduled timer carries a
//! generation token so a timer that was superseded is ignored.

mod event_loop;
mod terminal;

use std::time::Duration;

use thiserror::Error;

use crate::config::CaptureSettings;
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};

pub use event_loop::{CaptureEventLoop, ThreadTimer};
pub use terminal::{TerminalCaptureSurface, forward_terminal_events, map_terminal_event};

const TARGET: &str = "guest::capture";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    CaptureRequested,
    Captured,
    Released,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture rejected: {0}")]
    Rejected(String),
    #[error("terminal io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

impl TimerToken {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Relative-mouse mode toggled by the user.
    RelativeMouseChanged(bool),
    FocusChanged(bool),
    /// Back navigation or the drawer opening.
    NavigationOpened,
    /// Back button delivered through the captured pointer.
    BackButton,
    DrawerClosed,
    /// Dedicated release gesture; capture comes back after a delay.
    HardwareRelease,
    Teardown,
    TimerFired(TimerToken),
}

/// Platform side of pointer capture.
pub trait CaptureSurface {
    fn has_focus(&self) -> bool;

    fn is_attached(&self) -> bool;

    fn request_capture(&mut self) -> Result<(), CaptureError>;

    fn release_capture(&mut self);

    /// Focus notification forwarded from the event stream.
    fn focus_changed(&mut self, _focused: bool) {}
}

/// Deliver `TimerFired(token)` back to the controller after `delay`.
pub trait CaptureScheduler {
    fn schedule(&mut self, delay: Duration, token: TimerToken);
}

/// Records scheduled timers; the owner fires them by hand.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    scheduled: Vec<(Duration, TimerToken)>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> &[(Duration, TimerToken)] {
        &self.scheduled
    }

    pub fn last(&self) -> Option<(Duration, TimerToken)> {
        self.scheduled.last().copied()
    }
}

impl CaptureScheduler for ManualScheduler {
    fn schedule(&mut self, delay: Duration, token: TimerToken) {
        self.scheduled.push((delay, token));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTimings {
    pub poll_interval: Duration,
    pub recapture_delay: Duration,
    pub drawer_recapture_delay: Duration,
    /// Polls before a pending request gives up; `None` polls until focus.
    pub max_poll_attempts: Option<u32>,
}

impl Default for CaptureTimings {
    fn default() -> Self {
        Self::from(&CaptureSettings::default())
    }
}

impl From<&CaptureSettings> for CaptureTimings {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            recapture_delay: settings.recapture_delay(),
            drawer_recapture_delay: settings.drawer_recapture_delay(),
            max_poll_attempts: settings.max_poll_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub acquisitions: u64,
    pub releases: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPurpose {
    Poll,
    Recapture,
}

pub struct PointerCaptureController<S, T> {
    surface: S,
    scheduler: T,
    timings: CaptureTimings,
    state: CaptureState,
    relative_mode: bool,
    torn_down: bool,
    generation: u64,
    pending: Option<(TimerToken, TimerPurpose)>,
    poll_attempts: u32,
    stats: CaptureStats,
    logger: Option<Logger>,
}

impl<S: CaptureSurface, T: CaptureScheduler> PointerCaptureController<S, T> {
    pub fn new(surface: S, scheduler: T, timings: CaptureTimings) -> Self {
        Self {
            surface,
            scheduler,
            timings,
            state: CaptureState::Idle,
            relative_mode: false,
            torn_down: false,
            generation: 0,
            pending: None,
            poll_attempts: 0,
            stats: CaptureStats::default(),
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn relative_mode(&self) -> bool {
        self.relative_mode
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn scheduler(&self) -> &T {
        &self.scheduler
    }

    /// Apply one event and return the resulting state. Events after
    /// [`CaptureEvent::Teardown`] are ignored.
    pub fn handle(&mut self, event: CaptureEvent) -> CaptureState {
        if self.torn_down {
            return self.state;
        }
        match event {
            CaptureEvent::RelativeMouseChanged(true) => {
                self.relative_mode = true;
                if self.is_inactive() {
                    self.request();
                }
            }
            CaptureEvent::RelativeMouseChanged(false) => {
                self.relative_mode = false;
                self.release(CaptureState::Idle);
            }
            CaptureEvent::FocusChanged(focused) => {
                self.surface.focus_changed(focused);
                if focused {
                    match self.state {
                        CaptureState::CaptureRequested => self.attempt(),
                        _ if self.relative_mode && self.is_inactive() => self.request(),
                        _ => {}
                    }
                } else if self.state == CaptureState::Captured {
                    // A pending request keeps polling until focus returns.
                    self.release(CaptureState::Released);
                }
            }
            CaptureEvent::NavigationOpened | CaptureEvent::BackButton => {
                if matches!(
                    self.state,
                    CaptureState::Captured | CaptureState::CaptureRequested
                ) {
                    self.release(CaptureState::Released);
                }
            }
            CaptureEvent::DrawerClosed => {
                if self.relative_mode && self.is_inactive() {
                    self.schedule(self.timings.drawer_recapture_delay, TimerPurpose::Recapture);
                }
            }
            CaptureEvent::HardwareRelease => {
                if self.state == CaptureState::Captured {
                    self.release(CaptureState::Released);
                    self.schedule(self.timings.recapture_delay, TimerPurpose::Recapture);
                }
            }
            CaptureEvent::Teardown => {
                self.release(CaptureState::Released);
                self.torn_down = true;
                emit(
                    self.logger.as_ref(),
                    LogLevel::Debug,
                    TARGET,
                    "capture_torn_down",
                    [json_kv("acquisitions", self.stats.acquisitions)],
                );
            }
            CaptureEvent::TimerFired(token) => self.timer_fired(token),
        }
        self.state
    }

    fn is_inactive(&self) -> bool {
        matches!(self.state, CaptureState::Idle | CaptureState::Released)
    }

    fn timer_fired(&mut self, token: TimerToken) {
        let purpose = match self.pending {
            Some((pending, purpose)) if pending == token => purpose,
            _ => return,
        };
        self.pending = None;
        match purpose {
            TimerPurpose::Poll => {
                if self.state == CaptureState::CaptureRequested {
                    self.attempt();
                }
            }
            TimerPurpose::Recapture => {
                if self.relative_mode && self.is_inactive() {
                    self.request();
                }
            }
        }
    }

    fn request(&mut self) {
        self.state = CaptureState::CaptureRequested;
        self.poll_attempts = 0;
        self.pending = None;
        self.attempt();
    }

    fn attempt(&mut self) {
        if self.surface.has_focus() && self.surface.is_attached() {
            match self.surface.request_capture() {
                Ok(()) => {
                    self.state = CaptureState::Captured;
                    self.pending = None;
                    self.stats.acquisitions += 1;
                    emit(
                        self.logger.as_ref(),
                        LogLevel::Info,
                        TARGET,
                        "pointer_captured",
                        [json_kv("polls", self.poll_attempts)],
                    );
                    return;
                }
                Err(err) => emit(
                    self.logger.as_ref(),
                    LogLevel::Warn,
                    TARGET,
                    "capture_rejected",
                    [json_str("error", err.to_string())],
                ),
            }
        }
        self.poll_attempts += 1;
        if let Some(max) = self.timings.max_poll_attempts {
            if self.poll_attempts > max {
                self.state = CaptureState::Idle;
                self.pending = None;
                emit(
                    self.logger.as_ref(),
                    LogLevel::Warn,
                    TARGET,
                    "capture_abandoned",
                    [json_kv("polls", max)],
                );
                return;
            }
        }
        self.stats.retries += 1;
        self.schedule(self.timings.poll_interval, TimerPurpose::Poll);
    }

    fn release(&mut self, next: CaptureState) {
        if self.state == CaptureState::Captured {
            self.surface.release_capture();
            self.stats.releases += 1;
            emit(
                self.logger.as_ref(),
                LogLevel::Info,
                TARGET,
                "pointer_released",
                [json_str("next", format!("{next:?}"))],
            );
        }
        self.pending = None;
        if self.state != CaptureState::Idle || next == CaptureState::Idle {
            self.state = next;
        }
    }

    fn schedule(&mut self, delay: Duration, purpose: TimerPurpose) {
        self.generation += 1;
        let token = TimerToken(self.generation);
        self.pending = Some((token, purpose));
        self.scheduler.schedule(delay, token);
    }
}
