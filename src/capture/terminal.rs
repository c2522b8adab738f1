use std::io::{self, Write};
use std::time::Duration;

use crossbeam_channel::Sender;
use crossterm::event::{
    self, DisableFocusChange, DisableMouseCapture, EnableFocusChange, EnableMouseCapture, Event,
    KeyCode, KeyEventKind,
};
use crossterm::execute;

use super::{CaptureError, CaptureEvent, CaptureSurface};

/// Pointer capture on a terminal: mouse reporting stands in for the captured
/// pointer and terminal focus reports drive focus.
pub struct TerminalCaptureSurface<W: Write> {
    out: W,
    attached: bool,
    focused: bool,
    captured: bool,
}

impl<W: Write> TerminalCaptureSurface<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            attached: false,
            focused: true,
            captured: false,
        }
    }

    /// Start receiving focus reports.
    pub fn attach(&mut self) -> io::Result<()> {
        execute!(self.out, EnableFocusChange)?;
        self.attached = true;
        Ok(())
    }

    pub fn detach(&mut self) {
        if self.captured {
            self.release_capture();
        }
        execute!(self.out, DisableFocusChange).ok();
        self.attached = false;
    }

    pub fn is_captured(&self) -> bool {
        self.captured
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> CaptureSurface for TerminalCaptureSurface<W> {
    fn has_focus(&self) -> bool {
        self.focused
    }

    fn is_attached(&self) -> bool {
        self.attached
    }

    fn request_capture(&mut self) -> Result<(), CaptureError> {
        execute!(self.out, EnableMouseCapture)?;
        self.captured = true;
        Ok(())
    }

    fn release_capture(&mut self) {
        execute!(self.out, DisableMouseCapture).ok();
        self.captured = false;
    }

    fn focus_changed(&mut self, focused: bool) {
        self.focused = focused;
    }
}

/// F12 is the release gesture, Esc navigates back.
pub fn map_terminal_event(event: &Event) -> Option<CaptureEvent> {
    match event {
        Event::FocusGained => Some(CaptureEvent::FocusChanged(true)),
        Event::FocusLost => Some(CaptureEvent::FocusChanged(false)),
        Event::Key(key) if key.kind == KeyEventKind::Press => match key.code {
            KeyCode::F(12) => Some(CaptureEvent::HardwareRelease),
            KeyCode::Esc => Some(CaptureEvent::NavigationOpened),
            _ => None,
        },
        _ => None,
    }
}

/// Wait up to `timeout` for one terminal event and forward it. Returns
/// `false` once the receiving loop is gone.
pub fn forward_terminal_events(events: &Sender<CaptureEvent>, timeout: Duration) -> io::Result<bool> {
    if !event::poll(timeout)? {
        return Ok(true);
    }
    match map_terminal_event(&event::read()?) {
        Some(capture_event) => Ok(events.send(capture_event).is_ok()),
        None => Ok(true),
    }
}
