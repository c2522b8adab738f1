use crate::capture::CaptureStats;
use crate::components::ComponentStopErrors;
use crate::logging::{LogEvent, LogFields, LogLevel};
use crate::provision::ProvisionReport;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct SessionMetrics {
    provision_passes: u64,
    installs: u64,
    install_failures: u64,
    marker_writes: u64,
    component_starts: u64,
    component_stops: u64,
    component_stop_failures: u64,
    capture_acquisitions: u64,
    capture_releases: u64,
    capture_retries: u64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_provision(&mut self, report: &ProvisionReport, persisted: bool) {
        self.provision_passes = self.provision_passes.saturating_add(1);
        self.installs = self.installs.saturating_add(report.installed.len() as u64);
        self.install_failures = self.install_failures.saturating_add(report.failed.len() as u64);
        if persisted {
            self.marker_writes = self.marker_writes.saturating_add(1);
        }
    }

    pub fn record_started(&mut self, count: usize) {
        self.component_starts = self.component_starts.saturating_add(count as u64);
    }

    /// `attempted` counts every stop call, failed or not.
    pub fn record_stopped(&mut self, attempted: usize, failures: Option<&ComponentStopErrors>) {
        self.component_stops = self.component_stops.saturating_add(attempted as u64);
        if let Some(failures) = failures {
            self.component_stop_failures = self
                .component_stop_failures
                .saturating_add(failures.errors.len() as u64);
        }
    }

    pub fn record_capture(&mut self, stats: CaptureStats) {
        self.capture_acquisitions = self.capture_acquisitions.saturating_add(stats.acquisitions);
        self.capture_releases = self.capture_releases.saturating_add(stats.releases);
        self.capture_retries = self.capture_retries.saturating_add(stats.retries);
    }

    pub fn snapshot(&self, uptime: Duration) -> MetricSnapshot {
        MetricSnapshot {
            uptime_ms: uptime.as_millis() as u64,
            provision_passes: self.provision_passes,
            installs: self.installs,
            install_failures: self.install_failures,
            marker_writes: self.marker_writes,
            component_starts: self.component_starts,
            component_stops: self.component_stops,
            component_stop_failures: self.component_stop_failures,
            capture_acquisitions: self.capture_acquisitions,
            capture_releases: self.capture_releases,
            capture_retries: self.capture_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub uptime_ms: u64,
    pub provision_passes: u64,
    pub installs: u64,
    pub install_failures: u64,
    pub marker_writes: u64,
    pub component_starts: u64,
    pub component_stops: u64,
    pub component_stop_failures: u64,
    pub capture_acquisitions: u64,
    pub capture_releases: u64,
    pub capture_retries: u64,
}

impl MetricSnapshot {
    pub fn to_log_event(&self, target: &str) -> LogEvent {
        LogEvent::with_fields(
            LogLevel::Info,
            target.to_string(),
            "session_metrics".to_string(),
            self.as_fields(),
        )
    }

    pub fn as_fields(&self) -> LogFields {
        let mut map = LogFields::new();
        map.insert("uptime_ms".to_string(), json!(self.uptime_ms));
        map.insert("provision_passes".to_string(), json!(self.provision_passes));
        map.insert("installs".to_string(), json!(self.installs));
        map.insert("install_failures".to_string(), json!(self.install_failures));
        map.insert("marker_writes".to_string(), json!(self.marker_writes));
        map.insert("component_starts".to_string(), json!(self.component_starts));
        map.insert("component_stops".to_string(), json!(self.component_stops));
        map.insert(
            "component_stop_failures".to_string(),
            json!(self.component_stop_failures),
        );
        map.insert("capture_acquisitions".to_string(), json!(self.capture_acquisitions));
        map.insert("capture_releases".to_string(), json!(self.capture_releases));
        map.insert("capture_retries".to_string(), json!(self.capture_retries));
        map
    }
}
