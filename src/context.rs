//! Shared engine state handed to every program step.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::bus::{DeviceBus, DeviceId};
use crate::config::RunConfig;
use crate::pipeline::Pipeline;
use crate::queue::{Outcome, QueueStore, ScanRequest, ShutterMode};
use crate::status::{DeviceStatus, WeatherStatus};
use crate::tools::ToolRunner;

/// The request the engine is currently devoted to. `running` is set once
/// the exposure itself is under way; the slot is dropped entirely when the
/// foreground work for the request is over.
#[derive(Clone, Debug)]
pub struct CurrentScan {
    pub scan: ScanRequest,
    pub running: bool,
}

impl CurrentScan {
    pub fn new(scan: ScanRequest) -> Self {
        Self {
            scan,
            running: false,
        }
    }
}

/// A program requested by another program, picked up by the scheduler
/// after the current step round.
pub struct Spawn {
    pub program: Box<dyn Pipeline>,
    pub background: bool,
}

/// Everything a program step may touch.
pub struct Context {
    pub cfg: RunConfig,
    pub bus: DeviceBus,
    pub queue: QueueStore,
    pub status: DeviceStatus,
    pub weather: WeatherStatus,
    pub tools: Box<dyn ToolRunner>,
    pub current: Option<CurrentScan>,
    spawns: Vec<Spawn>,
    abort: Option<bool>,
}

impl Context {
    pub fn new(
        cfg: RunConfig,
        bus: DeviceBus,
        queue: QueueStore,
        tools: Box<dyn ToolRunner>,
    ) -> Self {
        Self {
            cfg,
            bus,
            queue,
            status: DeviceStatus::default(),
            weather: WeatherStatus::default(),
            tools,
            current: None,
            spawns: Vec::new(),
            abort: None,
        }
    }

    /// Re-read the device and weather documents, keeping the previous
    /// values when a publisher is mid-write or absent.
    pub fn refresh_status(&mut self) {
        if let Some(s) = DeviceStatus::load(&self.cfg.paths.status_file) {
            self.status = s;
        }
        if let Some(w) = WeatherStatus::load(&self.cfg.paths.weather_file) {
            self.weather = w;
        }
    }

    /// Ask the scheduler to start another program after this step round.
    pub fn spawn(&mut self, program: Box<dyn Pipeline>, background: bool) {
        self.spawns.push(Spawn {
            program,
            background,
        });
    }

    pub(crate) fn take_spawns(&mut self) -> Vec<Spawn> {
        std::mem::take(&mut self.spawns)
    }

    /// Ask the scheduler for a full stop after this step. `mark` controls
    /// whether a running request gets a Failed mark on the way down.
    pub fn request_abort(&mut self, mark: bool) {
        // an abort that marks wins over one that doesn't
        self.abort = Some(self.abort.unwrap_or(false) || mark);
    }

    pub(crate) fn take_abort(&mut self) -> Option<bool> {
        self.abort.take()
    }

    /// Record a terminal outcome for `sr` in the queue file. Declined
    /// marks (already-terminal records) are logged and swallowed; a mark
    /// is advisory once the work itself is over.
    pub fn mark(&mut self, sr: &ScanRequest, outcome: Outcome) {
        if self.queue.mark_outcome(sr, outcome) {
            info!(scan = %sr.image_file, ?outcome, "marked");
        } else {
            debug!(scan = %sr.image_file, ?outcome, "mark declined");
        }
    }

    /// Queue a setup command, downgrading a pending-channel rejection to a
    /// warning. Setup is re-checked by readiness gates anyway; a busy
    /// channel either catches up or times the setup out.
    pub fn try_send(&mut self, id: DeviceId, cmd: impl Into<String>) {
        if let Err(e) = self.bus.send(id, cmd) {
            warn!(%e, "setup command dropped");
        }
    }

    /// Max time between commanding device setup and being ready to run.
    pub fn setup_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cfg.timing.setup_timeout_s)
    }

    /// When an exposure started now would be fully downloaded.
    pub fn exposure_done_by(&self, now: DateTime<Utc>, dur_s: f64) -> DateTime<Utc> {
        now + chrono::Duration::milliseconds((dur_s * 1000.0) as i64)
            + chrono::Duration::seconds(self.cfg.timing.camera_download_max_s)
    }

    pub fn weather_max_age(&self) -> Duration {
        self.cfg.timing.weather_max_age
    }

    /// Queue a camera exposure command.
    pub fn start_exposure(
        &mut self,
        sr: &ScanRequest,
        dur_s: f64,
        shutter: ShutterMode,
        path: &str,
    ) {
        let cmd = expose_command(sr, dur_s, shutter, path);
        if self.bus.send(DeviceId::Camera, cmd).is_err() {
            // callers gate on camera idleness; a pending camera here means
            // a stale download is still winding up
            warn!(scan = %sr.image_file, "camera busy, exposure not started");
        }
    }
}

/// Single-line camera protocol:
/// `Expose <x>+<y>x<w>x<h> <binx>x<biny> <dur> <shutter> <priority> <path>`
pub fn expose_command(sr: &ScanRequest, dur_s: f64, shutter: ShutterMode, path: &str) -> String {
    let sh = match shutter {
        ShutterMode::Open => 1,
        ShutterMode::Closed => 0,
    };
    format!(
        "Expose {}+{}x{}x{} {}x{} {} {} {} {}",
        sr.sub_x,
        sr.sub_y,
        sr.sub_w,
        sr.sub_h,
        sr.bin_x,
        sr.bin_y,
        dur_s,
        sh,
        sr.priority,
        path
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::sample_request;

    #[test]
    fn test_expose_command_format() {
        let mut sr = sample_request("a.fts");
        sr.sub_x = 0;
        sr.sub_y = 0;
        sr.sub_w = 1024;
        sr.sub_h = 1024;
        sr.bin_x = 2;
        sr.bin_y = 2;
        sr.priority = 3;
        let cmd = expose_command(&sr, 45.0, ShutterMode::Open, "/img/a.fts");
        assert_eq!(cmd, "Expose 0+0x1024x1024 2x2 45 1 3 /img/a.fts");

        let cmd = expose_command(&sr, 0.0, ShutterMode::Closed, "/tmp/b.fts");
        assert_eq!(cmd, "Expose 0+0x1024x1024 2x2 0 0 3 /tmp/b.fts");
    }

    #[test]
    fn test_current_scan_starts_not_running() {
        let cur = CurrentScan::new(sample_request("a.fts"));
        assert!(!cur.running);
    }
}
