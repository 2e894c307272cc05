//! The science exposure program, plus the background finalize that waits
//! out the download and launches post-processing.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::bus::DeviceId;
use crate::context::Context;
use crate::pipeline::{Pipeline, Step};
use crate::queue::{DataKind, Outcome, ScanRequest};
use crate::status::{CameraState, DomeState, ShutterState, TelescopeState};
use crate::tools::{ToolHandle, ToolState};

#[derive(Clone, Copy)]
enum Stage {
    WaitStart,
    WaitSetup { deadline: DateTime<Utc> },
    WaitExposure { done_at: DateTime<Utc> },
}

pub struct RegScan {
    stage: Stage,
}

impl RegScan {
    pub fn new() -> Self {
        Self {
            stage: Stage::WaitStart,
        }
    }

    fn step_wait_start(
        &mut self,
        now: DateTime<Utc>,
        ctx: &mut Context,
        sr: &ScanRequest,
    ) -> Step {
        if now > sr.deadline() {
            let late = (now - sr.deadline()).num_seconds();
            warn!(scan = %sr.image_file, "too late by {late} secs");
            ctx.mark(sr, Outcome::Failed);
            ctx.current = None;
            return Step::Finished;
        }
        if now < sr.start_time - ctx.setup_timeout() {
            return Step::Continue;
        }
        if now >= sr.start_time {
            let late = (now - sr.start_time).num_seconds();
            warn!(scan = %sr.image_file, "no time to set up, late by {late} secs");
            ctx.mark(sr, Outcome::Failed);
            ctx.current = None;
            return Step::Finished;
        }

        info!(scan = %sr.image_file, "checking scan setup, scheduled at {}", sr.start_time);
        scan_setup(ctx, sr);
        // no reason to idle through whole poll windows once everything is
        // ready early
        ctx.bus.wake_at(sr.start_time);
        self.stage = Stage::WaitSetup {
            deadline: now + ctx.setup_timeout(),
        };
        Step::Continue
    }

    fn step_wait_setup(
        &mut self,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
        ctx: &mut Context,
        sr: &ScanRequest,
    ) -> Step {
        let s = &ctx.status;
        let camok = s.camera == CameraState::Idle;
        let telok = s.telescope == TelescopeState::Tracking;
        let filok = !s.filter_present || s.filter_ready;
        let focok = !s.focus_present || s.focus_ready;
        let domok = s.dome == DomeState::Absent || s.dome_ready;
        let allok = camok && telok && filok && focok && domok;

        if !allok && now > deadline {
            warn!(
                scan = %sr.image_file,
                "setup timed out for{}{}{}{}{}",
                if focok { "" } else { " focus" },
                if camok { "" } else { " camera" },
                if telok { "" } else { " telescope" },
                if filok { "" } else { " filter" },
                if domok { "" } else { " dome" },
            );
            ctx.request_abort(true);
            return Step::Finished;
        }
        if now > sr.deadline() {
            let late = (now - sr.deadline()).num_seconds();
            warn!(scan = %sr.image_file, "setup too late by {late} secs");
            ctx.request_abort(true);
            return Step::Finished;
        }
        // never start before the scheduled time
        if !allok || now < sr.start_time {
            return Step::Continue;
        }

        let late = (now - sr.start_time).num_seconds();
        if late > 0 {
            info!(scan = %sr.image_file, "starting exposure late by {late} secs");
        } else {
            info!(scan = %sr.image_file, "starting exposure on time");
        }
        if let Some(cur) = ctx.current.as_mut() {
            cur.running = true;
        }
        let path = sr.image_path();
        ctx.start_exposure(sr, sr.duration_s, sr.shutter, &path.to_string_lossy());
        self.stage = Stage::WaitExposure {
            done_at: now + chrono::Duration::milliseconds((sr.duration_s * 1000.0) as i64),
        };
        Step::Continue
    }

    fn step_wait_exposure(
        &mut self,
        now: DateTime<Utc>,
        done_at: DateTime<Utc>,
        ctx: &mut Context,
        sr: &ScanRequest,
    ) -> Step {
        let s = &ctx.status;
        let telok = s.telescope == TelescopeState::Tracking;
        let filok = !s.filter_present || s.filter_ready;
        let focok = !s.focus_present || s.focus_ready;
        if !telok || !filok || !focok {
            warn!(
                scan = %sr.image_file,
                "error during exposure from{}{}{}",
                if focok { "" } else { " focus" },
                if telok { "" } else { " telescope" },
                if filok { "" } else { " filter" },
            );
            ctx.request_abort(true);
            return Step::Finished;
        }

        if now <= done_at || s.camera == CameraState::Exposing {
            return Step::Continue;
        }

        // exposure finished; download and post-processing continue in the
        // background. Done now so the record is never repeated, even though
        // the finalize may still try to flag a failure.
        ctx.bus.send_unchecked(DeviceId::Telescope, "Stop");
        info!(scan = %sr.image_file, "exposure complete, starting download");
        ctx.mark(sr, Outcome::Done);
        ctx.spawn(
            Box::new(FinalizeScan::new(
                sr.clone(),
                now + chrono::Duration::seconds(ctx.cfg.timing.camera_download_max_s),
            )),
            true,
        );
        ctx.current = None;
        Step::Finished
    }
}

impl Pipeline for RegScan {
    fn name(&self) -> &'static str {
        "regscan"
    }

    fn step(&mut self, _first: bool, now: DateTime<Utc>, ctx: &mut Context) -> Step {
        let Some(cur) = ctx.current.clone() else {
            warn!("scan step with no current request");
            return Step::Finished;
        };
        let sr = cur.scan;

        match self.stage {
            Stage::WaitStart => self.step_wait_start(now, ctx, &sr),
            Stage::WaitSetup { deadline } => self.step_wait_setup(now, deadline, ctx, &sr),
            Stage::WaitExposure { done_at } => self.step_wait_exposure(now, done_at, ctx, &sr),
        }
    }
}

/// Command everything a science exposure needs: telescope on target,
/// filter in place, focus participating, dome open and following.
pub(crate) fn scan_setup(ctx: &mut Context, sr: &ScanRequest) {
    let s = ctx.status.clone();

    info!(scan = %sr.image_file, "slewing to {}", sr.pointing);
    ctx.try_send(DeviceId::Telescope, sr.pointing.clone());
    if s.filter_present {
        ctx.try_send(DeviceId::Filter, sr.filter.to_string());
    }
    if s.focus_present {
        ctx.try_send(DeviceId::Focus, "Auto");
    }
    if !matches!(
        s.shutter,
        ShutterState::Absent | ShutterState::Open | ShutterState::Opening
    ) {
        ctx.try_send(DeviceId::Dome, "Open");
    }
    if s.dome != DomeState::Absent {
        ctx.bus.send_unchecked(DeviceId::Dome, "Auto");
    }
}

/// Background program: wait for the camera download to finish, then hand
/// the image to the post-processing tool and see it through.
pub struct FinalizeScan {
    scan: ScanRequest,
    download_deadline: DateTime<Utc>,
    tool: Option<ToolHandle>,
}

impl FinalizeScan {
    pub fn new(scan: ScanRequest, download_deadline: DateTime<Utc>) -> Self {
        Self {
            scan,
            download_deadline,
            tool: None,
        }
    }

    fn submit_postprocess(&mut self, ctx: &mut Context) -> Step {
        let argv = vec![
            ctx.cfg.calib.postprocess_cmd.clone(),
            self.scan.image_path().to_string_lossy().into_owned(),
            match self.scan.calib.data {
                DataKind::Cooked => "1".to_string(),
                _ => "0".to_string(),
            },
        ];
        match ctx.tools.submit(&argv) {
            Ok(tool) => {
                info!(scan = %self.scan.image_file, "postprocess started");
                self.tool = Some(tool);
                Step::Continue
            }
            Err(e) => {
                warn!(scan = %self.scan.image_file, %e, "postprocess failed to start");
                // a decline here is expected: the record already reads Done
                let scan = self.scan.clone();
                ctx.mark(&scan, Outcome::Failed);
                Step::Finished
            }
        }
    }
}

impl Pipeline for FinalizeScan {
    fn name(&self) -> &'static str {
        "finalize"
    }

    fn step(&mut self, _first: bool, now: DateTime<Utc>, ctx: &mut Context) -> Step {
        if let Some(tool) = self.tool {
            return match ctx.tools.poll(tool) {
                Ok(ToolState::Running) => Step::Continue,
                Ok(ToolState::Exited(0)) => {
                    info!(scan = %self.scan.image_file, "postprocess complete");
                    Step::Finished
                }
                Ok(ToolState::Exited(code)) => {
                    warn!(scan = %self.scan.image_file, code, "postprocess failed");
                    Step::Finished
                }
                Err(e) => {
                    warn!(scan = %self.scan.image_file, %e, "postprocess lost");
                    Step::Finished
                }
            };
        }

        match ctx.status.camera {
            // Exposing means the camera has moved on to the next request,
            // so ours is certainly stored
            CameraState::Idle | CameraState::Exposing => self.submit_postprocess(ctx),
            CameraState::Reading => {
                if now < self.download_deadline {
                    Step::Continue
                } else {
                    warn!(scan = %self.scan.image_file, "camera reading too long");
                    let scan = self.scan.clone();
                    ctx.mark(&scan, Outcome::Failed);
                    Step::Finished
                }
            }
        }
    }
}
