//! Direct calibration frames: a single dark or flat taken straight into
//! the request's own image file, with no composite step.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::bus::DeviceId;
use crate::context::Context;
use crate::pipeline::calib::{flat_dome_ready, flat_setup};
use crate::pipeline::{Pipeline, Step};
use crate::queue::{CalFrames, Outcome, ScanRequest, ShutterMode};
use crate::status::{CameraState, TelescopeState};

#[derive(Clone, Copy)]
enum Stage {
    WaitStart,
    WaitSetup { deadline: DateTime<Utc> },
    WaitExposure { done_at: DateTime<Utc> },
}

pub struct DirectCalib {
    frames: CalFrames,
    stage: Stage,
}

impl DirectCalib {
    /// `frames` is Thermal or Flat; a direct bias is rejected at parse
    /// time since a zero-length closed frame needs no scheduling.
    pub fn new(frames: CalFrames) -> Self {
        Self {
            frames,
            stage: Stage::WaitStart,
        }
    }

    fn label(&self) -> &'static str {
        match self.frames {
            CalFrames::Flat => "flat",
            _ => "dark",
        }
    }

    fn fail(&self, ctx: &mut Context, sr: &ScanRequest) -> Step {
        ctx.mark(sr, Outcome::Failed);
        ctx.current = None;
        Step::Finished
    }

    fn begin_exposure(&mut self, now: DateTime<Utc>, ctx: &mut Context, sr: &ScanRequest) {
        if let Some(cur) = ctx.current.as_mut() {
            cur.running = true;
        }
        let shutter = match self.frames {
            CalFrames::Flat => sr.shutter,
            _ => ShutterMode::Closed,
        };
        let path = sr.image_path();
        ctx.start_exposure(sr, sr.duration_s, shutter, &path.to_string_lossy());
        self.stage = Stage::WaitExposure {
            done_at: now + chrono::Duration::milliseconds((sr.duration_s * 1000.0) as i64),
        };
    }

    fn step_wait_start(
        &mut self,
        now: DateTime<Utc>,
        ctx: &mut Context,
        sr: &ScanRequest,
    ) -> Step {
        if now > sr.deadline() {
            let late = (now - sr.deadline()).num_seconds();
            warn!(scan = %sr.image_file, "{} too late by {late} secs", self.label());
            return self.fail(ctx, sr);
        }
        match self.frames {
            CalFrames::Flat => {
                info!(scan = %sr.image_file, "checking flat setup");
                flat_setup(ctx, sr);
                self.stage = Stage::WaitSetup {
                    deadline: now + ctx.setup_timeout(),
                };
            }
            _ => {
                if now < sr.start_time {
                    return Step::Continue;
                }
                info!(scan = %sr.image_file, "starting {}s dark", sr.duration_s);
                self.begin_exposure(now, ctx, sr);
            }
        }
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
        let telok = s.telescope == TelescopeState::Stopped;
        let filok = !s.filter_present || s.filter_ready;
        let domok = flat_dome_ready(ctx);
        let lightok = ctx.cfg.calib.flat_lights <= 0 || ctx.status.lights > 0;
        let allok = camok && telok && filok && domok && lightok;

        if !allok && now > deadline {
            warn!(
                scan = %sr.image_file,
                "flat setup timed out for{}{}{}{}{}",
                if camok { "" } else { " camera" },
                if telok { "" } else { " telescope" },
                if filok { "" } else { " filter" },
                if domok { "" } else { " dome" },
                if lightok { "" } else { " lights" },
            );
            ctx.request_abort(true);
            return Step::Finished;
        }
        if now > sr.deadline() {
            let late = (now - sr.deadline()).num_seconds();
            warn!(scan = %sr.image_file, "flat setup too late by {late} secs");
            ctx.request_abort(true);
            return Step::Finished;
        }
        if !allok || now < sr.start_time {
            return Step::Continue;
        }
        info!(scan = %sr.image_file, "starting {}s flat", sr.duration_s);
        self.begin_exposure(now, ctx, sr);
        Step::Continue
    }

    fn step_wait_exposure(
        &mut self,
        now: DateTime<Utc>,
        done_at: DateTime<Utc>,
        ctx: &mut Context,
        sr: &ScanRequest,
    ) -> Step {
        if self.frames == CalFrames::Flat {
            let s = &ctx.status;
            let telok = s.telescope == TelescopeState::Stopped;
            let filok = !s.filter_present || s.filter_ready;
            let lightok = ctx.cfg.calib.flat_lights <= 0 || s.lights > 0;
            if !telok || !filok || !lightok {
                warn!(
                    scan = %sr.image_file,
                    "error during flat from{}{}{}",
                    if telok { "" } else { " telescope" },
                    if filok { "" } else { " filter" },
                    if lightok { "" } else { " lights" },
                );
                ctx.request_abort(true);
                return Step::Finished;
            }
        }

        // the frame goes straight to its final file, so wait out the
        // download as well
        if now <= done_at
            || matches!(
                ctx.status.camera,
                CameraState::Exposing | CameraState::Reading
            )
        {
            return Step::Continue;
        }

        info!(scan = %sr.image_file, "{} complete", self.label());
        ctx.mark(sr, Outcome::Done);
        if self.frames == CalFrames::Flat && ctx.status.lights > 0 {
            ctx.bus.send_unchecked(DeviceId::Lights, "0");
        }
        ctx.current = None;
        Step::Finished
    }
}

impl Pipeline for DirectCalib {
    fn name(&self) -> &'static str {
        "direct-calib"
    }

    fn step(&mut self, _first: bool, now: DateTime<Utc>, ctx: &mut Context) -> Step {
        let Some(cur) = ctx.current.clone() else {
            warn!("direct calibration step with no current request");
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
