//! Calibration reference chain: bias, thermal, flat.
//!
//! A reference request spawns one [`CalibPipeline`] per phase, bias first,
//! each taking a batch of raw frames into the scratch directory and then
//! handing them to the composite builder. A finished phase spawns the next
//! one the directive asks for, ending with a science exposure when the
//! request also wants data.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::bus::DeviceId;
use crate::context::Context;
use crate::pipeline::{regscan::RegScan, Pipeline, Step};
use crate::queue::{CalFrames, DataKind, Outcome, ScanRequest, ShutterMode};
use crate::status::{CameraState, DomeState, ShutterState, TelescopeState};
use crate::tools::{ToolHandle, ToolState};

/// Which reference this phase produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalPhase {
    Bias,
    Thermal,
    Flat,
}

impl CalPhase {
    fn label(self) -> &'static str {
        match self {
            CalPhase::Bias => "bias",
            CalPhase::Thermal => "thermal",
            CalPhase::Flat => "flat",
        }
    }

    fn scratch_prefix(self) -> &'static str {
        match self {
            CalPhase::Bias => "Bias",
            CalPhase::Thermal => "Thermal",
            CalPhase::Flat => "Flat",
        }
    }

    /// Flag understood by the composite builder.
    fn composite_flag(self) -> &'static str {
        match self {
            CalPhase::Bias => "-B",
            CalPhase::Thermal => "-T",
            CalPhase::Flat => "-F",
        }
    }

    fn frame_count(self, ctx: &Context) -> u32 {
        match self {
            CalPhase::Bias => ctx.cfg.calib.bias_frames,
            CalPhase::Thermal => ctx.cfg.calib.thermal_frames,
            CalPhase::Flat => ctx.cfg.calib.flat_frames,
        }
    }

    fn frame_dur_s(self, ctx: &Context) -> f64 {
        match self {
            CalPhase::Bias => 0.0,
            CalPhase::Thermal => ctx.cfg.calib.thermal_dur_s,
            CalPhase::Flat => ctx.cfg.calib.flat_dur_s,
        }
    }

    fn shutter(self) -> ShutterMode {
        match self {
            CalPhase::Flat => ShutterMode::Open,
            _ => ShutterMode::Closed,
        }
    }
}

#[derive(Clone, Copy)]
enum Stage {
    WaitStart,
    WaitSetup { deadline: DateTime<Utc> },
    TakeFrames { frame_due: DateTime<Utc> },
    WaitComposite { tool: ToolHandle },
}

pub struct CalibPipeline {
    phase: CalPhase,
    stage: Stage,
    taken: u32,
    scratch: Vec<PathBuf>,
}

impl CalibPipeline {
    pub fn new(phase: CalPhase) -> Self {
        Self {
            phase,
            stage: Stage::WaitStart,
            taken: 0,
            scratch: Vec::new(),
        }
    }

    fn scratch_name(&self, ctx: &Context, n: u32) -> PathBuf {
        ctx.cfg
            .paths
            .tmp_dir
            .join(format!("{}{n:03}", self.phase.scratch_prefix()))
    }

    fn start_frame(&mut self, ctx: &mut Context, sr: &ScanRequest, now: DateTime<Utc>) {
        let dur = self.phase.frame_dur_s(ctx);
        let path = self.scratch_name(ctx, self.taken);
        info!(
            scan = %sr.image_file,
            "starting {} frame {} of {}",
            self.phase.label(),
            self.taken + 1,
            self.phase.frame_count(ctx)
        );
        ctx.start_exposure(sr, dur, self.phase.shutter(), &path.to_string_lossy());
        self.scratch.push(path);
        self.stage = Stage::TakeFrames {
            frame_due: ctx.exposure_done_by(now, dur),
        };
    }

    fn remove_scratch(&mut self) {
        for p in self.scratch.drain(..) {
            if let Err(e) = std::fs::remove_file(&p) {
                warn!(path = %p.display(), %e, "scratch frame not removed");
            }
        }
    }

    fn fail(&mut self, ctx: &mut Context, sr: &ScanRequest) -> Step {
        // the flat panel must not stay lit behind a failed chain; the
        // pre-setup may have switched it on phases ago
        if ctx.status.lights > 0 {
            ctx.bus.send_unchecked(DeviceId::Lights, "0");
        }
        ctx.mark(sr, Outcome::Failed);
        ctx.current = None;
        Step::Finished
    }

    /// All raw frames are on disk; hand them to the composite builder.
    fn start_composite(&mut self, ctx: &mut Context, sr: &ScanRequest) -> Step {
        if self.phase == CalPhase::Flat && ctx.status.lights > 0 {
            ctx.bus.send_unchecked(DeviceId::Lights, "0");
        }
        let mut argv = vec![
            ctx.cfg.calib.composite_cmd.clone(),
            self.phase.composite_flag().to_string(),
        ];
        argv.extend(self.scratch.iter().map(|p| p.to_string_lossy().into_owned()));
        match ctx.tools.submit(&argv) {
            Ok(tool) => {
                self.stage = Stage::WaitComposite { tool };
                Step::Continue
            }
            Err(e) => {
                warn!(scan = %sr.image_file, %e, "composite builder failed to start");
                self.remove_scratch();
                self.fail(ctx, sr)
            }
        }
    }

    /// The reference is built; move the request along to the next phase
    /// the directive asks for, or retire it.
    fn advance(&mut self, ctx: &mut Context, sr: &ScanRequest) -> Step {
        info!(scan = %sr.image_file, "new {} reference complete", self.phase.label());
        let wants_data = sr.calib.data != DataKind::None;
        let next = match self.phase {
            CalPhase::Bias if sr.calib.frames >= CalFrames::Thermal => {
                Some(CalPhase::Thermal)
            }
            CalPhase::Thermal if sr.calib.frames >= CalFrames::Flat => Some(CalPhase::Flat),
            _ => None,
        };
        if let Some(phase) = next {
            ctx.spawn(Box::new(CalibPipeline::new(phase)), false);
        } else if wants_data {
            ctx.spawn(Box::new(RegScan::new()), false);
        } else {
            info!(scan = %sr.image_file, "{} is complete", self.phase.label());
            ctx.mark(sr, Outcome::Done);
            ctx.current = None;
        }
        Step::Finished
    }

    fn step_wait_start(
        &mut self,
        now: DateTime<Utc>,
        ctx: &mut Context,
        sr: &ScanRequest,
    ) -> Step {
        if now > sr.deadline() {
            let late = (now - sr.deadline()).num_seconds();
            warn!(scan = %sr.image_file, "{} too late by {late} secs", self.phase.label());
            return self.fail(ctx, sr);
        }
        match self.phase {
            CalPhase::Bias => {
                // science requests get their frames going well before the
                // scheduled start so the references are ready by then
                let takedata = sr.calib.data != DataKind::None;
                let pretime = if takedata {
                    ctx.setup_timeout() * 2
                } else {
                    chrono::Duration::zero()
                };
                if now < sr.start_time - pretime {
                    return Step::Continue;
                }
                if takedata && now > sr.start_time {
                    let late = (now - sr.start_time).num_seconds();
                    warn!(scan = %sr.image_file, "no time to set up, late by {late} secs");
                    return self.fail(ctx, sr);
                }
                if !takedata {
                    // pure calibration: this chain is the whole request
                    let late = (now - sr.start_time).num_seconds().max(0);
                    if late > 0 {
                        info!(scan = %sr.image_file, "starting calibrations late by {late} secs");
                    } else {
                        info!(scan = %sr.image_file, "starting calibrations on time");
                    }
                    if let Some(cur) = ctx.current.as_mut() {
                        cur.running = true;
                    }
                }
                self.start_frame(ctx, sr, now);
            }
            CalPhase::Thermal => {
                // the bias phase already absorbed the start wait
                self.start_frame(ctx, sr, now);
            }
            CalPhase::Flat => {
                info!(scan = %sr.image_file, "checking flat setup");
                flat_setup(ctx, sr);
                self.stage = Stage::WaitSetup {
                    deadline: now + ctx.setup_timeout(),
                };
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
        let allok = camok && telok && filok && domok;

        if !allok && now > deadline {
            warn!(
                scan = %sr.image_file,
                "flat setup timed out for{}{}{}{}",
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
            warn!(scan = %sr.image_file, "flat setup too late by {late} secs");
            ctx.request_abort(true);
            return Step::Finished;
        }
        if !allok {
            return Step::Continue;
        }
        self.start_frame(ctx, sr, now);
        Step::Continue
    }

    fn step_take_frames(
        &mut self,
        now: DateTime<Utc>,
        frame_due: DateTime<Utc>,
        ctx: &mut Context,
        sr: &ScanRequest,
    ) -> Step {
        if now < frame_due || ctx.status.camera != CameraState::Idle {
            return Step::Continue;
        }
        self.taken += 1;
        if self.taken < self.phase.frame_count(ctx) {
            self.start_frame(ctx, sr, now);
            return Step::Continue;
        }
        self.start_composite(ctx, sr)
    }

    fn step_wait_composite(
        &mut self,
        tool: ToolHandle,
        ctx: &mut Context,
        sr: &ScanRequest,
    ) -> Step {
        match ctx.tools.poll(tool) {
            Ok(ToolState::Running) => Step::Continue,
            Ok(ToolState::Exited(0)) => {
                self.remove_scratch();
                self.advance(ctx, sr)
            }
            Ok(ToolState::Exited(code)) => {
                warn!(scan = %sr.image_file, code, "{} composite failed", self.phase.label());
                self.remove_scratch();
                self.fail(ctx, sr)
            }
            Err(e) => {
                warn!(scan = %sr.image_file, %e, "{} composite lost", self.phase.label());
                self.remove_scratch();
                self.fail(ctx, sr)
            }
        }
    }
}

impl Pipeline for CalibPipeline {
    fn name(&self) -> &'static str {
        "calib"
    }

    fn step(&mut self, first: bool, now: DateTime<Utc>, ctx: &mut Context) -> Step {
        let Some(cur) = ctx.current.clone() else {
            warn!("calibration step with no current request");
            return Step::Finished;
        };
        let sr = cur.scan;

        if first && self.phase == CalPhase::Bias {
            // begin the slow equipment moves while the frames accumulate
            if sr.calib.frames == CalFrames::Flat {
                info!(scan = %sr.image_file, "starting flat pre-setup");
                flat_setup(ctx, &sr);
            } else if sr.calib.data != DataKind::None {
                info!(scan = %sr.image_file, "starting scan pre-setup");
                super::regscan::scan_setup(ctx, &sr);
            }
        }

        match self.stage {
            Stage::WaitStart => self.step_wait_start(now, ctx, &sr),
            Stage::WaitSetup { deadline } => self.step_wait_setup(now, deadline, ctx, &sr),
            Stage::TakeFrames { frame_due } => self.step_take_frames(now, frame_due, ctx, &sr),
            Stage::WaitComposite { tool } => self.step_wait_composite(tool, ctx, &sr),
        }
    }
}

/// Command everything a dome flat needs: filter in place, telescope at the
/// flat panel, lights on, focus halted, roof closed, dome at the panel
/// azimuth when one is configured.
pub(crate) fn flat_setup(ctx: &mut Context, sr: &ScanRequest) {
    let cal = ctx.cfg.calib.clone();
    let s = ctx.status.clone();

    if s.filter_present {
        ctx.try_send(DeviceId::Filter, sr.filter.to_string());
    }
    ctx.try_send(
        DeviceId::Telescope,
        format!("Alt:{} Az:{}", cal.flat_alt_deg, cal.flat_az_deg),
    );
    if s.lights >= 0 && s.lights != cal.flat_lights {
        ctx.try_send(DeviceId::Lights, cal.flat_lights.to_string());
    }
    if s.focus_present && !s.focus_ready {
        ctx.try_send(DeviceId::Focus, "Stop");
    }
    if !matches!(
        s.shutter,
        ShutterState::Absent | ShutterState::Closing | ShutterState::Closed
    ) {
        ctx.try_send(DeviceId::Dome, "Close");
    }
    if cal.flat_dome_az_deg != 0.0
        && matches!(s.shutter, ShutterState::Absent | ShutterState::Closed)
        && s.dome == DomeState::Stopped
        && az_sep_deg(s.dome_az_deg, cal.flat_dome_az_deg) > cal.dome_tol_deg
    {
        ctx.try_send(DeviceId::Dome, format!("Az:{}", cal.flat_dome_az_deg));
    }
}

/// Dome readiness for flats: stopped at the panel azimuth with the roof
/// closed, or simply out of the picture.
pub(crate) fn flat_dome_ready(ctx: &Context) -> bool {
    let cal = &ctx.cfg.calib;
    let s = &ctx.status;
    let closed = matches!(s.shutter, ShutterState::Absent | ShutterState::Closed);
    let positioned = cal.flat_dome_az_deg == 0.0
        || s.dome == DomeState::Absent
        || (s.dome == DomeState::Stopped
            && az_sep_deg(s.dome_az_deg, cal.flat_dome_az_deg) <= cal.dome_tol_deg);
    positioned && closed
}

/// Smallest separation between two azimuths, degrees.
pub(crate) fn az_sep_deg(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    if d > 180.0 {
        360.0 - d
    } else {
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_az_sep() {
        assert!((az_sep_deg(10.0, 350.0) - 20.0).abs() < 1e-9);
        assert!((az_sep_deg(350.0, 10.0) - 20.0).abs() < 1e-9);
        assert!(az_sep_deg(180.0, 180.0).abs() < 1e-9);
        assert!((az_sep_deg(0.0, 180.0) - 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_phase_table() {
        assert_eq!(CalPhase::Bias.shutter(), ShutterMode::Closed);
        assert_eq!(CalPhase::Flat.shutter(), ShutterMode::Open);
        assert_eq!(CalPhase::Thermal.composite_flag(), "-T");
    }
}
