//! The engine: one cooperative loop that polls the bus, watches the
//! environment and the queue file, admits requests, and steps programs.

use chrono::{DateTime, Utc};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::bus::DeviceId;
use crate::context::{Context, CurrentScan};
use crate::error::RunResult;
use crate::pipeline::{select_program, Pipeline, Step};
use crate::queue::Outcome;
use crate::safety::{SunGuard, WeatherGuard};
use crate::solar::{NoaaSun, SunModel};
use crate::status::ShutterState;

/// Modest number at most; programs are coarse units of work.
pub const MAX_PROGRAMS: usize = 10;

struct Program {
    pipeline: Box<dyn Pipeline>,
    first: bool,
    /// Background programs survive an all-stop.
    background: bool,
}

pub struct Scheduler {
    pub ctx: Context,
    programs: Vec<Program>,
    sun: SunGuard,
    weather: WeatherGuard,
}

impl Scheduler {
    pub fn new(ctx: Context) -> Self {
        Self::with_sun(ctx, Box::new(NoaaSun))
    }

    pub fn with_sun(ctx: Context, sun: Box<dyn SunModel>) -> Self {
        Self {
            ctx,
            programs: Vec::new(),
            sun: SunGuard::new(sun),
            weather: WeatherGuard::default(),
        }
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Open the covers and home whatever axes report unhomed, then verify.
    /// Returns false when the mount still is not homed after the
    /// configured wait; the caller must refuse to start observing.
    pub async fn ensure_homed(&mut self) -> RunResult<bool> {
        if !self.ctx.cfg.homing.auto_home {
            return Ok(true);
        }
        self.ctx.refresh_status();
        if self.ctx.status.homed {
            return Ok(true);
        }

        info!(
            "telescope not fully homed, auto homing ({:?} allowed)",
            self.ctx.cfg.homing.home_wait
        );
        self.ctx.bus.send_unchecked(DeviceId::Cover, "Open");
        self.ctx.bus.send_unchecked(DeviceId::Telescope, "Home");
        if self.ctx.status.focus_present {
            self.ctx.bus.send_unchecked(DeviceId::Focus, "Home");
        }
        if self.ctx.status.filter_present {
            self.ctx.bus.send_unchecked(DeviceId::Filter, "Home");
        }

        let interval = self.ctx.cfg.timing.poll_interval;
        let deadline = tokio::time::Instant::now() + self.ctx.cfg.homing.home_wait;
        while tokio::time::Instant::now() < deadline {
            self.ctx.bus.poll(interval, Utc::now()).await?;
            self.ctx.refresh_status();
            if self.ctx.status.homed {
                info!("homing complete");
                return Ok(true);
            }
        }
        warn!("failed to home within {:?}", self.ctx.cfg.homing.home_wait);
        self.all_stop(false);
        self.ctx.bus.flush().await?;
        Ok(false)
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(&mut self) -> RunResult<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        info!("scanrun start");
        loop {
            let interval = self.ctx.cfg.timing.poll_interval;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    self.shutdown().await?;
                    return Ok(());
                }
                _ = sigterm.recv() => {
                    info!("terminated");
                    self.shutdown().await?;
                    return Ok(());
                }
                _ = sighup.recv() => {
                    info!("hangup");
                    self.shutdown().await?;
                    return Ok(());
                }
                clean = self.ctx.bus.poll(interval, Utc::now()) => {
                    match clean {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("device fault reported");
                            self.all_stop(true);
                        }
                        Err(e) => {
                            // one channel is gone; stop whatever still
                            // listens before the process dies
                            error!(%e, "device transport failed");
                            self.all_stop(true);
                            self.ctx.bus.flush_lossy().await;
                            return Err(e);
                        }
                    }
                    self.tick(Utc::now());
                }
            }
        }
    }

    /// Stop everything and close up before exit.
    pub async fn shutdown(&mut self) -> RunResult<()> {
        info!("shutting down on signal");
        self.all_stop(true);
        if self.ctx.status.shutter != ShutterState::Absent {
            info!("closing dome for shutdown");
            self.ctx.bus.send_unchecked(DeviceId::Dome, "Close");
        }
        self.ctx.bus.flush().await
    }

    /// One pass of engine housekeeping and program stepping.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        self.ctx.refresh_status();

        // close and stow the moment the sun comes up
        if self
            .sun
            .check_dawn(now, &self.ctx.cfg.site, &self.ctx.cfg.safety)
        {
            info!("shutting down at dawn");
            self.all_stop(true);
            self.ctx.bus.send_unchecked(DeviceId::Dome, "Close");
            let stow = format!(
                "Alt:{} Az:{}",
                self.ctx.cfg.safety.stow_alt_deg, self.ctx.cfg.safety.stow_az_deg
            );
            self.ctx.bus.send_unchecked(DeviceId::Telescope, stow);
        }

        // nothing moves during a weather alert
        let wx = self.ctx.weather.clone();
        if self.weather.alerting(&wx, now, self.ctx.weather_max_age()) {
            return;
        }

        // an edited queue file invalidates whatever we were doing; the new
        // content may not even hold the record we would mark
        if self.ctx.queue.has_changed() {
            info!("queue file change detected");
            self.all_stop(false);
        }

        // look for more work when free and the channels are quiet
        if self.ctx.current.is_none() && !self.ctx.bus.any_pending() {
            self.admit_next();
        }

        if self.sun.ok_to_run(&self.ctx.cfg.safety) {
            self.run_programs(now);
        }
    }

    fn admit_next(&mut self) {
        let Some(sr) = self.ctx.queue.find_next() else {
            return;
        };
        match select_program(&sr) {
            Some(pipeline) => {
                if self.programs.len() >= MAX_PROGRAMS {
                    warn!("out of program slots");
                    return;
                }
                info!(scan = %sr.image_file, "scheduled at {}", sr.start_time);
                self.ctx.current = Some(CurrentScan::new(sr));
                self.programs.push(Program {
                    pipeline,
                    first: true,
                    background: false,
                });
            }
            None => {
                // nothing to take and nothing to process; fail it once so
                // it never comes back
                warn!(scan = %sr.image_file, "calibration directive is a no-op");
                self.ctx.mark(&sr, Outcome::Failed);
            }
        }
    }

    fn run_programs(&mut self, now: DateTime<Utc>) {
        let mut i = 0;
        while i < self.programs.len() {
            let prog = &mut self.programs[i];
            let first = std::mem::take(&mut prog.first);
            match prog.pipeline.step(first, now, &mut self.ctx) {
                Step::Finished => {
                    self.programs.remove(i);
                }
                Step::Continue => i += 1,
            }
            if let Some(mark) = self.ctx.take_abort() {
                self.all_stop(mark);
                return;
            }
        }

        // successors requested during this round start next tick
        for spawn in self.ctx.take_spawns() {
            if self.programs.len() >= MAX_PROGRAMS {
                warn!("out of program slots");
                if let Some(cur) = self.ctx.current.take() {
                    let scan = cur.scan;
                    self.ctx.mark(&scan, Outcome::Failed);
                }
                continue;
            }
            self.programs.push(Program {
                pipeline: spawn.program,
                first: true,
                background: spawn.background,
            });
        }
    }

    /// Stop all hardware and drop every foreground program. With `mark`
    /// set, a request whose exposure was under way is recorded as Failed.
    pub fn all_stop(&mut self, mark: bool) {
        info!("all stop");
        let status = self.ctx.status.clone();
        self.ctx.bus.stop_all(&status);

        if let Some(cur) = self.ctx.current.take() {
            if mark && cur.running {
                warn!(scan = %cur.scan.image_file, "failing scan in progress");
                let scan = cur.scan;
                self.ctx.mark(&scan, Outcome::Failed);
            }
        }

        self.programs.retain(|p| p.background);
        // pending successors die with their parents
        drop(self.ctx.take_spawns());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::bus::DeviceBus;
    use crate::config::RunConfig;
    use crate::error::RunError;
    use crate::queue::{sample_request, QueueStore};
    use crate::tools::MockRunner;
    use tokio::io::{duplex, split, AsyncBufReadExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    type Link = (DeviceId, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

    struct Idle;

    impl Pipeline for Idle {
        fn name(&self) -> &'static str {
            "idle"
        }

        fn step(&mut self, _first: bool, _now: DateTime<Utc>, _ctx: &mut Context) -> Step {
            Step::Continue
        }
    }

    fn scheduler() -> Scheduler {
        let mut links = Vec::new();
        for id in DeviceId::ALL {
            let (engine_side, _device_side) = duplex(4096);
            let (r, w) = split(engine_side);
            links.push((id, r, w));
        }
        scheduler_with(links)
    }

    fn scheduler_with(links: Vec<Link>) -> Scheduler {
        let cfg = RunConfig::default();
        let queue = QueueStore::new(cfg.paths.queue_file.clone());
        let ctx = Context::new(
            cfg,
            DeviceBus::from_links(links),
            queue,
            Box::new(MockRunner::new()),
        );
        Scheduler::new(ctx)
    }

    #[tokio::test]
    async fn test_fatal_transport_stops_surviving_channels() {
        let mut links = Vec::new();
        let mut device = HashMap::new();
        for id in DeviceId::ALL {
            let (engine_side, device_side) = duplex(4096);
            let (r, w) = split(engine_side);
            links.push((id, r, w));
            if id == DeviceId::Lights {
                // this daemon is gone; its channel reads EOF
                drop(device_side);
            } else {
                device.insert(id, device_side);
            }
        }
        let mut sched = scheduler_with(links);

        let err = match sched.run().await {
            Err(e) => e,
            Ok(()) => panic!("run survived a dead channel"),
        };
        assert!(matches!(
            err,
            RunError::DeviceIo {
                channel: DeviceId::Lights,
                ..
            }
        ));

        // the stop batch still reached the channels that worked
        for id in [DeviceId::Telescope, DeviceId::Camera] {
            let mut line = String::new();
            let mut rd = BufReader::new(device.remove(&id).unwrap());
            rd.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim_end(), "Stop", "channel {id}");
        }
    }

    #[test]
    fn test_spawn_overflow_drops_excess_and_fails_current() {
        let mut sched = scheduler();
        sched.ctx.current = Some(CurrentScan::new(sample_request("over.fts")));
        for _ in 0..=MAX_PROGRAMS {
            sched.ctx.spawn(Box::new(Idle), false);
        }

        sched.run_programs(Utc::now());

        // the table filled to capacity and stayed intact past the overflow
        assert_eq!(sched.program_count(), MAX_PROGRAMS);
        assert!(sched.ctx.current.is_none());
    }

    #[test]
    fn test_all_stop_keeps_background_programs() {
        let mut sched = scheduler();
        sched.ctx.spawn(Box::new(Idle), false);
        sched.ctx.spawn(Box::new(Idle), true);
        sched.run_programs(Utc::now());
        assert_eq!(sched.program_count(), 2);

        sched.all_stop(false);
        assert_eq!(sched.program_count(), 1);
    }
}
