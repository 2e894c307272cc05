//! Observation programs.
//!
//! A program owns one activity (a calibration chain phase, a science
//! exposure, a background finalize) and is stepped once per engine tick.
//! Steps never block: a program looks at the clock and the device status,
//! queues whatever commands it needs, and returns. Programs hand work to
//! their successors by spawning the next program through the [`Context`].

pub mod calib;
pub mod direct;
pub mod regscan;

pub use calib::{CalPhase, CalibPipeline};
pub use direct::DirectCalib;
pub use regscan::{FinalizeScan, RegScan};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::context::Context;
use crate::queue::{CalFrames, DataKind, ScanRequest};

/// Outcome of one program step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Still making progress; call again next tick.
    Continue,
    /// Done, whether successfully or not; remove from the table.
    Finished,
}

pub trait Pipeline {
    fn name(&self) -> &'static str;

    /// Advance the program. `first` is set only on the very first call
    /// after admission.
    fn step(&mut self, first: bool, now: DateTime<Utc>, ctx: &mut Context) -> Step;
}

/// Choose the program for a fresh request. `None` means the directive
/// asks for no frames and no data, which is nothing we can do.
pub fn select_program(sr: &ScanRequest) -> Option<Box<dyn Pipeline>> {
    let d = &sr.calib;
    if d.direct {
        match d.frames {
            CalFrames::Thermal | CalFrames::Flat => Some(Box::new(DirectCalib::new(d.frames))),
            CalFrames::None | CalFrames::Bias => None,
        }
    } else if d.frames != CalFrames::None {
        // reference chains always open with a bias
        info!(scan = %sr.image_file, "starting calibration chain");
        Some(Box::new(CalibPipeline::new(CalPhase::Bias)))
    } else if d.data != DataKind::None {
        Some(Box::new(RegScan::new()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{sample_request, CalibDirective};

    fn with_calib(frames: CalFrames, direct: bool, data: DataKind) -> ScanRequest {
        let mut sr = sample_request("x.fts");
        sr.calib = CalibDirective {
            frames,
            direct,
            data,
        };
        sr
    }

    #[test]
    fn test_select_program() {
        let p = select_program(&with_calib(CalFrames::None, false, DataKind::Cooked));
        assert_eq!(p.map(|p| p.name()), Some("regscan"));

        let p = select_program(&with_calib(CalFrames::Flat, false, DataKind::None));
        assert_eq!(p.map(|p| p.name()), Some("calib"));

        let p = select_program(&with_calib(CalFrames::Thermal, true, DataKind::None));
        assert_eq!(p.map(|p| p.name()), Some("direct-calib"));

        assert!(select_program(&with_calib(CalFrames::None, false, DataKind::None)).is_none());
    }
}
