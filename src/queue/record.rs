//! The scan-request record and its on-disk text form.
//!
//! A queue file is a sequence of line-numbered records. Every line reads
//!
//! ```text
//! NN label       value
//! ```
//!
//! with the value starting at a fixed column, so the single outcome
//! character of line 0 sits at a known byte offset inside the file and can
//! be patched in place without rewriting anything else. Lines starting with
//! `!` or `#` are comments. A line that does not fit the expected shape
//! desynchronizes the reader, which skips the rest of that record and hunts
//! for the next line 0: an externally edited file must never wedge the
//! engine.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

/// Column where every line's value begins: 2-digit line number, one space,
/// 12-character label field.
pub const CONTENT_COL: usize = 15;

/// Lines per record, numbered `0..NUM_LINES`.
pub const NUM_LINES: usize = 16;

/// Persisted single-character outcome of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    New,
    Done,
    Failed,
}

impl Outcome {
    pub fn as_char(self) -> char {
        match self {
            Outcome::New => 'N',
            Outcome::Done => 'D',
            Outcome::Failed => 'F',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'N' => Some(Outcome::New),
            'D' => Some(Outcome::Done),
            'F' => Some(Outcome::Failed),
            _ => None,
        }
    }
}

/// How the camera shutter operates during an exposure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutterMode {
    Open,
    Closed,
}

impl ShutterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutterMode::Open => "open",
            ShutterMode::Closed => "closed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ShutterMode::Open),
            "closed" => Some(ShutterMode::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for ShutterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which reference frames a request asks this engine to (re)acquire.
///
/// The composite stages are cumulative: `Flat` means fresh bias, thermal
/// and flat composites, in that order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CalFrames {
    None,
    Bias,
    Thermal,
    Flat,
}

/// Whether science data is wanted, and how to process it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataKind {
    None,
    Raw,
    Cooked,
}

/// The calibration directive field: which reference stage(s) to acquire,
/// whether the simplified single-frame variant is meant, and whether
/// science data should also be taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalibDirective {
    pub frames: CalFrames,
    /// Single direct frame into the request's own file instead of a
    /// multi-frame composite. Only meaningful for thermal and flat.
    pub direct: bool,
    pub data: DataKind,
}

impl CalibDirective {
    /// True when the directive asks for nothing at all.
    pub fn is_noop(&self) -> bool {
        self.frames == CalFrames::None && self.data == DataKind::None
    }

    pub fn wants_data(&self) -> bool {
        self.data != DataKind::None
    }

    fn parse(s: &str) -> Option<Self> {
        let (frames_s, data_s) = s.split_once(',')?;
        let (frames, direct) = match frames_s.trim() {
            "none" => (CalFrames::None, false),
            "bias" => (CalFrames::Bias, false),
            "thermal" => (CalFrames::Thermal, false),
            "flat" => (CalFrames::Flat, false),
            "thermal-direct" => (CalFrames::Thermal, true),
            "flat-direct" => (CalFrames::Flat, true),
            _ => return None,
        };
        let data = match data_s.trim() {
            "none" => DataKind::None,
            "raw" => DataKind::Raw,
            "cooked" => DataKind::Cooked,
            _ => return None,
        };
        Some(Self {
            frames,
            direct,
            data,
        })
    }
}

impl fmt::Display for CalibDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frames = match (self.frames, self.direct) {
            (CalFrames::None, _) => "none",
            (CalFrames::Bias, _) => "bias",
            (CalFrames::Thermal, false) => "thermal",
            (CalFrames::Thermal, true) => "thermal-direct",
            (CalFrames::Flat, false) => "flat",
            (CalFrames::Flat, true) => "flat-direct",
        };
        let data = match self.data {
            DataKind::None => "none",
            DataKind::Raw => "raw",
            DataKind::Cooked => "cooked",
        };
        write!(f, "{frames},{data}")
    }
}

/// One queued observation or calibration unit.
#[derive(Clone, Debug)]
pub struct ScanRequest {
    pub outcome: Outcome,
    /// Scheduled start, assigned by the scheduling tool; overwritten with
    /// the actual start when a pipeline publishes the run.
    pub start_time: DateTime<Utc>,
    /// Allowed start tolerance, seconds after `start_time`
    pub tolerance_s: i64,
    /// Source schedule identity
    pub schedule: String,
    /// Object name, for logs
    pub target: String,
    /// Pointing command text, sent verbatim to the Telescope channel
    pub pointing: String,
    pub image_dir: String,
    pub image_file: String,
    /// Sub-frame origin, unbinned pixels
    pub sub_x: u32,
    pub sub_y: u32,
    /// Sub-frame size, unbinned pixels
    pub sub_w: u32,
    pub sub_h: u32,
    pub bin_x: u32,
    pub bin_y: u32,
    /// Exposure duration, seconds
    pub duration_s: f64,
    pub shutter: ShutterMode,
    pub calib: CalibDirective,
    pub filter: char,
    /// Lower values are scheduled first by the tool that writes the queue
    pub priority: i32,
    /// Set while the run is actually under way. Never persisted.
    pub running: bool,
}

impl ScanRequest {
    pub fn image_path(&self) -> PathBuf {
        PathBuf::from(&self.image_dir).join(&self.image_file)
    }

    /// Latest acceptable start.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.start_time + chrono::Duration::seconds(self.tolerance_s)
    }

    /// Identity comparison that ignores every field this engine itself
    /// mutates (outcome, start time, shutter, running), so a record can be
    /// found again after the engine has begun working on it.
    pub fn same_request(&self, other: &ScanRequest) -> bool {
        self.schedule == other.schedule
            && self.target == other.target
            && self.pointing == other.pointing
            && self.image_dir == other.image_dir
            && self.image_file == other.image_file
            && self.tolerance_s == other.tolerance_s
            && (self.sub_x, self.sub_y, self.sub_w, self.sub_h)
                == (other.sub_x, other.sub_y, other.sub_w, other.sub_h)
            && (self.bin_x, self.bin_y) == (other.bin_x, other.bin_y)
            && self.duration_s == other.duration_s
            && self.calib == other.calib
            && self.filter == other.filter
            && self.priority == other.priority
    }
}

/// A parsed record plus the byte offset of its outcome character.
#[derive(Clone, Debug)]
pub struct RecordAt {
    pub request: ScanRequest,
    pub outcome_offset: u64,
}

const LABELS: [&str; NUM_LINES] = [
    "outcome",
    "start",
    "tolerance",
    "schedule",
    "target",
    "pointing",
    "imagedir",
    "imagefile",
    "origin",
    "size",
    "binning",
    "duration",
    "shutter",
    "calib",
    "filter",
    "priority",
];

/// Render one record in queue-file form, trailing newline included.
pub fn format_record(sr: &ScanRequest) -> String {
    let values = [
        sr.outcome.as_char().to_string(),
        sr.start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        sr.tolerance_s.to_string(),
        sr.schedule.clone(),
        sr.target.clone(),
        sr.pointing.clone(),
        sr.image_dir.clone(),
        sr.image_file.clone(),
        format!("{}+{}", sr.sub_x, sr.sub_y),
        format!("{}x{}", sr.sub_w, sr.sub_h),
        format!("{}x{}", sr.bin_x, sr.bin_y),
        format!("{}", sr.duration_s),
        sr.shutter.as_str().to_string(),
        sr.calib.to_string(),
        sr.filter.to_string(),
        sr.priority.to_string(),
    ];

    let mut out = String::new();
    for (i, v) in values.iter().enumerate() {
        out.push_str(&format!("{:>2} {:<12}{}\n", i, LABELS[i], v));
    }
    out
}

/// Parse every well-formed record in `text`, in file order.
///
/// Bad lines are reported and skip the enclosing record; parsing then
/// resynchronizes on the next line 0.
pub fn parse_records(text: &str) -> Vec<RecordAt> {
    let mut records = Vec::new();
    let mut partial: Option<PartialRecord> = None;
    let mut offset = 0usize;

    for raw in text.split_inclusive('\n') {
        let line_offset = offset;
        offset += raw.len();
        let line = raw.trim_end_matches(['\n', '\r']);

        if line.is_empty() || line.starts_with('!') || line.starts_with('#') {
            continue;
        }

        let expected = partial.as_ref().map_or(0, |p| p.next_line);
        let Some((lineno, value)) = split_line(line) else {
            if partial.take().is_some() {
                warn!(line, "malformed queue line, skipping record");
            }
            continue;
        };

        if lineno != expected {
            // out of sync: a fresh line 0 restarts, anything else is noise
            if partial.take().is_some() {
                warn!(lineno, expected, "queue record out of sync, resyncing");
            }
            if lineno != 0 {
                continue;
            }
        }

        if lineno == 0 {
            partial = Some(PartialRecord::new(line_offset as u64 + CONTENT_COL as u64));
        }
        let Some(p) = partial.as_mut() else {
            continue;
        };

        if !p.accept(lineno, value) {
            warn!(lineno, value, "bad queue field, skipping record");
            partial = None;
            continue;
        }

        if lineno == NUM_LINES - 1 {
            if let Some(done) = partial.take() {
                if let Some(rec) = done.finish() {
                    records.push(rec);
                }
            }
        }
    }

    records
}

fn split_line(line: &str) -> Option<(usize, &str)> {
    if line.len() <= CONTENT_COL {
        return None;
    }
    let lineno: usize = line.get(..2)?.trim().parse().ok()?;
    let value = line.get(CONTENT_COL..)?.trim_end();
    Some((lineno, value))
}

struct PartialRecord {
    outcome_offset: u64,
    next_line: usize,
    fields: Vec<String>,
}

impl PartialRecord {
    fn new(outcome_offset: u64) -> Self {
        Self {
            outcome_offset,
            next_line: 0,
            fields: Vec::with_capacity(NUM_LINES),
        }
    }

    fn accept(&mut self, lineno: usize, value: &str) -> bool {
        if lineno != self.next_line {
            return false;
        }
        self.fields.push(value.to_string());
        self.next_line += 1;
        true
    }

    fn finish(self) -> Option<RecordAt> {
        let f = &self.fields;
        if f.len() != NUM_LINES {
            return None;
        }

        let mut outcome_chars = f[0].chars();
        let outcome = Outcome::from_char(outcome_chars.next()?)?;
        if outcome_chars.next().is_some() {
            return None;
        }

        let start_time = DateTime::parse_from_rfc3339(&f[1]).ok()?.with_timezone(&Utc);
        let tolerance_s: i64 = f[2].parse().ok()?;
        let (sub_x, sub_y) = parse_pair(&f[8], '+')?;
        let (sub_w, sub_h) = parse_pair(&f[9], 'x')?;
        let (bin_x, bin_y) = parse_pair(&f[10], 'x')?;
        let duration_s: f64 = f[11].parse().ok()?;
        let shutter = ShutterMode::parse(&f[12])?;
        let calib = CalibDirective::parse(&f[13])?;
        let filter = f[14].chars().next()?;
        let priority: i32 = f[15].parse().ok()?;

        Some(RecordAt {
            request: ScanRequest {
                outcome,
                start_time,
                tolerance_s,
                schedule: f[3].clone(),
                target: f[4].clone(),
                pointing: f[5].clone(),
                image_dir: f[6].clone(),
                image_file: f[7].clone(),
                sub_x,
                sub_y,
                sub_w,
                sub_h,
                bin_x,
                bin_y,
                duration_s,
                shutter,
                calib,
                filter,
                priority,
                running: false,
            },
            outcome_offset: self.outcome_offset,
        })
    }
}

fn parse_pair(s: &str, sep: char) -> Option<(u32, u32)> {
    let (a, b) = s.split_once(sep)?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

#[cfg(test)]
pub(crate) fn sample_request(file: &str) -> ScanRequest {
    ScanRequest {
        outcome: Outcome::New,
        start_time: DateTime::parse_from_rfc3339("2026-03-01T04:30:00Z")
            .unwrap()
            .with_timezone(&Utc),
        tolerance_s: 300,
        schedule: "nightly.sch".into(),
        target: "M51".into(),
        pointing: "RA:13.4979 Dec:47.1952".into(),
        image_dir: "/data/images".into(),
        image_file: file.into(),
        sub_x: 0,
        sub_y: 0,
        sub_w: 1024,
        sub_h: 1024,
        bin_x: 1,
        bin_y: 1,
        duration_s: 120.0,
        shutter: ShutterMode::Open,
        calib: CalibDirective {
            frames: CalFrames::None,
            direct: false,
            data: DataKind::Cooked,
        },
        filter: 'R',
        priority: 5,
        running: false,
    }
}
