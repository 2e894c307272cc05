//! The persisted scan queue.
//!
//! The queue file is written by the scheduling tool and edited by operators
//! at will; this engine only ever reads it, watches it for change, and
//! patches single outcome characters in place. An absent or transiently
//! locked queue file is never an error; every operation silently declines
//! and the scheduler tries again next tick.

mod record;

#[cfg(test)]
pub(crate) use record::sample_request;

pub use record::{
    format_record, parse_records, CalFrames, CalibDirective, DataKind, Outcome, RecordAt,
    ScanRequest, ShutterMode,
};

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Cheap file identity: device, inode, size, mtime. All-zero stands in for
/// a file that does not exist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Fingerprint {
    dev: u64,
    ino: u64,
    size: u64,
    mtime_s: i64,
    mtime_ns: i64,
}

impl Fingerprint {
    fn of(path: &Path) -> Self {
        use std::os::unix::fs::MetadataExt;
        match fs::metadata(path) {
            Ok(md) => Self {
                dev: md.dev(),
                ino: md.ino(),
                size: md.size(),
                mtime_s: md.mtime(),
                mtime_ns: md.mtime_nsec(),
            },
            Err(_) => Self::default(),
        }
    }
}

/// Read/mark access to the persisted request queue, with change detection.
pub struct QueueStore {
    path: PathBuf,
    last: Fingerprint,
}

impl QueueStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            last: Fingerprint::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file is materially different from the last time anyone
    /// asked. This is a change *detector*, not a content diff: any touch
    /// counts, and the recorded fingerprint is updated as a side effect.
    pub fn has_changed(&mut self) -> bool {
        let now = Fingerprint::of(&self.path);
        let diff = now != self.last;
        self.last = now;
        diff
    }

    /// First record still marked New, in file order.
    pub fn find_next(&self) -> Option<ScanRequest> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "queue unreadable");
                return None;
            }
        };
        parse_records(&text)
            .into_iter()
            .map(|r| r.request)
            .find(|r| r.outcome == Outcome::New)
    }

    /// Find the record matching `sr` (ignoring fields this engine mutates)
    /// that is still marked New, and overwrite exactly its outcome byte.
    /// A record already marked is never re-marked, which both preserves the
    /// one-way outcome transition and guards against duplicate matches.
    ///
    /// Returns whether a record was actually marked. Declines silently if
    /// the file cannot be opened.
    pub fn mark_outcome(&mut self, sr: &ScanRequest, outcome: Outcome) -> bool {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "queue unreadable, not marking");
                return false;
            }
        };

        let Some(rec) = parse_records(&text)
            .into_iter()
            .find(|r| r.request.outcome == Outcome::New && r.request.same_request(sr))
        else {
            debug!(image = %sr.image_file, "no matching New record to mark");
            return false;
        };

        let patched = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .and_then(|mut f| {
                f.seek(SeekFrom::Start(rec.outcome_offset))?;
                f.write_all(&[outcome.as_char() as u8])?;
                f.flush()
            });

        match patched {
            Ok(()) => {
                // our own write must not look like an external edit
                self.last = Fingerprint::of(&self.path);
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to mark outcome");
                false
            }
        }
    }

    /// Append one record, creating the file if needed. Used by tests and by
    /// tooling on the scheduling side; the engine itself never appends.
    pub fn append_record(&mut self, sr: &ScanRequest) -> std::io::Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        f.write_all(format_record(sr).as_bytes())?;
        f.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    fn request(file: &str) -> ScanRequest {
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
                data: DataKind::Raw,
            },
            filter: 'R',
            priority: 5,
            running: false,
        }
    }

    fn store_with(dir: &TempDir, files: &[&str]) -> QueueStore {
        let mut store = QueueStore::new(dir.path().join("run.slq"));
        for f in files {
            store.append_record(&request(f)).unwrap();
        }
        store
    }

    #[test]
    fn test_find_next_first_new_in_file_order() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with(&dir, &["a.fts", "b.fts", "c.fts"]);

        let first = store.find_next().unwrap();
        assert_eq!(first.image_file, "a.fts");

        assert!(store.mark_outcome(&first, Outcome::Done));
        let second = store.find_next().unwrap();
        assert_eq!(second.image_file, "b.fts");
    }

    #[test]
    fn test_find_next_none_when_all_terminal() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with(&dir, &["a.fts"]);
        let a = store.find_next().unwrap();
        assert!(store.mark_outcome(&a, Outcome::Failed));
        assert!(store.find_next().is_none());
    }

    #[test]
    fn test_mark_never_remarks_terminal_record() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with(&dir, &["a.fts"]);
        let a = store.find_next().unwrap();

        assert!(store.mark_outcome(&a, Outcome::Done));
        // second mark finds no New record and declines
        assert!(!store.mark_outcome(&a, Outcome::Failed));
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("outcome     D"));
        assert!(!text.contains("outcome     F"));
    }

    #[test]
    fn test_mark_with_duplicate_records_marks_first_only() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with(&dir, &["dup.fts", "dup.fts"]);
        let a = store.find_next().unwrap();

        assert!(store.mark_outcome(&a, Outcome::Done));
        // exactly one of the two duplicates was marked
        let next = store.find_next().unwrap();
        assert_eq!(next.image_file, "dup.fts");
        assert!(store.mark_outcome(&next, Outcome::Done));
        assert!(store.find_next().is_none());
    }

    #[test]
    fn test_mark_matches_despite_engine_mutated_fields() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with(&dir, &["a.fts"]);

        let mut a = store.find_next().unwrap();
        // the engine rewrites these while working on a request
        a.start_time = Utc::now();
        a.running = true;
        a.shutter = ShutterMode::Closed;

        assert!(store.mark_outcome(&a, Outcome::Done));
    }

    #[test]
    fn test_has_changed_detects_touches_not_own_writes() {
        let dir = TempDir::new().unwrap();
        let mut store = store_with(&dir, &["a.fts", "b.fts"]);

        // first call after creation: changed
        assert!(store.has_changed());
        // immediate repeat with no intervening modification: not changed
        assert!(!store.has_changed());

        // an external append is a change
        let mut other = QueueStore::new(store.path().to_path_buf());
        other.append_record(&request("c.fts")).unwrap();
        assert!(store.has_changed());
        assert!(!store.has_changed());

        // the store's own mark refreshes the fingerprint
        let a = store.find_next().unwrap();
        assert!(store.mark_outcome(&a, Outcome::Done));
        assert!(!store.has_changed());
    }

    #[test]
    fn test_absent_file_declines_silently() {
        let dir = TempDir::new().unwrap();
        let mut store = QueueStore::new(dir.path().join("missing.slq"));
        assert!(store.find_next().is_none());
        assert!(!store.mark_outcome(&request("a.fts"), Outcome::Failed));
        // absent on both calls: zero fingerprint both times
        assert!(!store.has_changed());
    }
}
