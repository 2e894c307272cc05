//! The device command bus.
//!
//! A fixed set of named bidirectional channels connects this engine to the
//! device-control daemons (telescope, filter wheel, focuser, dome, cover,
//! lights, camera). Commands are single lines of text; every command
//! eventually yields one or more `<code> <description>` response lines:
//!
//! - `code < 0`:  fatal device error
//! - `code == 0`: command complete
//! - `code > 0`:  progress report
//!
//! A channel's pending flag is set when a command is queued and cleared the
//! moment a terminal (`<= 0`) response is observed. Sending on a channel
//! that is still pending is rejected; see [`DeviceBus::send`].
//!
//! The read sides of all channels are merged into one cancel-safe line
//! stream; [`DeviceBus::poll`] waits on it bounded by the poll interval or
//! by a one-shot [`DeviceBus::wake_at`] deadline, whichever comes first.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{LocalBoxStream, SelectAll, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, error, info, warn};

use crate::error::{RunError, RunResult};
use crate::status::{DeviceStatus, DomeState, ShutterState};

/// Number of device channels; one link per [`DeviceId`].
pub const NUM_CHANNELS: usize = 7;

/// Identity of one device-control channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceId {
    Telescope,
    Filter,
    Focus,
    Dome,
    Cover,
    Lights,
    Camera,
}

impl DeviceId {
    pub const ALL: [DeviceId; NUM_CHANNELS] = [
        DeviceId::Telescope,
        DeviceId::Filter,
        DeviceId::Focus,
        DeviceId::Dome,
        DeviceId::Cover,
        DeviceId::Lights,
        DeviceId::Camera,
    ];

    /// Channel name, also the daemon's socket basename.
    pub fn name(self) -> &'static str {
        match self {
            DeviceId::Telescope => "Tel",
            DeviceId::Filter => "Filter",
            DeviceId::Focus => "Focus",
            DeviceId::Dome => "Dome",
            DeviceId::Cover => "Cover",
            DeviceId::Lights => "Lights",
            DeviceId::Camera => "Camera",
        }
    }

    fn idx(self) -> usize {
        match self {
            DeviceId::Telescope => 0,
            DeviceId::Filter => 1,
            DeviceId::Focus => 2,
            DeviceId::Dome => 3,
            DeviceId::Cover => 4,
            DeviceId::Lights => 5,
            DeviceId::Camera => 6,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One parsed response line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub code: i32,
    pub text: String,
}

impl Response {
    pub fn parse(line: &str) -> Option<Self> {
        let t = line.trim();
        let (code_s, rest) = match t.split_once(char::is_whitespace) {
            Some((a, b)) => (a, b.trim_start()),
            None => (t, ""),
        };
        let code = code_s.parse().ok()?;
        Some(Self {
            code,
            text: rest.to_string(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.code <= 0
    }
}

type BoxWriter = Box<dyn AsyncWrite + Unpin>;
type LineItem = (DeviceId, io::Result<String>);

/// The bus: per-channel pending flags and outboxes, plus the merged read
/// stream and an optional armed wake-up deadline.
pub struct DeviceBus {
    writers: Vec<(DeviceId, BoxWriter)>,
    pending: [bool; NUM_CHANNELS],
    outbox: [VecDeque<String>; NUM_CHANNELS],
    merged: SelectAll<LocalBoxStream<'static, LineItem>>,
    wake_at: Option<DateTime<Utc>>,
}

impl DeviceBus {
    /// Build a bus from explicit read/write link halves, one per channel.
    /// Production uses [`DeviceBus::connect`]; tests hand in
    /// `tokio::io::duplex` halves.
    pub fn from_links<R, W>(links: Vec<(DeviceId, R, W)>) -> Self
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        let mut merged = SelectAll::new();
        let mut writers = Vec::with_capacity(links.len());
        for (id, r, w) in links {
            let lines = LinesStream::new(BufReader::new(r).lines())
                .map(move |res| (id, res))
                .chain(futures::stream::once(async move {
                    // EOF means the daemon went away: surface as an error
                    (id, Err(io::Error::from(io::ErrorKind::UnexpectedEof)))
                }))
                .boxed_local();
            merged.push(lines);
            writers.push((id, Box::new(w) as BoxWriter));
        }
        Self {
            writers,
            pending: [false; NUM_CHANNELS],
            outbox: std::array::from_fn(|_| VecDeque::new()),
            merged,
            wake_at: None,
        }
    }

    /// Connect to every device daemon's socket under `dir`.
    pub async fn connect(dir: &Path) -> RunResult<Self> {
        let mut links = Vec::with_capacity(NUM_CHANNELS);
        for id in DeviceId::ALL {
            let path = dir.join(format!("{}.sock", id.name()));
            let stream = UnixStream::connect(&path)
                .await
                .map_err(|e| RunError::DeviceIo {
                    channel: id,
                    source: e,
                })?;
            let (r, w) = stream.into_split();
            links.push((id, r, w));
        }
        Ok(Self::from_links(links))
    }

    /// Queue one command line for `id` and set its pending flag.
    ///
    /// A channel that still awaits a terminal response rejects the send:
    /// silently replacing the outstanding bookkeeping (what the historical
    /// behavior amounted to) hides lost commands from the caller.
    pub fn send(&mut self, id: DeviceId, cmd: impl Into<String>) -> RunResult<()> {
        if self.pending[id.idx()] {
            return Err(RunError::CommandPending(id));
        }
        self.enqueue(id, cmd.into());
        Ok(())
    }

    /// Queue a command regardless of the pending flag. Only abort and stop
    /// paths use this: cancellation must always flow.
    pub fn send_unchecked(&mut self, id: DeviceId, cmd: impl Into<String>) {
        if self.pending[id.idx()] {
            debug!(channel = %id, "superseding pending command");
        }
        self.enqueue(id, cmd.into());
    }

    fn enqueue(&mut self, id: DeviceId, cmd: String) {
        debug!(channel = %id, %cmd, "queue command");
        self.outbox[id.idx()].push_back(cmd);
        self.pending[id.idx()] = true;
    }

    pub fn is_pending(&self, id: DeviceId) -> bool {
        self.pending[id.idx()]
    }

    /// True if any channel other than Camera awaits a terminal response.
    /// The Camera is excluded because its completion (download, storage)
    /// naturally overlaps the next request's housekeeping.
    pub fn any_pending(&self) -> bool {
        DeviceId::ALL
            .into_iter()
            .any(|id| id != DeviceId::Camera && self.pending[id.idx()])
    }

    /// Arm a one-shot deadline that cuts the next `poll` short, for stages
    /// that know exactly when they become ready. Re-arming supersedes any
    /// previous deadline.
    pub fn wake_at(&mut self, t: DateTime<Utc>) {
        self.wake_at = Some(t);
    }

    /// Transmit everything queued. A transport failure here is fatal to
    /// the process's purpose and escalates as [`RunError::DeviceIo`].
    pub async fn flush(&mut self) -> RunResult<()> {
        for (id, w) in &mut self.writers {
            let q = &mut self.outbox[id.idx()];
            while let Some(cmd) = q.pop_front() {
                let mut line = cmd;
                line.push('\n');
                w.write_all(line.as_bytes())
                    .await
                    .map_err(|e| RunError::DeviceIo {
                        channel: *id,
                        source: e,
                    })?;
            }
            w.flush().await.map_err(|e| RunError::DeviceIo {
                channel: *id,
                source: e,
            })?;
        }
        Ok(())
    }

    /// Transmit everything queued, pressing on past dead channels. The
    /// exit paths use this: when one daemon is already gone, the stop
    /// commands must still reach the others.
    pub async fn flush_lossy(&mut self) {
        for (id, w) in &mut self.writers {
            let q = &mut self.outbox[id.idx()];
            while let Some(cmd) = q.pop_front() {
                let mut line = cmd;
                line.push('\n');
                if let Err(e) = w.write_all(line.as_bytes()).await {
                    warn!(channel = %id, %e, "channel lost while stopping");
                    q.clear();
                    break;
                }
            }
            if let Err(e) = w.flush().await {
                warn!(channel = %id, %e, "channel lost while stopping");
            }
        }
    }

    /// Flush queued commands, then wait for channel input (bounded by
    /// `interval` or the armed wake-up deadline, whichever is sooner) and
    /// handle every line that arrives inside the window.
    ///
    /// Returns `Ok(true)` for a fault-free window, `Ok(false)` if any
    /// channel reported a fatal response code, and `Err` only for
    /// transport failures.
    pub async fn poll(&mut self, interval: Duration, now: DateTime<Utc>) -> RunResult<bool> {
        self.flush().await?;

        let mut window = interval;
        if let Some(t) = self.wake_at {
            match t.signed_duration_since(now).to_std() {
                Ok(until) if until < window => window = until,
                Ok(_) => {}
                Err(_) => {
                    // already due
                    self.wake_at = None;
                    window = Duration::ZERO;
                }
            }
        }

        let deadline = tokio::time::Instant::now() + window;
        let mut clean = true;
        loop {
            match tokio::time::timeout_at(deadline, self.merged.next()).await {
                Err(_) => break, // window elapsed
                Ok(None) => {
                    // every stream exhausted; don't spin out the window
                    tokio::time::sleep_until(deadline).await;
                    break;
                }
                Ok(Some((id, line))) => {
                    if !self.handle_line(id, line)? {
                        clean = false;
                    }
                }
            }
        }

        // a deadline that has passed is spent
        if self.wake_at.is_some_and(|t| t <= now) {
            self.wake_at = None;
        }

        Ok(clean)
    }

    fn handle_line(&mut self, id: DeviceId, line: io::Result<String>) -> RunResult<bool> {
        let line = line.map_err(|e| RunError::DeviceIo {
            channel: id,
            source: e,
        })?;

        let Some(resp) = Response::parse(&line) else {
            warn!(channel = %id, %line, "unparsable response line");
            return Ok(true);
        };

        if resp.is_terminal() {
            self.pending[id.idx()] = false;
        }

        if resp.code < 0 {
            error!(channel = %id, code = resp.code, "{}", resp.text);
            Ok(false)
        } else {
            info!(channel = %id, code = resp.code, "{}", resp.text);
            Ok(true)
        }
    }

    /// Shut down all activity. Commands are conditional on what the
    /// installation actually has, mirroring what the daemons tolerate.
    pub fn stop_all(&mut self, status: &DeviceStatus) {
        if status.filter_present {
            self.send_unchecked(DeviceId::Filter, "Stop");
        }
        if status.focus_present {
            self.send_unchecked(DeviceId::Focus, "Stop");
        }
        if status.dome != DomeState::Absent || status.shutter != ShutterState::Absent {
            self.send_unchecked(DeviceId::Dome, "Stop");
        }
        if status.lights > 0 {
            self.send_unchecked(DeviceId::Lights, "0");
        }
        self.send_unchecked(DeviceId::Telescope, "Stop");
        // if the camera is idle this can race with a new command; harmless
        self.send_unchecked(DeviceId::Camera, "Stop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        bus: DeviceBus,
        device_rd: std::collections::HashMap<DeviceId, BufReader<ReadHalf<DuplexStream>>>,
        device_wr: std::collections::HashMap<DeviceId, WriteHalf<DuplexStream>>,
    }

    fn harness() -> Harness {
        let mut links = Vec::new();
        let mut device_rd = std::collections::HashMap::new();
        let mut device_wr = std::collections::HashMap::new();
        for id in DeviceId::ALL {
            let (engine_side, device_side) = duplex(4096);
            let (er, ew) = split(engine_side);
            let (dr, dw) = split(device_side);
            links.push((id, er, ew));
            device_rd.insert(id, BufReader::new(dr));
            device_wr.insert(id, dw);
        }
        Harness {
            bus: DeviceBus::from_links(links),
            device_rd,
            device_wr,
        }
    }

    impl Harness {
        async fn read_cmd(&mut self, id: DeviceId) -> String {
            let mut line = String::new();
            self.device_rd
                .get_mut(&id)
                .unwrap()
                .read_line(&mut line)
                .await
                .unwrap();
            line.trim_end().to_string()
        }

        async fn respond(&mut self, id: DeviceId, line: &str) {
            let w = self.device_wr.get_mut(&id).unwrap();
            w.write_all(format!("{line}\n").as_bytes()).await.unwrap();
            w.flush().await.unwrap();
        }
    }

    const TICK: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_send_sets_pending_and_terminal_response_clears_it() {
        let mut h = harness();
        h.bus.send(DeviceId::Telescope, "Stop").unwrap();
        assert!(h.bus.is_pending(DeviceId::Telescope));
        assert!(h.bus.any_pending());

        assert!(h.bus.poll(TICK, Utc::now()).await.unwrap());
        assert_eq!(h.read_cmd(DeviceId::Telescope).await, "Stop");
        // progress does not clear pending
        h.respond(DeviceId::Telescope, "1 slewing").await;
        assert!(h.bus.poll(TICK, Utc::now()).await.unwrap());
        assert!(h.bus.is_pending(DeviceId::Telescope));
        // terminal does
        h.respond(DeviceId::Telescope, "0 stopped").await;
        assert!(h.bus.poll(TICK, Utc::now()).await.unwrap());
        assert!(!h.bus.is_pending(DeviceId::Telescope));
    }

    #[tokio::test]
    async fn test_send_on_pending_channel_is_rejected() {
        let mut h = harness();
        h.bus.send(DeviceId::Dome, "Open").unwrap();
        match h.bus.send(DeviceId::Dome, "Close") {
            Err(RunError::CommandPending(DeviceId::Dome)) => {}
            other => panic!("expected CommandPending, got {other:?}"),
        }
        // the original command is still the one on the wire
        assert!(h.bus.poll(TICK, Utc::now()).await.unwrap());
        assert_eq!(h.read_cmd(DeviceId::Dome).await, "Open");
    }

    #[tokio::test]
    async fn test_any_pending_excludes_camera() {
        let mut h = harness();
        h.bus.send(DeviceId::Camera, "Expose ...").unwrap();
        assert!(h.bus.is_pending(DeviceId::Camera));
        assert!(!h.bus.any_pending());
    }

    #[tokio::test]
    async fn test_negative_code_reports_fault() {
        let mut h = harness();
        h.bus.send(DeviceId::Focus, "Auto").unwrap();
        assert!(h.bus.poll(TICK, Utc::now()).await.unwrap());
        h.respond(DeviceId::Focus, "-5 motor stalled").await;
        let clean = h.bus.poll(TICK, Utc::now()).await.unwrap();
        assert!(!clean);
        // fatal code is still terminal
        assert!(!h.bus.is_pending(DeviceId::Focus));
    }

    #[tokio::test]
    async fn test_wake_at_cuts_poll_short() {
        let mut h = harness();
        let now = Utc::now();
        h.bus.wake_at(now + chrono::Duration::milliseconds(30));

        let started = tokio::time::Instant::now();
        assert!(h.bus.poll(Duration::from_secs(2), now).await.unwrap());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_eof_is_transport_error() {
        let mut h = harness();
        drop(h.device_wr.remove(&DeviceId::Lights));
        drop(h.device_rd.remove(&DeviceId::Lights));
        match h.bus.poll(TICK, Utc::now()).await {
            Err(RunError::DeviceIo { channel, .. }) => assert_eq!(channel, DeviceId::Lights),
            other => panic!("expected DeviceIo, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_all_is_conditional() {
        let mut h = harness();
        let status = DeviceStatus {
            filter_present: true,
            focus_present: false,
            dome: DomeState::Stopped,
            lights: 2,
            ..DeviceStatus::default()
        };
        h.bus.stop_all(&status);
        h.bus.flush().await.unwrap();

        assert_eq!(h.read_cmd(DeviceId::Filter).await, "Stop");
        assert_eq!(h.read_cmd(DeviceId::Dome).await, "Stop");
        assert_eq!(h.read_cmd(DeviceId::Lights).await, "0");
        assert_eq!(h.read_cmd(DeviceId::Telescope).await, "Stop");
        assert_eq!(h.read_cmd(DeviceId::Camera).await, "Stop");
        assert!(!h.bus.is_pending(DeviceId::Focus));
    }

    #[test]
    fn test_response_parse() {
        let r = Response::parse("0 all stopped").unwrap();
        assert_eq!(r.code, 0);
        assert!(r.is_terminal());
        assert_eq!(r.text, "all stopped");

        let r = Response::parse("-3 hit limit switch").unwrap();
        assert_eq!(r.code, -3);
        assert!(r.is_terminal());

        let r = Response::parse("2").unwrap();
        assert_eq!(r.code, 2);
        assert!(!r.is_terminal());
        assert_eq!(r.text, "");

        assert!(Response::parse("garbled").is_none());
    }
}
