//! External tool invocation (image postprocessing, calibration composites).
//!
//! Tools run as child processes and are polled each engine tick rather
//! than awaited, so a long composite build never blocks device traffic.

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};

use tracing::{debug, warn};

use crate::error::{RunError, RunResult};

/// Opaque handle to a submitted tool invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ToolHandle(u64);

/// State of a submitted tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolState {
    Running,
    Exited(i32),
}

/// Launches and polls external programs. Abstract so scenario tests can
/// script completions without forking anything.
pub trait ToolRunner {
    /// Start `argv[0]` with the remaining arguments. No shell is involved.
    fn submit(&mut self, argv: &[String]) -> RunResult<ToolHandle>;

    /// Non-blocking check. A handle stays valid until it reports
    /// `Exited`; polling after that is a caller bug and reports the same
    /// exit again.
    fn poll(&mut self, handle: ToolHandle) -> RunResult<ToolState>;
}

/// The real runner.
#[derive(Default)]
pub struct ProcessRunner {
    next_id: u64,
    children: HashMap<u64, Child>,
    exited: HashMap<u64, i32>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ToolRunner for ProcessRunner {
    fn submit(&mut self, argv: &[String]) -> RunResult<ToolHandle> {
        let Some((prog, args)) = argv.split_first() else {
            return Err(RunError::ExternalTool("empty command line".into()));
        };
        debug!(cmd = %argv.join(" "), "launch tool");
        let child = Command::new(prog)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RunError::ExternalTool(format!("{prog}: {e}")))?;
        let id = self.next_id;
        self.next_id += 1;
        self.children.insert(id, child);
        Ok(ToolHandle(id))
    }

    fn poll(&mut self, handle: ToolHandle) -> RunResult<ToolState> {
        if let Some(code) = self.exited.get(&handle.0) {
            return Ok(ToolState::Exited(*code));
        }
        let Some(child) = self.children.get_mut(&handle.0) else {
            return Err(RunError::ExternalTool(format!(
                "unknown tool handle {}",
                handle.0
            )));
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or_else(|| {
                    warn!("tool killed by signal");
                    -1
                });
                self.children.remove(&handle.0);
                self.exited.insert(handle.0, code);
                Ok(ToolState::Exited(code))
            }
            Ok(None) => Ok(ToolState::Running),
            Err(e) => Err(RunError::ExternalTool(e.to_string())),
        }
    }
}

/// Scripted runner for tests: records submitted command lines and reports
/// exit codes on a configurable schedule.
#[derive(Default)]
pub struct MockRunner {
    next_id: u64,
    pub submitted: Vec<Vec<String>>,
    /// handle id -> (polls remaining before exit, exit code)
    plans: HashMap<u64, (u32, i32)>,
    /// applied to each new submission
    pub next_plan: (u32, i32),
    /// when set, submissions fail outright
    pub fail_submit: bool,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            next_plan: (0, 0),
            ..Self::default()
        }
    }
}

impl ToolRunner for MockRunner {
    fn submit(&mut self, argv: &[String]) -> RunResult<ToolHandle> {
        if self.fail_submit {
            return Err(RunError::ExternalTool("scripted submit failure".into()));
        }
        self.submitted.push(argv.to_vec());
        let id = self.next_id;
        self.next_id += 1;
        self.plans.insert(id, self.next_plan);
        Ok(ToolHandle(id))
    }

    fn poll(&mut self, handle: ToolHandle) -> RunResult<ToolState> {
        let Some((left, code)) = self.plans.get_mut(&handle.0) else {
            return Err(RunError::ExternalTool(format!(
                "unknown tool handle {}",
                handle.0
            )));
        };
        if *left == 0 {
            Ok(ToolState::Exited(*code))
        } else {
            *left -= 1;
            Ok(ToolState::Running)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_process_runner_runs_to_exit() {
        let mut runner = ProcessRunner::new();
        let h = runner.submit(&args(&["true"])).unwrap();
        loop {
            match runner.poll(h).unwrap() {
                ToolState::Running => std::thread::sleep(std::time::Duration::from_millis(5)),
                ToolState::Exited(code) => {
                    assert_eq!(code, 0);
                    break;
                }
            }
        }
        // exit code is sticky
        assert_eq!(runner.poll(h).unwrap(), ToolState::Exited(0));
    }

    #[test]
    fn test_process_runner_nonzero_exit() {
        let mut runner = ProcessRunner::new();
        let h = runner.submit(&args(&["false"])).unwrap();
        loop {
            if let ToolState::Exited(code) = runner.poll(h).unwrap() {
                assert_ne!(code, 0);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn test_process_runner_missing_program() {
        let mut runner = ProcessRunner::new();
        let err = runner.submit(&args(&["/no/such/program"])).unwrap_err();
        assert!(matches!(err, RunError::ExternalTool(_)));
    }

    #[test]
    fn test_mock_runner_schedule() {
        let mut runner = MockRunner::new();
        runner.next_plan = (2, 3);
        let h = runner.submit(&args(&["postprocess", "x.fts"])).unwrap();
        assert_eq!(runner.poll(h).unwrap(), ToolState::Running);
        assert_eq!(runner.poll(h).unwrap(), ToolState::Running);
        assert_eq!(runner.poll(h).unwrap(), ToolState::Exited(3));
        assert_eq!(runner.submitted.len(), 1);
        assert_eq!(runner.submitted[0][0], "postprocess");
    }
}
