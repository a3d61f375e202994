//! Worker processes started by the supervisor.
//!
//! Every worker runs in its own process group so that a Ctrl+C on the
//! terminal only reaches the supervisor, which then interrupts each worker
//! with SIGINT and gives it time to finish cleanly (e.g. finalise an MP4).

use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta};
use log::{error, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStdout, Command};

use crate::device::format_elapsed;
use crate::error::{Error, Result};

pub const P_INFERENCE: &str = "inference";
pub const P_STREAMING: &str = "streaming";
pub const P_FILESERVER: &str = "file-server";
pub const P_FILESAVE_PREFIX: &str = "file-save-";

/// How long a worker may take to exit after being interrupted.
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub started: DateTime<Local>,
    pub running: bool,
}

/// Bookkeeping of every worker by unique name.
#[derive(Debug, Default)]
pub struct ProcessTable {
    entries: HashMap<String, ProcessInfo>,
}

impl ProcessTable {
    pub fn started(&mut self, name: &str, at: DateTime<Local>) {
        self.entries.insert(
            name.to_string(),
            ProcessInfo {
                started: at,
                running: true,
            },
        );
    }

    /// Marks `name` as ended at `at` and returns how long it ran.
    /// Sequential workers are `forget`-ed so the table does not grow with
    /// every recording.
    pub fn ended(&mut self, name: &str, at: DateTime<Local>, forget: bool) -> Option<TimeDelta> {
        let ran = self
            .entries
            .get(name)
            .filter(|info| info.running)
            .map(|info| at - info.started);
        if forget {
            self.entries.remove(name);
        } else if let Some(info) = self.entries.get_mut(name) {
            info.running = false;
        }
        ran
    }

    pub fn get(&self, name: &str) -> Option<&ProcessInfo> {
        self.entries.get(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.get(name).map(|info| info.running).unwrap_or(false)
    }

    /// Time since `name` started, only while it is running.
    pub fn runtime(&self, name: &str, now: DateTime<Local>) -> Option<TimeDelta> {
        self.get(name)
            .filter(|info| info.running)
            .map(|info| now - info.started)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// What to run for a worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Pipe stdout back to the supervisor instead of inheriting it.
    pub capture_stdout: bool,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, program: impl Into<OsString>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            capture_stdout: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }
}

/// A running worker process.
#[derive(Debug)]
pub struct Worker {
    name: String,
    child: Child,
}

impl Worker {
    /// Launches the worker and records it in `table`.
    pub fn spawn(spec: WorkerSpec, table: &mut ProcessTable) -> Result<Worker> {
        let stdout = if spec.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::inherit()
        };
        let mut command = std::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .process_group(0);
        let child = Command::from(command)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                name: spec.name.clone(),
                source,
            })?;

        table.started(&spec.name, Local::now());
        info!("Process {} started with PID: {:?}", spec.name, child.id());
        Ok(Worker {
            name: spec.name,
            child,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("Process {} exited with: {}", self.name, status);
                false
            }
            Err(e) => {
                error!("Failed to check status of process {}: {}", self.name, e);
                false
            }
        }
    }

    /// Interrupts the worker and waits for it, force-killing it after
    /// `timeout`. The entry in `table` is marked ended, or removed when
    /// `forget` is set.
    pub async fn terminate(
        mut self,
        timeout: Duration,
        table: &mut ProcessTable,
        forget: bool,
    ) -> Result<()> {
        let result = self.interrupt_and_wait(timeout).await;
        let ran = table.ended(&self.name, Local::now(), forget);
        info!(
            "Process terminated: {} (runtime: {})",
            self.name,
            format_elapsed(ran)
        );
        result
    }

    async fn interrupt_and_wait(&mut self, timeout: Duration) -> Result<()> {
        if let Some(pid) = self.child.id() {
            info!("Sending interrupt to {} process", self.name);
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                warn!("Failed to interrupt process {}: {}", self.name, e);
            }
        }

        info!("Waiting for process {} to terminate...", self.name);
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                status?;
                Ok(())
            }
            Err(_) => {
                warn!("Forcing termination of process: {}", self.name);
                self.child.kill().await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_runtime_only_while_running() {
        let mut table = ProcessTable::default();
        let start = Local::now();
        table.started(P_INFERENCE, start);

        let later = start + TimeDelta::seconds(90);
        assert_eq!(table.runtime(P_INFERENCE, later), Some(TimeDelta::seconds(90)));

        assert_eq!(
            table.ended(P_INFERENCE, later, false),
            Some(TimeDelta::seconds(90))
        );
        assert!(!table.is_running(P_INFERENCE));
        assert_eq!(table.runtime(P_INFERENCE, later), None);
        // Already ended
        assert_eq!(table.ended(P_INFERENCE, later, false), None);
    }

    #[test]
    fn test_table_forgets_sequential_workers() {
        let mut table = ProcessTable::default();
        let now = Local::now();
        table.started("file-save-1", now);
        table.started("file-save-2", now);
        table.ended("file-save-1", now, true);

        assert_eq!(table.len(), 1);
        assert!(table.get("file-save-1").is_none());
    }

    #[test]
    fn test_restart_replaces_entry() {
        let mut table = ProcessTable::default();
        let first = Local::now();
        table.started(P_STREAMING, first);
        table.ended(P_STREAMING, first, false);
        let second = first + TimeDelta::seconds(5);
        table.started(P_STREAMING, second);

        assert_eq!(table.len(), 1);
        assert!(table.is_running(P_STREAMING));
        assert_eq!(table.get(P_STREAMING).unwrap().started, second);
    }

    #[tokio::test]
    async fn test_terminate_interrupts_worker() {
        let mut table = ProcessTable::default();
        let spec = WorkerSpec::new("sleeper", "sleep").arg("30");
        let mut worker = Worker::spawn(spec, &mut table).unwrap();
        assert!(worker.is_alive());
        assert!(table.is_running("sleeper"));

        worker
            .terminate(Duration::from_secs(5), &mut table, false)
            .await
            .unwrap();
        assert!(!table.is_running("sleeper"));
    }

    #[tokio::test]
    async fn test_force_kill_after_timeout() {
        let mut table = ProcessTable::default();
        let spec = WorkerSpec::new("stubborn", "sh")
            .arg("-c")
            .arg("trap '' INT; sleep 30");
        let worker = Worker::spawn(spec, &mut table).unwrap();
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        worker
            .terminate(Duration::from_millis(300), &mut table, true)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(table.get("stubborn").is_none());
    }

    #[tokio::test]
    async fn test_detects_exited_worker() {
        let mut table = ProcessTable::default();
        let mut worker = Worker::spawn(WorkerSpec::new("short", "true"), &mut table).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!worker.is_alive());
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let mut table = ProcessTable::default();
        let spec = WorkerSpec::new("ghost", "/nonexistent/maskcam-worker");
        let err = Worker::spawn(spec, &mut table).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert!(table.get("ghost").is_none());
    }
}
