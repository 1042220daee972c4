//! Process-based governor: one interpreter per execution, OS limits, watchdog supervision

use super::{RawExecutionRecord, ResourceGovernor, TerminationCause, WallClockStart};
use crate::error::GovernorError;
use crate::launch::LaunchCommand;
use crate::limits::ResourceLimits;
use async_trait::async_trait;
use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_READER_GRACE: Duration = Duration::from_millis(100);
const MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;
const MAX_OPEN_FILES: u64 = 64;
const MAX_PROCESSES: u64 = 64;

/// OS limits installed in the child between fork and exec
#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    cpu_seconds: u64,
    address_space: u64,
}

macro_rules! set_rlimit {
    ($resource:expr, $soft:expr, $hard:expr) => {{
        let limit = libc::rlimit {
            rlim_cur: $soft as libc::rlim_t,
            rlim_max: $hard as libc::rlim_t,
        };
        if unsafe { libc::setrlimit($resource, &limit) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }};
}

impl RlimitPlan {
    fn from_limits(limits: &ResourceLimits) -> Self {
        Self {
            cpu_seconds: limits.cpu_seconds(),
            address_space: limits.max_memory_bytes,
        }
    }

    /// Runs in the forked child; only async-signal-safe calls allowed
    fn apply(&self) -> io::Result<()> {
        // SIGXCPU at the soft limit, SIGKILL one second later
        set_rlimit!(libc::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1);

        #[cfg(any(target_os = "linux", target_os = "android"))]
        set_rlimit!(libc::RLIMIT_AS, self.address_space, self.address_space);

        set_rlimit!(libc::RLIMIT_CORE, 0, 0);
        set_rlimit!(libc::RLIMIT_FSIZE, MAX_FILE_BYTES, MAX_FILE_BYTES);
        set_rlimit!(libc::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES);
        set_rlimit!(libc::RLIMIT_NPROC, MAX_PROCESSES, MAX_PROCESSES);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Captured>>;

fn lock(capture: &SharedCapture) -> std::sync::MutexGuard<'_, Captured> {
    capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drain `source` to EOF, keeping at most `cap` bytes. Signals `overflow` once.
fn drain_capped(mut source: impl Read, cap: usize, sink: SharedCapture, overflow: Arc<Notify>) {
    let mut buf = [0u8; 8192];
    let mut signalled = false;

    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let over = {
                    let mut captured = lock(&sink);
                    let room = cap.saturating_sub(captured.bytes.len());
                    captured.bytes.extend_from_slice(&buf[..n.min(room)]);
                    if n > room {
                        captured.truncated = true;
                    }
                    captured.truncated
                };
                if over && !signalled {
                    signalled = true;
                    overflow.notify_one();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

#[derive(Debug)]
struct Reaped {
    status: libc::c_int,
    cpu_time_ms: u64,
    peak_memory_bytes: u64,
}

fn timeval_ms(tv: libc::timeval) -> u64 {
    (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000
}

/// Block until `pid` exits, then reap it and collect its rusage.
///
/// The rest of the process group is killed in between, while the unreaped leader still pins
/// the group id.
fn reap(pid: libc::pid_t) -> io::Result<Reaped> {
    // SAFETY: siginfo_t is plain old data; waitid fills it in
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    kill_group(pid);

    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data; wait4 fills it in
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    #[cfg(target_os = "macos")]
    let peak_memory_bytes = usage.ru_maxrss.max(0) as u64;
    #[cfg(not(target_os = "macos"))]
    let peak_memory_bytes = (usage.ru_maxrss.max(0) as u64) * 1024;

    Ok(Reaped {
        status,
        cpu_time_ms: timeval_ms(usage.ru_utime) + timeval_ms(usage.ru_stime),
        peak_memory_bytes,
    })
}

fn kill_group(pid: libc::pid_t) {
    // ESRCH once the group is gone is expected
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
}

/// Process-based governor
pub struct ProcessGovernor {
    spawned: AtomicU64,
    reader_grace: Duration,
}

impl ProcessGovernor {
    pub fn new() -> Self {
        Self {
            spawned: AtomicU64::new(0),
            reader_grace: DEFAULT_READER_GRACE,
        }
    }

    /// How long to wait for output readers after the child is reaped
    pub fn with_reader_grace(mut self, grace: Duration) -> Self {
        self.reader_grace = grace;
        self
    }

    fn spawn_reader(
        &self,
        source: Option<impl Read + Send + 'static>,
        cap: usize,
        overflow: Arc<Notify>,
    ) -> (SharedCapture, Option<JoinHandle<()>>) {
        let sink = SharedCapture::default();
        let handle = source.map(|source| {
            let sink = sink.clone();
            tokio::task::spawn_blocking(move || drain_capped(source, cap, sink, overflow))
        });
        (sink, handle)
    }

    async fn collect(&self, sink: SharedCapture, handle: Option<JoinHandle<()>>) -> Captured {
        if let Some(handle) = handle {
            if tokio::time::timeout(self.reader_grace, handle).await.is_err() {
                tracing::debug!("output reader still blocked after grace period");
            }
        }
        std::mem::take(&mut *lock(&sink))
    }
}

impl Default for ProcessGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGovernor {
    async fn supervise(
        &self,
        command: &LaunchCommand,
        limits: &ResourceLimits,
        cancel: CancellationToken,
        on_start: Option<WallClockStart>,
    ) -> Result<RawExecutionRecord, GovernorError> {
        let spawn_error = |source: io::Error| GovernorError::Spawn {
            program: command.program.clone(),
            source,
        };

        let workdir = tempfile::Builder::new()
            .prefix("jester-")
            .tempdir()
            .map_err(spawn_error)?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env_clear()
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let plan = RlimitPlan::from_limits(limits);
        // SAFETY: the hook only calls setrlimit, which is async-signal-safe
        unsafe {
            cmd.pre_exec(move || plan.apply());
        }

        let started = tokio::time::Instant::now();
        let mut child = cmd.spawn().map_err(spawn_error)?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        if let Some(hook) = on_start {
            hook(started);
        }

        let pid = child.id();
        let raw_pid = pid as libc::pid_t;
        tracing::debug!(pid, program = %command.program, "spawned sandboxed child");

        let cap = usize::try_from(limits.max_output_bytes).unwrap_or(usize::MAX);
        let overflow = Arc::new(Notify::new());
        let (stdout_sink, stdout_task) = self.spawn_reader(child.stdout.take(), cap, overflow.clone());
        let (stderr_sink, stderr_task) = self.spawn_reader(child.stderr.take(), cap, overflow.clone());
        // wait4 below reaps the child; the handle only owned the pipes
        drop(child);

        let mut reaper = tokio::task::spawn_blocking(move || reap(raw_pid));
        let deadline = started + limits.wall_duration();

        let mut termination = TerminationCause::Exited;
        let mut reaped = None;
        tokio::select! {
            result = &mut reaper => reaped = Some(result),
            _ = cancel.cancelled() => termination = TerminationCause::Cancelled,
            _ = overflow.notified() => termination = TerminationCause::OutputLimit,
            _ = tokio::time::sleep_until(deadline) => termination = TerminationCause::WallClock,
        }

        if termination != TerminationCause::Exited {
            tracing::debug!(pid, ?termination, "watchdog killing process group");
            kill_group(raw_pid);
        }

        let reaped = match reaped {
            Some(result) => result,
            None => reaper.await,
        };
        let wall_time_ms = started.elapsed().as_millis() as u64;

        let reaped = reaped
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
            .and_then(|result| result)
            .map_err(|source| GovernorError::Wait { pid, source })?;

        let stdout = self.collect(stdout_sink, stdout_task).await;
        let stderr = self.collect(stderr_sink, stderr_task).await;

        let status = reaped.status;
        let (exit_code, signal) = if libc::WIFEXITED(status) {
            (Some(libc::WEXITSTATUS(status)), None)
        } else if libc::WIFSIGNALED(status) {
            (None, Some(libc::WTERMSIG(status)))
        } else {
            (None, None)
        };

        // overflow can be noticed by a reader after the child already exited
        if termination == TerminationCause::Exited && (stdout.truncated || stderr.truncated) {
            termination = TerminationCause::OutputLimit;
        }

        drop(workdir);

        Ok(RawExecutionRecord {
            stdout: stdout.bytes,
            stderr: stderr.bytes,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            exit_code,
            signal,
            termination,
            wall_time_ms,
            cpu_time_ms: reaped.cpu_time_ms,
            peak_memory_bytes: reaped.peak_memory_bytes,
            pid: Some(pid),
        })
    }
}

#[async_trait]
impl ResourceGovernor for ProcessGovernor {
    async fn run(
        &self,
        command: &LaunchCommand,
        limits: &ResourceLimits,
        cancel: CancellationToken,
    ) -> Result<RawExecutionRecord, GovernorError> {
        self.supervise(command, limits, cancel, None).await
    }

    async fn run_observed(
        &self,
        command: &LaunchCommand,
        limits: &ResourceLimits,
        cancel: CancellationToken,
        on_start: WallClockStart,
    ) -> Result<RawExecutionRecord, GovernorError> {
        self.supervise(command, limits, cancel, Some(on_start)).await
    }

    fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    fn name(&self) -> &str {
        "process"
    }
}
