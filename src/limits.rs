use serde::{Deserialize, Serialize};
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Appended to a captured stream that hit the output cap.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Slack given to the interpreter's own alarm before the host kills the process group.
const HOST_GRACE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8192;

/// Per-execution resource limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock limit; zero or negative disables it
    pub timeout_seconds: f64,
    /// Address-space ceiling for the interpreter process (Unix, not macOS)
    pub max_memory_bytes: Option<u64>,
    /// Cap applied to stdout and stderr separately
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout_seconds: 30.0,
            max_memory_bytes: None,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_seconds > 0.0 {
            Duration::try_from_secs_f64(self.timeout_seconds).ok()
        } else {
            None
        }
    }

    fn host_deadline(&self) -> Option<Duration> {
        self.timeout().map(|t| t.saturating_add(HOST_GRACE))
    }
}

/// Bytes read from one child stream, at most the configured cap.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl CapturedStream {
    pub fn into_text(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// What happened to a supervised child.
#[derive(Debug)]
pub struct ChildOutcome {
    /// `None` only when the child could not be reaped after a kill
    pub status: Option<ExitStatus>,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub timed_out: bool,
}

/// Applies [`ResourceLimits`] to one interpreter process.
pub struct ResourceLimiter<'a> {
    limits: &'a ResourceLimits,
}

impl<'a> ResourceLimiter<'a> {
    pub fn new(limits: &'a ResourceLimits) -> Self {
        Self { limits }
    }

    /// Put the child in its own process group and cap its address space.
    #[cfg(unix)]
    pub fn configure(&self, cmd: &mut Command) {
        #[cfg(not(target_os = "macos"))]
        let memory_bytes = self.limits.max_memory_bytes;

        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }

                // RLIMIT_AS is not enforced on macOS
                #[cfg(not(target_os = "macos"))]
                {
                    if let Some(bytes) = memory_bytes {
                        let rlimit = libc::rlimit {
                            rlim_cur: bytes as libc::rlim_t,
                            rlim_max: bytes as libc::rlim_t,
                        };
                        if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                            return Err(io::Error::last_os_error());
                        }
                    }
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    pub fn configure(&self, _cmd: &mut Command) {
        // No process groups or rlimits; the host deadline and kill_on_drop still apply.
    }

    /// Drain the child's pipes under the output cap and wait for it under the deadline.
    ///
    /// On expiry the whole process group is killed and the output read so far is kept.
    pub async fn supervise(&self, mut child: Child) -> io::Result<ChildOutcome> {
        let mut guard = ProcessGroupGuard::new(child.id());
        let cap = self.limits.max_output_bytes;
        let stdout_task = tokio::spawn(drain_capped(child.stdout.take(), cap));
        let stderr_task = tokio::spawn(drain_capped(child.stderr.take(), cap));

        let (status, timed_out) = match self.limits.host_deadline() {
            Some(deadline) => match tokio::time::timeout(deadline, child.wait()).await {
                Ok(status) => (Some(status?), false),
                Err(_) => {
                    warn!(
                        "[SANDBOX] interpreter exceeded {:.2}s deadline, killing process group",
                        deadline.as_secs_f64()
                    );
                    guard.kill();
                    if let Err(e) = child.start_kill() {
                        debug!("[SANDBOX] child already gone: {}", e);
                    }
                    (child.wait().await.ok(), true)
                }
            },
            None => (Some(child.wait().await?), false),
        };
        guard.disarm();

        let stdout = join_drain(stdout_task).await?;
        let stderr = join_drain(stderr_task).await?;

        Ok(ChildOutcome {
            status,
            stdout,
            stderr,
            timed_out,
        })
    }
}

async fn join_drain(
    task: tokio::task::JoinHandle<io::Result<CapturedStream>>,
) -> io::Result<CapturedStream> {
    task.await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("output reader failed: {}", e)))?
}

/// Read `reader` to EOF, keeping at most `cap` bytes. The rest is discarded
/// so the pipe never fills.
pub async fn drain_capped<R>(reader: Option<R>, cap: usize) -> io::Result<CapturedStream>
where
    R: AsyncRead + Unpin,
{
    let mut captured = CapturedStream::default();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok(captured)
}

/// Kills the child's process group when dropped, unless disarmed first.
pub struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    pub fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    pub fn disarm(&mut self) {
        self.pgid = None;
    }

    pub fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                debug!("[SANDBOX] killpg({}) failed: {}", pgid, e);
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}
