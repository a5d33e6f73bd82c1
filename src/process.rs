use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::error::{AgentResult, ServerFault};

const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        ExitInfo {
            code: status.code(),
            signal,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

/// One line of child output, already split on newlines. A partial final
/// line is flushed at EOF.
#[derive(Debug, Clone)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Thin wrapper over a spawned server child: streams stdout/stderr as
/// lines, observes exit, and escalates termination from graceful to forced.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    /// Spawn `program` with `args` and extra environment entries. Stdin is
    /// closed; stdout/stderr are piped and pumped by background tasks.
    pub fn spawn(
        program: &Path,
        args: &[String],
        cwd: Option<&Path>,
        envs: &[(String, String)],
    ) -> AgentResult<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = cmd.spawn().map_err(ServerFault::Spawn)?;
        let pid = child.id().unwrap_or(0);

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        if let Some(stdout) = child.stdout.take() {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Stdout(line)).is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = line_tx;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Stderr(line)).is_err() {
                        break;
                    }
                }
            });
        }

        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    tracing::warn!("wait() on child {} failed: {}", pid, e);
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            let _ = exit_tx.send(Some(info));
        });

        Ok(ProcessHandle {
            pid,
            output: Some(line_rx),
            exit: exit_rx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Hand the output stream to the single consumer. Returns None on the
    /// second call.
    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<OutputLine>> {
        self.output.take()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit.clone()
    }

    /// Exit info if the child is already gone.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Signal-0 probe. On non-unix platforms exit observation is the only
    /// liveness source, so unknown pids read as alive.
    pub fn is_alive(pid: u32) -> bool {
        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(pid as i32, 0) };
            if rc == 0 {
                return true;
            }
            std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            true
        }
    }

    /// Request graceful termination, poll liveness at 100 ms, and
    /// force-kill once `grace` has elapsed. Returns when the OS confirms
    /// the pid is gone; "no such process" counts as success.
    pub async fn kill(&self, grace: Duration) -> AgentResult<()> {
        if self.exit_info().is_some() {
            return Ok(());
        }

        self.terminate_gracefully();

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.gone() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(LIVENESS_POLL).await;
        }

        tracing::warn!(
            "child {} did not exit within {:?}, force-killing",
            self.pid,
            grace
        );
        self.terminate_forcefully();

        loop {
            if self.gone() {
                return Ok(());
            }
            tokio::time::sleep(LIVENESS_POLL).await;
        }
    }

    fn gone(&self) -> bool {
        self.exit_info().is_some() || !Self::is_alive(self.pid)
    }

    fn terminate_gracefully(&self) {
        #[cfg(unix)]
        unsafe {
            libc::kill(self.pid as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            // Best-effort graceful close; no console-event plumbing here.
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", &self.pid.to_string()])
                .output();
        }
    }

    fn terminate_forcefully(&self) {
        #[cfg(unix)]
        unsafe {
            libc::kill(self.pid as i32, libc::SIGKILL);
        }
        #[cfg(not(unix))]
        {
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", &self.pid.to_string(), "/F"])
                .output();
        }
    }
}
