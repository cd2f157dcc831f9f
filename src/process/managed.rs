use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Executable and arguments for a server the bridge starts itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a `--name value` pair
    pub fn flag(mut self, name: &str, value: impl Into<String>) -> Self {
        self.args.push(format!("--{}", name));
        self.args.push(value.into());
        self
    }
}

impl fmt::Display for SpawnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A child process the bridge is responsible for terminating
///
/// `terminate` consumes the handle, so a process is terminated at most once.
/// If the handle is dropped instead, tokio kills the child.
pub struct ManagedProcess {
    child: Child,
    pid: Option<u32>,
}

impl ManagedProcess {
    /// Launch the process described by `spec`
    ///
    /// The child's stdout and stderr are forwarded to the log at debug level
    /// so they never mix with protocol traffic on our own stdout.
    pub fn spawn(spec: &SpawnSpec) -> Result<Self> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch {}", spec.program.display()))?;

        let pid = child.id();
        info!("[PROCESS] Started {} (pid {:?})", spec, pid);

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        Ok(Self { child, pid })
    }

    /// OS process id, if known
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Stop the process: SIGTERM, wait up to `grace`, then kill
    ///
    /// Returns the exit status once the process is gone.
    pub async fn terminate(mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            debug!("[PROCESS] pid {:?} already exited: {}", self.pid, status);
            return Ok(status);
        }

        if self.signal_terminate() {
            match timeout(grace, self.child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    info!("[PROCESS] pid {:?} exited: {}", self.pid, status);
                    return Ok(status);
                }
                Err(_) => {
                    warn!(
                        "[PROCESS] pid {:?} still running {:?} after SIGTERM, killing",
                        self.pid, grace
                    );
                }
            }
        }

        self.child.start_kill()?;
        let status = self.child.wait().await?;
        info!("[PROCESS] pid {:?} killed: {}", self.pid, status);
        Ok(status)
    }

    #[cfg(unix)]
    fn signal_terminate(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return false;
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                warn!("[PROCESS] SIGTERM to pid {} failed: {}", pid, e);
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) -> bool {
        false
    }
}

fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[SERVER:{}] {}", stream, line);
        }
    });
}
