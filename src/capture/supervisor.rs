//! Render subprocess supervision
//!
//! The supervisor launches the renderer with
//! `[command...] <script> <payload> <output>`, forwards its output into the
//! log, and enforces a hard timeout. It never retries.
//!
//! On unix the renderer leads its own process group, so a timeout reaches the
//! browser it launched as well: the group gets `SIGTERM`, then `SIGKILL` once
//! [`TERM_GRACE`] has passed.

use crate::error::ConfigError;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Time the renderer gets to close its browser after `SIGTERM`
pub const TERM_GRACE: Duration = Duration::from_secs(2);

/// How a renderer process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited on its own with this code
    Exited(i32),
    /// The process ran past the timeout and was killed
    TimedOut {
        /// Limit that was exceeded
        after_ms: u64,
    },
    /// The process could not be started or waited on
    SpawnFailed(String),
}

/// Launches renderer processes under a timeout
#[derive(Debug, Clone)]
pub struct Supervisor {
    command: Vec<String>,
    script: String,
    timeout: Duration,
}

impl Supervisor {
    /// Create a supervisor for a resolved command line
    pub fn new(
        command: Vec<String>,
        script: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        Ok(Self {
            command,
            script: script.into(),
            timeout,
        })
    }

    /// Configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Full argument vector for one invocation, program first
    pub fn argv(&self, payload: &str, output: &Path) -> Vec<String> {
        let mut argv = self.command.clone();
        if !self.script.is_empty() {
            argv.push(self.script.clone());
        }
        argv.push(payload.to_string());
        argv.push(output.display().to_string());
        argv
    }

    /// Run the renderer once and report how it ended
    #[instrument(skip(self, payload))]
    pub async fn invoke(&self, payload: &str, output: &Path) -> ProcessExit {
        let argv = self.argv(payload, output);
        debug!("Launching renderer: {:?}", argv);

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn renderer {}: {}", argv[0], e);
                return ProcessExit::SpawnFailed(format!("{}: {}", argv[0], e));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let code = exit_code(status);
                info!("Renderer exited with status {}", code);
                ProcessExit::Exited(code)
            }
            Ok(Err(e)) => {
                warn!("Failed waiting for renderer: {}", e);
                ProcessExit::SpawnFailed(format!("wait failed: {}", e))
            }
            Err(_) => {
                let after_ms = self.timeout.as_millis() as u64;
                warn!("Renderer timed out after {}ms, terminating it", after_ms);
                terminate(&mut child).await;
                ProcessExit::TimedOut { after_ms }
            }
        }
    }
}

/// Stop a timed-out renderer and everything in its process group, then reap it
#[cfg(unix)]
async fn terminate(child: &mut tokio::process::Child) {
    let Some(pid) = child.id() else {
        return;
    };
    signal_group(pid, libc::SIGTERM);

    let exited = match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(_) => {
            debug!("Renderer exited after SIGTERM");
            true
        }
        Err(_) => {
            warn!("Renderer ignored SIGTERM for {:?}", TERM_GRACE);
            false
        }
    };

    // Stragglers such as browser helpers survive their leader otherwise
    signal_group(pid, libc::SIGKILL);
    if !exited {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill renderer: {}", e);
        }
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut tokio::process::Child) {
    // kill() also reaps the child
    if let Err(e) = child.kill().await {
        warn!("Failed to kill renderer: {}", e);
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only signals that process group
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("Failed to signal process group {}: {}", pgid, err);
        }
    }
}

async fn forward_lines<R>(stream: R, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream = name, "renderer: {}", line);
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn supervisor(command: &[&str], timeout_ms: u64) -> Supervisor {
        Supervisor::new(
            command.iter().map(|s| s.to_string()).collect(),
            "screenshot/1",
            Duration::from_millis(timeout_ms),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_command_rejected() {
        let result = Supervisor::new(Vec::new(), "screenshot/1", Duration::from_secs(1));
        assert!(matches!(result, Err(ConfigError::EmptyCommand)));
    }

    #[test]
    fn test_argv_layout() {
        let sup = supervisor(&["xvfb-run", "shotcache-render"], 1000);
        let argv = sup.argv("eyJ1cmwiOiIifQ==", &PathBuf::from("/tmp/a.png"));
        assert_eq!(
            argv,
            vec![
                "xvfb-run",
                "shotcache-render",
                "screenshot/1",
                "eyJ1cmwiOiIifQ==",
                "/tmp/a.png"
            ]
        );
    }

    #[test]
    fn test_argv_without_script() {
        let sup = Supervisor::new(vec!["render".to_string()], "", Duration::from_secs(1)).unwrap();
        assert_eq!(
            sup.argv("p", &PathBuf::from("/o.png")),
            vec!["render", "p", "/o.png"]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let sup = supervisor(&["/nonexistent/shotcache-render"], 1000);
        let exit = sup.invoke("payload", Path::new("/tmp/never.png")).await;
        assert!(matches!(exit, ProcessExit::SpawnFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_propagated() {
        let sup = supervisor(&["sh", "-c", "exit 3"], 5000);
        let exit = sup.invoke("payload", Path::new("/tmp/never.png")).await;
        assert_eq!(exit, ProcessExit::Exited(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_child() {
        let sup = supervisor(&["sh", "-c", "exec sleep 30"], 200);
        let start = std::time::Instant::now();
        let exit = sup.invoke("payload", Path::new("/tmp/never.png")).await;
        assert_eq!(exit, ProcessExit::TimedOut { after_ms: 200 });
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    fn running(pid: u32) -> bool {
        // Zombies still have a /proc entry
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .map_or(false, |state| state != "Z" && state != "X"),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("sleep 300 & echo $! > {}; wait", pid_file.display());
        let sup = supervisor(&["sh", "-c", &script], 500);

        let exit = sup.invoke("payload", Path::new("/tmp/never.png")).await;
        assert_eq!(exit, ProcessExit::TimedOut { after_ms: 500 });

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while running(pid) && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!running(pid), "grandchild {} outlived the timeout", pid);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_term_ignoring_renderer_is_killed() {
        let sup = supervisor(&["sh", "-c", "trap '' TERM; while :; do sleep 1; done"], 200);
        let start = std::time::Instant::now();
        let exit = sup.invoke("payload", Path::new("/tmp/never.png")).await;
        assert_eq!(exit, ProcessExit::TimedOut { after_ms: 200 });
        assert!(start.elapsed() < TERM_GRACE + Duration::from_secs(5));
    }
}
