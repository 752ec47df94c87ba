use std::io;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};

const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct CapturedOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl CapturedOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Exited(CapturedOutput),
    /// The wall-clock bound elapsed and the process group was terminated.
    TimedOut(CapturedOutput),
}

/// Spawns `cmd` with piped output, capturing at most `max_bytes` per stream.
///
/// The child runs in its own process group so that expiry of `limit` tears down
/// anything it started. Dropping the returned future kills the child.
pub async fn run_captured(
    cmd: &mut Command,
    limit: Duration,
    max_bytes: usize,
    label: &str,
) -> anyhow::Result<RunOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    apply_process_group(cmd);
    let mut child = cmd.spawn().with_context(|| format!("spawn {label}"))?;

    let stdout = child.stdout.take().context("missing stdout")?;
    let stderr = child.stderr.take().context("missing stderr")?;
    let stdout_task = tokio::spawn(read_capped(stdout, max_bytes));
    let stderr_task = tokio::spawn(read_capped(stderr, max_bytes));

    let (exit_code, timed_out) = match timeout(limit, child.wait()).await {
        Ok(status) => {
            let status = status.with_context(|| format!("wait on {label}"))?;
            (status.code(), false)
        }
        Err(_) => {
            let status = terminate_child(&mut child).await;
            (status.and_then(|status| status.code()), true)
        }
    };

    let (stdout, stdout_truncated) = drain(stdout_task).await;
    let (stderr, stderr_truncated) = drain(stderr_task).await;
    let captured = CapturedOutput {
        exit_code,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
    };
    Ok(if timed_out {
        RunOutcome::TimedOut(captured)
    } else {
        RunOutcome::Exited(captured)
    })
}

async fn drain(task: tokio::task::JoinHandle<io::Result<(Vec<u8>, bool)>>) -> (Vec<u8>, bool) {
    match timeout(DRAIN_GRACE, task).await {
        Ok(Ok(Ok(captured))) => captured,
        _ => (Vec::new(), false),
    }
}

pub async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> io::Result<(Vec<u8>, bool)> {
    let mut buffer = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if buffer.len() < max_bytes {
            let remaining = max_bytes - buffer.len();
            let to_copy = remaining.min(n);
            buffer.extend_from_slice(&chunk[..to_copy]);
            if to_copy < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }
    Ok((buffer, truncated))
}

#[cfg(unix)]
fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: i32) {}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

async fn terminate_child(child: &mut Child) -> Option<std::process::ExitStatus> {
    signal_group(child, SIGTERM);
    if let Ok(status) = timeout(TERMINATE_GRACE, child.wait()).await {
        return status.ok();
    }
    signal_group(child, SIGKILL);
    let _ = child.kill().await;
    match timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => None,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let rt = runtime();
        let outcome = rt.block_on(async {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg("printf hello; exit 3");
            run_captured(&mut cmd, Duration::from_secs(5), 1024, "sh")
                .await
                .expect("run")
        });
        match outcome {
            RunOutcome::Exited(output) => {
                assert_eq!(output.stdout_lossy(), "hello");
                assert_eq!(output.exit_code, Some(3));
                assert!(!output.stdout_truncated);
            }
            RunOutcome::TimedOut(_) => panic!("unexpected timeout"),
        }
    }

    #[test]
    fn caps_captured_bytes() {
        let rt = runtime();
        let outcome = rt.block_on(async {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg("printf 0123456789");
            run_captured(&mut cmd, Duration::from_secs(5), 4, "sh")
                .await
                .expect("run")
        });
        let RunOutcome::Exited(output) = outcome else {
            panic!("unexpected timeout");
        };
        assert_eq!(output.stdout_lossy(), "0123");
        assert!(output.stdout_truncated);
    }

    #[test]
    fn reports_timeout() {
        let rt = runtime();
        let outcome = rt.block_on(async {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg("sleep 5");
            run_captured(&mut cmd, Duration::from_millis(100), 1024, "sh")
                .await
                .expect("run")
        });
        assert!(matches!(outcome, RunOutcome::TimedOut(_)));
    }
}
