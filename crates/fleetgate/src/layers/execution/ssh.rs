use super::transport::{RemoteOutput, RemoteTransport, TransportError};
use crate::config::{LimitsConfig, SshConfig};
use async_trait::async_trait;
use std::time::Duration;
use system_utils::process::{run_captured, CapturedOutput, RunOutcome};
use system_utils::ssh::{classify_ssh_failure, ssh_command, SshFailure, SshOptions};

/// Runs commands through the system `ssh` client in batch mode.
pub struct SshTransport {
    options: SshOptions,
    capture_bytes: usize,
}

impl SshTransport {
    pub fn new(options: SshOptions, capture_bytes: usize) -> Self {
        Self {
            options,
            capture_bytes,
        }
    }

    pub fn from_config(ssh: &SshConfig, limits: &LimitsConfig) -> Self {
        Self::new(
            SshOptions {
                user: ssh.user.clone(),
                port: ssh.port,
                connect_timeout: Duration::from_secs(ssh.connect_timeout_secs),
                extra_args: ssh.ssh_args.clone(),
            },
            limits.capture_bytes(),
        )
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn run_remote(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteOutput, TransportError> {
        let mut options = self.options.clone();
        options.connect_timeout = options.connect_timeout.min(timeout);
        let mut cmd = ssh_command(host, command, &options);
        let outcome = run_captured(&mut cmd, timeout, self.capture_bytes, "ssh")
            .await
            .map_err(|err| TransportError::Failed(format!("{err:#}")))?;
        match outcome {
            RunOutcome::Exited(captured) => classify(host, captured),
            RunOutcome::TimedOut(_) => Err(TransportError::CommandTimeout(timeout)),
        }
    }
}

fn classify(host: &str, captured: CapturedOutput) -> Result<RemoteOutput, TransportError> {
    let stderr = captured.stderr_lossy();
    if let Some(failure) = classify_ssh_failure(captured.exit_code, &stderr) {
        let detail = format!("{host}: {}", stderr.trim());
        return Err(match failure {
            SshFailure::Refused => TransportError::ConnectionRefused(detail),
            SshFailure::ConnectTimeout => TransportError::ConnectTimeout(detail),
            SshFailure::AuthFailed => TransportError::AuthFailed(detail),
            SshFailure::Unreachable => TransportError::Unreachable(detail),
        });
    }
    Ok(RemoteOutput {
        stdout: captured.stdout_lossy(),
        stderr,
        exit_code: captured.exit_code,
        truncated: captured.stdout_truncated || captured.stderr_truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captured(exit_code: Option<i32>, stdout: &str, stderr: &str) -> CapturedOutput {
        CapturedOutput {
            exit_code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    #[test]
    fn refused_connection_is_connection_level() {
        let err = classify(
            "hostD",
            captured(Some(255), "", "ssh: connect to host hostD port 22: Connection refused"),
        )
        .expect_err("refused");
        assert!(matches!(err, TransportError::ConnectionRefused(_)));
        assert!(err.is_connection_level());
    }

    #[test]
    fn remote_failure_is_still_output() {
        let output = classify("hostA", captured(Some(1), "", "No NVMe devices found\n")).expect("output");
        assert_eq!(output.exit_code, Some(1));
        assert_eq!(output.combined(), "No NVMe devices found");
    }
}
