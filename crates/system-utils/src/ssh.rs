use std::time::Duration;

use tokio::process::Command;

/// ssh reserves exit status 255 for its own failures.
pub const SSH_ERROR_EXIT: i32 = 255;

#[derive(Debug, Clone, Default)]
pub struct SshOptions {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub connect_timeout: Duration,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshFailure {
    Refused,
    ConnectTimeout,
    AuthFailed,
    Unreachable,
}

/// Builds a non-interactive `ssh` invocation running `remote_command` on `host`.
///
/// `BatchMode` keeps ssh from ever prompting; key material comes from the
/// operator's agent or ssh config.
pub fn ssh_command(host: &str, remote_command: &str, options: &SshOptions) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-T");
    cmd.arg("-o").arg("BatchMode=yes");
    cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
    let connect_secs = options.connect_timeout.as_secs().max(1);
    cmd.arg("-o").arg(format!("ConnectTimeout={connect_secs}"));
    if let Some(port) = options.port {
        cmd.arg("-p").arg(port.to_string());
    }
    if let Some(user) = options.user.as_deref().filter(|user| !user.trim().is_empty()) {
        cmd.arg("-l").arg(user);
    }
    cmd.args(&options.extra_args);
    cmd.arg("--");
    cmd.arg(host);
    cmd.arg(remote_command);
    cmd
}

/// Maps an ssh exit into a connection-level failure, if it was one.
///
/// A remote command that itself exits non-zero (even with 255) is not a
/// connection failure unless ssh's own diagnostics say so.
pub fn classify_ssh_failure(exit_code: Option<i32>, stderr: &str) -> Option<SshFailure> {
    if exit_code != Some(SSH_ERROR_EXIT) {
        return None;
    }
    let lower = stderr.to_lowercase();
    if lower.contains("connection refused") {
        return Some(SshFailure::Refused);
    }
    if lower.contains("connection timed out")
        || lower.contains("operation timed out")
        || lower.contains("timed out during banner exchange")
    {
        return Some(SshFailure::ConnectTimeout);
    }
    if lower.contains("permission denied (")
        || lower.contains("too many authentication failures")
        || lower.contains("host key verification failed")
        || lower.contains("authentication failed")
    {
        return Some(SshFailure::AuthFailed);
    }
    let unreachable = [
        "could not resolve hostname",
        "name or service not known",
        "no route to host",
        "network is unreachable",
        "connection closed by",
        "connection reset by",
        "kex_exchange_identification",
    ];
    if unreachable.iter().any(|hint| lower.contains(hint)) {
        return Some(SshFailure::Unreachable);
    }
    None
}
