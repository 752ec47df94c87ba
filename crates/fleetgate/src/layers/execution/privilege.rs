use super::transport::RemoteOutput;

const PRIVILEGE_HINTS: &[&str] = &[
    "a password is required",
    "permission denied",
    "operation not permitted",
    "not permitted",
    "a terminal is required",
    "interactive authentication is required",
    "must be run as root",
    "must be root",
    "requires root",
    "authentication failed",
];

/// Whether a finished run failed because it lacked privilege.
pub fn needs_escalation(output: &RemoteOutput) -> bool {
    if output.succeeded() {
        return false;
    }
    let text = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
    PRIVILEGE_HINTS.iter().any(|hint| text.contains(hint))
}
