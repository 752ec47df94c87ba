use serde::{Deserialize, Serialize};

pub mod control;
pub mod framing;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub session_id: String,
    pub host: String,
    pub command: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PolicyRejected,
    PendingApproval,
    HostUnavailable,
    ExecutionTimeout,
    ConcurrencyTimeout,
    OutputRejected,
    Cancelled,
    ExecutionFailed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PolicyRejected => "policy_rejected",
            Self::PendingApproval => "pending_approval",
            Self::HostUnavailable => "host_unavailable",
            Self::ExecutionTimeout => "execution_timeout",
            Self::ConcurrencyTimeout => "concurrency_timeout",
            Self::OutputRejected => "output_rejected",
            Self::Cancelled => "cancelled",
            Self::ExecutionFailed => "execution_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeMode {
    #[default]
    Unprivileged,
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub id: String,
    pub ok: bool,
    pub output: String,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub message: Option<String>,
    pub from_cache: bool,
    pub host: String,
    pub command: String,
    #[serde(default)]
    pub command_name: Option<String>,
    #[serde(default)]
    pub privilege: PrivilegeMode,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub summary_default: bool,
}

impl ExecutionResult {
    pub fn failure(
        id: impl Into<String>,
        host: impl Into<String>,
        command: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            ok: false,
            output: String::new(),
            error_kind: Some(kind),
            message: Some(message.into()),
            from_cache: false,
            host: host.into(),
            command: command.into(),
            command_name: None,
            privilege: PrivilegeMode::Unprivileged,
            exit_code: None,
            truncated: false,
            summary_default: false,
        }
    }

    pub fn success(
        id: impl Into<String>,
        host: impl Into<String>,
        command: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            ok: true,
            output: output.into(),
            error_kind: None,
            message: None,
            from_cache: false,
            host: host.into(),
            command: command.into(),
            command_name: None,
            privilege: PrivilegeMode::Unprivileged,
            exit_code: None,
            truncated: false,
            summary_default: false,
        }
    }

    pub fn is_pending_approval(&self) -> bool {
        self.error_kind == Some(ErrorKind::PendingApproval)
    }
}
