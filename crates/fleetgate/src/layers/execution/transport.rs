use async_trait::async_trait;
use protocol::ErrorKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// The transport stopped capturing before the stream ended.
    pub truncated: bool,
}

impl RemoteOutput {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: text.into(),
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, as the operator would see them.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim_end_matches('\n');
        let stderr = self.stderr.trim_end_matches('\n');
        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("connect timed out: {0}")]
    ConnectTimeout(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("command did not finish within {0:?}")]
    CommandTimeout(Duration),
    #[error("execution failed: {0}")]
    Failed(String),
}

impl TransportError {
    /// Failures that say the host cannot be reached; only these feed the breaker.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused(_) | Self::ConnectTimeout(_) | Self::AuthFailed(_) | Self::Unreachable(_)
        )
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::CommandTimeout(_) => ErrorKind::ExecutionTimeout,
            Self::Failed(_) => ErrorKind::ExecutionFailed,
            _ => ErrorKind::HostUnavailable,
        }
    }
}

/// Runs one literal command on one host.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn run_remote(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteOutput, TransportError>;
}
