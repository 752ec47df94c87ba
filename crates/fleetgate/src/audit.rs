use protocol::{ErrorKind, PrivilegeMode};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// One terminal outcome, written for every request whatever its result.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditRecord {
    pub id: String,
    pub session_id: String,
    pub host: String,
    pub requested_text: String,
    pub command: String,
    pub command_name: Option<String>,
    pub decision: String,
    pub ok: bool,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub from_cache: bool,
    pub privilege: PrivilegeMode,
    pub exit_code: Option<i32>,
    pub truncated: bool,
    pub duration_ms: u64,
    pub finished_at_ms: u64,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Logs each record and writes it to its own file in the background.
///
/// File names are generated here; the caller-supplied request id only appears
/// inside the record.
pub struct FileAuditSink {
    output_dir: Arc<PathBuf>,
}

impl FileAuditSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: Arc::new(output_dir.into()),
        }
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, record: AuditRecord) {
        tracing::info!(
            event = "audit.record",
            id = %record.id,
            session_id = %record.session_id,
            host = %record.host,
            command = %record.command,
            decision = %record.decision,
            ok = record.ok,
            error_kind = record.error_kind.map(ErrorKind::as_str),
            from_cache = record.from_cache,
            duration_ms = record.duration_ms,
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(id = %record.id, "no runtime to write audit record");
            return;
        };
        let output_dir = Arc::clone(&self.output_dir);
        handle.spawn(async move {
            if let Err(err) = write_audit_record(&output_dir, &record).await {
                tracing::warn!(error = %err, id = %record.id, "failed to write audit record");
            }
        });
    }
}

pub(crate) async fn write_audit_record(output_dir: &Path, record: &AuditRecord) -> anyhow::Result<PathBuf> {
    let path = output_dir.join(format!("{}-{}.audit.json", record.finished_at_ms, Uuid::new_v4()));
    let payload = serde_json::to_vec_pretty(record)?;
    tokio::fs::write(&path, payload).await?;
    Ok(path)
}

pub(crate) fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    fn record(id: &str) -> AuditRecord {
        AuditRecord {
            id: id.to_string(),
            session_id: "s1".to_string(),
            host: "hostB".to_string(),
            requested_text: "rm -rf /".to_string(),
            command: "rm -rf /".to_string(),
            command_name: None,
            decision: "rejected".to_string(),
            ok: false,
            error_kind: Some(ErrorKind::PolicyRejected),
            message: Some("denied".to_string()),
            from_cache: false,
            privilege: PrivilegeMode::Unprivileged,
            exit_code: None,
            truncated: false,
            duration_ms: 0,
            finished_at_ms: 1,
        }
    }

    #[test]
    fn writes_pretty_json_record() {
        let dir = temp_dir("audit");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let path = rt.block_on(async { write_audit_record(&dir, &record("req-1")).await.expect("write") });
        let content = std::fs::read_to_string(path).expect("read");
        let value: serde_json::Value = serde_json::from_str(&content).expect("json");
        assert_eq!(value["id"], "req-1");
        assert_eq!(value["error_kind"], "policy_rejected");
        assert_eq!(value["decision"], "rejected");
        assert!(content.contains('\n'));
    }

    #[test]
    fn request_id_never_shapes_the_file_path() {
        let root = temp_dir("audit-ids");
        let dir = root.join("records");
        std::fs::create_dir_all(&dir).expect("records dir");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let (escaped, first, second) = rt.block_on(async {
            (
                write_audit_record(&dir, &record("../escaped")).await.expect("write"),
                write_audit_record(&dir, &record("req-7")).await.expect("write"),
                write_audit_record(&dir, &record("req-7")).await.expect("write"),
            )
        });
        assert_eq!(escaped.parent(), Some(dir.as_path()));
        assert!(!root.join("escaped.audit.json").exists());
        assert_ne!(first, second);
        assert_eq!(std::fs::read_dir(&dir).expect("read dir").count(), 3);
        let content = std::fs::read_to_string(escaped).expect("read");
        assert!(content.contains("../escaped"));
    }
}
