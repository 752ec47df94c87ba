use crate::audit::{AuditRecord, AuditSink};
use crate::layers::execution::transport::{RemoteOutput, RemoteTransport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    dir.push(format!("fleetgate-{prefix}-{}-{nanos}", std::process::id()));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Current-thread runtime with a paused clock; timers auto-advance when idle.
pub(crate) fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("runtime")
}

#[derive(Clone)]
struct Scripted {
    delay: Duration,
    result: Result<RemoteOutput, TransportError>,
}

/// Answers from per-(host, command) scripts; the last script for a key repeats.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<HashMap<(String, String), VecDeque<Scripted>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub(crate) fn script(&self, host: &str, command: &str, result: Result<RemoteOutput, TransportError>) {
        self.script_delayed(host, command, Duration::ZERO, result);
    }

    pub(crate) fn script_delayed(
        &self,
        host: &str,
        command: &str,
        delay: Duration,
        result: Result<RemoteOutput, TransportError>,
    ) {
        self.scripts
            .lock()
            .expect("scripts")
            .entry((host.to_string(), command.to_string()))
            .or_default()
            .push_back(Scripted { delay, result });
    }

    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("calls").clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().expect("calls").len()
    }

    fn next(&self, host: &str, command: &str) -> Option<Scripted> {
        let mut scripts = self.scripts.lock().expect("scripts");
        let queue = scripts.get_mut(&(host.to_string(), command.to_string()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl RemoteTransport for ScriptedTransport {
    async fn run_remote(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteOutput, TransportError> {
        self.calls
            .lock()
            .expect("calls")
            .push((host.to_string(), command.to_string()));
        let Some(scripted) = self.next(host, command) else {
            return Err(TransportError::Failed(format!("no script for {host}: {command}")));
        };
        if scripted.delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::CommandTimeout(timeout));
        }
        if !scripted.delay.is_zero() {
            tokio::time::sleep(scripted.delay).await;
        }
        scripted.result
    }
}

#[derive(Default)]
pub(crate) struct CollectingAudit {
    records: Mutex<Vec<AuditRecord>>,
}

impl CollectingAudit {
    pub(crate) fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("records").clone()
    }
}

impl AuditSink for CollectingAudit {
    fn record(&self, record: AuditRecord) {
        self.records.lock().expect("records").push(record);
    }
}
