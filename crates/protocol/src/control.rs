use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingSnapshot {
    pub id: String,
    pub requested_text: String,
    pub host: String,
    pub session_id: String,
    pub first_seen_at_ms: u64,
    pub occurrence_count: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostHealthSnapshot {
    pub host: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub retry_in_secs: u64,
    pub probe_in_flight: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Pending,
    Approve { name: String, requested_text: String },
    Reject { requested_text: String },
    Breakers,
    ResetHost { host: String },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Pending { items: Vec<PendingSnapshot> },
    Approved { name: String },
    Ack { message: String },
    Breakers { hosts: Vec<HostHealthSnapshot> },
    Error { message: String },
}
