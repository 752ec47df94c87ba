use protocol::control::PendingSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApprovalRequest {
    pub id: String,
    pub requested_text: String,
    pub host: String,
    pub session_id: String,
    pub first_seen_at_ms: u64,
    pub occurrence_count: u64,
}

impl PendingApprovalRequest {
    pub fn snapshot(&self) -> PendingSnapshot {
        PendingSnapshot {
            id: self.id.clone(),
            requested_text: self.requested_text.clone(),
            host: self.host.clone(),
            session_id: self.session_id.clone(),
            first_seen_at_ms: self.first_seen_at_ms,
            occurrence_count: self.occurrence_count,
        }
    }
}

/// Pending entries in arrival order, unique by requested text.
#[derive(Debug, Default)]
pub(crate) struct PendingState {
    entries: Vec<PendingApprovalRequest>,
}

impl PendingState {
    /// Records one more sighting of `text`; returns the entry and whether it is new.
    pub(crate) fn record(
        &mut self,
        text: &str,
        host: &str,
        session_id: &str,
        now_ms: u64,
        new_id: impl FnOnce() -> String,
    ) -> (PendingApprovalRequest, bool) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.requested_text == text) {
            entry.occurrence_count += 1;
            return (entry.clone(), false);
        }
        let entry = PendingApprovalRequest {
            id: new_id(),
            requested_text: text.to_string(),
            host: host.to_string(),
            session_id: session_id.to_string(),
            first_seen_at_ms: now_ms,
            occurrence_count: 1,
        };
        self.entries.push(entry.clone());
        (entry, true)
    }

    pub(crate) fn contains(&self, text: &str) -> bool {
        self.entries.iter().any(|entry| entry.requested_text == text)
    }

    pub(crate) fn remove(&mut self, text: &str) -> Option<PendingApprovalRequest> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.requested_text == text)?;
        Some(self.entries.remove(index))
    }

    pub(crate) fn snapshots(&self) -> Vec<PendingSnapshot> {
        self.entries.iter().map(PendingApprovalRequest::snapshot).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
