mod state;

pub use state::PendingApprovalRequest;

use crate::audit::system_time_ms;
use crate::layers::policy::template::CommandTemplate;
use crate::layers::policy::{normalize_command, CommandSpec, RegistryError, RegistryStore, SharedRegistry};
use protocol::control::PendingSnapshot;
use state::PendingState;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("no pending request for {0:?}")]
    UnknownRequest(String),
    #[error("command name must not be empty")]
    EmptyName,
    #[error("command name already registered: {0}")]
    DuplicateName(String),
    #[error("{text:?} matches denied pattern {pattern}")]
    Denied { text: String, pattern: String },
    #[error("registry rejected the command: {0}")]
    Registry(RegistryError),
    #[error("failed to persist registry: {0:#}")]
    Persist(anyhow::Error),
}

enum PublishError {
    Registry(RegistryError),
    Persist(anyhow::Error),
}

impl From<RegistryError> for PublishError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

/// Unregistered commands waiting for an operator decision.
///
/// Approving an entry grows the registry; rejecting just drops the entry, so
/// the same text queues again the next time it is requested.
pub struct ApprovalQueue {
    pending: Mutex<PendingState>,
    registry: Arc<SharedRegistry>,
    store: Arc<dyn RegistryStore>,
}

impl ApprovalQueue {
    pub fn new(registry: Arc<SharedRegistry>, store: Arc<dyn RegistryStore>) -> Self {
        Self {
            pending: Mutex::new(PendingState::default()),
            registry,
            store,
        }
    }

    pub fn submit(&self, requested_text: &str, host: &str, session_id: &str) -> PendingApprovalRequest {
        let text = normalize_command(requested_text);
        let now_ms = system_time_ms(SystemTime::now());
        let (entry, created) = self
            .lock()
            .record(&text, host, session_id, now_ms, || Uuid::new_v4().to_string());
        if created {
            tracing::info!(
                event = "approval.submitted",
                id = %entry.id,
                host = %entry.host,
                session_id = %entry.session_id,
                command = %entry.requested_text,
            );
        } else {
            tracing::debug!(
                event = "approval.repeated",
                id = %entry.id,
                command = %entry.requested_text,
                occurrences = entry.occurrence_count,
            );
        }
        entry
    }

    pub fn pending(&self) -> Vec<PendingSnapshot> {
        self.lock().snapshots()
    }

    pub fn is_pending(&self, requested_text: &str) -> bool {
        self.lock().contains(&normalize_command(requested_text))
    }

    /// Registers `requested_text` under `name` and removes it from the queue.
    ///
    /// The grown registry is persisted before it is published; on any error
    /// the pending entry and the live registry are left untouched.
    pub fn approve(&self, name: &str, requested_text: &str) -> Result<CommandSpec, ApprovalError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ApprovalError::EmptyName);
        }
        let text = normalize_command(requested_text);
        if !self.lock().contains(&text) {
            return Err(ApprovalError::UnknownRequest(text));
        }

        let spec = CommandSpec {
            name: name.clone(),
            literal_command_pattern: CommandTemplate::escape_literal(&text),
            aliases: Vec::new(),
            requires_privilege: false,
            summary_default: false,
            description: String::new(),
            arg_rules: Default::default(),
        };

        let snapshot = self.registry.snapshot();
        if let Some(pattern) = snapshot.denied_by(&text) {
            return Err(ApprovalError::Denied {
                text,
                pattern: pattern.to_string(),
            });
        }
        if snapshot.contains_name(&name) {
            return Err(ApprovalError::DuplicateName(name));
        }

        let published = self
            .registry
            .update(|current| {
                let next = current.with_command(spec.clone(), &text)?;
                self.store.save(next.file()).map_err(PublishError::Persist)?;
                Ok(next)
            })
            .map_err(|err| match err {
                PublishError::Registry(RegistryError::DuplicateName(name)) => {
                    ApprovalError::DuplicateName(name)
                }
                PublishError::Registry(err) => ApprovalError::Registry(err),
                PublishError::Persist(err) => ApprovalError::Persist(err),
            })?;

        let removed = self.lock().remove(&text);
        tracing::info!(
            event = "approval.approved",
            name = %name,
            command = %text,
            registry_version = published.version(),
            occurrences = removed.map(|entry| entry.occurrence_count).unwrap_or(0),
        );
        Ok(spec)
    }

    /// Drops the pending entry for `requested_text`; returns whether one existed.
    pub fn reject(&self, requested_text: &str) -> bool {
        let text = normalize_command(requested_text);
        let removed = self.lock().remove(&text);
        if let Some(entry) = &removed {
            tracing::info!(
                event = "approval.rejected",
                id = %entry.id,
                command = %entry.requested_text,
                occurrences = entry.occurrence_count,
            );
        }
        removed.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
