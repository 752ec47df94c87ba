pub mod audit;
pub mod cli;
pub mod config;
pub mod control;
pub mod layers;
pub mod logging;
pub mod server;

#[cfg(test)]
mod test_utils;

pub use audit::{AuditRecord, AuditSink, FileAuditSink};
pub use config::BrokerConfig;
pub use layers::approvals::{ApprovalError, ApprovalQueue, PendingApprovalRequest};
pub use layers::execution::{ExecContext, ExecutionCoordinator, RemoteTransport, SshTransport};
pub use layers::policy::{CommandAuthorizer, Registry, RegistryFile, SharedRegistry};
pub use layers::resilience::{CircuitBreaker, ConcurrencyLimiter, ResultCache};
