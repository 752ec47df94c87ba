pub mod coordinator;
pub mod output;
pub mod privilege;
pub mod ssh;
pub mod transport;

pub use coordinator::{BatchOutcome, BatchSummary, ExecContext, ExecutionCoordinator};
pub use output::{GuardedOutput, OutputGuard, TRUNCATION_MARKER};
pub use ssh::SshTransport;
pub use transport::{RemoteOutput, RemoteTransport, TransportError};
