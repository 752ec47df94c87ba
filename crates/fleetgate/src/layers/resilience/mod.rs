pub mod breaker;
pub mod cache;
pub mod limiter;

pub use breaker::{Admission, CircuitBreaker, HostHealth, ProbeTicket};
pub use cache::{CachedOutput, ResultCache};
pub use limiter::{ConcurrencyLimiter, LimiterError, SlotPermit};

/// Hosts are tracked case-insensitively.
pub(crate) fn host_key(host: &str) -> String {
    host.trim().to_lowercase()
}
