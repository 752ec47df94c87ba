pub mod approvals;
pub mod execution;
pub mod policy;
pub mod resilience;
