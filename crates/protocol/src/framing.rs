/// Upper bound for a single length-delimited frame.
///
/// Sized for a control reply carrying the pending-approval list or an
/// `ExecutionResult` with guarded output; requests are far smaller.
///
/// Client and server must agree on this value.
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;
