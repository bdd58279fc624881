//! Stable exit codes for swarm CLI commands.

/// Command succeeded; for `run`, no task ended in `failed`.
pub const OK: i32 = 0;
/// Invalid workspace, config, adapter, token, or any other error.
pub const INVALID: i32 = 1;
/// `swarm run` finished with tasks left in `failed`.
pub const TASKS_FAILED: i32 = 2;
/// `swarm run` stopped on cancellation (Ctrl-C).
pub const CANCELLED: i32 = 130;
