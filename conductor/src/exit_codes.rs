//! Stable exit codes for conductor CLI commands.

/// Command succeeded; for `run`, every task completed and no review stopped the run.
pub const OK: i32 = 0;
/// Invalid task list, configuration, or dirty tree, or another fatal error.
pub const INVALID: i32 = 1;
/// At least one task failed.
pub const FAILED: i32 = 2;
/// A review requested a replan that was not (or could no longer be) carried out.
pub const REPLAN: i32 = 3;
/// The run stopped on a persisting NEEDS_ATTENTION verdict.
pub const ATTENTION: i32 = 4;
