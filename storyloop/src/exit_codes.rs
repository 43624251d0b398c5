//! Stable exit codes for the `storyloop` binary.

/// Every task passed, or a dry run generated a valid plan.
pub const OK: i32 = 0;
/// The run failed or made no progress.
pub const FAILED: i32 = 1;
/// The run stopped with some, but not all, tasks passing.
pub const PARTIAL: i32 = 2;
