//! Stable exit codes for keeper CLI commands.

/// Command succeeded; `keeper run` ended `pr_created`, `no_op` or halted.
pub const OK: i32 = 0;
/// Invalid layout/config/backlog, or a run that ended `error`.
pub const INVALID: i32 = 1;
/// `keeper select` found no `todo` milestone.
pub const EMPTY: i32 = 2;
/// `keeper select` found a milestone already `in_progress`.
pub const BUSY: i32 = 3;
/// `keeper run` ended `blocked`.
pub const BLOCKED: i32 = 4;
/// `keeper check` found failing truth checks.
pub const RED: i32 = 5;
