//! Stable exit codes for aios CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Task or workflow declaration failed validation.
pub const VALIDATION: i32 = 1;
/// Execution failed after the error policy was exhausted.
pub const EXECUTION: i32 = 2;
/// A blocking quality gate check failed.
pub const GATE_BLOCKED: i32 = 3;
