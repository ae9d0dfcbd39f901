//! Stable exit codes for steward CLI commands.

/// Command succeeded; for `turn`, the outcome was `success`.
pub const OK: i32 = 0;
/// Invalid config/arguments, an internal error, or a turn with outcome `error`.
pub const INVALID: i32 = 1;
/// `steward turn` finished with outcome `degraded` (gate escalation).
pub const DEGRADED: i32 = 2;
/// `steward verify` found a broken hash chain.
pub const BROKEN_CHAIN: i32 = 3;
