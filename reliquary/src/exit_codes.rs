//! Stable exit codes for reliquary CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments, invalid transition, or any unclassified error.
pub const INVALID: i32 = 1;
/// The work item has no run.
pub const NOT_FOUND: i32 = 2;
/// The run already exists or was modified concurrently.
pub const CONFLICT: i32 = 3;
/// Storage stayed unavailable after bounded retries.
pub const STORAGE: i32 = 4;
/// The run is flagged inconsistent or its stored data is corrupt.
pub const INCONSISTENT: i32 = 5;
