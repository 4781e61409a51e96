//! Run tracking and approval workflow core.
//!
//! A run is one tracked attempt-lineage to resolve a work item. It moves
//! through retries and human gates until it is delivered or blocked, leaving an
//! append-only evidence trail and a hash-chained decision log behind. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, hash chain,
//!   projections, invariants). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting storage (config, run records, evidence and
//!   decision log files, the [`io::store::RunStore`] seam).
//!
//! Orchestration modules ([`workflow`], [`query`], [`project`]) coordinate core
//! logic with storage to implement CLI commands and the HTTP API.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod project;
pub mod query;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
