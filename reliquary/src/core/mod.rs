//! Deterministic, pure logic shared by the workflow engine and query service.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and return deterministic outputs suitable for tests.

pub mod chain;
pub mod invariants;
pub mod projection;
pub mod replay;
pub mod state_machine;
pub mod status;
pub mod types;
