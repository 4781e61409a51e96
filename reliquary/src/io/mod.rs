//! Storage and configuration I/O for the run tracker.

pub mod config;
pub mod decision_log;
pub mod evidence_store;
pub mod file_store;
pub mod init;
pub mod jsonl;
pub mod retry;
pub mod run_records;
pub mod store;
