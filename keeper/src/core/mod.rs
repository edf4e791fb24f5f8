//! Deterministic, pure logic shared by the keeper orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod aggregate;
pub mod apply;
pub mod branch;
pub mod diff;
pub mod invariants;
pub mod policy;
pub mod selector;
pub mod types;
