//! Deterministic, pure logic shared by the store and the scheduler.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod extract;
pub mod invariants;
pub mod marker;
pub mod schema;
pub mod selector;
