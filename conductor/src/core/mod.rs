//! Deterministic, pure logic shared by the execution engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod memory;
pub mod scope;
pub mod task_list;
pub mod test_scope;
pub mod types;
pub mod verdict;
