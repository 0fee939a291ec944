//! Side-effecting adapters: git, processes, backends, files.

pub mod backend;
pub mod baseline;
pub mod config;
pub mod git;
pub mod memory;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod test_runner;
