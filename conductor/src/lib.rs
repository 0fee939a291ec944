//! Execution engine for AI-assisted code changes.
//!
//! A run takes a task list, anchors itself to a git baseline, executes
//! FUNDAMENTAL tasks sequentially and INDEPENDENT tasks on a bounded worker
//! pool, commits one checkpoint per accepted task, and gates each phase on a
//! review verdict. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task-list parsing, scope checks,
//!   verdict grammar, backoff, memory ranking). No I/O.
//! - **[`io`]**: Side-effecting operations (git, child processes, backend,
//!   config, run artifacts). Isolated behind traits where tests need doubles.
//!
//! Orchestration modules ([`retry`], [`correction`], [`parallel`], [`review`],
//! [`planner`], [`workflow`]) compose the two.

pub mod cancel;
pub mod core;
pub mod correction;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod parallel;
pub mod planner;
pub mod retry;
pub mod review;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
