//! Autonomous story loop: turn a request into a prioritized task set, then
//! dispatch each pending task to a coding agent until every task passes.
//!
//! The crate keeps a strict split:
//!
//! - **[`core`]**: pure logic (invariants, schema checks, selection, marker
//!   detection, JSON extraction). No I/O.
//! - **[`io`]**: side effects (the locked task store, agent processes, git,
//!   configuration, prompt rendering), behind traits where the scheduler
//!   needs to swap them in tests.
//!
//! [`workflow`] and [`looping`] coordinate the two; [`events`] carries
//! progress to [`display`] without blocking the loop indefinitely.

pub mod cancel;
pub mod core;
pub mod display;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod generate;
pub mod io;
pub mod logging;
pub mod looping;
pub mod task_set;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
