//! Side-effecting collaborators: the task store and its lock, agent
//! processes, git, configuration and prompt rendering.

pub mod config;
pub mod git;
pub mod lock;
pub mod performer;
pub mod process;
pub mod prompt;
pub mod task_store;
