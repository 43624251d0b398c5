//! Deterministic selection of the next task to dispatch.

use crate::task_set::{Task, TaskSet};

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<'a> {
    /// Every task passes.
    Complete,
    /// Next task to dispatch.
    Next(&'a Task),
    /// Open tasks remain but all have exhausted their retries.
    Exhausted(Vec<String>),
}

/// Returns true if a task may still be dispatched.
pub fn is_eligible(task: &Task, max_retries: u32) -> bool {
    !task.passes && task.retry_count < i64::from(max_retries)
}

/// Pick the eligible task with the smallest priority; ties go to the task that
/// appears first in list order.
pub fn next_task(set: &TaskSet, max_retries: u32) -> Option<&Task> {
    let mut best: Option<&Task> = None;
    for task in set.tasks.iter().filter(|task| is_eligible(task, max_retries)) {
        match best {
            Some(current) if current.priority <= task.priority => {}
            _ => best = Some(task),
        }
    }
    best
}

pub fn select(set: &TaskSet, max_retries: u32) -> Selection<'_> {
    if set.all_passed() {
        return Selection::Complete;
    }
    match next_task(set, max_retries) {
        Some(task) => Selection::Next(task),
        None => Selection::Exhausted(
            set.tasks
                .iter()
                .filter(|task| !task.passes)
                .map(|task| task.id.clone())
                .collect(),
        ),
    }
}
