//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::task_set::TaskSet;

pub const MAX_CONTEXT_BYTES: usize = 1024 * 1024;
pub const MAX_TASKS: usize = 1000;
pub const MAX_DESCRIPTION_BYTES: usize = 100 * 1024;
pub const MAX_ACCEPTANCE_CRITERIA: usize = 50;

/// Check task set invariants, stopping at the first violation:
/// - at most [`MAX_TASKS`] tasks and a context of at most [`MAX_CONTEXT_BYTES`]
/// - non-empty, unique task ids
/// - descriptions of at most [`MAX_DESCRIPTION_BYTES`]
/// - at most [`MAX_ACCEPTANCE_CRITERIA`] acceptance criteria per task
/// - non-negative `priority` and `retry_count`
///
/// Runs on both load and save so that external corruption and internal bugs
/// are rejected the same way.
pub fn validate_task_set(set: &TaskSet) -> Result<(), ValidationError> {
    if let Some(context) = &set.context
        && context.len() > MAX_CONTEXT_BYTES
    {
        return Err(ValidationError::new(
            "context",
            format!(
                "{} bytes exceeds limit of {MAX_CONTEXT_BYTES}",
                context.len()
            ),
        ));
    }

    if set.tasks.len() > MAX_TASKS {
        return Err(ValidationError::new(
            "stories",
            format!("{} tasks exceeds limit of {MAX_TASKS}", set.tasks.len()),
        ));
    }

    let mut seen = HashSet::new();
    for (index, task) in set.tasks.iter().enumerate() {
        let at = |field: &str| format!("stories[{index}].{field}");

        if task.id.trim().is_empty() {
            return Err(ValidationError::new(at("id"), "must not be empty"));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(ValidationError::new(
                at("id"),
                format!("duplicate id '{}'", task.id),
            ));
        }
        if task.description.len() > MAX_DESCRIPTION_BYTES {
            return Err(ValidationError::new(
                at("description"),
                format!(
                    "task '{}': {} bytes exceeds limit of {MAX_DESCRIPTION_BYTES}",
                    task.id,
                    task.description.len()
                ),
            ));
        }
        if task.acceptance_criteria.len() > MAX_ACCEPTANCE_CRITERIA {
            return Err(ValidationError::new(
                at("acceptance_criteria"),
                format!(
                    "task '{}': {} criteria exceeds limit of {MAX_ACCEPTANCE_CRITERIA}",
                    task.id,
                    task.acceptance_criteria.len()
                ),
            ));
        }
        if task.priority < 0 {
            return Err(ValidationError::new(
                at("priority"),
                format!("task '{}': must be >= 0, got {}", task.id, task.priority),
            ));
        }
        if task.retry_count < 0 {
            return Err(ValidationError::new(
                at("retry_count"),
                format!(
                    "task '{}': must be >= 0, got {}",
                    task.id, task.retry_count
                ),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{task, task_set};

    #[test]
    fn accepts_valid_set() {
        let set = task_set(vec![task("a", 0), task("b", 1)]);
        assert_eq!(validate_task_set(&set), Ok(()));
    }

    #[test]
    fn rejects_duplicate_ids_with_index() {
        let set = task_set(vec![task("a", 0), task("b", 1), task("a", 2)]);
        let err = validate_task_set(&set).unwrap_err();
        assert_eq!(err.field, "stories[2].id");
        assert!(err.message.contains("duplicate id 'a'"));
    }

    #[test]
    fn rejects_negative_priority_and_retry_count() {
        let mut set = task_set(vec![task("a", 0)]);
        set.tasks[0].priority = -1;
        assert_eq!(
            validate_task_set(&set).unwrap_err().field,
            "stories[0].priority"
        );

        set.tasks[0].priority = 0;
        set.tasks[0].retry_count = -2;
        assert_eq!(
            validate_task_set(&set).unwrap_err().field,
            "stories[0].retry_count"
        );
    }

    #[test]
    fn rejects_oversized_fields() {
        let mut set = task_set(vec![task("a", 0)]);
        set.context = Some("x".repeat(MAX_CONTEXT_BYTES + 1));
        assert_eq!(validate_task_set(&set).unwrap_err().field, "context");

        let mut set = task_set(vec![task("a", 0)]);
        set.tasks[0].description = "d".repeat(MAX_DESCRIPTION_BYTES + 1);
        assert_eq!(
            validate_task_set(&set).unwrap_err().field,
            "stories[0].description"
        );

        let mut set = task_set(vec![task("a", 0)]);
        set.tasks[0].acceptance_criteria = vec!["c".to_string(); MAX_ACCEPTANCE_CRITERIA + 1];
        assert_eq!(
            validate_task_set(&set).unwrap_err().field,
            "stories[0].acceptance_criteria"
        );
    }

    #[test]
    fn rejects_too_many_tasks() {
        let tasks = (0..=MAX_TASKS)
            .map(|i| task(&format!("t-{i}"), 0))
            .collect();
        let set = task_set(tasks);
        assert_eq!(validate_task_set(&set).unwrap_err().field, "stories");
    }

    #[test]
    fn limits_are_inclusive() {
        let mut set = task_set(vec![task("a", 0)]);
        set.context = Some("x".repeat(MAX_CONTEXT_BYTES));
        set.tasks[0].description = "d".repeat(MAX_DESCRIPTION_BYTES);
        set.tasks[0].acceptance_criteria = vec!["c".to_string(); MAX_ACCEPTANCE_CRITERIA];
        assert_eq!(validate_task_set(&set), Ok(()));
    }
}
