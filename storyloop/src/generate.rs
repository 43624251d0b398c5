//! Turning a free-form generation response into a validated task set.

use serde::Deserialize;

use crate::core::extract::extract_json_object;
use crate::core::invariants::validate_task_set;
use crate::core::schema::generated_plan_errors;
use crate::error::GenerateError;
use crate::task_set::{Task, TaskSet};

#[derive(Debug, Deserialize)]
struct GeneratedPlan {
    project_name: String,
    #[serde(default)]
    branch_name: Option<String>,
    #[serde(default)]
    context: Option<String>,
    stories: Vec<GeneratedTask>,
}

#[derive(Debug, Deserialize)]
struct GeneratedTask {
    id: String,
    title: String,
    description: String,
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    test_guidance: Option<String>,
    priority: i64,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extract, validate and normalize the plan embedded in `response`.
///
/// Tasks come back sorted by ascending priority (stable), with `passes=false`
/// and `retry_count=0` regardless of what the agent wrote, and `version=0`.
pub fn parse_generation_response(response: &str) -> Result<TaskSet, GenerateError> {
    let value = extract_json_object(response)
        .map_err(|err| GenerateError::MalformedResponse(err.to_string()))?;

    let errors = generated_plan_errors(&value);
    if !errors.is_empty() {
        return Err(GenerateError::InvalidResponse(errors.join("; ")));
    }
    let plan: GeneratedPlan = serde_json::from_value(value)
        .map_err(|err| GenerateError::InvalidResponse(err.to_string()))?;

    let project_name = plan.project_name.trim().to_string();
    if project_name.is_empty() {
        return Err(GenerateError::InvalidResponse(
            "project_name must not be empty".to_string(),
        ));
    }
    if plan.stories.is_empty() {
        return Err(GenerateError::InvalidResponse(
            "plan must contain at least one story".to_string(),
        ));
    }
    for (index, story) in plan.stories.iter().enumerate() {
        if story.title.trim().is_empty() {
            return Err(GenerateError::InvalidResponse(format!(
                "stories[{index}].title: must not be empty"
            )));
        }
    }

    let mut set = TaskSet {
        version: 0,
        project_name,
        branch_name: non_empty(plan.branch_name),
        context: non_empty(plan.context),
        tasks: plan
            .stories
            .into_iter()
            .map(|story| Task {
                id: story.id.trim().to_string(),
                title: story.title.trim().to_string(),
                description: story.description,
                acceptance_criteria: story.acceptance_criteria,
                test_guidance: non_empty(story.test_guidance),
                priority: story.priority,
                passes: false,
                retry_count: 0,
            })
            .collect(),
    };
    validate_task_set(&set).map_err(|err| GenerateError::InvalidResponse(err.to_string()))?;
    set.sort_by_priority();
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"Sure! Here's the plan:

```json
{
  "project_name": "todo-cli",
  "branch_name": "feature/todo",
  "context": "Rust 2024, no network. Use {braces} freely.",
  "stories": [
    {"id": "s-3", "title": "List", "description": "List todos", "acceptance_criteria": ["prints all"], "priority": 3},
    {"id": "s-1", "title": "Add", "description": "Add a todo }", "acceptance_criteria": ["stores it"], "priority": 1, "passes": true, "retry_count": 4},
    {"id": "s-2", "title": "Done", "description": "Mark done", "acceptance_criteria": [], "priority": 1, "test_guidance": "  "}
  ]
}
```

Let me know if you want changes."#;

    #[test]
    fn parses_sorts_and_resets_bookkeeping() {
        let set = parse_generation_response(PLAN).expect("parse");
        assert_eq!(set.project_name, "todo-cli");
        assert_eq!(set.branch_name.as_deref(), Some("feature/todo"));
        let ids: Vec<&str> = set.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["s-1", "s-2", "s-3"]);
        assert!(set.tasks.iter().all(|t| !t.passes && t.retry_count == 0));
        assert_eq!(set.tasks[0].description, "Add a todo }");
        assert_eq!(set.tasks[1].test_guidance, None);
        assert_eq!(set.version, 0);
    }

    #[test]
    fn prose_without_json_is_malformed() {
        let err = parse_generation_response("I could not produce a plan.").unwrap_err();
        assert!(matches!(err, GenerateError::MalformedResponse(_)));
    }

    #[test]
    fn broken_json_is_malformed() {
        let err = parse_generation_response("{\"project_name\": \"x\", stories: }").unwrap_err();
        assert!(matches!(err, GenerateError::MalformedResponse(_)));
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let response = r#"{"project_name": "x", "stories": [{"id": "a", "title": "A", "description": "d", "priority": 0}]}"#;
        let err = parse_generation_response(response).unwrap_err();
        match err {
            GenerateError::InvalidResponse(msg) => assert!(msg.contains("acceptance_criteria")),
            other => panic!("expected invalid response, got {other:?}"),
        }
    }

    #[test]
    fn empty_project_name_is_invalid() {
        let response = r#"{"project_name": "  ", "stories": [{"id": "a", "title": "A", "description": "d", "acceptance_criteria": [], "priority": 0}]}"#;
        let err = parse_generation_response(response).unwrap_err();
        assert!(matches!(err, GenerateError::InvalidResponse(_)));
    }

    #[test]
    fn empty_story_list_is_invalid() {
        let err = parse_generation_response(r#"{"project_name": "x", "stories": []}"#).unwrap_err();
        assert!(matches!(err, GenerateError::InvalidResponse(_)));
    }

    #[test]
    fn duplicate_ids_are_invalid() {
        let response = r#"{"project_name": "x", "stories": [
            {"id": "a", "title": "A", "description": "d", "acceptance_criteria": [], "priority": 0},
            {"id": "a", "title": "B", "description": "d", "acceptance_criteria": [], "priority": 1}
        ]}"#;
        match parse_generation_response(response).unwrap_err() {
            GenerateError::InvalidResponse(msg) => assert!(msg.contains("duplicate id 'a'")),
            other => panic!("expected invalid response, got {other:?}"),
        }
    }

    #[test]
    fn negative_priority_is_invalid() {
        let response = r#"{"project_name": "x", "stories": [{"id": "a", "title": "A", "description": "d", "acceptance_criteria": [], "priority": -1}]}"#;
        match parse_generation_response(response).unwrap_err() {
            GenerateError::InvalidResponse(msg) => assert!(msg.contains("priority")),
            other => panic!("expected invalid response, got {other:?}"),
        }
    }
}
