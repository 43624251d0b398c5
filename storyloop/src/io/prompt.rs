//! Prompt rendering for generation, per-task dispatch and store repair.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::invariants::{MAX_ACCEPTANCE_CRITERIA, MAX_TASKS};
use crate::core::marker::COMPLETION_MARKER;
use crate::task_set::{Task, TaskSet};

const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");

/// Selected task context for template rendering.
#[derive(Debug, Clone, Serialize)]
struct TaskContext<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
    acceptance_criteria: &'a [String],
    test_guidance: Option<&'a str>,
    retry_count: i64,
}

impl<'a> TaskContext<'a> {
    fn from_task(task: &'a Task) -> Self {
        Self {
            id: &task.id,
            title: &task.title,
            description: task.description.trim(),
            acceptance_criteria: &task.acceptance_criteria,
            test_guidance: task
                .test_guidance
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty()),
            retry_count: task.retry_count,
        }
    }
}

/// Inputs for a per-task prompt.
#[derive(Debug, Clone)]
pub struct TaskPromptInputs<'a> {
    pub set: &'a TaskSet,
    pub task: &'a Task,
    pub iteration: u32,
    pub store_file: &'a str,
}

/// Template engine wrapper around minijinja.
pub struct PromptBuilder {
    env: Environment<'static>,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptBuilder {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("generate", GENERATE_TEMPLATE)
            .expect("generate template should be valid");
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        env.add_template("repair", REPAIR_TEMPLATE)
            .expect("repair template should be valid");
        Self { env }
    }

    pub fn generation(&self, request: &str) -> Result<String> {
        let template = self.env.get_template("generate")?;
        let rendered = template.render(context! {
            request => request.trim(),
            max_tasks => MAX_TASKS,
            max_criteria => MAX_ACCEPTANCE_CRITERIA,
        })?;
        Ok(rendered)
    }

    pub fn task(&self, input: &TaskPromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("task")?;
        let rendered = template.render(context! {
            project_name => &input.set.project_name,
            context => input.set.context.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            iteration => input.iteration,
            completed => input.set.completed_count(),
            total => input.set.tasks.len(),
            task => TaskContext::from_task(input.task),
            store_file => input.store_file,
            marker => COMPLETION_MARKER,
        })?;
        Ok(rendered)
    }

    pub fn repair(&self, store_file: &str, raw: &str, error: &str) -> Result<String> {
        let template = self.env.get_template("repair")?;
        let rendered = template.render(context! {
            store_file => store_file,
            raw => raw,
            error => error,
        })?;
        Ok(rendered)
    }
}
