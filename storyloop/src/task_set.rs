use serde::{Deserialize, Serialize};

/// A single prioritized unit of work.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_guidance: Option<String>,
    /// Lower is more urgent.
    pub priority: i64,
    pub passes: bool,
    pub retry_count: i64,
}

/// The persisted document: project metadata plus the ordered task list.
///
/// Tasks serialize under `stories` to match the on-disk format the agent is
/// told to edit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSet {
    pub version: u64,
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(rename = "stories")]
    pub tasks: Vec<Task>,
}

impl TaskSet {
    pub fn all_passed(&self) -> bool {
        self.tasks.iter().all(|task| task.passes)
    }

    pub fn completed_count(&self) -> usize {
        self.tasks.iter().filter(|task| task.passes).count()
    }

    pub fn find(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Stable sort by ascending priority; equal priorities keep list order.
    pub fn sort_by_priority(&mut self) {
        self.tasks.sort_by_key(|task| task.priority);
    }
}
