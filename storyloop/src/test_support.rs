//! Test helpers: task builders, a scripted work performer, a recording VCS
//! and a ready-wired workflow harness.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::Value;
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::error::DispatchError;
use crate::events::{self, EventKind, EventReceiver, OutputLevel, OutputLine};
use crate::io::config::Config;
use crate::io::git::VcsManager;
use crate::io::performer::{DispatchRequest, OutputSink, WorkPerformer};
use crate::io::process::StreamKind;
use crate::io::task_store::TaskStore;
use crate::task_set::{Task, TaskSet};
use crate::workflow::Workflow;

/// Create a deterministic pending task.
pub fn task(id: &str, priority: i64) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        acceptance_criteria: Vec::new(),
        test_guidance: None,
        priority,
        passes: false,
        retry_count: 0,
    }
}

/// Wrap tasks in a version-0 set for project `demo`.
pub fn task_set(tasks: Vec<Task>) -> TaskSet {
    TaskSet {
        version: 0,
        project_name: "demo".to_string(),
        branch_name: None,
        context: None,
        tasks,
    }
}

/// A generation reply wrapping a two-story plan in prose and a code fence.
pub fn plan_response() -> String {
    r#"Here is the plan.

```json
{
  "project_name": "demo",
  "stories": [
    {"id": "p2", "title": "Second", "description": "Do the second thing", "acceptance_criteria": ["works"], "priority": 2},
    {"id": "p1", "title": "First", "description": "Do the first thing", "acceptance_criteria": ["works"], "priority": 1}
  ]
}
```
"#
    .to_string()
}

/// Out-of-band edit the scripted agent applies to the store before replying.
#[derive(Debug, Clone)]
pub enum StoreEdit {
    /// Set `passes=true` on the story with this id.
    MarkPassed(String),
    /// Replace the whole file.
    Overwrite(String),
}

#[derive(Debug, Clone)]
enum StepResult {
    Reply(String),
    Fail(String),
    WaitForCancel,
}

/// One scripted dispatch.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    edit: Option<StoreEdit>,
    result: StepResult,
}

impl ScriptStep {
    pub fn reply(output: impl Into<String>) -> Self {
        Self {
            edit: None,
            result: StepResult::Reply(output.into()),
        }
    }

    /// A dispatch that fails as if the agent exited non-zero.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            edit: None,
            result: StepResult::Fail(message.into()),
        }
    }

    /// A dispatch that only returns once the run is cancelled.
    pub fn block_until_cancelled() -> Self {
        Self {
            edit: None,
            result: StepResult::WaitForCancel,
        }
    }

    pub fn marking_passed(mut self, id: &str) -> Self {
        self.edit = Some(StoreEdit::MarkPassed(id.to_string()));
        self
    }

    pub fn overwriting(mut self, contents: impl Into<String>) -> Self {
        self.edit = Some(StoreEdit::Overwrite(contents.into()));
        self
    }
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<ScriptStep>,
    prompts: Vec<String>,
}

/// Work performer that replays scripted steps. Clones share the script, so a
/// test can keep a handle after boxing one into a workflow.
#[derive(Debug, Clone)]
pub struct ScriptedPerformer {
    store_path: PathBuf,
    script: Arc<Mutex<Script>>,
}

impl ScriptedPerformer {
    pub fn new(store_path: impl Into<PathBuf>, steps: Vec<ScriptStep>) -> Self {
        Self {
            store_path: store_path.into(),
            script: Arc::new(Mutex::new(Script {
                steps: steps.into(),
                prompts: Vec::new(),
            })),
        }
    }

    pub fn dispatch_count(&self) -> usize {
        self.script.lock().expect("script lock").prompts.len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.script.lock().expect("script lock").prompts.clone()
    }

    fn apply(&self, edit: &StoreEdit) {
        match edit {
            StoreEdit::MarkPassed(id) => {
                let raw = fs::read_to_string(&self.store_path).expect("read store");
                let mut doc: Value = serde_json::from_str(&raw).expect("parse store");
                let stories = doc["stories"].as_array_mut().expect("stories array");
                for story in stories.iter_mut() {
                    if story["id"] == id.as_str() {
                        story["passes"] = Value::Bool(true);
                    }
                }
                let payload = serde_json::to_string_pretty(&doc).expect("serialize store");
                fs::write(&self.store_path, payload).expect("write store");
            }
            StoreEdit::Overwrite(contents) => {
                fs::write(&self.store_path, contents).expect("overwrite store");
            }
        }
    }
}

impl WorkPerformer for ScriptedPerformer {
    fn name(&self) -> &str {
        "scripted"
    }

    fn dispatch(
        &self,
        request: &DispatchRequest<'_>,
        cancel: &CancelToken,
        sink: &dyn OutputSink,
    ) -> Result<String, DispatchError> {
        let step = {
            let mut script = self.script.lock().expect("script lock");
            script.prompts.push(request.prompt.to_string());
            script.steps.pop_front()
        };
        let Some(step) = step else {
            return Err(failure("script exhausted"));
        };
        if let Some(edit) = &step.edit {
            self.apply(edit);
        }
        match step.result {
            StepResult::Reply(output) => {
                for line in output.lines() {
                    sink.emit(OutputLine {
                        stream: StreamKind::Stdout,
                        level: OutputLevel::User,
                        text: line.to_string(),
                    });
                }
                Ok(output)
            }
            StepResult::Fail(message) => Err(failure(&message)),
            StepResult::WaitForCancel => {
                let deadline = Instant::now() + Duration::from_secs(10);
                while Instant::now() < deadline {
                    if cancel.sleep(Duration::from_millis(5)) {
                        return Err(DispatchError::Cancelled);
                    }
                }
                Err(failure("never cancelled"))
            }
        }
    }
}

fn failure(message: &str) -> DispatchError {
    DispatchError::Failed {
        program: "scripted".to_string(),
        code: Some(1),
        stderr_tail: message.to_string(),
    }
}

#[derive(Debug)]
struct VcsLog {
    repository: bool,
    fail_commits: bool,
    fail_branches: bool,
    current: String,
    branches: Vec<String>,
    commits: Vec<String>,
}

/// In-memory VCS that records branch and commit calls.
#[derive(Debug, Clone)]
pub struct RecordingVcs {
    log: Arc<Mutex<VcsLog>>,
}

impl Default for RecordingVcs {
    fn default() -> Self {
        Self {
            log: Arc::new(Mutex::new(VcsLog {
                repository: true,
                fail_commits: false,
                fail_branches: false,
                current: "main".to_string(),
                branches: Vec::new(),
                commits: Vec::new(),
            })),
        }
    }
}

impl RecordingVcs {
    pub fn not_a_repository(&self) {
        self.log.lock().expect("vcs lock").repository = false;
    }

    pub fn fail_commits(&self) {
        self.log.lock().expect("vcs lock").fail_commits = true;
    }

    pub fn fail_branches(&self) {
        self.log.lock().expect("vcs lock").fail_branches = true;
    }

    /// Task ids committed so far, in order.
    pub fn commits(&self) -> Vec<String> {
        self.log.lock().expect("vcs lock").commits.clone()
    }

    /// Branches created so far, in order.
    pub fn branches(&self) -> Vec<String> {
        self.log.lock().expect("vcs lock").branches.clone()
    }
}

impl VcsManager for RecordingVcs {
    fn is_repository(&self) -> bool {
        self.log.lock().expect("vcs lock").repository
    }

    fn current_branch(&self) -> Result<String> {
        Ok(self.log.lock().expect("vcs lock").current.clone())
    }

    fn branch_exists(&self, name: &str) -> bool {
        let log = self.log.lock().expect("vcs lock");
        name == "main" || log.branches.iter().any(|branch| branch == name)
    }

    fn create_branch(&self, name: &str) -> Result<()> {
        let mut log = self.log.lock().expect("vcs lock");
        if log.fail_branches {
            return Err(anyhow!("cannot create branch {name}"));
        }
        log.branches.push(name.to_string());
        log.current = name.to_string();
        Ok(())
    }

    fn checkout_branch(&self, name: &str) -> Result<()> {
        let mut log = self.log.lock().expect("vcs lock");
        if log.fail_branches {
            return Err(anyhow!("cannot check out {name}"));
        }
        log.current = name.to_string();
        Ok(())
    }

    fn has_changes(&self) -> bool {
        true
    }

    fn commit_task(&self, id: &str, _title: &str, _description: &str) -> Result<bool> {
        let mut log = self.log.lock().expect("vcs lock");
        if log.fail_commits {
            return Err(anyhow!("commit rejected by hook"));
        }
        log.commits.push(id.to_string());
        Ok(true)
    }
}

/// Drain everything currently queued and return the event kinds in order.
pub fn event_kinds(receiver: &EventReceiver) -> Vec<EventKind> {
    receiver.drain().iter().map(|event| event.kind()).collect()
}

/// Config with short lock waits suited to tests.
pub fn test_config() -> Config {
    Config {
        agent: "command".to_string(),
        command: vec!["true".to_string()],
        lock_timeout_ms: 2_000,
        lock_poll_ms: 5,
        dispatch_timeout_secs: 10,
        event_publish_timeout_ms: 50,
        ..Config::default()
    }
}

/// A workflow over a temp directory with scripted collaborators.
pub struct WorkflowHarness {
    pub temp: TempDir,
    pub workflow: Workflow,
    pub performer: ScriptedPerformer,
    pub vcs: RecordingVcs,
    pub receiver: EventReceiver,
    pub cancel: CancelToken,
}

impl WorkflowHarness {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::with_config(|_| {}, steps)
    }

    pub fn with_config(customize: impl FnOnce(&mut Config), steps: Vec<ScriptStep>) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = test_config();
        customize(&mut config);

        let cancel = CancelToken::new();
        let store = TaskStore::new(
            config.store_path(temp.path()),
            config.lock_options(),
            cancel.clone(),
        );
        let performer = ScriptedPerformer::new(config.store_path(temp.path()), steps);
        let vcs = RecordingVcs::default();
        let (publisher, receiver) =
            events::bounded(config.event_capacity, config.event_publish_timeout());
        let workflow = Workflow::new(
            &config,
            store,
            Box::new(performer.clone()),
            Box::new(vcs.clone()),
            publisher,
            cancel.clone(),
        )
        .expect("workflow");

        Self {
            temp,
            workflow,
            performer,
            vcs,
            receiver,
            cancel,
        }
    }

    pub fn store_path(&self) -> &Path {
        self.workflow.store().path()
    }

    pub fn write_store(&self, contents: &str) {
        fs::write(self.store_path(), contents).expect("write store");
    }
}
