//! Workflow executor: generation, resume, repair and branch setup.
//!
//! The implementation loop itself lives in [`crate::looping`]. Every
//! collaborator is injected through [`Workflow::new`], so tests swap in
//! scripted performers and recording VCS managers without touching the
//! filesystem layout or spawning agents.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::extract::extract_json_object;
use crate::error::{DispatchError, GenerateError, RepairExhausted, StateError, StoreError};
use crate::events::{Event, EventPublisher};
use crate::generate::parse_generation_response;
use crate::io::config::Config;
use crate::io::git::VcsManager;
use crate::io::performer::{DispatchRequest, WorkPerformer};
use crate::io::prompt::PromptBuilder;
use crate::io::task_store::TaskStore;
use crate::task_set::TaskSet;

/// Repair dispatches allowed before a corrupt store is fatal.
pub const MAX_REPAIR_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Init,
    Generating,
    Implementing,
    Completed,
    Failed,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Init => "init",
            WorkflowState::Generating => "generating",
            WorkflowState::Implementing => "implementing",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Loop limits and naming taken from the validated config.
#[derive(Debug, Clone)]
pub(crate) struct WorkflowSettings {
    pub(crate) max_iterations: u32,
    pub(crate) max_retries: u32,
    pub(crate) dispatch_timeout: Duration,
    pub(crate) store_file: String,
}

impl WorkflowSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_retries: config.max_retries,
            dispatch_timeout: config.dispatch_timeout(),
            store_file: config.store_file.clone(),
        }
    }
}

pub struct Workflow {
    pub(crate) settings: WorkflowSettings,
    pub(crate) store: TaskStore,
    pub(crate) performer: Box<dyn WorkPerformer>,
    pub(crate) vcs: Box<dyn VcsManager>,
    pub(crate) events: EventPublisher,
    pub(crate) cancel: CancelToken,
    pub(crate) prompts: PromptBuilder,
    pub(crate) state: WorkflowState,
    /// Implementation dispatches made so far in this run.
    pub(crate) iterations: u32,
}

impl Workflow {
    /// Build a workflow from explicit collaborators. The config is validated
    /// here so a bad limit fails before anything is dispatched.
    pub fn new(
        config: &Config,
        store: TaskStore,
        performer: Box<dyn WorkPerformer>,
        vcs: Box<dyn VcsManager>,
        events: EventPublisher,
        cancel: CancelToken,
    ) -> Result<Self> {
        config.validate().context("invalid config")?;
        Ok(Self {
            settings: WorkflowSettings::from_config(config),
            store,
            performer,
            vcs,
            events,
            cancel,
            prompts: PromptBuilder::new(),
            state: WorkflowState::Init,
            iterations: 0,
        })
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub(crate) fn ensure_state(
        &self,
        allowed: &[WorkflowState],
        operation: &'static str,
    ) -> Result<(), StateError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(StateError {
                state: self.state,
                operation,
            })
        }
    }

    /// Enter the terminal failed state and report `reason`.
    pub(crate) fn fail(&mut self, reason: String) {
        error!(reason = %reason, "workflow failed");
        self.state = WorkflowState::Failed;
        self.events.publish(Event::Failed { reason });
    }

    /// Ask the agent for a task plan and validate it. Nothing is persisted.
    #[instrument(skip_all)]
    pub fn run_generate(&mut self, request: &str) -> Result<TaskSet, GenerateError> {
        self.ensure_state(&[WorkflowState::Init], "generate")?;
        self.state = WorkflowState::Generating;
        self.events.publish(Event::Generating);

        match self.generate(request) {
            Ok(set) => {
                info!(project = %set.project_name, tasks = set.tasks.len(), "plan generated");
                self.events.publish(Event::Generated {
                    project_name: set.project_name.clone(),
                    task_count: set.tasks.len(),
                });
                Ok(set)
            }
            Err(err) => {
                self.fail(format!("{}: {err}", err.class()));
                Err(err)
            }
        }
    }

    fn generate(&self, request: &str) -> Result<TaskSet, GenerateError> {
        let prompt = self
            .prompts
            .generation(request)
            .map_err(|err| GenerateError::Prompt(format!("{err:#}")))?;
        let response = self.performer.dispatch(
            &DispatchRequest {
                prompt: &prompt,
                timeout: self.settings.dispatch_timeout,
            },
            &self.cancel,
            &self.events,
        )?;
        parse_generation_response(&response)
    }

    /// End a dry run after a successful generation.
    pub fn finish_dry_run(&mut self) -> Result<(), StateError> {
        self.ensure_state(&[WorkflowState::Generating], "finish a dry run")?;
        self.state = WorkflowState::Completed;
        Ok(())
    }

    /// Save a freshly generated set; returns it with the stored version.
    pub fn persist_generated(&mut self, set: &TaskSet) -> Result<TaskSet, StoreError> {
        match self.store.save(set) {
            Ok(version) => {
                let mut saved = set.clone();
                saved.version = version;
                Ok(saved)
            }
            Err(err) => {
                self.fail(format!("{}: {err}", err.class()));
                Err(err)
            }
        }
    }

    /// Load the stored set for a resumed run. Store errors are returned as-is.
    pub fn run_load(&mut self) -> Result<TaskSet, StoreError> {
        let set = self.store.load()?;
        self.publish_loaded(&set);
        Ok(set)
    }

    /// Like [`Workflow::run_load`], but a set that is not valid JSON is handed
    /// to the agent for repair up to [`MAX_REPAIR_ATTEMPTS`] times.
    pub fn load_or_repair(&mut self) -> Result<TaskSet> {
        let set = self.load_with_repair()?;
        self.publish_loaded(&set);
        Ok(set)
    }

    fn publish_loaded(&self, set: &TaskSet) {
        info!(
            project = %set.project_name,
            version = set.version,
            completed = set.completed_count(),
            total = set.tasks.len(),
            "task set loaded"
        );
        self.events.publish(Event::Loaded {
            project_name: set.project_name.clone(),
            completed: set.completed_count(),
            total: set.tasks.len(),
        });
    }

    pub(crate) fn load_with_repair(&self) -> Result<TaskSet> {
        let mut attempts = 0u32;
        loop {
            match self.store.load() {
                Ok(set) => return Ok(set),
                Err(StoreError::Parse { path, message, raw }) => {
                    if attempts >= MAX_REPAIR_ATTEMPTS {
                        return Err(RepairExhausted {
                            path,
                            attempts,
                            last_error: message,
                        }
                        .into());
                    }
                    attempts += 1;
                    warn!(path = %path.display(), attempt = attempts, error = %message, "task set is corrupt, requesting repair");
                    self.events.error(format!(
                        "{} is not valid JSON ({message}); repair attempt {attempts}/{MAX_REPAIR_ATTEMPTS}",
                        path.display()
                    ));
                    self.repair_once(&raw, &message)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// One repair dispatch. A fix is written only if it parses and validates;
    /// the caller re-reads the store either way, since the agent may have
    /// rewritten the file itself.
    fn repair_once(&self, raw: &str, parse_error: &str) -> Result<()> {
        let prompt = self
            .prompts
            .repair(&self.settings.store_file, raw, parse_error)
            .context("render repair prompt")?;
        let response = match self.performer.dispatch(
            &DispatchRequest {
                prompt: &prompt,
                timeout: self.settings.dispatch_timeout,
            },
            &self.cancel,
            &self.events,
        ) {
            Ok(response) => response,
            Err(DispatchError::Cancelled) => return Err(DispatchError::Cancelled.into()),
            Err(err) => {
                warn!(error = %err, "repair dispatch failed");
                return Ok(());
            }
        };

        let fixed = match extract_json_object(&response) {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "repair response carried no document");
                return Ok(());
            }
        };
        let fixed = serde_json::to_string(&fixed).context("serialize repaired task set")?;
        match self.store.write_raw(&fixed) {
            Ok(set) => {
                info!(version = set.version, "repaired task set written");
                Ok(())
            }
            Err(err @ (StoreError::Parse { .. } | StoreError::Validation(_))) => {
                warn!(error = %err, "repaired document rejected");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Check out the set's branch, creating it when missing. Failures are
    /// reported but never stop the run.
    #[instrument(skip_all)]
    pub fn prepare_branch(&self, set: &TaskSet) {
        let Some(branch) = set.branch_name.as_deref() else {
            return;
        };
        if !self.vcs.is_repository() {
            debug!(branch, "not a repository, skipping branch setup");
            return;
        }
        let result = match self.vcs.current_branch() {
            Ok(current) if current == branch => Ok(()),
            _ if self.vcs.branch_exists(branch) => self.vcs.checkout_branch(branch),
            _ => self.vcs.create_branch(branch),
        };
        if let Err(err) = result {
            warn!(branch, error = %err, "branch setup failed");
            self.events
                .error(format!("could not switch to branch {branch}: {err:#}"));
        }
    }
}
