//! The implementation loop: reload, select, dispatch, reconcile, persist.

use std::fmt;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};

use crate::core::marker::has_completion_marker;
use crate::core::selector::{Selection, select};
use crate::error::{DispatchError, RepairExhausted, StoreError};
use crate::events::Event;
use crate::io::performer::DispatchRequest;
use crate::io::prompt::TaskPromptInputs;
use crate::task_set::{Task, TaskSet};
use crate::workflow::{Workflow, WorkflowState};

/// Reason the implementation loop stopped without a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every task passes; the store file has been removed.
    Completed,
    /// Open tasks remain but every one has used up its retries.
    Exhausted { tasks: Vec<String> },
    /// The run hit `max_iterations` dispatches.
    MaxIterations { max_iterations: u32 },
    Cancelled,
}

impl fmt::Display for LoopStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopStop::Completed => f.write_str("all tasks passed"),
            LoopStop::Exhausted { tasks } => {
                write!(f, "retries exhausted for: {}", tasks.join(", "))
            }
            LoopStop::MaxIterations { max_iterations } => {
                write!(f, "reached max_iterations ({max_iterations})")
            }
            LoopStop::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Summary of an implementation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Dispatches made by this run.
    pub iterations: u32,
    pub completed: usize,
    pub total: usize,
    pub stop: LoopStop,
}

impl LoopOutcome {
    pub fn all_passed(&self) -> bool {
        self.stop == LoopStop::Completed
    }
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    completed: usize,
    total: usize,
}

impl Progress {
    fn of(set: &TaskSet) -> Self {
        Self {
            completed: set.completed_count(),
            total: set.tasks.len(),
        }
    }
}

/// Short class name for a fatal loop error.
fn error_class(err: &anyhow::Error) -> &'static str {
    if let Some(store) = err.downcast_ref::<StoreError>() {
        return store.class();
    }
    if err.downcast_ref::<RepairExhausted>().is_some() {
        return "RepairExhausted";
    }
    "Error"
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Cancelled { .. })
    ) || matches!(
        err.downcast_ref::<DispatchError>(),
        Some(DispatchError::Cancelled)
    )
}

impl Workflow {
    /// Drive tasks to completion, one dispatch per iteration.
    ///
    /// The store is re-read before selection and after every dispatch, since
    /// the agent edits it out of band. Reload failures abort the run; commit
    /// and save failures are reported and the loop continues.
    #[instrument(skip_all, fields(project = %initial.project_name))]
    pub fn run_implementation(&mut self, initial: &TaskSet) -> Result<LoopOutcome> {
        self.ensure_state(
            &[WorkflowState::Init, WorkflowState::Generating],
            "run the implementation loop",
        )?;
        self.state = WorkflowState::Implementing;
        info!(
            tasks = initial.tasks.len(),
            completed = initial.completed_count(),
            max_iterations = self.settings.max_iterations,
            max_retries = self.settings.max_retries,
            "implementation loop starting"
        );

        let mut progress = Progress::of(initial);
        match self.implementation_loop(&mut progress) {
            Ok(stop) => {
                let outcome = LoopOutcome {
                    iterations: self.iterations,
                    completed: progress.completed,
                    total: progress.total,
                    stop,
                };
                self.finish(&outcome);
                Ok(outcome)
            }
            Err(err) => {
                self.fail(format!("{}: {err:#}", error_class(&err)));
                Err(err)
            }
        }
    }

    fn finish(&mut self, outcome: &LoopOutcome) {
        match &outcome.stop {
            LoopStop::Completed => {
                info!(iterations = outcome.iterations, "all tasks passed");
                self.state = WorkflowState::Completed;
                self.events.publish(Event::Completed {
                    iterations: outcome.iterations,
                    total: outcome.total,
                });
            }
            stop => self.fail(format!(
                "{stop} ({} of {} tasks complete)",
                outcome.completed, outcome.total
            )),
        }
    }

    fn implementation_loop(&mut self, progress: &mut Progress) -> Result<LoopStop> {
        loop {
            if self.cancel.is_cancelled() {
                info!("cancellation requested, stopping");
                return Ok(LoopStop::Cancelled);
            }

            let Some(set) = self.reload()? else {
                return Ok(LoopStop::Cancelled);
            };
            *progress = Progress::of(&set);

            let task = match select(&set, self.settings.max_retries) {
                Selection::Complete => {
                    self.remove_store();
                    return Ok(LoopStop::Completed);
                }
                Selection::Exhausted(tasks) => {
                    warn!(tasks = ?tasks, "every open task has exhausted its retries");
                    return Ok(LoopStop::Exhausted { tasks });
                }
                Selection::Next(task) => task.clone(),
            };

            if self.iterations >= self.settings.max_iterations {
                warn!(max_iterations = self.settings.max_iterations, "iteration ceiling reached");
                return Ok(LoopStop::MaxIterations {
                    max_iterations: self.settings.max_iterations,
                });
            }
            self.iterations += 1;

            match self.run_iteration(&set, &task, progress)? {
                IterationEnd::Continue => {}
                IterationEnd::Cancelled => return Ok(LoopStop::Cancelled),
            }
        }
    }

    #[instrument(skip_all, fields(task_id = %task.id, iteration = self.iterations))]
    fn run_iteration(
        &mut self,
        set: &TaskSet,
        task: &Task,
        progress: &mut Progress,
    ) -> Result<IterationEnd> {
        let iteration = self.iterations;
        info!(
            agent = self.performer.name(),
            title = %task.title,
            retry_count = task.retry_count,
            "dispatching task"
        );
        self.events.publish(Event::TaskStarted {
            id: task.id.clone(),
            title: task.title.clone(),
            iteration,
            completed: progress.completed,
            total: progress.total,
        });

        let prompt = self
            .prompts
            .task(&TaskPromptInputs {
                set,
                task,
                iteration,
                store_file: &self.settings.store_file,
            })
            .context("render task prompt")?;
        let output = match self.performer.dispatch(
            &DispatchRequest {
                prompt: &prompt,
                timeout: self.settings.dispatch_timeout,
            },
            &self.cancel,
            &self.events,
        ) {
            Ok(output) => Some(output),
            Err(DispatchError::Cancelled) => {
                info!("dispatch cancelled");
                return Ok(IterationEnd::Cancelled);
            }
            Err(err) => {
                warn!(error = %err, "dispatch failed, counting a failed attempt");
                self.events
                    .error(format!("agent run for {} failed: {err}", task.id));
                None
            }
        };

        let Some(mut reloaded) = self.reload()? else {
            return Ok(IterationEnd::Cancelled);
        };
        let current = reloaded
            .find_mut(&task.id)
            .ok_or_else(|| anyhow!("task {} disappeared from the task set", task.id))?;
        let marked = output.as_deref().is_some_and(has_completion_marker);
        let success = current.passes || marked;
        debug!(passes = current.passes, marked, "reconciled outcome");
        if success {
            current.passes = true;
        } else {
            current.retry_count += 1;
        }
        let retry_count = current.retry_count;
        let (title, description) = (current.title.clone(), current.description.clone());

        if success {
            self.commit(&task.id, &title, &description);
        }
        *progress = Progress::of(&reloaded);
        match self.store.save(&reloaded) {
            Ok(version) => debug!(version, "progress saved"),
            Err(err) => {
                error!(error = %err, "failed to save progress");
                self.events
                    .error(format!("failed to save progress for {}: {err}", task.id));
            }
        }

        info!(success, retry_count, "task iteration finished");
        self.events.publish(Event::TaskCompleted {
            id: task.id.clone(),
            success,
            retry_count,
        });
        Ok(IterationEnd::Continue)
    }

    /// Reload with repair. `None` means the run was cancelled while waiting.
    fn reload(&self) -> Result<Option<TaskSet>> {
        match self.load_with_repair() {
            Ok(set) => Ok(Some(set)),
            Err(err) if is_cancellation(&err) => Ok(None),
            Err(err) => Err(err.context("reload task set")),
        }
    }

    fn commit(&self, id: &str, title: &str, description: &str) {
        if !self.vcs.is_repository() {
            debug!("not a repository, skipping commit");
            return;
        }
        match self.vcs.commit_task(id, title, description) {
            Ok(true) => info!(task_id = id, "committed task"),
            Ok(false) => debug!(task_id = id, "nothing to commit"),
            Err(err) => {
                warn!(task_id = id, error = %err, "commit failed");
                self.events
                    .error(format!("commit for {id} failed: {err:#}"));
            }
        }
    }

    fn remove_store(&self) {
        if let Err(err) = self.store.delete() {
            error!(error = %err, "failed to remove completed task set");
            self.events
                .error(format!("could not remove completed task set: {err}"));
        }
    }
}

enum IterationEnd {
    Continue,
    Cancelled,
}
