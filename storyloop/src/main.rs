//! `storyloop`: generate a task plan from a request and drive a coding agent
//! through it, or resume a plan already on disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::warn;

use storyloop::cancel::CancelToken;
use storyloop::display;
use storyloop::events;
use storyloop::exit_codes;
use storyloop::io::config::{Config, DEFAULT_CONFIG_PATH, load_config};
use storyloop::io::git::Git;
use storyloop::io::performer::build_performer;
use storyloop::io::task_store::TaskStore;
use storyloop::logging;
use storyloop::looping::LoopOutcome;
use storyloop::task_set::TaskSet;
use storyloop::workflow::Workflow;

#[derive(Debug, Parser)]
#[command(
    name = "storyloop",
    version,
    about = "Drive a coding agent through a prioritized story list"
)]
struct Cli {
    /// What to build. Required unless --resume or --request-file is given.
    #[arg(conflicts_with = "request_file")]
    request: Option<String>,

    /// Read the request from a file instead.
    #[arg(long, value_name = "PATH")]
    request_file: Option<PathBuf>,

    /// Generate and print the plan without persisting or implementing it.
    #[arg(long, conflicts_with = "resume")]
    dry_run: bool,

    /// Continue the task set already on disk.
    #[arg(long, conflicts_with_all = ["request", "request_file"])]
    resume: bool,

    /// Show agent diagnostics and debug tracing.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (defaults to .storyloop/config.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

enum RunResult {
    DryRun(TaskSet),
    Loop(LoopOutcome),
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<i32> {
    let root = std::env::current_dir().context("resolve working directory")?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| root.join(DEFAULT_CONFIG_PATH));
    let config = load_config(&config_path)?;
    let request = resolve_request(cli)?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("install Ctrl-C handler")?;
    }

    let store = TaskStore::new(
        config.store_path(&root),
        config.lock_options(),
        cancel.clone(),
    );
    if !cli.resume && !cli.dry_run && store.exists() {
        bail!(
            "{} already exists; pass --resume to continue it",
            store.path().display()
        );
    }

    let (publisher, receiver) =
        events::bounded(config.event_capacity, config.event_publish_timeout());
    let consumer = display::spawn(receiver, cli.verbose);
    let result = build_workflow(&config, &root, store, publisher, cancel)
        .and_then(|mut workflow| drive(&mut workflow, cli.resume, cli.dry_run, request.as_deref()));

    // The workflow owned the only publisher, so the consumer drains and exits.
    match consumer.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "display output failed"),
        Err(_) => warn!("display thread panicked"),
    }

    match result? {
        RunResult::DryRun(set) => {
            let json = serde_json::to_string_pretty(&set).context("serialize plan")?;
            println!("{json}");
            Ok(exit_codes::OK)
        }
        RunResult::Loop(outcome) => Ok(exit_code(&outcome)),
    }
}

fn build_workflow(
    config: &Config,
    root: &Path,
    store: TaskStore,
    publisher: events::EventPublisher,
    cancel: CancelToken,
) -> Result<Workflow> {
    let performer = build_performer(config, root)?;
    Workflow::new(
        config,
        store,
        Box::new(performer),
        Box::new(Git::new(root)),
        publisher,
        cancel,
    )
}

fn drive(
    workflow: &mut Workflow,
    resume: bool,
    dry_run: bool,
    request: Option<&str>,
) -> Result<RunResult> {
    let set = if resume {
        workflow.load_or_repair()?
    } else {
        let request = request.context("a request is required unless --resume is given")?;
        let generated = workflow.run_generate(request)?;
        if dry_run {
            workflow.finish_dry_run()?;
            return Ok(RunResult::DryRun(generated));
        }
        workflow.persist_generated(&generated)?
    };
    workflow.prepare_branch(&set);
    let outcome = workflow.run_implementation(&set)?;
    Ok(RunResult::Loop(outcome))
}

fn resolve_request(cli: &Cli) -> Result<Option<String>> {
    let request = match (&cli.request, &cli.request_file) {
        (Some(text), _) => Some(text.clone()),
        (None, Some(path)) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("read request file {}", path.display()))?,
        ),
        (None, None) => None,
    };
    match request {
        Some(text) if text.trim().is_empty() => bail!("request must not be empty"),
        Some(text) => Ok(Some(text)),
        None if cli.resume => Ok(None),
        None => bail!("a request is required unless --resume is given"),
    }
}

fn exit_code(outcome: &LoopOutcome) -> i32 {
    if outcome.all_passed() {
        exit_codes::OK
    } else if outcome.completed > 0 {
        exit_codes::PARTIAL
    } else {
        exit_codes::FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyloop::looping::LoopStop;

    fn outcome(completed: usize, stop: LoopStop) -> LoopOutcome {
        LoopOutcome {
            iterations: 3,
            completed,
            total: 2,
            stop,
        }
    }

    #[test]
    fn parse_request_with_flags() {
        let cli = Cli::parse_from(["storyloop", "build a todo app", "--dry-run", "-v"]);
        assert_eq!(cli.request.as_deref(), Some("build a todo app"));
        assert!(cli.dry_run);
        assert!(cli.verbose);
        assert!(!cli.resume);
    }

    #[test]
    fn resume_conflicts_with_request() {
        assert!(Cli::try_parse_from(["storyloop", "x", "--resume"]).is_err());
        assert!(Cli::try_parse_from(["storyloop", "--resume", "--dry-run"]).is_err());
        assert!(Cli::try_parse_from(["storyloop", "--resume"]).is_ok());
    }

    #[test]
    fn request_is_required_without_resume() {
        let cli = Cli::parse_from(["storyloop"]);
        assert!(resolve_request(&cli).is_err());
        let cli = Cli::parse_from(["storyloop", "   "]);
        assert!(resolve_request(&cli).is_err());
    }

    #[test]
    fn request_file_is_read() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("request.md");
        fs::write(&path, "build a parser\n").expect("write");
        let cli = Cli::parse_from([
            "storyloop",
            "--request-file",
            path.to_str().expect("utf8 path"),
        ]);
        assert_eq!(
            resolve_request(&cli).expect("request").as_deref(),
            Some("build a parser\n")
        );
    }

    #[test]
    fn exit_codes_follow_progress() {
        assert_eq!(exit_code(&outcome(2, LoopStop::Completed)), exit_codes::OK);
        assert_eq!(
            exit_code(&outcome(1, LoopStop::MaxIterations { max_iterations: 3 })),
            exit_codes::PARTIAL
        );
        assert_eq!(
            exit_code(&outcome(
                0,
                LoopStop::Exhausted {
                    tasks: vec!["a".to_string()]
                }
            )),
            exit_codes::FAILED
        );
        assert_eq!(exit_code(&outcome(0, LoopStop::Cancelled)), exit_codes::FAILED);
    }
}
