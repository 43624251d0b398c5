//! Work performer abstraction for agent invocation.
//!
//! The [`WorkPerformer`] trait decouples the scheduler from the agent backend.
//! Backends are a closed set ([`PerformerKind`]) resolved when the config is
//! validated, so an unknown identifier fails before any work starts. Tests use
//! scripted performers that return predetermined output without spawning
//! processes.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::error::DispatchError;
use crate::events::{Event, EventPublisher, OutputLevel, OutputLine};
use crate::io::config::Config;
use crate::io::process::{RunLimits, StreamKind, run_command_streaming};

/// Receives agent output lines as they are produced.
pub trait OutputSink {
    fn emit(&self, line: OutputLine);
}

impl OutputSink for EventPublisher {
    fn emit(&self, line: OutputLine) {
        self.publish(Event::Output(line));
    }
}

/// Parameters for a dispatch.
#[derive(Debug, Clone)]
pub struct DispatchRequest<'a> {
    pub prompt: &'a str,
    /// Deadline for this dispatch; the agent is killed when it elapses.
    pub timeout: Duration,
}

/// Abstraction over agent backends: text in, text plus side effects out.
pub trait WorkPerformer {
    fn name(&self) -> &str;

    /// Run the agent on `request.prompt`, streaming output lines to `sink`, and
    /// return its final output text.
    fn dispatch(
        &self,
        request: &DispatchRequest<'_>,
        cancel: &CancelToken,
        sink: &dyn OutputSink,
    ) -> Result<String, DispatchError>;
}

/// Supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformerKind {
    Claude,
    Codex,
    Amp,
    /// A user-supplied argv that reads the prompt on stdin.
    Command,
}

impl PerformerKind {
    pub const ALL: [PerformerKind; 4] = [
        PerformerKind::Claude,
        PerformerKind::Codex,
        PerformerKind::Amp,
        PerformerKind::Command,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PerformerKind::Claude => "claude",
            PerformerKind::Codex => "codex",
            PerformerKind::Amp => "amp",
            PerformerKind::Command => "command",
        }
    }

    /// Program and fixed arguments; the prompt always goes to stdin.
    fn argv(self, config: &Config) -> Vec<String> {
        let fixed: &[&str] = match self {
            PerformerKind::Claude => &["claude", "--print", "--dangerously-skip-permissions"],
            PerformerKind::Codex => &[
                "codex",
                "exec",
                "--sandbox",
                "danger-full-access",
                "--skip-git-repo-check",
                "-",
            ],
            PerformerKind::Amp => &["amp", "--dangerously-allow-all", "--execute"],
            PerformerKind::Command => return config.command.clone(),
        };
        fixed.iter().map(|arg| arg.to_string()).collect()
    }

    /// Heuristic split between agent-internal noise and user-relevant output.
    pub fn classify_line(self, stream: StreamKind, line: &str) -> OutputLevel {
        if stream == StreamKind::Stderr {
            return OutputLevel::Diagnostic;
        }
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('{') {
            return OutputLevel::Diagnostic;
        }
        match self {
            // codex prefixes its own progress lines with a bracketed timestamp.
            PerformerKind::Codex if trimmed.starts_with('[') => OutputLevel::Diagnostic,
            _ => OutputLevel::User,
        }
    }
}

impl fmt::Display for PerformerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PerformerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        PerformerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = PerformerKind::ALL.iter().map(|k| k.as_str()).collect();
                anyhow!("unknown agent {s:?} (expected one of: {})", known.join(", "))
            })
    }
}

/// Performer that spawns an agent CLI and feeds the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandPerformer {
    kind: PerformerKind,
    argv: Vec<String>,
    workdir: PathBuf,
    output_limit_bytes: usize,
    poll_interval: Duration,
}

impl CommandPerformer {
    pub fn new(kind: PerformerKind, config: &Config, workdir: impl Into<PathBuf>) -> Result<Self> {
        let argv = kind.argv(config);
        if argv.is_empty() {
            return Err(anyhow!("agent {kind} has no command configured"));
        }
        Ok(Self {
            kind,
            argv,
            workdir: workdir.into(),
            output_limit_bytes: config.output_limit_bytes,
            poll_interval: Duration::from_millis(config.lock_poll_ms),
        })
    }
}

/// Build the performer selected by `config.agent`.
pub fn build_performer(config: &Config, workdir: impl Into<PathBuf>) -> Result<CommandPerformer> {
    let kind = config.performer_kind()?;
    CommandPerformer::new(kind, config, workdir)
}

impl WorkPerformer for CommandPerformer {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    #[instrument(skip_all, fields(agent = %self.kind, timeout_secs = request.timeout.as_secs()))]
    fn dispatch(
        &self,
        request: &DispatchRequest<'_>,
        cancel: &CancelToken,
        sink: &dyn OutputSink,
    ) -> Result<String, DispatchError> {
        info!(workdir = %self.workdir.display(), "dispatching agent");
        let program = &self.argv[0];
        let mut cmd = Command::new(program);
        cmd.args(&self.argv[1..]).current_dir(&self.workdir);

        let kind = self.kind;
        let output = run_command_streaming(
            cmd,
            Some(request.prompt.as_bytes().to_vec()),
            RunLimits {
                timeout: request.timeout,
                poll_interval: self.poll_interval,
                output_limit_bytes: self.output_limit_bytes,
                cancel,
            },
            &mut |stream, text| {
                sink.emit(OutputLine {
                    stream,
                    level: kind.classify_line(stream, text),
                    text: text.to_string(),
                });
            },
        )
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                DispatchError::Spawn {
                    program: program.clone(),
                    source,
                }
            } else {
                DispatchError::Io(source)
            }
        })?;

        if output.cancelled {
            return Err(DispatchError::Cancelled);
        }
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(DispatchError::TimedOut(request.timeout));
        }
        if !output.success() {
            warn!(exit_code = ?output.status.and_then(|s| s.code()), "agent failed");
            return Err(DispatchError::Failed {
                program: program.clone(),
                code: output.status.and_then(|s| s.code()),
                stderr_tail: output.stderr_tail(20),
            });
        }

        debug!(stdout_bytes = output.stdout.len(), "agent finished");
        Ok(output.stdout_text())
    }
}
