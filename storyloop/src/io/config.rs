//! Configuration stored under `.storyloop/config.toml`.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::lock::LockOptions;
use crate::io::performer::PerformerKind;

pub const DEFAULT_CONFIG_PATH: &str = ".storyloop/config.toml";

/// Storyloop configuration (TOML).
///
/// Missing fields fall back to defaults. The config is validated once, before
/// the scheduler is built, so bad values fail fast instead of mid-run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Work performer backend: `claude`, `codex`, `amp` or `command`.
    pub agent: String,

    /// Argv for the `command` agent; the prompt is fed on stdin.
    pub command: Vec<String>,

    /// Global ceiling on implementation dispatches per run.
    pub max_iterations: u32,

    /// Per-task ceiling on failed attempts.
    pub max_retries: u32,

    /// File name of the task set, relative to the project root.
    pub store_file: String,

    pub lock_timeout_ms: u64,
    pub lock_poll_ms: u64,

    /// Wall-clock budget for a single dispatch.
    pub dispatch_timeout_secs: u64,

    pub event_capacity: usize,
    pub event_publish_timeout_ms: u64,

    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: "claude".to_string(),
            command: Vec::new(),
            max_iterations: 50,
            max_retries: 3,
            store_file: "prd.json".to_string(),
            lock_timeout_ms: 5_000,
            lock_poll_ms: 50,
            dispatch_timeout_secs: 30 * 60,
            event_capacity: 1024,
            event_publish_timeout_ms: 250,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let kind: PerformerKind = self.agent.parse()?;
        if kind == PerformerKind::Command
            && (self.command.is_empty() || self.command[0].trim().is_empty())
        {
            return Err(anyhow!("command must be a non-empty array when agent = \"command\""));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        validate_store_file(&self.store_file)?;
        if self.lock_timeout_ms == 0 {
            return Err(anyhow!("lock_timeout_ms must be > 0"));
        }
        if self.lock_poll_ms == 0 {
            return Err(anyhow!("lock_poll_ms must be > 0"));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(anyhow!("dispatch_timeout_secs must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(anyhow!("event_capacity must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn performer_kind(&self) -> Result<PerformerKind> {
        self.agent.parse()
    }

    pub fn store_path(&self, root: &Path) -> PathBuf {
        root.join(&self.store_file)
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.lock_timeout_ms),
            poll_interval: Duration::from_millis(self.lock_poll_ms),
        }
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn event_publish_timeout(&self) -> Duration {
        Duration::from_millis(self.event_publish_timeout_ms)
    }
}

/// Reject empty names and anything that could escape the project root.
fn validate_store_file(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("store_file must not be empty"));
    }
    let path = Path::new(name);
    let mut components = path.components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if !single_normal || name.contains(['/', '\\']) {
        return Err(anyhow!(
            "store_file must be a plain file name without path separators or '..': {name:?}"
        ));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp config in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .context("write temp config")?;
    tmp.persist(path)
        .with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
