//! Helpers for running child processes with deadlines, cancellation and
//! line-by-line output streaming.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// How long to keep draining pipes after the child was killed. Grandchildren
/// may hold the pipes open; readers still running after this are abandoned.
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    /// `None` when the child had to be killed and could not be reaped.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|status| status.success())
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Last `max_lines` lines of stderr, for error messages.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Limits and signals for [`run_command_streaming`].
#[derive(Debug, Clone, Copy)]
pub struct RunLimits<'a> {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub output_limit_bytes: usize,
    pub cancel: &'a CancelToken,
}

enum Msg {
    Line(StreamKind, Vec<u8>),
    Eof(StreamKind),
    Failed(StreamKind, String),
}

/// Run a command, streaming each stdout/stderr line to `on_line` as it arrives.
///
/// Two reader threads drain the pipes so the child never blocks on a full pipe.
/// Lines are forwarded to `on_line` on the calling thread. The child is killed
/// when `limits.cancel` fires or `limits.timeout` elapses; readers are joined
/// (or abandoned after a short grace period) before returning.
/// `output_limit_bytes` bounds what is kept in memory per stream; every line is
/// still forwarded.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command_streaming(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    limits: RunLimits<'_>,
    on_line: &mut dyn FnMut(StreamKind, &str),
) -> std::io::Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e);
        }
    };

    if let Some(input) = stdin
        && let Some(mut child_stdin) = child.stdin.take()
    {
        // A separate writer keeps a large prompt from deadlocking against a
        // child that writes before it finishes reading.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                debug!(err = %e, "stdin write ended early");
            }
        });
    }

    let (tx, rx) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, StreamKind::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, StreamKind::Stderr, tx.clone());
    }
    drop(tx);

    let mut collector = Collector::new(limits.output_limit_bytes);
    let start = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;

    let status = loop {
        collector.drain_ready(&rx, on_line, limits, start);
        if let Some(status) = child.wait_timeout(limits.poll_interval)? {
            break Some(status);
        }
        if limits.cancel.is_cancelled() {
            warn!("cancellation requested, killing child");
            cancelled = true;
            break kill_and_reap(&mut child);
        }
        if start.elapsed() >= limits.timeout {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            break kill_and_reap(&mut child);
        }
    };

    let grace = if cancelled || timed_out {
        Some(Instant::now() + KILL_DRAIN_GRACE)
    } else {
        None
    };
    collector.drain_until_eof(&rx, on_line, limits, start, grace);

    if collector.stdout_truncated > 0 || collector.stderr_truncated > 0 {
        warn!(
            stdout_truncated = collector.stdout_truncated,
            stderr_truncated = collector.stderr_truncated,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout: collector.stdout,
        stderr: collector.stderr,
        stdout_truncated: collector.stdout_truncated,
        stderr_truncated: collector.stderr_truncated,
        timed_out,
        cancelled,
    })
}

/// Cancellation or the deadline. Checked between lines so a slow `on_line`
/// cannot hold off the kill.
fn must_stop(limits: RunLimits<'_>, start: Instant) -> bool {
    limits.cancel.is_cancelled() || start.elapsed() >= limits.timeout
}

fn kill_and_reap(child: &mut Child) -> Option<ExitStatus> {
    if let Err(e) = child.kill() {
        warn!(err = %e, "failed to kill child");
    }
    match child.wait_timeout(KILL_DRAIN_GRACE) {
        Ok(status) => status,
        Err(e) => {
            warn!(err = %e, "failed to reap killed child");
            None
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, kind: StreamKind, tx: Sender<Msg>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(Msg::Line(kind, line)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Msg::Failed(kind, e.to_string()));
                    return;
                }
            }
        }
        let _ = tx.send(Msg::Eof(kind));
    });
}

/// Accumulates bounded output and tracks which readers have finished.
struct Collector {
    limit: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: usize,
    stderr_truncated: usize,
    open_streams: usize,
}

impl Collector {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            open_streams: 2,
        }
    }

    fn drain_ready(
        &mut self,
        rx: &Receiver<Msg>,
        on_line: &mut dyn FnMut(StreamKind, &str),
        limits: RunLimits<'_>,
        start: Instant,
    ) {
        while !must_stop(limits, start) {
            match rx.try_recv() {
                Ok(msg) => self.handle(msg, on_line),
                Err(_) => return,
            }
        }
    }

    fn drain_until_eof(
        &mut self,
        rx: &Receiver<Msg>,
        on_line: &mut dyn FnMut(StreamKind, &str),
        limits: RunLimits<'_>,
        start: Instant,
        mut grace: Option<Instant>,
    ) {
        while self.open_streams > 0 {
            if grace.is_none() && must_stop(limits, start) {
                grace = Some(Instant::now() + KILL_DRAIN_GRACE);
            }
            let wait = match grace {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            open_streams = self.open_streams,
                            "abandoning output readers"
                        );
                        return;
                    }
                    (deadline - now).min(limits.poll_interval)
                }
                None => limits.poll_interval,
            };
            match rx.recv_timeout(wait) {
                Ok(msg) => self.handle(msg, on_line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn handle(&mut self, msg: Msg, on_line: &mut dyn FnMut(StreamKind, &str)) {
        match msg {
            Msg::Line(kind, bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                on_line(kind, text.trim_end_matches(['\n', '\r']));
                let (buf, truncated) = match kind {
                    StreamKind::Stdout => (&mut self.stdout, &mut self.stdout_truncated),
                    StreamKind::Stderr => (&mut self.stderr, &mut self.stderr_truncated),
                };
                let remaining = self.limit.saturating_sub(buf.len());
                let keep = bytes.len().min(remaining);
                buf.extend_from_slice(&bytes[..keep]);
                *truncated += bytes.len() - keep;
            }
            Msg::Eof(_) => self.open_streams -= 1,
            Msg::Failed(kind, err) => {
                warn!(?kind, err = %err, "output reader failed");
                self.open_streams -= 1;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn limits(cancel: &CancelToken) -> RunLimits<'_> {
        RunLimits {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            output_limit_bytes: 10_000,
            cancel,
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn streams_lines_from_both_pipes() {
        let cancel = CancelToken::new();
        let mut seen = Vec::new();
        let output = run_command_streaming(
            sh("echo out-1; echo err-1 >&2; echo out-2"),
            None,
            limits(&cancel),
            &mut |kind, line| seen.push((kind, line.to_string())),
        )
        .expect("run");

        assert!(output.success());
        assert_eq!(output.stdout_text(), "out-1\nout-2\n");
        assert!(seen.contains(&(StreamKind::Stdout, "out-1".to_string())));
        assert!(seen.contains(&(StreamKind::Stderr, "err-1".to_string())));
    }

    #[test]
    fn feeds_stdin() {
        let cancel = CancelToken::new();
        let output = run_command_streaming(
            sh("cat"),
            Some(b"prompt text\n".to_vec()),
            limits(&cancel),
            &mut |_, _| {},
        )
        .expect("run");
        assert_eq!(output.stdout_text(), "prompt text\n");
    }

    #[test]
    fn truncates_stored_output_but_forwards_lines() {
        let cancel = CancelToken::new();
        let mut forwarded = 0;
        let output = run_command_streaming(
            sh("for i in 1 2 3 4 5; do echo line-$i; done"),
            None,
            RunLimits {
                output_limit_bytes: 7,
                ..limits(&cancel)
            },
            &mut |_, _| forwarded += 1,
        )
        .expect("run");
        assert_eq!(forwarded, 5);
        assert_eq!(output.stdout.len(), 7);
        assert_eq!(output.stdout_truncated, 35 - 7);
    }

    #[test]
    fn kills_on_timeout() {
        let cancel = CancelToken::new();
        let start = Instant::now();
        let output = run_command_streaming(
            sh("sleep 30"),
            None,
            RunLimits {
                timeout: Duration::from_millis(100),
                ..limits(&cancel)
            },
            &mut |_, _| {},
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn slow_line_handler_does_not_delay_the_deadline() {
        let cancel = CancelToken::new();
        let start = Instant::now();
        let mut handled = 0;
        let output = run_command_streaming(
            sh("for i in $(seq 1 200); do echo line-$i; done; sleep 30"),
            None,
            RunLimits {
                timeout: Duration::from_millis(300),
                ..limits(&cancel)
            },
            &mut |_, _| {
                handled += 1;
                thread::sleep(Duration::from_millis(20));
            },
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(handled < 200);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn kills_on_cancel() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });
        let start = Instant::now();
        let output = run_command_streaming(sh("sleep 30"), None, limits(&cancel), &mut |_, _| {})
            .expect("run");
        assert!(output.cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().expect("join");
    }
}
