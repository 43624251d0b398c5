//! Terminal consumer for the event stream.

use std::io::{self, Write};
use std::thread::{self, JoinHandle};

use crate::events::{Event, EventReceiver, OutputLevel};

/// Render one event as a terminal line. Diagnostic agent output is shown only
/// when `verbose`.
pub fn render(event: &Event, verbose: bool) -> Option<String> {
    let line = match event {
        Event::Generating => "Generating task plan...".to_string(),
        Event::Generated {
            project_name,
            task_count,
        } => format!("Generated {task_count} stories for {project_name}"),
        Event::Loaded {
            project_name,
            completed,
            total,
        } => format!("Resuming {project_name}: {completed}/{total} stories done"),
        Event::TaskStarted {
            id,
            title,
            iteration,
            completed,
            total,
        } => format!("[{iteration}] {id}: {title} ({completed}/{total} done)"),
        Event::TaskCompleted {
            id,
            success: true,
            ..
        } => format!("    {id} passed"),
        Event::TaskCompleted {
            id, retry_count, ..
        } => format!("    {id} not done yet (attempt {retry_count})"),
        Event::Output(line) => match line.level {
            OutputLevel::User => format!("    | {}", line.text),
            OutputLevel::Diagnostic if verbose => format!("    . {}", line.text),
            OutputLevel::Diagnostic => return None,
        },
        Event::Error { message } => format!("error: {message}"),
        Event::Completed { iterations, total } => {
            format!("All {total} stories passed after {iterations} iterations")
        }
        Event::Failed { reason } => format!("Stopped: {reason}"),
        Event::Dropped { count, last_kind } => {
            format!("({count} events dropped, last was {last_kind})")
        }
    };
    Some(line)
}

/// Write events to `out` until every publisher is gone.
pub fn consume<W: Write>(receiver: EventReceiver, verbose: bool, out: &mut W) -> io::Result<()> {
    for event in receiver {
        if let Some(line) = render(&event, verbose) {
            writeln!(out, "{line}")?;
            out.flush()?;
        }
    }
    Ok(())
}

/// Run [`consume`] on a background thread writing to stdout.
pub fn spawn(receiver: EventReceiver, verbose: bool) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || consume(receiver, verbose, &mut io::stdout().lock()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::events::{OutputLine, bounded};
    use crate::io::process::StreamKind;

    fn output(level: OutputLevel, text: &str) -> Event {
        Event::Output(OutputLine {
            stream: StreamKind::Stdout,
            level,
            text: text.to_string(),
        })
    }

    #[test]
    fn hides_diagnostic_output_unless_verbose() {
        let noise = output(OutputLevel::Diagnostic, "{\"type\":\"ping\"}");
        assert_eq!(render(&noise, false), None);
        assert!(render(&noise, true).is_some());
        assert_eq!(
            render(&output(OutputLevel::User, "hi"), false).as_deref(),
            Some("    | hi")
        );
    }

    #[test]
    fn consumes_until_publishers_are_dropped() {
        let (publisher, receiver) = bounded(8, Duration::from_millis(10));
        publisher.publish(Event::TaskStarted {
            id: "a".to_string(),
            title: "Add".to_string(),
            iteration: 1,
            completed: 0,
            total: 2,
        });
        publisher.publish(Event::Failed {
            reason: "cancelled".to_string(),
        });
        drop(publisher);

        let mut out = Vec::new();
        consume(receiver, false, &mut out).expect("consume");
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text, "[1] a: Add (0/2 done)\nStopped: cancelled\n");
    }
}
