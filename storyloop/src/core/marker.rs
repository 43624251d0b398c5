//! Completion-marker detection in agent output.

use std::sync::LazyLock;

use regex::Regex;

/// Sentinel an agent prints when it believes the task is done.
pub const COMPLETION_MARKER: &str = "COMPLETED:";

/// Returns true if some line of `output` starts with [`COMPLETION_MARKER`],
/// ignoring leading whitespace.
///
/// The marker must anchor the line: `NOT COMPLETED: ...` mentions the marker
/// but does not count.
pub fn has_completion_marker(output: &str) -> bool {
    static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(&format!(r"(?m)^[ \t]*{}", regex::escape(COMPLETION_MARKER)))
            .expect("marker regex should be valid")
    });
    MARKER_RE.is_match(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_at_line_start_counts() {
        assert!(has_completion_marker("COMPLETED: done"));
    }

    #[test]
    fn negated_phrasing_does_not_count() {
        assert!(!has_completion_marker("NOT COMPLETED: x"));
    }

    #[test]
    fn indented_marker_counts() {
        assert!(has_completion_marker("  COMPLETED: x"));
        assert!(has_completion_marker("\tCOMPLETED: x"));
    }

    #[test]
    fn empty_output_does_not_count() {
        assert!(!has_completion_marker(""));
    }

    #[test]
    fn marker_on_later_line_counts() {
        let output = "ran tests\nall green\nCOMPLETED: story-1 implemented\n";
        assert!(has_completion_marker(output));
    }

    #[test]
    fn marker_mid_line_does_not_count() {
        assert!(!has_completion_marker("I have not yet COMPLETED: the work"));
        assert!(!has_completion_marker("COMPLETED without colon"));
    }

    #[test]
    fn crlf_lines_are_handled() {
        assert!(has_completion_marker("working\r\nCOMPLETED: yes\r\n"));
    }
}
