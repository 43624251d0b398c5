//! Extraction of an embedded JSON object from free-form agent output.

use std::collections::HashMap;

use serde_json::Value;

/// Why no JSON object could be extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// The text contains no `{`.
    NoObject,
    /// An object starts but its braces never balance.
    Unbalanced,
    /// Balanced candidates were found but none parsed as a JSON object.
    Invalid(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::NoObject => f.write_str("no JSON object found in response"),
            ExtractError::Unbalanced => f.write_str("unbalanced braces in JSON object"),
            ExtractError::Invalid(msg) => write!(f, "invalid JSON object: {msg}"),
        }
    }
}

/// Find the byte range of the balanced `{...}` that starts at `start`.
///
/// Braces inside double-quoted strings are ignored; backslash escapes inside
/// strings are honored so `"\""` does not end the string.
pub fn balanced_object_end(text: &str, start: usize) -> Option<usize> {
    if text.as_bytes().get(start) != Some(&b'{') {
        return None;
    }
    scan_object(text, start, &mut HashMap::new())
}

/// Scan from the `{` at `start` until it closes or the text ends.
///
/// Every structural `{` met on the way is recorded in `known` with its end
/// offset, or `None` when it never closes. A later scan from one of those
/// positions would see the same bytes in the same string state, so its
/// result can be looked up instead of recomputed.
fn scan_object(
    text: &str,
    start: usize,
    known: &mut HashMap<usize, Option<usize>>,
) -> Option<usize> {
    let mut open = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (pos, &byte) in text.as_bytes().iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => open.push(pos),
            b'}' => {
                let Some(opened) = open.pop() else { continue };
                known.insert(opened, Some(pos + 1));
                if open.is_empty() {
                    return Some(pos + 1);
                }
            }
            _ => {}
        }
    }
    known.extend(open.into_iter().map(|opened| (opened, None)));
    None
}

/// Extract the first balanced JSON object from `text`, tolerating prose and
/// markdown fences around it.
///
/// Candidates are tried left to right, so a stray `{` in leading prose does
/// not hide the real payload. Each byte is scanned about once however many
/// unclosed braces the text carries.
pub fn extract_json_object(text: &str) -> Result<Value, ExtractError> {
    let mut last_error: Option<ExtractError> = None;
    let mut known = HashMap::new();
    for (start, _) in text.match_indices('{') {
        let end = match known.get(&start) {
            Some(&end) => end,
            None => scan_object(text, start, &mut known),
        };
        let Some(end) = end else {
            last_error.get_or_insert(ExtractError::Unbalanced);
            continue;
        };
        match serde_json::from_str::<Value>(&text[start..end]) {
            Ok(value) if value.is_object() => return Ok(value),
            Ok(_) => {}
            Err(err) => {
                if !matches!(last_error, Some(ExtractError::Invalid(_))) {
                    last_error = Some(ExtractError::Invalid(err.to_string()));
                }
            }
        }
    }
    Err(last_error.unwrap_or(ExtractError::NoObject))
}
