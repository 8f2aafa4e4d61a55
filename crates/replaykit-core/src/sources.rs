//! Script source references embedded in JavaScript exception payloads.

use serde::Deserialize;
use std::collections::HashSet;

/// `ErrorEvent::source` value marking a script exception.
pub const JS_EXCEPTION_SOURCE: &str = "js_exception";

/// One entry of the stack trace carried in an exception payload.
/// Only the file name matters here; other fields are ignored.
#[derive(Debug, Deserialize)]
struct StackFrame {
    #[serde(rename = "fileName", default)]
    file_name: Option<String>,
}

fn strip_query(name: &str) -> &str {
    name.split_once('?').map_or(name, |(path, _)| path)
}

/// Collect the remote script files referenced by a stack trace payload.
///
/// Names are kept when, without their query string, they start with
/// `http`. Two names that differ only in their query string count once;
/// the first one seen is returned as-is.
pub fn extract_js_exception_sources(payload: &str) -> Result<Vec<String>, serde_json::Error> {
    let frames: Vec<StackFrame> = serde_json::from_str(payload)?;
    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    for name in frames.into_iter().filter_map(|frame| frame.file_name) {
        let stripped = strip_query(&name);
        if !stripped.starts_with("http") {
            continue;
        }
        if seen.insert(stripped.to_owned()) {
            sources.push(name);
        }
    }
    Ok(sources)
}
