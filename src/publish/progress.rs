//! Build-log progress extraction.
//!
//! Build tools print step headers such as `#7 [build 3/5] RUN pnpm install`.
//! The same header can appear several times across interleaved output chunks,
//! and later chunks (image push, container start) often carry no header at
//! all, so only the most recent header of the most recent header-bearing chunk
//! is meaningful.

use serde::Deserialize;

/// One entry of the platform's deployment log.
#[derive(Debug, Clone, Deserialize)]
struct LogEntry {
    #[serde(default)]
    output: String,
}

/// Returns true if the line starts with `#` immediately followed by a digit.
pub fn is_step_marker(line: &str) -> bool {
    let mut chars = line.chars();
    chars.next() == Some('#') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

/// Parse the step number out of a marker line: the token between `#` and the
/// first whitespace. A token such as `#7a` is not a valid step.
fn marker_step(line: &str) -> Option<u32> {
    let token = line.strip_prefix('#')?.split_whitespace().next()?;
    token.parse().ok()
}

/// Extract the current step from a sequence of log chunks.
///
/// Picks the last chunk containing a marker line, then the last marker line
/// within that chunk. Returns `None` when no marker exists anywhere, so the
/// caller can leave existing progress untouched.
pub fn parse_step<S: AsRef<str>>(chunks: &[S]) -> Option<u32> {
    let line = chunks
        .iter()
        .rev()
        .find_map(|chunk| chunk.as_ref().lines().rev().find(|l| is_step_marker(l)))?;
    marker_step(line)
}

/// Decode the platform's `logs` field, a JSON-encoded array of
/// `{"output": "..."}` objects, into raw chunks.
///
/// An empty or undecodable log yields no chunks.
pub fn parse_remote_log(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<LogEntry>>(raw) {
        Ok(entries) => entries.into_iter().map(|e| e.output).collect(),
        Err(e) => {
            tracing::debug!(error = %e, "deployment log is not a JSON entry list");
            Vec::new()
        }
    }
}

/// Suppresses progress writes that would not move the counter forward.
#[derive(Debug, Clone, Default)]
pub struct StepTracker {
    last: u32,
}

impl StepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> u32 {
        self.last
    }

    /// Accept `step` if it is strictly greater than the last accepted step.
    /// Returns whether the caller should persist it.
    pub fn advance(&mut self, step: u32) -> bool {
        if step > self.last {
            self.last = step;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_marker_of_last_marker_chunk() {
        let chunks = ["#3 a\nb", "no markers here", "#3 a\n#9 b"];
        assert_eq!(parse_step(&chunks), Some(9));
    }

    #[test]
    fn test_trailing_chunks_without_markers_do_not_reset() {
        let chunks = [
            "#4 [installer 1/3] FROM base",
            "#6 [installer 3/3] RUN pnpm run build\n#6 DONE 41.2s",
            "Pushing image to registry...",
            "Rolling update started.",
        ];
        assert_eq!(parse_step(&chunks), Some(6));
    }

    #[test]
    fn test_no_markers_returns_none() {
        assert_eq!(parse_step(&["starting build", "pulling image"]), None);
        assert_eq!(parse_step::<&str>(&[]), None);
    }

    #[test]
    fn test_hash_without_digit_is_not_a_marker() {
        assert!(!is_step_marker("# comment"));
        assert!(!is_step_marker("#"));
        assert!(!is_step_marker(" #5 indented"));
        assert!(is_step_marker("#12 [runner 2/3] COPY"));
        assert_eq!(parse_step(&["#5 real", "# heading"]), Some(5));
    }

    #[test]
    fn test_non_numeric_marker_token_is_none() {
        assert_eq!(parse_step(&["#7abc something"]), None);
    }

    #[test]
    fn test_marker_without_trailing_text() {
        assert_eq!(parse_step(&["#11"]), Some(11));
    }

    #[test]
    fn test_parse_remote_log() {
        let raw = serde_json::json!([
            {"output": "#1 [internal] load build definition", "type": "stdout"},
            {"output": "#2 [internal] load metadata\n#3 [installer 1/2] FROM base"},
            {"output": "Build finished."}
        ])
        .to_string();
        let chunks = parse_remote_log(&raw);
        assert_eq!(chunks.len(), 3);
        assert_eq!(parse_step(&chunks), Some(3));
    }

    #[test]
    fn test_parse_remote_log_invalid_or_empty() {
        assert!(parse_remote_log("").is_empty());
        assert!(parse_remote_log("not json").is_empty());
        assert!(parse_remote_log("[]").is_empty());
    }

    #[test]
    fn test_tracker_only_accepts_increases() {
        let mut tracker = StepTracker::new();
        let written: Vec<u32> = [3, 1, 5, 5, 7]
            .into_iter()
            .filter(|step| tracker.advance(*step))
            .collect();
        assert_eq!(written, vec![3, 5, 7]);
        assert_eq!(tracker.last(), 7);
    }

    #[test]
    fn test_tracker_ignores_zero() {
        let mut tracker = StepTracker::new();
        assert!(!tracker.advance(0));
    }
}
