//! Completion evaluation for dispatched output.
//!
//! Two independent gates must both pass before a task may move to its success
//! status: the adapter's declared criteria (length, pattern) and the presence
//! of a recognized completion marker.

use regex::{Regex, RegexBuilder};

/// Markers recognized when the config does not override them.
pub const DEFAULT_COMPLETION_MARKERS: [&str; 4] =
    ["TASK_COMPLETE", "TASK COMPLETE", "[DONE]", "STATUS: DONE"];

/// Adapter-declared completion criteria. Absent criteria always pass.
#[derive(Debug, Clone, Default)]
pub struct CompletionCriteria {
    pub min_output_length: Option<usize>,
    pub validation_pattern: Option<Regex>,
}

/// Compile a validation pattern; matching is case-insensitive.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// Outcome of evaluating one output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriteriaReport {
    pub output_length: usize,
    pub length_ok: bool,
    pub pattern_ok: bool,
    /// The first recognized marker found, if any.
    pub marker: Option<String>,
}

impl CriteriaReport {
    pub fn criteria_ok(&self) -> bool {
        self.length_ok && self.pattern_ok
    }

    pub fn passed(&self) -> bool {
        self.criteria_ok() && self.marker.is_some()
    }

    /// Human-readable list of unmet gates; empty when passed.
    pub fn shortfalls(&self, criteria: &CompletionCriteria) -> Vec<String> {
        let mut out = Vec::new();
        if !self.length_ok {
            out.push(format!(
                "output too short ({} < {})",
                self.output_length,
                criteria.min_output_length.unwrap_or_default()
            ));
        }
        if !self.pattern_ok {
            let pattern = criteria
                .validation_pattern
                .as_ref()
                .map(Regex::as_str)
                .unwrap_or_default();
            out.push(format!("output does not match /{pattern}/"));
        }
        if self.marker.is_none() {
            out.push("no completion marker".to_string());
        }
        out
    }
}

/// Evaluate `output` against `criteria` and the recognized `markers`.
pub fn evaluate<S: AsRef<str>>(
    output: &str,
    criteria: &CompletionCriteria,
    markers: &[S],
) -> CriteriaReport {
    let output_length = output.trim().chars().count();
    let length_ok = criteria
        .min_output_length
        .is_none_or(|min| output_length >= min);
    let pattern_ok = criteria
        .validation_pattern
        .as_ref()
        .is_none_or(|re| re.is_match(output));
    CriteriaReport {
        output_length,
        length_ok,
        pattern_ok,
        marker: find_marker(output, markers).map(str::to_string),
    }
}

/// Case-insensitive search for the first marker present in `output`.
pub fn find_marker<'m, S: AsRef<str>>(output: &str, markers: &'m [S]) -> Option<&'m str> {
    let haystack = output.to_lowercase();
    markers
        .iter()
        .map(AsRef::as_ref)
        .filter(|marker| !marker.trim().is_empty())
        .find(|marker| haystack.contains(&marker.to_lowercase()))
}
