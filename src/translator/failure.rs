//! Failure detection for translation script output.
//!
//! The translation tool reports some internal errors only as text, still
//! exiting with status 0. Captured output is scanned for known phrases.

/// Phrases that mark a failed run, matched case-insensitively.
pub const FAILURE_INDICATORS: &[&str] = &[
    "translationimpossibleerror",
    "failed to translate",
    "failed to communicate with provider",
    "saving partial results",
    "traceback (most recent call last)",
];

/// Result of scanning captured script output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// No failure indicator was found.
    Clean,
    /// The output contained the given indicator.
    Failed { indicator: &'static str },
}

impl ScriptOutcome {
    /// Returns true if a failure indicator was found.
    pub fn is_failure(&self) -> bool {
        matches!(self, ScriptOutcome::Failed { .. })
    }
}

/// Scans stdout and stderr for the first known failure indicator.
pub fn classify_output(stdout: &str, stderr: &str) -> ScriptOutcome {
    let combined = format!("{stdout}\n{stderr}").to_lowercase();
    FAILURE_INDICATORS
        .iter()
        .copied()
        .find(|indicator| combined.contains(indicator))
        .map_or(ScriptOutcome::Clean, |indicator| ScriptOutcome::Failed {
            indicator,
        })
}
