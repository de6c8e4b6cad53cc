//! Build success decision for in-cluster builds.
//!
//! The primary signal is the Job's own `status.succeeded` counter. The log
//! watch can end before the Job record is updated, so when that counter is
//! absent or zero the accumulated build log is checked against a table of
//! token requirements. This is a heuristic and is only consulted as a
//! fallback.

/// Tokens that must all appear in a build log for the build to count as
/// pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEvidence {
    pub name: &'static str,
    pub required: &'static [&'static str],
}

/// Push confirmation plus a content digest, as printed by kaniko.
pub const KANIKO_PUSHED: LogEvidence = LogEvidence {
    name: "kaniko-push",
    required: &["Pushed", "sha256:"],
};

/// Which signal decided a build outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    JobSucceeded,
    LogEvidence(&'static str),
    Failed,
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Ordered list of log-evidence rules.
#[derive(Debug, Clone)]
pub struct SuccessPolicy {
    rules: Vec<LogEvidence>,
}

impl Default for SuccessPolicy {
    fn default() -> Self {
        Self {
            rules: vec![KANIKO_PUSHED],
        }
    }
}

impl SuccessPolicy {
    pub fn new(rules: Vec<LogEvidence>) -> Self {
        Self { rules }
    }

    /// Decide from the Job's succeeded counter, falling back to the log.
    pub fn evaluate(&self, job_succeeded: Option<i32>, logs: &str) -> Verdict {
        if job_succeeded.is_some_and(|n| n > 0) {
            return Verdict::JobSucceeded;
        }
        self.rules
            .iter()
            .find(|rule| rule.required.iter().all(|token| logs.contains(token)))
            .map_or(Verdict::Failed, |rule| Verdict::LogEvidence(rule.name))
    }
}
