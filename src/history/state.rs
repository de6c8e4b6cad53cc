//! Status state machines for executions and build jobs.
//!
//! Both machines are one-directional: once a record reaches a terminal
//! state no further transition is accepted. The stores enforce the same
//! rule in SQL so concurrent writers cannot revert a terminal row.

use serde::{Deserialize, Serialize};

/// State of a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn can_transition_to(&self, target: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        matches!(
            (self, target),
            (Running, Success) | (Running, Failed) | (Running, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// State of an image build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl BuildStatus {
    pub const ALL: [BuildStatus; 4] = [
        BuildStatus::Pending,
        BuildStatus::Running,
        BuildStatus::Success,
        BuildStatus::Failed,
    ];

    pub fn can_transition_to(&self, target: BuildStatus) -> bool {
        use BuildStatus::*;

        matches!(
            (self, target),
            // A dispatch can fail before the backend ever starts.
            (Pending, Running) | (Pending, Failed) |
            (Running, Success) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Every state that may legally move to `target`.
    pub fn predecessors(target: BuildStatus) -> Vec<BuildStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown build status '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_terminal_states_are_final() {
        for terminal in [
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Stopped,
        ] {
            assert!(terminal.is_terminal());
            assert!(ExecutionStatus::Running.can_transition_to(terminal));
            for target in [
                ExecutionStatus::Running,
                ExecutionStatus::Success,
                ExecutionStatus::Failed,
                ExecutionStatus::Stopped,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn build_status_only_moves_forward() {
        use BuildStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Success));
    }

    #[test]
    fn predecessors_match_transition_table() {
        assert_eq!(
            BuildStatus::predecessors(BuildStatus::Failed),
            vec![BuildStatus::Pending, BuildStatus::Running]
        );
        assert_eq!(
            BuildStatus::predecessors(BuildStatus::Success),
            vec![BuildStatus::Running]
        );
        assert!(BuildStatus::predecessors(BuildStatus::Pending).is_empty());
    }

    #[test]
    fn status_strings_match_persisted_form() {
        assert_eq!(BuildStatus::Pending.to_string(), "PENDING");
        assert_eq!("success".parse::<BuildStatus>().unwrap(), BuildStatus::Success);
        assert_eq!(ExecutionStatus::Stopped.to_string(), "stopped");
        assert_eq!(
            serde_json::to_string(&BuildStatus::Running).unwrap(),
            "\"RUNNING\""
        );
    }
}
