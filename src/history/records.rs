use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{BuildStatus, ExecutionStatus};

/// A persisted tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Also stamped on the cluster job as the `execution-id` label.
    pub id: Uuid,
    pub tool_name: String,
    pub tool_path: String,
    pub target: Option<String>,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub logs: String,
    pub arguments: serde_json::Value,
}

impl ExecutionRecord {
    /// A fresh `running` record.
    pub fn started(
        id: Uuid,
        tool_name: impl Into<String>,
        tool_path: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        let target = extract_target(&arguments);
        Self {
            id,
            tool_name: tool_name.into(),
            tool_path: tool_path.into(),
            target,
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            result: None,
            logs: String::new(),
            arguments,
        }
    }
}

/// Pull the scan target out of a tool's arguments, if it has one.
pub fn extract_target(arguments: &serde_json::Value) -> Option<String> {
    let map = arguments.as_object()?;
    ["target", "url", "ip", "domain"]
        .iter()
        .find_map(|key| match map.get(*key)? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        })
}

/// A persisted image build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJobRecord {
    pub id: Uuid,
    pub tool_id: String,
    pub status: BuildStatus,
    pub logs: String,
    pub image_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BuildJobRecord {
    pub fn pending(tool_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tool_id: tool_id.into(),
            status: BuildStatus::Pending,
            logs: String::new(),
            image_tag: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Execution count for a single tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub tool_name: String,
    pub count: i64,
}

/// Aggregate execution statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub top_tools: Vec<ToolUsage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_prefers_explicit_target_key() {
        let args = serde_json::json!({"url": "https://example.com", "target": "10.0.0.1"});
        assert_eq!(extract_target(&args).as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn target_falls_through_empty_values() {
        let args = serde_json::json!({"target": "", "domain": "example.com"});
        assert_eq!(extract_target(&args).as_deref(), Some("example.com"));
    }

    #[test]
    fn target_absent_for_non_object_arguments() {
        assert_eq!(extract_target(&serde_json::json!(["a"])), None);
        assert_eq!(extract_target(&serde_json::json!({"ports": "80"})), None);
    }

    #[test]
    fn started_record_is_running_without_end_time() {
        let rec = ExecutionRecord::started(
            Uuid::new_v4(),
            "nmap_scan",
            "network/nmap_scan.py",
            serde_json::json!({"ip": "192.168.0.1"}),
        );
        assert_eq!(rec.status, ExecutionStatus::Running);
        assert!(rec.end_time.is_none());
        assert_eq!(rec.target.as_deref(), Some("192.168.0.1"));
    }
}
