//! Durable run records: tool executions and image build jobs.

mod records;
mod state;

pub use records::{BuildJobRecord, ExecutionRecord, ExecutionStats, ToolUsage, extract_target};
pub use state::{BuildStatus, ExecutionStatus};
