//! Cluster Job construction for tool executions, plus result extraction
//! from the finished pod's log.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use uuid::Uuid;

use crate::tools::naming::execution_job_name;
use crate::tools::{CallingConvention, Quantities, ResolvedTool, ResourceSpec};

/// `app` label value on every tool execution job.
pub const TOOL_APP_LABEL: &str = "security-platform-tool";

/// Label carrying the execution id on tool jobs.
pub const EXECUTION_ID_LABEL: &str = "execution-id";

/// Separator the entry script prints before the tool's return value.
pub const RESULT_MARKER: &str = "--- RESULT ---";

const EXECUTOR_CONTAINER: &str = "executor";

/// In-container entry point. `__CALL__` is replaced with the invocation
/// for the tool's calling convention. argv: script body, JSON arguments.
const ENTRY_TEMPLATE: &str = r#"
import sys, json, importlib.util, os

script_content = sys.argv[1]
args = json.loads(sys.argv[2])

os.makedirs("/app", exist_ok=True)
with open("/app/tool.py", "w") as f:
    f.write(script_content)

try:
    spec = importlib.util.spec_from_file_location("tool_module", "/app/tool.py")
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)

    if not hasattr(module, "main"):
        print("Error: No main function found")
        sys.exit(1)

__CALL__

    if ans is not None:
        print("\n--- RESULT ---")
        if isinstance(ans, (dict, list)):
            print(json.dumps(ans, indent=2))
        else:
            print(str(ans))
except Exception as e:
    print(f"Error executing script: {e}")
    sys.exit(1)
"#;

/// Python statements (indented one level) that call `main` and bind `ans`.
fn invocation(convention: CallingConvention) -> &'static str {
    match convention {
        CallingConvention::NoArgs => "    ans = module.main()",
        CallingConvention::MapArg => "    ans = module.main(args)",
        CallingConvention::KeywordArgs {
            positional_fallback: false,
        } => "    ans = module.main(**args)",
        CallingConvention::KeywordArgs {
            positional_fallback: true,
        } => "    try:\n        ans = module.main(**args)\n    except TypeError:\n        ans = module.main(args)",
    }
}

/// The entry script for a calling convention.
pub fn entry_script(convention: CallingConvention) -> String {
    ENTRY_TEMPLATE.replace("__CALL__", invocation(convention))
}

/// Label selector matching the job(s) of one execution.
pub fn execution_selector(execution_id: Uuid) -> String {
    format!("{}={}", EXECUTION_ID_LABEL, execution_id)
}

/// Label selector matching the pods of a job.
pub fn job_pods_selector(job_name: &str) -> String {
    format!("job-name={}", job_name)
}

fn quantities(q: &Quantities) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(q.cpu.clone())),
        ("memory".to_string(), Quantity(q.memory.clone())),
    ])
}

pub(crate) fn resource_requirements(spec: &ResourceSpec) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(quantities(&spec.requests)),
        limits: Some(quantities(&spec.limits)),
        ..Default::default()
    }
}

/// A run-once job executing `tool` with `arguments`.
///
/// Never restarted or retried by the scheduler; the finished job is
/// garbage-collected `ttl_secs` after completion.
pub fn tool_job(
    tool: &ResolvedTool,
    execution_id: Uuid,
    arguments: &serde_json::Value,
    ttl_secs: i32,
) -> Job {
    let name = execution_job_name(&tool.definition.name, &execution_id.to_string());

    let container = Container {
        name: EXECUTOR_CONTAINER.to_string(),
        image: Some(tool.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "python3".to_string(),
            "-c".to_string(),
            entry_script(tool.convention),
            tool.definition.script.clone(),
            arguments.to_string(),
        ]),
        env: Some(vec![EnvVar {
            name: "PYTHONUNBUFFERED".to_string(),
            value: Some("1".to_string()),
            ..Default::default()
        }]),
        resources: Some(resource_requirements(&tool.resources)),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(BTreeMap::from([
                ("app".to_string(), TOOL_APP_LABEL.to_string()),
                (EXECUTION_ID_LABEL.to_string(), execution_id.to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(ttl_secs),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([("job-name".to_string(), name)])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ==================== Result extraction ====================

/// The raw text of a run's result, if the log carries one.
///
/// Text after the last result marker wins. Without a marker, a successful
/// run falls back to the last line that looks like a JSON object or array.
pub fn result_text(logs: &str, succeeded: bool) -> Option<&str> {
    if let Some(idx) = logs.rfind(RESULT_MARKER) {
        let text = logs[idx + RESULT_MARKER.len()..].trim();
        return (!text.is_empty()).then_some(text);
    }
    if !succeeded {
        return None;
    }
    logs.lines().rev().map(str::trim).find(|line| {
        let bracketed = (line.starts_with('{') && line.ends_with('}'))
            || (line.starts_with('[') && line.ends_with(']'));
        bracketed && serde_json::from_str::<serde_json::Value>(line).is_ok()
    })
}

/// Parse result text as JSON, keeping it as a string when it isn't.
pub fn parse_result(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}

pub fn extract_result(logs: &str, succeeded: bool) -> Option<serde_json::Value> {
    result_text(logs, succeeded).map(parse_result)
}
