//! Tool definitions: naming, configuration, calling conventions and lookup.

pub mod convention;
pub mod definition;
pub mod naming;
pub mod resolver;

pub use convention::CallingConvention;
pub use definition::{
    CopySpec, DockerConfig, DockerMode, Quantities, ResourceOverrides, ResourceQuantities,
    ResourceSpec, ToolConfig, ToolDefinition, tool_id,
};
pub use resolver::{ResolvedTool, ToolResolver};
