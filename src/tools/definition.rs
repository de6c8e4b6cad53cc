//! Stored tool definitions and their declarative YAML configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ResolutionError;
use crate::tools::convention::CallingConvention;
use crate::tools::naming::is_generated_tag;

/// `<category>/<name>` with spaces in the name replaced and lowercased.
pub fn tool_id(category: &str, name: &str) -> String {
    format!("{}/{}", category, name.replace(' ', "_").to_lowercase())
}

/// A registered tool, as owned by the CRUD layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// `<category>/<tool id>`.
    pub id: String,
    pub name: String,
    pub category: String,
    pub script: String,
    /// Raw YAML holding the `docker` and `resources` sections.
    pub configuration: Option<String>,
    /// Explicit override; inferred from the script when absent.
    pub calling_convention: Option<CallingConvention>,
    pub updated_at: DateTime<Utc>,
}

impl ToolDefinition {
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        let category = category.into();
        let name = name.into();
        Self {
            id: tool_id(&category, &name),
            name,
            category,
            script: script.into(),
            configuration: None,
            calling_convention: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_configuration(mut self, yaml: impl Into<String>) -> Self {
        self.configuration = Some(yaml.into());
        self
    }

    /// The id without its category prefix.
    pub fn short_id(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }

    /// Legacy on-disk path recorded on executions.
    pub fn legacy_path(&self) -> String {
        format!("{}/{}.py", self.category, self.short_id())
    }

    /// Parse the YAML configuration. Missing configuration parses as empty.
    pub fn parse_config(&self) -> Result<ToolConfig, ResolutionError> {
        match self.configuration.as_deref().map(str::trim) {
            None | Some("") => Ok(ToolConfig::default()),
            Some(raw) => {
                let parsed: Option<ToolConfig> =
                    serde_yaml::from_str(raw).map_err(|e| ResolutionError::InvalidConfig {
                        tool_id: self.id.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(parsed.unwrap_or_default())
            }
        }
    }

    /// The calling convention baked into this tool's entry script.
    pub fn calling_convention(&self) -> CallingConvention {
        self.calling_convention
            .or_else(|| CallingConvention::infer_from_source(&self.script))
            .unwrap_or_default()
    }
}

/// Parsed tool configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub docker: Option<DockerConfig>,
    #[serde(default)]
    pub resources: ResourceOverrides,
}

/// How the tool's image is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DockerMode {
    /// Use the generic generated tag.
    Auto,
    /// Build from declarative package lists.
    Custom,
    /// Build explicitly requested.
    Build,
    /// Use an external image verbatim.
    Preexisting,
    #[serde(other)]
    Unknown,
}

/// A `COPY --from=builder` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CopySpec {
    Path(String),
    Mapping { src: String, dest: String },
}

impl CopySpec {
    pub fn src(&self) -> &str {
        match self {
            Self::Path(p) => p,
            Self::Mapping { src, .. } => src,
        }
    }

    pub fn dest(&self) -> &str {
        match self {
            Self::Path(p) => p,
            Self::Mapping { dest, .. } => dest,
        }
    }
}

/// The `docker` section of a tool's configuration.
///
/// List fields stay `Option` so that "key present but empty" is
/// distinguishable from "key absent" when deciding whether to build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apt_packages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pip_packages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_run_commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_from_builder: Option<Vec<CopySpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_mode: Option<DockerMode>,
}

impl DockerConfig {
    /// An explicit image that this system did not generate.
    pub fn external_image(&self) -> Option<&str> {
        self.image
            .as_deref()
            .map(str::trim)
            .filter(|img| !img.is_empty() && !is_generated_tag(img))
    }

    /// The declared mode, or the one implied by the other fields.
    pub fn effective_mode(&self) -> DockerMode {
        if let Some(mode) = self.docker_mode {
            return mode;
        }
        if self.external_image().is_some() {
            DockerMode::Preexisting
        } else if self.apt_packages.is_some() || self.pip_packages.is_some() {
            DockerMode::Custom
        } else {
            DockerMode::Auto
        }
    }
}

/// Per-field resource overrides from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceOverrides {
    #[serde(default)]
    pub requests: Option<ResourceQuantities>,
    #[serde(default)]
    pub limits: Option<ResourceQuantities>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuantities {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

/// A single cpu/memory pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantities {
    pub cpu: String,
    pub memory: String,
}

impl Quantities {
    fn merged(&self, overrides: Option<&ResourceQuantities>) -> Self {
        let Some(o) = overrides else {
            return self.clone();
        };
        Self {
            cpu: o.cpu.clone().unwrap_or_else(|| self.cpu.clone()),
            memory: o.memory.clone().unwrap_or_else(|| self.memory.clone()),
        }
    }
}

/// Resolved container resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub requests: Quantities,
    pub limits: Quantities,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            requests: Quantities {
                cpu: "100m".to_string(),
                memory: "256Mi".to_string(),
            },
            limits: Quantities {
                cpu: "1000m".to_string(),
                memory: "1024Mi".to_string(),
            },
        }
    }
}

impl ResourceSpec {
    /// Defaults with each configured field layered on top.
    pub fn from_overrides(overrides: &ResourceOverrides) -> Self {
        let base = Self::default();
        Self {
            requests: base.requests.merged(overrides.requests.as_ref()),
            limits: base.limits.merged(overrides.limits.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_yaml_layout() {
        let yaml = r#"
docker:
  base_image: python:3.11-slim
  pip_packages: [flask]
  copy_from_builder:
    - /usr/local/bin/tool
    - src: /go/bin/
      dest: /usr/local/bin/
resources:
  limits:
    memory: 2Gi
"#;
        let tool = ToolDefinition::new("web", "crawler", "def main(): pass").with_configuration(yaml);
        let cfg = tool.parse_config().unwrap();
        let docker = cfg.docker.unwrap();
        assert_eq!(docker.base_image.as_deref(), Some("python:3.11-slim"));
        assert_eq!(docker.pip_packages, Some(vec!["flask".to_string()]));
        let copies = docker.copy_from_builder.clone().unwrap();
        assert_eq!(copies[0], CopySpec::Path("/usr/local/bin/tool".to_string()));
        assert_eq!(copies[1].dest(), "/usr/local/bin/");
        assert_eq!(docker.effective_mode(), DockerMode::Custom);

        let resources = ResourceSpec::from_overrides(&cfg.resources);
        assert_eq!(resources.limits.memory, "2Gi");
        assert_eq!(resources.limits.cpu, "1000m");
        assert_eq!(resources.requests, ResourceSpec::default().requests);
    }

    #[test]
    fn empty_or_missing_configuration_is_default() {
        let tool = ToolDefinition::new("misc", "echo", "");
        assert_eq!(tool.parse_config().unwrap(), ToolConfig::default());
        let tool = tool.with_configuration("   ");
        assert_eq!(tool.parse_config().unwrap(), ToolConfig::default());
    }

    #[test]
    fn malformed_yaml_is_invalid_config() {
        let tool = ToolDefinition::new("misc", "echo", "").with_configuration("docker: [unclosed");
        assert!(matches!(
            tool.parse_config(),
            Err(ResolutionError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn mode_inference() {
        let external = DockerConfig {
            image: Some("instrumentisto/nmap".to_string()),
            ..Default::default()
        };
        assert_eq!(external.effective_mode(), DockerMode::Preexisting);

        let generated = DockerConfig {
            image: Some("security-platform-tool-nmap:latest".to_string()),
            ..Default::default()
        };
        assert_eq!(generated.external_image(), None);
        assert_eq!(generated.effective_mode(), DockerMode::Auto);

        let declared = DockerConfig {
            docker_mode: Some(DockerMode::Build),
            ..Default::default()
        };
        assert_eq!(declared.effective_mode(), DockerMode::Build);
    }

    #[test]
    fn ids_and_paths() {
        let tool = ToolDefinition::new("Network", "Nmap Scan", "");
        assert_eq!(tool.id, "Network/nmap_scan");
        assert_eq!(tool.short_id(), "nmap_scan");
        assert_eq!(tool.legacy_path(), "Network/nmap_scan.py");
    }

    #[test]
    fn explicit_convention_wins_over_inference() {
        let mut tool = ToolDefinition::new("misc", "echo", "def main(args):\n    pass\n");
        assert_eq!(tool.calling_convention(), CallingConvention::MapArg);
        tool.calling_convention = Some(CallingConvention::NoArgs);
        assert_eq!(tool.calling_convention(), CallingConvention::NoArgs);
    }
}
