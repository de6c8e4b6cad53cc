//! Maps tool identifiers to stored definitions and execution settings.

use std::sync::Arc;

use crate::db::ToolStore;
use crate::error::ResolutionError;
use crate::tools::convention::CallingConvention;
use crate::tools::definition::{ResourceSpec, ToolConfig, ToolDefinition};
use crate::tools::naming::generated_image_tag;

/// Image used for ad-hoc test runs that carry no stored configuration.
pub const ADHOC_BASE_IMAGE: &str = "python:3.11-slim";

/// Tool names the UI uses for unsaved test runs.
const ADHOC_TOOL_NAMES: &[&str] = &["test-tool", "adhoc-tool"];

/// Everything needed to put a tool on the cluster.
#[derive(Debug, Clone)]
pub struct ResolvedTool {
    pub definition: ToolDefinition,
    pub config: ToolConfig,
    pub image: String,
    pub resources: ResourceSpec,
    pub convention: CallingConvention,
}

/// Resolves identifiers against the tool store.
pub struct ToolResolver {
    store: Arc<dyn ToolStore>,
    registry: String,
}

impl ToolResolver {
    /// `registry` is the pull host prefixed onto generated tags.
    pub fn new(store: Arc<dyn ToolStore>, registry: impl Into<String>) -> Self {
        Self {
            store,
            registry: registry.into(),
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Find a definition by exact id, two-segment suffix, then `.py`-stripped id.
    pub async fn find(&self, identifier: &str) -> Result<ToolDefinition, ResolutionError> {
        for candidate in lookup_candidates(identifier) {
            if let Some(tool) = self.store.get_tool(&candidate).await? {
                tracing::debug!(identifier, resolved = %tool.id, "Resolved tool");
                return Ok(tool);
            }
        }
        Err(ResolutionError::NotFound {
            identifier: identifier.to_string(),
        })
    }

    /// Find a tool and derive its image, resources and calling convention.
    pub async fn resolve(&self, identifier: &str) -> Result<ResolvedTool, ResolutionError> {
        let definition = self.find(identifier).await?;
        self.resolve_definition(definition)
    }

    /// Derive execution settings for an already-loaded definition.
    pub fn resolve_definition(
        &self,
        definition: ToolDefinition,
    ) -> Result<ResolvedTool, ResolutionError> {
        if definition.script.trim().is_empty() {
            return Err(ResolutionError::EmptyScript {
                tool_id: definition.id.clone(),
            });
        }
        let config = definition.parse_config()?;
        let image = self.execution_image(&definition, &config);
        let resources = ResourceSpec::from_overrides(&config.resources);
        let convention = definition.calling_convention();
        Ok(ResolvedTool {
            definition,
            config,
            image,
            resources,
            convention,
        })
    }

    /// The image a tool runs in.
    pub fn execution_image(&self, definition: &ToolDefinition, config: &ToolConfig) -> String {
        if let Some(external) = config.docker.as_ref().and_then(|d| d.external_image()) {
            return external.to_string();
        }
        let unconfigured = definition
            .configuration
            .as_deref()
            .is_none_or(|c| c.trim().is_empty());
        if unconfigured && ADHOC_TOOL_NAMES.contains(&definition.name.as_str()) {
            return ADHOC_BASE_IMAGE.to_string();
        }
        self.authoritative_tag(&definition.id)
    }

    /// The generated tag a build for this tool produces.
    pub fn authoritative_tag(&self, tool_id: &str) -> String {
        generated_image_tag(&self.registry, tool_id)
    }
}

/// Store ids to try, in order, for an identifier.
fn lookup_candidates(identifier: &str) -> Vec<String> {
    let identifier = identifier.trim();
    let mut out = vec![identifier.to_string()];
    if identifier.contains('/') {
        let parts: Vec<&str> = identifier.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() >= 2 {
            let suffix = format!("{}/{}", parts[parts.len() - 2], parts[parts.len() - 1]);
            out.push(suffix.trim_end_matches(".py").to_string());
        }
    }
    out.push(identifier.trim_end_matches(".py").to_string());
    let mut seen = std::collections::HashSet::new();
    out.retain(|c| !c.is_empty() && seen.insert(c.clone()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_db;

    #[test]
    fn candidates_follow_lookup_order() {
        assert_eq!(
            lookup_candidates("/opt/tools/network/nmap_scan.py"),
            vec![
                "/opt/tools/network/nmap_scan.py".to_string(),
                "network/nmap_scan".to_string(),
                "/opt/tools/network/nmap_scan".to_string(),
            ]
        );
        assert_eq!(lookup_candidates("nmap.py"), vec!["nmap.py", "nmap"]);
        assert_eq!(lookup_candidates("network/nmap"), vec!["network/nmap"]);
    }

    #[tokio::test]
    async fn resolves_legacy_path_to_stored_tool() {
        let (db, _dir) = test_db().await;
        let tool = ToolDefinition::new("network", "nmap_scan", "def main(args):\n    return args\n");
        db.save_tool(&tool).await.unwrap();

        let resolver = ToolResolver::new(db.clone(), "registry:5000");
        let resolved = resolver.resolve("tools/network/nmap_scan.py").await.unwrap();
        assert_eq!(resolved.definition.id, "network/nmap_scan");
        assert_eq!(
            resolved.image,
            "registry:5000/security-platform-tool-nmap-scan:latest"
        );
        assert_eq!(resolved.resources, ResourceSpec::default());
        assert_eq!(resolved.convention, CallingConvention::MapArg);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let (db, _dir) = test_db().await;
        let resolver = ToolResolver::new(db, "registry:5000");
        let err = resolver.resolve("nope/missing").await.unwrap_err();
        assert!(matches!(err, ResolutionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn external_image_is_used_verbatim() {
        let (db, _dir) = test_db().await;
        let tool = ToolDefinition::new("network", "masscan", "def main(): pass")
            .with_configuration("docker:\n  image: instrumentisto/masscan:1.3\n");
        db.save_tool(&tool).await.unwrap();

        let resolver = ToolResolver::new(db, "registry:5000");
        let resolved = resolver.resolve("network/masscan").await.unwrap();
        assert_eq!(resolved.image, "instrumentisto/masscan:1.3");
    }

    #[tokio::test]
    async fn adhoc_tool_without_config_uses_base_image() {
        let (db, _dir) = test_db().await;
        let mut tool = ToolDefinition::new("scratch", "test-tool", "def main(): return 1");
        tool.id = "test-tool".to_string();
        db.save_tool(&tool).await.unwrap();

        let resolver = ToolResolver::new(db, "registry:5000");
        let resolved = resolver.resolve("test-tool").await.unwrap();
        assert_eq!(resolved.image, ADHOC_BASE_IMAGE);
    }

    #[tokio::test]
    async fn empty_script_is_rejected() {
        let (db, _dir) = test_db().await;
        db.save_tool(&ToolDefinition::new("misc", "blank", "   ")).await.unwrap();
        let resolver = ToolResolver::new(db, "r");
        assert!(matches!(
            resolver.resolve("misc/blank").await,
            Err(ResolutionError::EmptyScript { .. })
        ));
    }
}
