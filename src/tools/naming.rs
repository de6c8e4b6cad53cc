//! Name and tag derivation for cluster objects and generated images.

/// Marker carried by every image tag this system generates.
pub const GENERATED_TAG_MARKER: &str = "security-platform-tool-";

/// Kubernetes object names are capped at 63 characters.
const MAX_NAME_LEN: usize = 63;

/// Normalise a string to `[a-z0-9-]`, collapsing runs of dashes.
///
/// Idempotent: `sanitize_k8s_name(sanitize_k8s_name(x)) == sanitize_k8s_name(x)`.
pub fn sanitize_k8s_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Image slug for a tool identifier: its last path segment, sanitised.
pub fn image_slug(identifier: &str) -> String {
    let last = identifier
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim_end_matches(".py");
    if last.trim().is_empty() {
        return "unknown".to_string();
    }
    sanitize_k8s_name(last)
}

/// The authoritative tag: `<registry>/security-platform-tool-<slug>:latest`.
pub fn generated_image_tag(registry: &str, identifier: &str) -> String {
    let repo = format!("{}{}:latest", GENERATED_TAG_MARKER, image_slug(identifier));
    let registry = registry.trim_end_matches('/');
    if registry.is_empty() {
        repo
    } else {
        format!("{}/{}", registry, repo)
    }
}

/// Whether an image reference is one of this system's generated tags.
pub fn is_generated_tag(image: &str) -> bool {
    image.contains(GENERATED_TAG_MARKER)
}

/// Cluster job name for a tool execution: `<tool>-<execution id>`.
pub fn execution_job_name(tool_name: &str, execution_id: &str) -> String {
    let suffix = sanitize_k8s_name(execution_id);
    let budget = MAX_NAME_LEN.saturating_sub(suffix.len() + 1);
    let prefix = sanitize_k8s_name(tool_name);
    let prefix: String = prefix.chars().take(budget).collect();
    let prefix = prefix.trim_end_matches('-');
    if prefix.is_empty() {
        suffix.chars().take(MAX_NAME_LEN).collect()
    } else {
        format!("{}-{}", prefix, suffix)
    }
}

/// Cluster job name for an in-cluster image build.
pub fn build_job_name(build_id: &str) -> String {
    let short: String = build_id.chars().take(8).collect();
    format!("kaniko-build-{}", sanitize_k8s_name(&short))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_and_trims() {
        assert_eq!(sanitize_k8s_name("Nmap_Scan"), "nmap-scan");
        assert_eq!(sanitize_k8s_name("  __weird!!name__ "), "weird-name");
        assert_eq!(sanitize_k8s_name("!!!"), "unnamed");
        assert_eq!(sanitize_k8s_name(""), "unnamed");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in ["Network/nmap_scan", "a--b__c", "---", "ÀÉ tool", "sub.domain_enum"] {
            let once = sanitize_k8s_name(input);
            assert_eq!(sanitize_k8s_name(&once), once, "input {:?}", input);
        }
    }

    #[test]
    fn generated_tag_uses_last_segment() {
        assert_eq!(
            generated_image_tag("R", "Network/nmap_scan"),
            "R/security-platform-tool-nmap-scan:latest"
        );
        assert_eq!(
            generated_image_tag("registry:5000/", "web/whatweb.py"),
            "registry:5000/security-platform-tool-whatweb:latest"
        );
        assert_eq!(
            generated_image_tag("R", ""),
            "R/security-platform-tool-unknown:latest"
        );
    }

    #[test]
    fn generated_tags_are_recognised() {
        assert!(is_generated_tag(&generated_image_tag("R", "x")));
        assert!(!is_generated_tag("instrumentisto/nmap:latest"));
    }

    #[test]
    fn execution_job_name_fits_label_limit() {
        let id = "3f1c2a9e-8b7d-4c6e-9a5f-0123456789ab";
        let name = execution_job_name("an_extremely_long_tool_name_that_keeps_going", id);
        assert!(name.len() <= 63, "{} is {} chars", name, name.len());
        assert!(name.ends_with(id));
        assert!(!name.contains("--"));

        assert_eq!(execution_job_name("nmap", id), format!("nmap-{}", id));
    }

    #[test]
    fn build_job_name_uses_short_id() {
        assert_eq!(
            build_job_name("3f1c2a9e-8b7d-4c6e-9a5f-0123456789ab"),
            "kaniko-build-3f1c2a9e"
        );
    }
}
