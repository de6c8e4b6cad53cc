//! Registry destination settings.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};

/// Where built images end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryType {
    /// Cluster-local registry, or a direct load into the cluster runtime.
    #[default]
    #[serde(alias = "internal")]
    Local,
    Dockerhub,
    Ecr,
    Gcr,
}

impl RegistryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Dockerhub => "dockerhub",
            Self::Ecr => "ecr",
            Self::Gcr => "gcr",
        }
    }
}

impl std::fmt::Display for RegistryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RegistryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "internal" => Ok(Self::Local),
            "dockerhub" => Ok(Self::Dockerhub),
            "ecr" => Ok(Self::Ecr),
            "gcr" => Ok(Self::Gcr),
            other => Err(format!("unknown registry type '{}'", other)),
        }
    }
}

/// The single active registry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(rename = "type", default)]
    pub registry_type: RegistryType,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_true")]
    pub use_local_fallback: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_type: RegistryType::Local,
            url: None,
            username: None,
            password: None,
            namespace: None,
            use_local_fallback: true,
        }
    }
}

impl RegistryConfig {
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret())
    }

    /// Client-facing view with the password masked.
    pub fn masked(&self) -> RegistryConfigView {
        RegistryConfigView {
            registry_type: self.registry_type,
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.as_ref().map(|_| "***".to_string()),
            namespace: self.namespace.clone(),
            use_local_fallback: self.use_local_fallback,
        }
    }
}

/// Serializable registry configuration without secrets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryConfigView {
    #[serde(rename = "type")]
    pub registry_type: RegistryType,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub namespace: Option<String>,
    pub use_local_fallback: bool,
}

fn default_true() -> bool {
    true
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|s| !s.is_empty())
        .map(SecretString::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_local_with_fallback() {
        let cfg: RegistryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.registry_type, RegistryType::Local);
        assert!(cfg.use_local_fallback);
    }

    #[test]
    fn internal_is_an_alias_for_local() {
        let cfg: RegistryConfig = serde_json::from_str(r#"{"type":"internal"}"#).unwrap();
        assert_eq!(cfg.registry_type, RegistryType::Local);
    }

    #[test]
    fn masked_view_hides_password() {
        let cfg: RegistryConfig = serde_json::from_str(
            r#"{"type":"dockerhub","username":"bob","password":"hunter2","use_local_fallback":false}"#,
        )
        .unwrap();
        assert_eq!(cfg.password(), Some("hunter2"));
        let view = serde_json::to_value(cfg.masked()).unwrap();
        assert_eq!(view["password"], "***");
        assert_eq!(view["type"], "dockerhub");
        assert!(!format!("{:?}", cfg).contains("hunter2"));
    }

    #[test]
    fn empty_password_is_absent() {
        let cfg: RegistryConfig =
            serde_json::from_str(r#"{"type":"dockerhub","password":""}"#).unwrap();
        assert!(cfg.password.is_none());
        assert_eq!(cfg.masked().password, None);
    }
}
