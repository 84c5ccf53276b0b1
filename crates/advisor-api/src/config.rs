//! Gateway configuration
//!
//! Read from the YAML file named by `ADVISOR_GATEWAY_CONFIG` (defaults when
//! unset), then patched from a handful of environment variables.

use advisor_auth::AuthType;
use advisor_core::OrgId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_ENV: &str = "ADVISOR_GATEWAY_CONFIG";
pub const ADDR_ENV: &str = "ADVISOR_GATEWAY_ADDR";
pub const AGGREGATOR_URL_ENV: &str = "ADVISOR_GATEWAY_AGGREGATOR_URL";
pub const CONTENT_URL_ENV: &str = "ADVISOR_GATEWAY_CONTENT_URL";
pub const RBAC_URL_ENV: &str = "ADVISOR_GATEWAY_RBAC_URL";
pub const AMS_URL_ENV: &str = "ADVISOR_GATEWAY_AMS_URL";
pub const AMS_TOKEN_ENV: &str = "ADVISOR_GATEWAY_AMS_TOKEN";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub services: ServicesConfig,
    pub rbac: RbacConfig,
    pub ams: AmsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub api_prefix: String,
    pub auth: bool,
    pub auth_type: String,
    pub use_rbac: bool,
    pub log_auth_token: bool,
    pub enable_internal_rules_organizations: bool,
    pub internal_rules_organizations: Vec<OrgId>,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8000".to_string(),
            api_prefix: "/api/v2/".to_string(),
            auth: true,
            auth_type: AuthType::Xrh.to_string(),
            use_rbac: false,
            log_auth_token: false,
            enable_internal_rules_organizations: false,
            internal_rules_organizations: Vec::new(),
            cors: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub aggregator_base_endpoint: String,
    pub content_base_endpoint: String,
    pub content_refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            aggregator_base_endpoint: "http://localhost:8080/api/v1/".to_string(),
            content_base_endpoint: "http://localhost:8082/api/v1/".to_string(),
            content_refresh_interval_secs: 3600,
            request_timeout_secs: 30,
        }
    }
}

impl ServicesConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn content_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.content_refresh_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RbacConfig {
    pub url: String,
    /// Origin relative `next` links are resolved against; derived from `url` when empty
    pub host: String,
    pub enforce: bool,
    pub max_pages: usize,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            host: String::new(),
            enforce: false,
            max_pages: 100,
        }
    }
}

/// Account management service; an empty `url` leaves the aggregator as
/// the only cluster inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmsConfig {
    pub url: String,
    /// Bearer token sent with every AMS request
    pub token: String,
    pub page_size: usize,
}

impl Default for AmsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            page_size: 500,
        }
    }
}

impl AmsConfig {
    pub fn is_enabled(&self) -> bool {
        !self.url.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    /// File named by `ADVISOR_GATEWAY_CONFIG` plus environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Patch values from `lookup`; empty values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(v) = get(ADDR_ENV) {
            self.server.address = v;
        }
        if let Some(v) = get(AGGREGATOR_URL_ENV) {
            self.services.aggregator_base_endpoint = v;
        }
        if let Some(v) = get(CONTENT_URL_ENV) {
            self.services.content_base_endpoint = v;
        }
        if let Some(v) = get(RBAC_URL_ENV) {
            self.rbac.url = v;
        }
        if let Some(v) = get(AMS_URL_ENV) {
            self.ams.url = v;
        }
        if let Some(v) = get(AMS_TOKEN_ENV) {
            self.ams.token = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.server.api_prefix;
        if !prefix.starts_with('/') || !prefix.ends_with('/') {
            return Err(ConfigError::Invalid(format!(
                "api_prefix must start and end with '/': {}",
                prefix
            )));
        }
        self.server
            .auth_type
            .parse::<AuthType>()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.server.use_rbac && self.rbac.url.is_empty() {
            return Err(ConfigError::Invalid("rbac.url is required when use_rbac is set".into()));
        }
        Ok(())
    }

    /// Api prefix without the trailing slash, as used for nesting routes
    pub fn route_prefix(&self) -> &str {
        self.server.api_prefix.trim_end_matches('/')
    }

    pub fn is_internal_rules_org(&self, org: OrgId) -> bool {
        self.server.internal_rules_organizations.contains(&org)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.api_prefix, "/api/v2/");
        assert_eq!(config.route_prefix(), "/api/v2");
        assert!(config.server.auth);
        assert_eq!(config.rbac.max_pages, 100);
        assert!(!config.ams.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = GatewayConfig::from_yaml(
            r#"
server:
  address: "127.0.0.1:9000"
  use_rbac: true
  enable_internal_rules_organizations: true
  internal_rules_organizations: [1, 2]
rbac:
  url: "rbac:8000/api/rbac/v1"
  enforce: true
"#,
        )
        .unwrap();

        assert_eq!(config.server.address, "127.0.0.1:9000");
        assert_eq!(config.server.api_prefix, "/api/v2/");
        assert!(config.is_internal_rules_org(OrgId(2)));
        assert!(!config.is_internal_rules_org(OrgId(3)));
        assert!(config.rbac.enforce);
        assert_eq!(config.services.request_timeout_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ADDR_ENV, "0.0.0.0:1234"),
            (AGGREGATOR_URL_ENV, "http://agg/api/v1/"),
            (CONTENT_URL_ENV, ""),
            (AMS_URL_ENV, "https://api.openshift.com"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.address, "0.0.0.0:1234");
        assert_eq!(config.services.aggregator_base_endpoint, "http://agg/api/v1/");
        assert_eq!(
            config.services.content_base_endpoint,
            ServicesConfig::default().content_base_endpoint
        );
        assert!(config.ams.is_enabled());
        assert_eq!(config.ams.url, "https://api.openshift.com");
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = GatewayConfig::default();
        config.server.api_prefix = "api".into();
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.server.auth_type = "jwt".into();
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.server.use_rbac = true;
        assert!(config.validate().is_err());
    }
}
