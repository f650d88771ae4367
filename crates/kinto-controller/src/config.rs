//! Controller settings.

use serde::{Deserialize, Serialize};

/// Settings read from the `[controller]` section of the daemon config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Parent domain of generated external URLs.
    pub external_domain: String,
    /// Registry prefix of release artifacts.
    pub image_registry: String,
    /// Activate a release as soon as its build succeeds.
    pub auto_deploy: bool,
    pub teleport_port: u16,
    /// Lifetime of a teleport session.
    pub teleport_ttl_secs: u64,
    pub enable_external_urls: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            external_domain: "kinto.local".to_string(),
            image_registry: "registry.kinto.local".to_string(),
            auto_deploy: true,
            teleport_port: 2222,
            teleport_ttl_secs: 3600,
            enable_external_urls: true,
        }
    }
}

impl ControllerConfig {
    /// Image reference a release builds into.
    pub fn artifact(&self, env_id: &str, block: &str, release_id: &str) -> String {
        format!("{}/{env_id}/{block}:{release_id}", self.image_registry)
    }

    /// External URL of a block.
    pub fn external_url(&self, env_id: &str, block: &str) -> String {
        format!("https://{block}-{env_id}.{}", self.external_domain)
    }
}
