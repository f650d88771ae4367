//! kintod.toml configuration.
//!
//! Every section is optional; missing keys take their defaults:
//!
//! ```toml
//! [server]
//! port = 8470
//!
//! [storage]
//! data_dir = "/var/lib/kinto"
//!
//! [log]
//! filter = "info,kinto=debug"
//! json = false
//!
//! [build]
//! manifest_root = "/srv/manifests"
//! retention_secs = 3600
//!
//! [controller]
//! external_domain = "kinto.example.com"
//! auto_deploy = true
//!
//! [guard]
//! protected_environments = ["env-3f9a1c0b2d4e"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use kinto_controller::ControllerConfig;
use serde::Deserialize;

/// Filter used when neither `RUST_LOG` nor `[log].filter` is set.
pub const DEFAULT_LOG_FILTER: &str = "info,kintod=debug,kinto=debug";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
    pub build: BuildSettings,
    pub controller: ControllerConfig,
    pub guard: GuardConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8470 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `kinto.redb`.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/kinto"),
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("kinto.redb")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: Option<String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl LogConfig {
    pub fn directives(&self) -> &str {
        self.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Directory of `{org}/{repo}/{branch}/kinto.toml` manifests.
    pub manifest_root: Option<PathBuf>,
    /// How long ended builds keep their log history.
    pub retention_secs: u64,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            manifest_root: None,
            retention_secs: kinto_build::local::DEFAULT_RETENTION.as_secs(),
        }
    }
}

impl BuildSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Environment ids on which destructive operations are refused.
    pub protected_environments: Vec<String>,
}

impl DaemonConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid daemon configuration")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Apply command-line overrides.
    pub fn override_with(&mut self, port: Option<u16>, data_dir: Option<PathBuf>) {
        if let Some(port) = port {
            self.server.port = port;
        }
        if let Some(data_dir) = data_dir {
            self.storage.data_dir = data_dir;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = DaemonConfig::from_toml("").unwrap();
        assert_eq!(cfg.server.port, 8470);
        assert_eq!(cfg.storage.db_path(), PathBuf::from("/var/lib/kinto/kinto.redb"));
        assert_eq!(cfg.log.directives(), DEFAULT_LOG_FILTER);
        assert!(!cfg.log.json);
        assert_eq!(cfg.controller, ControllerConfig::default());
        assert!(cfg.guard.protected_environments.is_empty());
        assert_eq!(cfg.build.retention(), Duration::from_secs(3600));
    }

    #[test]
    fn sections_are_independent() {
        let cfg = DaemonConfig::from_toml(
            r#"
            [log]
            json = true

            [build]
            retention_secs = 120

            [controller]
            external_domain = "apps.acme.io"
            auto_deploy = false

            [guard]
            protected_environments = ["env-prod"]
            "#,
        )
        .unwrap();
        assert!(cfg.log.json);
        assert_eq!(cfg.controller.external_domain, "apps.acme.io");
        assert!(!cfg.controller.auto_deploy);
        assert_eq!(cfg.controller.teleport_port, 2222);
        assert_eq!(cfg.guard.protected_environments, ["env-prod"]);
        assert_eq!(cfg.build.retention(), Duration::from_secs(120));
        assert!(cfg.build.manifest_root.is_none());
        assert_eq!(cfg.server.port, 8470);
    }

    #[test]
    fn cli_overrides_win() {
        let mut cfg = DaemonConfig::from_toml("[server]\nport = 9000\n").unwrap();
        cfg.override_with(Some(9100), Some(PathBuf::from("/tmp/kinto")));
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.storage.data_dir, PathBuf::from("/tmp/kinto"));

        cfg.override_with(None, None);
        assert_eq!(cfg.server.port, 9100);
    }

    #[test]
    fn unknown_types_are_rejected() {
        let err = DaemonConfig::from_toml("[server]\nport = \"eighty\"\n").unwrap_err();
        assert!(err.to_string().contains("invalid daemon configuration"));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kintod.toml");
        std::fs::write(&path, "[storage]\ndata_dir = \"/data\"\n").unwrap();
        let cfg = DaemonConfig::load(&path).unwrap();
        assert_eq!(cfg.storage.data_dir, PathBuf::from("/data"));

        assert!(DaemonConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
