//! kinto.toml repository manifest parser.
//!
//! A repository may carry a `kinto.toml` describing how to build and run
//! it. The controller fetches the file through the build client and
//! translates it into a [`ReleaseConfig`] for a given environment:
//!
//! ```toml
//! [build]
//! language = "rust"
//! start_command = "./server"
//!
//! [run]
//! type = "service"
//! port = 8080
//! expose = true
//!
//! [environments.prod.run]
//! min_instances = 3
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::types::{BlockType, BuildConfig, Protocol, ReleaseConfig, RunConfig};

/// Default file name looked up at the repository root.
pub const MANIFEST_FILE: &str = "kinto.toml";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid kinto.toml: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("kinto.toml declares a {declared:?} block but a {requested:?} was requested")]
    TypeMismatch {
        declared: BlockType,
        requested: BlockType,
    },

    #[error("kinto.toml is missing [build].language and [build].dockerfile")]
    MissingLanguage,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KintoFile {
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub run: RunSection,
    /// Per-environment overrides keyed by environment id.
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BuildSection {
    pub language: Option<String>,
    pub language_version: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunSection {
    #[serde(rename = "type")]
    pub block_type: Option<BlockType>,
    pub port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub expose: Option<bool>,
    pub min_instances: Option<u32>,
    pub max_instances: Option<u32>,
    pub memory_mb: Option<u32>,
    pub cpu_millicores: Option<u32>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvironmentSection {
    #[serde(default)]
    pub run: RunSection,
}

impl KintoFile {
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(content)?)
    }

    /// Translate the manifest into the release configuration used when the
    /// block is deployed into `env_id`. Environment overrides win over the
    /// top-level `[run]` section; anything unset falls back to defaults.
    pub fn to_release_config(
        &self,
        repository: &str,
        branch: &str,
        env_id: &str,
        requested: BlockType,
    ) -> Result<ReleaseConfig, ManifestError> {
        match self.run.block_type {
            Some(declared) if declared != requested => {
                return Err(ManifestError::TypeMismatch {
                    declared,
                    requested,
                });
            }
            _ => {}
        }

        let language = match (&self.build.language, &self.build.dockerfile) {
            (Some(lang), _) => lang.clone(),
            (None, Some(_)) => "dockerfile".to_string(),
            (None, None) => return Err(ManifestError::MissingLanguage),
        };

        let build_config = BuildConfig {
            repository: repository.to_string(),
            branch: branch.to_string(),
            language,
            language_version: self.build.language_version.clone(),
            build_command: self.build.build_command.clone(),
            start_command: self.build.start_command.clone(),
            dockerfile: self.build.dockerfile.clone(),
            build_args: self.build.args.clone(),
        };

        let mut run_config = RunConfig {
            block_type: requested,
            ..RunConfig::default()
        };
        self.run.apply(&mut run_config);
        if let Some(overrides) = self.environments.get(env_id) {
            overrides.run.apply(&mut run_config);
        }
        if requested == BlockType::Job {
            run_config.expose_externally = false;
        }

        Ok(ReleaseConfig {
            build_config,
            run_config,
        })
    }
}

impl RunSection {
    fn apply(&self, run: &mut RunConfig) {
        if let Some(port) = self.port {
            run.port = port;
        }
        if let Some(protocol) = self.protocol {
            run.protocol = protocol;
        }
        if let Some(expose) = self.expose {
            run.expose_externally = expose;
        }
        if let Some(min) = self.min_instances {
            run.min_instances = min;
        }
        if let Some(max) = self.max_instances {
            run.max_instances = max;
        }
        if let Some(memory) = self.memory_mb {
            run.memory_mb = memory;
        }
        if let Some(cpu) = self.cpu_millicores {
            run.cpu_millicores = cpu;
        }
        if self.timeout_secs.is_some() {
            run.job_timeout_secs = self.timeout_secs;
        }
        run.env
            .extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        run.max_instances = run.max_instances.max(run.min_instances);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[build]
language = "rust"
start_command = "./server"

[run]
type = "service"
port = 3000
expose = true
env = { LOG = "info" }

[environments.prod.run]
min_instances = 3
env = { LOG = "warn" }
"#;

    #[test]
    fn parse_minimal() {
        let file = KintoFile::parse("[build]\nlanguage = \"go\"\n").unwrap();
        assert_eq!(file.build.language.as_deref(), Some("go"));
        assert!(file.environments.is_empty());
    }

    #[test]
    fn translates_top_level_sections() {
        let file = KintoFile::parse(MANIFEST).unwrap();
        let cfg = file
            .to_release_config("https://github.com/acme/api", "main", "staging", BlockType::Service)
            .unwrap();

        assert_eq!(cfg.build_config.language, "rust");
        assert_eq!(cfg.build_config.branch, "main");
        assert_eq!(cfg.run_config.port, 3000);
        assert!(cfg.run_config.expose_externally);
        assert_eq!(cfg.run_config.min_instances, 1);
        assert_eq!(cfg.run_config.env.get("LOG").map(String::as_str), Some("info"));
    }

    #[test]
    fn environment_overrides_win() {
        let file = KintoFile::parse(MANIFEST).unwrap();
        let cfg = file
            .to_release_config("https://github.com/acme/api", "main", "prod", BlockType::Service)
            .unwrap();

        assert_eq!(cfg.run_config.min_instances, 3);
        assert_eq!(cfg.run_config.max_instances, 3);
        assert_eq!(cfg.run_config.env.get("LOG").map(String::as_str), Some("warn"));
    }

    #[test]
    fn rejects_type_mismatch() {
        let file = KintoFile::parse(MANIFEST).unwrap();
        let err = file
            .to_release_config("repo", "main", "dev", BlockType::Job)
            .unwrap_err();
        assert!(matches!(err, ManifestError::TypeMismatch { .. }));
    }

    #[test]
    fn dockerfile_stands_in_for_language() {
        let file = KintoFile::parse("[build]\ndockerfile = \"Dockerfile\"\n").unwrap();
        let cfg = file.to_release_config("repo", "main", "dev", BlockType::Job).unwrap();
        assert_eq!(cfg.build_config.language, "dockerfile");
        assert_eq!(cfg.run_config.block_type, BlockType::Job);
        assert!(!cfg.run_config.expose_externally);

        let empty = KintoFile::parse("").unwrap();
        assert!(matches!(
            empty.to_release_config("repo", "main", "dev", BlockType::Service),
            Err(ManifestError::MissingLanguage)
        ));
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        assert!(matches!(KintoFile::parse("[run\n"), Err(ManifestError::Parse(_))));
    }
}
