//! Input validation shared by controller workflows.
//!
//! Every check fails with [`ControlError::InvalidArgument`].

use kinto_core::{BlockType, BuildConfig, RunConfig};
use regex::Regex;

use crate::error::{ControlError, ControlResult};

const BLOCK_NAME_PATTERN: &str = r"^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$";
const DOMAIN_LABEL_PATTERN: &str = r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$";

pub const MAX_ENVIRONMENT_NAME: usize = 63;
pub const MAX_TAG: usize = 128;

fn compile(pattern: &str) -> ControlResult<Regex> {
    Regex::new(pattern).map_err(|e| ControlError::Internal(format!("bad pattern {pattern}: {e}")))
}

fn invalid(msg: impl Into<String>) -> ControlError {
    ControlError::InvalidArgument(msg.into())
}

/// Block names are DNS labels.
pub fn block_name(name: &str) -> ControlResult<()> {
    if compile(BLOCK_NAME_PATTERN)?.is_match(name) {
        Ok(())
    } else {
        Err(invalid(format!(
            "block name {name:?} must be a lowercase DNS label (a-z, 0-9, '-', at most 63 chars)"
        )))
    }
}

/// Returns the trimmed name.
pub fn environment_name(name: &str) -> ControlResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(invalid("environment name must not be empty"));
    }
    if name.chars().count() > MAX_ENVIRONMENT_NAME {
        return Err(invalid(format!(
            "environment name must be at most {MAX_ENVIRONMENT_NAME} characters"
        )));
    }
    Ok(name)
}

pub fn domain(domain: &str) -> ControlResult<()> {
    let label = compile(DOMAIN_LABEL_PATTERN)?;
    let labels: Vec<&str> = domain.split('.').collect();
    if domain.len() > 253 || labels.len() < 2 || !labels.iter().all(|l| label.is_match(l)) {
        return Err(invalid(format!("{domain:?} is not a valid domain name")));
    }
    Ok(())
}

pub fn tag(tag: &str) -> ControlResult<()> {
    if tag.is_empty() {
        return Err(invalid("tag must not be empty"));
    }
    if tag.chars().any(char::is_whitespace) {
        return Err(invalid(format!("tag {tag:?} must not contain whitespace")));
    }
    if tag.len() > MAX_TAG {
        return Err(invalid(format!("tag must be at most {MAX_TAG} bytes")));
    }
    Ok(())
}

pub fn build_config(build: &BuildConfig) -> ControlResult<()> {
    if build.repository.trim().is_empty() {
        return Err(invalid("build config needs a repository"));
    }
    Ok(())
}

pub fn run_config(run: &RunConfig) -> ControlResult<()> {
    match run.block_type {
        BlockType::Service if run.port == 0 => Err(invalid("services need a non-zero port")),
        BlockType::Job if run.expose_externally => {
            Err(invalid("jobs cannot be exposed externally"))
        }
        _ if run.max_instances < run.min_instances => Err(invalid(format!(
            "max_instances ({}) is below min_instances ({})",
            run.max_instances, run.min_instances
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_names_are_dns_labels() {
        for ok in ["api", "a", "web-1", "a1b2"] {
            assert!(block_name(ok).is_ok(), "{ok}");
        }
        let too_long = "a".repeat(64);
        for bad in ["", "Api", "1api", "api-", "a_b", "a.b", too_long.as_str()] {
            assert!(block_name(bad).is_err(), "{bad}");
        }
        assert!(block_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn environment_names_are_trimmed() {
        assert_eq!(environment_name("  Staging ").unwrap(), "Staging");
        assert!(environment_name("   ").is_err());
        assert!(environment_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn domains_need_two_labels() {
        assert!(domain("api.example.com").is_ok());
        assert!(domain("localhost").is_err());
        assert!(domain("API.example.com").is_err());
        assert!(domain("api..com").is_err());
    }

    #[test]
    fn tags() {
        assert!(tag("v1.2.0").is_ok());
        assert!(tag("").is_err());
        assert!(tag("v1 final").is_err());
        assert!(tag(&"t".repeat(129)).is_err());
    }

    #[test]
    fn run_configs() {
        assert!(run_config(&RunConfig::default()).is_ok());

        let no_port = RunConfig {
            port: 0,
            ..RunConfig::default()
        };
        assert!(run_config(&no_port).is_err());

        let exposed_job = RunConfig {
            block_type: BlockType::Job,
            port: 0,
            expose_externally: true,
            ..RunConfig::default()
        };
        let err = run_config(&exposed_job).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);

        let inverted = RunConfig {
            min_instances: 3,
            max_instances: 1,
            ..RunConfig::default()
        };
        assert!(run_config(&inverted).is_err());
    }
}
