//! EnvironmentGuard: refuses destructive operations on protected
//! environments.

use std::collections::HashSet;

use async_trait::async_trait;
use kinto_core::{BlockRef, TeleportServiceData};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::ControllerApi;
use crate::chain::{Link, successor};
use crate::error::{ControlError, ControlResult};

#[derive(Debug, Default)]
pub struct EnvironmentGuard {
    link: Link,
    protected: HashSet<String>,
}

impl EnvironmentGuard {
    pub fn new<I, S>(protected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            link: Link::new(),
            protected: protected.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_protected(&self, env: &str) -> bool {
        self.protected.contains(env)
    }

    fn check(&self, operation: &str, env: &str) -> ControlResult<()> {
        if self.is_protected(env) {
            warn!(%env, operation, "refused on protected environment");
            return Err(ControlError::PermissionDenied(format!(
                "{operation} is not allowed in protected environment {env}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ControllerApi for EnvironmentGuard {
    fn link(&self) -> Option<&Link> {
        Some(&self.link)
    }

    async fn delete_environment(&self, id: &str) -> ControlResult<()> {
        self.check("delete_environment", id)?;
        successor(self.link()).delete_environment(id).await
    }

    async fn delete_block(&self, name: &str, env: &str) -> ControlResult<()> {
        self.check("delete_block", env)?;
        successor(self.link()).delete_block(name, env).await
    }

    async fn suspend_block(&self, name: &str, env: &str) -> ControlResult<BlockRef> {
        self.check("suspend_block", env)?;
        successor(self.link()).suspend_block(name, env).await
    }

    async fn kill_block_instance(&self, instance_id: &str, env: &str) -> ControlResult<()> {
        self.check("kill_block_instance", env)?;
        successor(self.link())
            .kill_block_instance(instance_id, env)
            .await
    }

    async fn start_teleport(
        &self,
        cancel: &CancellationToken,
        env: &str,
        block: &str,
    ) -> ControlResult<TeleportServiceData> {
        self.check("start_teleport", env)?;
        successor(self.link())
            .start_teleport(cancel, env, block)
            .await
    }

    async fn stop_teleport(&self, env: &str, block: &str) -> ControlResult<()> {
        self.check("stop_teleport", env)?;
        successor(self.link()).stop_teleport(env, block).await
    }
}
