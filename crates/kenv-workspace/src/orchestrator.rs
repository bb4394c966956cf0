//! Provisioning orchestrator: init→apply→output and init→destroy for one
//! environment, with typed output extraction.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::{info, instrument};

use kenv_common::Error;

use crate::executor::{Outputs, Variables, WorkspaceExecutor};

/// Output holding the cluster-access kubeconfig (required)
pub const KUBECONFIG_OUTPUT: &str = "kubeconfig";

/// Output holding the cluster console URL (optional)
pub const CONSOLE_URL_OUTPUT: &str = "console_url";

/// Validated result of a successful provisioning run
#[derive(Clone, PartialEq)]
pub struct ProvisionOutputs {
    /// Kubeconfig YAML for the new cluster
    pub kubeconfig: String,
    /// Console URL, when the module exports one
    pub console_url: Option<String>,
    /// Every output the module produced
    pub raw: Outputs,
}

impl std::fmt::Debug for ProvisionOutputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionOutputs")
            .field("kubeconfig", &"<redacted>")
            .field("console_url", &self.console_url)
            .field("outputs", &self.raw.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProvisionOutputs {
    /// Extract and validate the outputs the lifecycle manager depends on
    pub fn from_outputs(env_id: &str, raw: Outputs) -> Result<Self, Error> {
        let kubeconfig = match raw.get(KUBECONFIG_OUTPUT) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) => {
                return Err(Error::execution(
                    "terraform output",
                    format!("output '{KUBECONFIG_OUTPUT}' is empty for {env_id}"),
                ))
            }
            Some(_) => {
                return Err(Error::execution(
                    "terraform output",
                    format!("output '{KUBECONFIG_OUTPUT}' is not a string for {env_id}"),
                ))
            }
            None => {
                return Err(Error::execution(
                    "terraform output",
                    format!("Failed to get kubeconfig: output '{KUBECONFIG_OUTPUT}' missing for {env_id}"),
                ))
            }
        };

        let console_url = match raw.get(CONSOLE_URL_OUTPUT) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        };

        Ok(Self {
            kubeconfig,
            console_url,
            raw,
        })
    }
}

/// Sequences workspace steps for one environment.
///
/// Implementations never retry; the caller owns retry policy.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisioningOrchestrator: Send + Sync {
    /// Create or update the environment's infrastructure and return its outputs
    async fn provision(&self, env_id: &str, variables: &Variables)
        -> Result<ProvisionOutputs, Error>;

    /// Destroy the environment's infrastructure
    async fn teardown(&self, env_id: &str, variables: &Variables) -> Result<(), Error>;
}

/// Orchestrator running one module through a `WorkspaceExecutor`
pub struct TerraformOrchestrator {
    executor: Arc<WorkspaceExecutor>,
    module: String,
}

impl TerraformOrchestrator {
    /// Create an orchestrator for `module`
    pub fn new(executor: Arc<WorkspaceExecutor>, module: impl Into<String>) -> Self {
        Self {
            executor,
            module: module.into(),
        }
    }

    /// Module this orchestrator applies
    pub fn module(&self) -> &str {
        &self.module
    }
}

#[async_trait]
impl ProvisioningOrchestrator for TerraformOrchestrator {
    #[instrument(skip(self, variables), fields(env_id = %env_id, module = %self.module))]
    async fn provision(
        &self,
        env_id: &str,
        variables: &Variables,
    ) -> Result<ProvisionOutputs, Error> {
        let handle = self.executor.apply(env_id, &self.module, variables).await?;
        let outputs = self.executor.outputs(&handle).await?;
        let outputs = ProvisionOutputs::from_outputs(env_id, outputs)?;
        info!(console_url = ?outputs.console_url, "environment provisioned");
        Ok(outputs)
    }

    #[instrument(skip(self, variables), fields(env_id = %env_id, module = %self.module))]
    async fn teardown(&self, env_id: &str, variables: &Variables) -> Result<(), Error> {
        let handle = self.executor.handle_for(env_id, &self.module)?;
        self.executor
            .destroy(&self.module, variables, &handle)
            .await?;
        info!("environment torn down");
        Ok(())
    }
}
