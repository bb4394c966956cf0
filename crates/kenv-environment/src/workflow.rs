//! Background lifecycle workflows.
//!
//! A workflow owns its environment's lease until it finishes. It waits for a
//! concurrency permit, then drives the record through its states with
//! version-checked writes. Any failure lands the record in ERROR with a
//! message naming the step that failed.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, Instrument};

use kenv_common::retry::retry_with_backoff_when;
use kenv_common::Error;
use kenv_workspace::ProvisionOutputs;

use crate::lease::WorkflowLease;
use crate::manager::ManagerInner;
use crate::model::{Credential, Environment, EnvironmentState};
use crate::variables::module_variables;

/// Attempts at a version-checked write before giving up on contention
const CAS_ATTEMPTS: u32 = 5;

/// Which lifecycle operation a workflow carries out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowKind {
    /// Provision, bootstrap, then ACTIVE
    Create,
    /// Re-apply, bootstrap, then ACTIVE
    Update,
    /// Tear down, then DELETED
    Delete,
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A failed workflow step and its cause
#[derive(Debug)]
struct StepFailure {
    step: &'static str,
    source: Error,
}

impl StepFailure {
    fn at(step: &'static str) -> impl FnOnce(Error) -> Self {
        move |source| Self { step, source }
    }

    fn message(&self) -> String {
        format!("Failed to {}: {}", self.step, self.source)
    }
}

impl ManagerInner {
    /// Spawn the workflow on the tracker. The lease moves into the task.
    pub(crate) fn launch(self: &Arc<Self>, kind: WorkflowKind, id: String, lease: WorkflowLease) {
        let inner = Arc::clone(self);
        let span = tracing::info_span!("workflow", %kind, env_id = %id);
        self.tracker
            .spawn(async move { inner.run(kind, id, lease).await }.instrument(span));
    }

    async fn run(self: Arc<Self>, kind: WorkflowKind, id: String, _lease: WorkflowLease) {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("workflow permits closed, abandoning workflow");
                return;
            }
        };
        debug!("workflow started");

        let result = match kind {
            WorkflowKind::Create => self.provision_flow(&id, true).await,
            WorkflowKind::Update => self.provision_flow(&id, false).await,
            WorkflowKind::Delete => self.teardown_flow(&id).await,
        };

        match result {
            Ok(()) => info!("workflow finished"),
            Err(failure) => self.record_failure(&id, kind, failure).await,
        }
    }

    /// Create and Update share one path: apply, persist outputs, bootstrap
    async fn provision_flow(&self, id: &str, creating: bool) -> Result<(), StepFailure> {
        if creating {
            self.transition(id, EnvironmentState::Provisioning, "Provisioning resources", |_| {})
                .await
                .map_err(StepFailure::at("record progress"))?;
        }

        let env = self
            .load(id)
            .await
            .map_err(StepFailure::at("record progress"))?;
        let outputs = self
            .provision_with_retry(&env)
            .await
            .map_err(StepFailure::at("provision resources"))?;

        let credential = Credential::new(outputs.kubeconfig.clone());
        let console_url = outputs.console_url.clone();
        let env = self
            .modify(id, |record| {
                record.credential = Some(credential.clone());
                record.console_url = console_url.clone();
                record.push_history(
                    record.status,
                    "Resources provisioned, bootstrapping cluster".to_string(),
                    Utc::now(),
                    self.config.history_limit,
                );
                Ok(())
            })
            .await
            .map_err(StepFailure::at("record progress"))?;

        self.ctx
            .bootstrap
            .bootstrap(&env, &credential)
            .await
            .map_err(StepFailure::at("bootstrap cluster"))?;

        let message = if creating {
            "Environment provisioned successfully"
        } else {
            "Environment updated successfully"
        };
        self.transition(id, EnvironmentState::Active, message, |_| {})
            .await
            .map_err(StepFailure::at("record progress"))?;
        Ok(())
    }

    async fn provision_with_retry(&self, env: &Environment) -> Result<ProvisionOutputs, Error> {
        let variables = module_variables(env, &self.config.defaults)?;
        let retry = &self.config.retry;
        let this = self;
        let id = env.id.as_str();
        let variables = &variables;
        let mut attempt = 0u32;

        retry_with_backoff_when(retry, "provision", Error::is_retryable, move || {
            attempt += 1;
            let n = attempt;
            async move {
                let result = this.ctx.orchestrator.provision(id, variables).await;
                if let Err(e) = &result {
                    if retry.retries_enabled() && !retry.is_exhausted(n) && e.is_retryable() {
                        this.note(id, format!("Provisioning attempt {n} failed: {e}"))
                            .await;
                    }
                }
                result
            }
        })
        .await
    }

    async fn teardown_flow(&self, id: &str) -> Result<(), StepFailure> {
        let env = self
            .load(id)
            .await
            .map_err(StepFailure::at("record progress"))?;
        let variables = module_variables(&env, &self.config.defaults)
            .map_err(StepFailure::at("delete resources"))?;

        self.ctx
            .orchestrator
            .teardown(id, &variables)
            .await
            .map_err(StepFailure::at("delete resources"))?;

        self.transition(
            id,
            EnvironmentState::Deleted,
            "Environment deleted successfully",
            |_| {},
        )
        .await
        .map_err(StepFailure::at("record progress"))?;
        Ok(())
    }

    /// Land the record in ERROR. A failed teardown also clears `deleted_at`
    /// so the record is visible again and Delete can be retried.
    async fn record_failure(&self, id: &str, kind: WorkflowKind, failure: StepFailure) {
        let message = failure.message();
        error!(step = failure.step, error = %failure.source, "workflow failed");

        let restore = kind == WorkflowKind::Delete;
        let result = self
            .transition(id, EnvironmentState::Error, message, |record| {
                if restore {
                    record.deleted_at = None;
                }
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "could not record workflow failure");
        }
    }

    // =========================================================================
    // Record writes
    // =========================================================================

    async fn load(&self, id: &str) -> Result<Environment, Error> {
        self.ctx
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("environment", id))
    }

    /// Move the record to `to`, applying `mutate` in the same write
    #[instrument(skip(self, message, mutate), fields(to = %to))]
    async fn transition<F>(
        &self,
        id: &str,
        to: EnvironmentState,
        message: impl Into<String>,
        mutate: F,
    ) -> Result<Environment, Error>
    where
        F: Fn(&mut Environment) + Send + Sync,
    {
        let message = message.into();
        self.modify(id, |record| {
            if !record.status.can_transition_to(to) {
                return Err(Error::conflict(
                    &record.id,
                    format!("cannot move from {} to {}", record.status, to),
                ));
            }
            mutate(record);
            record.set_status(to, message.clone(), Utc::now(), self.config.history_limit);
            Ok(())
        })
        .await
    }

    /// Append a history entry under the current status. Best effort.
    async fn note(&self, id: &str, message: String) {
        let result = self
            .modify(id, |record| {
                record.push_history(
                    record.status,
                    message.clone(),
                    Utc::now(),
                    self.config.history_limit,
                );
                Ok(())
            })
            .await;
        if let Err(e) = result {
            debug!(error = %e, "could not record history note");
        }
    }

    /// Read, edit, write with the read version; re-read on contention
    async fn modify<F>(&self, id: &str, edit: F) -> Result<Environment, Error>
    where
        F: Fn(&mut Environment) -> Result<(), Error> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut record = self.load(id).await?;
            let expected = record.version;
            edit(&mut record)?;

            match self.ctx.store.put(&record, Some(expected)).await {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_conflict() && attempt < CAS_ATTEMPTS => {
                    debug!(attempt, error = %e, "record changed underneath, retrying write");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
