//! Lifecycle manager: the public create/get/list/update/delete/status API.
//!
//! Every mutating call validates and persists synchronously, takes the
//! environment's workflow lease, and hands the slow part to a background
//! workflow (see [`crate::workflow`]). Callers get the record as persisted
//! in CREATING, UPDATING or DELETING and poll `get` for progress.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use kenv_common::retry::RetryConfig;
use kenv_common::Error;
use kenv_workspace::ProvisioningOrchestrator;

use crate::bootstrap::ClusterBootstrap;
use crate::lease::LeaseTable;
use crate::model::{
    Environment, EnvironmentFilter, EnvironmentPatch, EnvironmentRequest, EnvironmentState,
};
use crate::status::{EnvironmentStatusView, StatusAggregator};
use crate::store::EnvironmentStore;
use crate::validation::{DefaultValidator, EnvironmentValidator};
use crate::variables::ProvisioningDefaults;
use crate::workflow::WorkflowKind;

/// Default bound on workflows running at once
pub const DEFAULT_MAX_CONCURRENT_WORKFLOWS: usize = 8;

/// Default number of status history entries kept per record
pub const DEFAULT_HISTORY_LIMIT: usize = 32;

/// Manager tuning
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
    /// Values passed to the provisioning module that the record does not carry
    pub defaults: ProvisioningDefaults,
    /// Workflows beyond this many wait for a permit
    pub max_concurrent_workflows: usize,
    /// Retry policy for provisioning; a single attempt unless configured
    #[serde(skip)]
    pub retry: RetryConfig,
    /// Status history entries kept per record
    pub history_limit: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            defaults: ProvisioningDefaults::default(),
            max_concurrent_workflows: DEFAULT_MAX_CONCURRENT_WORKFLOWS,
            retry: RetryConfig::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Collaborators the manager drives
pub struct ManagerContext {
    /// Durable record store
    pub store: Arc<dyn EnvironmentStore>,
    /// Infrastructure provisioning
    pub orchestrator: Arc<dyn ProvisioningOrchestrator>,
    /// Post-provisioning cluster setup
    pub bootstrap: Arc<dyn ClusterBootstrap>,
    /// Live cluster observation
    pub aggregator: Arc<dyn StatusAggregator>,
    /// Record validation shared by create and update
    pub validator: Arc<dyn EnvironmentValidator>,
}

impl ManagerContext {
    /// Context using the default validator
    pub fn new(
        store: Arc<dyn EnvironmentStore>,
        orchestrator: Arc<dyn ProvisioningOrchestrator>,
        bootstrap: Arc<dyn ClusterBootstrap>,
        aggregator: Arc<dyn StatusAggregator>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            bootstrap,
            aggregator,
            validator: Arc::new(DefaultValidator),
        }
    }

    /// Replace the validator
    pub fn with_validator(mut self, validator: Arc<dyn EnvironmentValidator>) -> Self {
        self.validator = validator;
        self
    }
}

pub(crate) struct ManagerInner {
    pub(crate) ctx: ManagerContext,
    pub(crate) config: ManagerConfig,
    pub(crate) leases: LeaseTable,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) tracker: TaskTracker,
}

/// Environment lifecycle manager. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EnvironmentManager {
    inner: Arc<ManagerInner>,
}

impl EnvironmentManager {
    /// Create a manager. Must be called inside a Tokio runtime before any
    /// mutating operation runs.
    pub fn new(ctx: ManagerContext, config: ManagerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_workflows.max(1)));
        Self {
            inner: Arc::new(ManagerInner {
                ctx,
                config,
                leases: LeaseTable::new(),
                permits,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Validate and persist a new environment in CREATING, then start
    /// provisioning in the background
    #[instrument(skip_all, fields(name = %request.name, owner = %request.owner_id))]
    pub async fn create(&self, request: EnvironmentRequest) -> Result<Environment, Error> {
        let id = Uuid::new_v4().to_string();
        let record = Environment::from_request(id.clone(), request, Utc::now());
        self.inner.ctx.validator.validate(&record)?;

        let lease = self.inner.leases.try_acquire(&id)?;
        let stored = self.inner.ctx.store.put(&record, None).await?;

        info!(env_id = %id, cluster = %stored.cluster_name, "environment accepted");
        self.inner.launch(WorkflowKind::Create, id, lease);
        Ok(stored)
    }

    /// Record by id; soft-deleted records are reported as not found
    pub async fn get(&self, id: &str) -> Result<Environment, Error> {
        match self.inner.ctx.store.get(id).await? {
            Some(env) if !env.is_deleted() => Ok(env),
            _ => Err(Error::not_found("environment", id)),
        }
    }

    /// Records matching `filter`, never including soft-deleted ones
    pub async fn list(&self, filter: EnvironmentFilter) -> Result<Vec<Environment>, Error> {
        let filter = EnvironmentFilter {
            include_deleted: false,
            ..filter
        };
        self.inner.ctx.store.scan(&filter).await
    }

    /// Merge `patch` into the record, persist it in UPDATING and re-apply
    /// infrastructure in the background
    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: &str, patch: EnvironmentPatch) -> Result<Environment, Error> {
        let current = self.get(id).await?;
        let lease = self.inner.leases.try_acquire(id)?;
        ensure_transition(&current, EnvironmentState::Updating)?;

        let mut next = current.clone();
        patch.apply_to(&mut next);
        self.inner.ctx.validator.validate(&next)?;
        next.set_status(
            EnvironmentState::Updating,
            "Environment update initiated",
            Utc::now(),
            self.inner.config.history_limit,
        );

        let stored = self.inner.ctx.store.put(&next, Some(current.version)).await?;
        info!(env_id = %id, "environment update accepted");
        self.inner.launch(WorkflowKind::Update, id.to_string(), lease);
        Ok(stored)
    }

    /// Soft-delete the record and tear down its infrastructure in the
    /// background. The record disappears from get/list immediately.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), Error> {
        let current = self.get(id).await?;
        let lease = self.inner.leases.try_acquire(id)?;
        ensure_transition(&current, EnvironmentState::Deleting)?;

        let now = Utc::now();
        let mut next = current.clone();
        next.deleted_at = Some(now);
        next.set_status(
            EnvironmentState::Deleting,
            "Environment deletion initiated",
            now,
            self.inner.config.history_limit,
        );

        self.inner.ctx.store.put(&next, Some(current.version)).await?;
        info!(env_id = %id, "environment deletion accepted");
        self.inner.launch(WorkflowKind::Delete, id.to_string(), lease);
        Ok(())
    }

    /// Persisted status merged with live cluster data when a credential
    /// exists. Never writes to the store.
    #[instrument(skip(self))]
    pub async fn get_status(&self, id: &str) -> Result<EnvironmentStatusView, Error> {
        let env = self.get(id).await?;
        let mut view = EnvironmentStatusView::persisted(&env);

        let Some(credential) = env.credential.as_ref().filter(|c| !c.is_empty()) else {
            return Ok(view);
        };

        match self.inner.ctx.aggregator.collect(&env.id, credential).await {
            Ok(live) => view.live = Some(live),
            Err(e) => {
                warn!(env_id = %id, error = %e, "live status unavailable");
                view.live_error = Some(e.to_string());
            }
        }
        Ok(view)
    }

    /// True while a workflow holds the environment's lease
    pub fn is_busy(&self, id: &str) -> bool {
        self.inner.leases.is_held(id)
    }

    /// Wait until every workflow started so far has finished
    pub async fn wait_for_workflows(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }
}

fn ensure_transition(env: &Environment, next: EnvironmentState) -> Result<(), Error> {
    if env.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(Error::conflict(
            &env.id,
            format!("cannot move from {} to {}", env.status, next),
        ))
    }
}
