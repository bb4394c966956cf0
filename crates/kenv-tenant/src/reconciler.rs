//! Tenant reconciler
//!
//! Periodically converges every namespace of every Tenant to its declared
//! state: namespace labels, quota, network policies, owner binding and mesh
//! injection. Each object is compared with its desired form and only
//! written when it is missing or has drifted, so a pass over an unchanged
//! cluster performs no writes.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::ResourceExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};

use kenv_common::crd::{Tenant, TenantPhase, TenantSpec, TenantStatus};
use kenv_common::{Error, MESH_INJECTION_LABEL, TENANT_LABEL};

use crate::client::TenantKubeClient;
use crate::desired::{
    desired_namespace, desired_policies, desired_quota, desired_role_binding, has_labels,
    managed_labels, namespace_labels, policy_matches, quota_matches, recorded_hash,
    OWNER_BINDING_NAME, QUOTA_NAME,
};

/// Default time between passes
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Default bound on a single cluster call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconciler tuning
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Time between passes
    pub interval: Duration,
    /// Bound on each cluster call
    pub call_timeout: Duration,
    /// Delete managed namespaces no Tenant declares any more
    pub prune_namespaces: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            prune_namespaces: false,
        }
    }
}

/// Result of one Tenant's reconciliation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TenantOutcome {
    /// Namespaces that converged
    pub ready: usize,
    /// `namespace: error` for each namespace that did not
    pub failures: Vec<String>,
    /// Cluster writes made, status excluded
    pub changes: usize,
}

/// Summary of one pass over all Tenants
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tenants listed
    pub tenants: usize,
    /// Namespaces that converged
    pub namespaces_ready: usize,
    /// Namespaces that failed
    pub namespaces_failed: usize,
    /// Cluster writes made, status excluded
    pub changes: usize,
    /// Orphaned namespaces deleted
    pub namespaces_pruned: usize,
}

/// Converges cluster objects to declared Tenants
pub struct TenantReconciler {
    client: Arc<dyn TenantKubeClient>,
    config: ReconcilerConfig,
}

impl TenantReconciler {
    /// Create a reconciler
    pub fn new(client: Arc<dyn TenantKubeClient>, config: ReconcilerConfig) -> Self {
        Self { client, config }
    }

    /// Run passes on the configured interval until `cancel` fires.
    ///
    /// Cancellation is checked between passes; a pass in progress finishes.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.interval.as_secs(),
            prune_namespaces = self.config.prune_namespaces,
            "tenant reconciler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if cancel.is_cancelled() {
                break;
            }

            match self.tick().await {
                Ok(report) => info!(
                    tenants = report.tenants,
                    ready = report.namespaces_ready,
                    failed = report.namespaces_failed,
                    changes = report.changes,
                    pruned = report.namespaces_pruned,
                    "reconcile pass complete"
                ),
                Err(e) => warn!(error = %e, "reconcile pass aborted"),
            }
        }

        info!("tenant reconciler stopped");
    }

    /// One pass over every Tenant. Fails only if Tenants cannot be listed.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport, Error> {
        let tenants = self.call("list tenants", self.client.list_tenants()).await?;
        let mut report = TickReport {
            tenants: tenants.len(),
            ..Default::default()
        };

        for tenant in &tenants {
            let outcome = self.reconcile_tenant(tenant).await;
            report.namespaces_ready += outcome.ready;
            report.namespaces_failed += outcome.failures.len();
            report.changes += outcome.changes;
        }

        if self.config.prune_namespaces {
            match self.prune_namespaces(&tenants).await {
                Ok(pruned) => report.namespaces_pruned = pruned,
                Err(e) => warn!(error = %e, "namespace prune skipped"),
            }
        }

        Ok(report)
    }

    /// Converge every namespace of `tenant`, then record the outcome in its
    /// status if it changed
    #[instrument(skip_all, fields(tenant = %tenant.name_any()))]
    pub async fn reconcile_tenant(&self, tenant: &Tenant) -> TenantOutcome {
        let name = tenant.name_any();
        let spec = &tenant.spec;
        let mut outcome = TenantOutcome::default();

        if let Err(e) = spec.validate(&name) {
            warn!(error = %e, "tenant spec rejected");
            outcome.failures = spec.namespaces.iter().map(|ns| format!("{ns}: {e}")).collect();
            let status = TenantStatus {
                phase: TenantPhase::Degraded,
                message: Some(e.to_string()),
                observed_generation: tenant.metadata.generation,
                ready_namespaces: 0,
                last_reconciled: Some(Utc::now().to_rfc3339()),
            };
            self.record_status(tenant, status).await;
            return outcome;
        }

        for namespace in &spec.namespaces {
            let span = tracing::info_span!("namespace", namespace = %namespace);
            match self
                .reconcile_namespace(&name, spec, namespace)
                .instrument(span)
                .await
            {
                Ok(changes) => {
                    outcome.ready += 1;
                    outcome.changes += changes;
                }
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "namespace failed to converge");
                    outcome.failures.push(format!("{namespace}: {e}"));
                }
            }
        }

        let total = spec.namespaces.len();
        let (phase, message) = match outcome.failures.first() {
            None => (TenantPhase::Ready, format!("{total} namespaces converged")),
            Some(first) => (
                TenantPhase::Degraded,
                format!("{} of {total} namespaces failed: {first}", outcome.failures.len()),
            ),
        };
        let status = TenantStatus {
            phase,
            message: Some(message),
            observed_generation: tenant.metadata.generation,
            ready_namespaces: u32::try_from(outcome.ready).unwrap_or(u32::MAX),
            last_reconciled: Some(Utc::now().to_rfc3339()),
        };
        self.record_status(tenant, status).await;

        if outcome.changes > 0 {
            info!(changes = outcome.changes, "tenant converged with changes");
        }
        outcome
    }

    async fn record_status(&self, tenant: &Tenant, status: TenantStatus) {
        let current = tenant.status.clone().unwrap_or_default();
        if !status.differs_from(&current) {
            return;
        }
        let name = tenant.name_any();
        let result = self
            .call(
                "patch tenant status",
                self.client.patch_tenant_status(&name, &status),
            )
            .await;
        match result {
            Ok(()) => debug!(phase = %status.phase, "tenant status updated"),
            Err(e) => warn!(error = %e, "failed to update tenant status"),
        }
    }

    // =========================================================================
    // Per-namespace convergence
    // =========================================================================

    /// Converge one namespace; returns the number of writes made
    async fn reconcile_namespace(
        &self,
        tenant: &str,
        spec: &TenantSpec,
        namespace: &str,
    ) -> Result<usize, Error> {
        let mut changes = self.ensure_namespace(tenant, spec, namespace).await?;
        changes += self.ensure_quota(tenant, spec, namespace).await?;
        changes += self.ensure_policies(tenant, spec, namespace).await?;
        changes += self.ensure_role_binding(tenant, spec, namespace).await?;
        Ok(changes)
    }

    async fn ensure_namespace(
        &self,
        tenant: &str,
        spec: &TenantSpec,
        namespace: &str,
    ) -> Result<usize, Error> {
        let existing = self
            .call("get namespace", self.client.get_namespace(namespace))
            .await?;

        let Some(existing) = existing else {
            let desired = desired_namespace(namespace, tenant, spec);
            self.call("create namespace", self.client.create_namespace(&desired))
                .await?;
            info!(namespace = %namespace, "namespace created");
            return Ok(1);
        };

        let current = existing.metadata.labels.as_ref();
        if let Some(owner) = current.and_then(|l| l.get(TENANT_LABEL)) {
            if owner != tenant {
                return Err(Error::conflict(
                    namespace,
                    format!("namespace belongs to tenant '{owner}'"),
                ));
            }
        }

        let mut patch: BTreeMap<String, Option<String>> = namespace_labels(tenant, spec)
            .into_iter()
            .filter(|(k, v)| current.and_then(|l| l.get(k)) != Some(v))
            .map(|(k, v)| (k, Some(v)))
            .collect();
        if !spec.service_mesh_enabled && current.is_some_and(|l| l.contains_key(MESH_INJECTION_LABEL)) {
            patch.insert(MESH_INJECTION_LABEL.to_string(), None);
        }
        if patch.is_empty() {
            return Ok(0);
        }

        self.call(
            "patch namespace labels",
            self.client.patch_namespace_labels(namespace, &patch),
        )
        .await?;
        info!(namespace = %namespace, labels = ?patch.keys().collect::<Vec<_>>(), "namespace labels updated");
        Ok(1)
    }

    async fn ensure_quota(
        &self,
        tenant: &str,
        spec: &TenantSpec,
        namespace: &str,
    ) -> Result<usize, Error> {
        let mut desired = desired_quota(namespace, tenant, spec)?;
        let existing = self
            .call("get quota", self.client.get_quota(namespace, QUOTA_NAME))
            .await?;

        match existing {
            None => {
                self.call("create quota", self.client.create_quota(namespace, &desired))
                    .await?;
                info!(namespace = %namespace, "quota created");
                Ok(1)
            }
            Some(existing)
                if quota_matches(&existing, &desired)
                    && recorded_hash(&existing.metadata) == recorded_hash(&desired.metadata)
                    && has_labels(existing.metadata.labels.as_ref(), &managed_labels(tenant)) =>
            {
                Ok(0)
            }
            Some(existing) => {
                desired.metadata.resource_version = existing.metadata.resource_version;
                self.call("replace quota", self.client.replace_quota(namespace, &desired))
                    .await?;
                info!(namespace = %namespace, "quota updated");
                Ok(1)
            }
        }
    }

    /// Create or replace the declared policies and delete managed ones that
    /// are no longer declared
    async fn ensure_policies(
        &self,
        tenant: &str,
        spec: &TenantSpec,
        namespace: &str,
    ) -> Result<usize, Error> {
        let desired = desired_policies(namespace, tenant, spec)?;
        let mut existing: BTreeMap<String, NetworkPolicy> = self
            .call(
                "list network policies",
                self.client.list_network_policies(namespace, tenant),
            )
            .await?
            .into_iter()
            .map(|p| (p.name_any(), p))
            .collect();

        let mut changes = 0;
        for mut policy in desired {
            let name = policy.name_any();
            match existing.remove(&name) {
                None => {
                    self.call(
                        "create network policy",
                        self.client.create_network_policy(namespace, &policy),
                    )
                    .await?;
                    info!(namespace = %namespace, policy = %name, "network policy created");
                    changes += 1;
                }
                Some(current)
                    if policy_matches(&current, &policy)
                        && recorded_hash(&current.metadata) == recorded_hash(&policy.metadata) => {}
                Some(current) => {
                    policy.metadata.resource_version = current.metadata.resource_version;
                    self.call(
                        "replace network policy",
                        self.client.replace_network_policy(namespace, &policy),
                    )
                    .await?;
                    info!(namespace = %namespace, policy = %name, "network policy updated");
                    changes += 1;
                }
            }
        }

        // Whatever is left is managed for this tenant but no longer declared
        for name in existing.keys() {
            self.call(
                "delete network policy",
                self.client.delete_network_policy(namespace, name),
            )
            .await?;
            info!(namespace = %namespace, policy = %name, "stale network policy deleted");
            changes += 1;
        }

        Ok(changes)
    }

    async fn ensure_role_binding(
        &self,
        tenant: &str,
        spec: &TenantSpec,
        namespace: &str,
    ) -> Result<usize, Error> {
        let mut desired = desired_role_binding(namespace, tenant, spec);
        let existing = self
            .call(
                "get role binding",
                self.client.get_role_binding(namespace, OWNER_BINDING_NAME),
            )
            .await?;

        let Some(existing) = existing else {
            self.call(
                "create role binding",
                self.client.create_role_binding(namespace, &desired),
            )
            .await?;
            info!(namespace = %namespace, owner = %spec.owner_id, "owner binding created");
            return Ok(1);
        };

        if existing.role_ref != desired.role_ref {
            // roleRef is immutable
            self.call(
                "delete role binding",
                self.client.delete_role_binding(namespace, OWNER_BINDING_NAME),
            )
            .await?;
            self.call(
                "create role binding",
                self.client.create_role_binding(namespace, &desired),
            )
            .await?;
            info!(namespace = %namespace, "owner binding recreated");
            return Ok(2);
        }

        if existing.subjects == desired.subjects
            && has_labels(existing.metadata.labels.as_ref(), &managed_labels(tenant))
        {
            return Ok(0);
        }

        desired.metadata.resource_version = existing.metadata.resource_version;
        self.call(
            "replace role binding",
            self.client.replace_role_binding(namespace, &desired),
        )
        .await?;
        info!(namespace = %namespace, owner = %spec.owner_id, "owner binding updated");
        Ok(1)
    }

    // =========================================================================
    // Namespace prune
    // =========================================================================

    /// Delete managed namespaces that no Tenant declares
    async fn prune_namespaces(&self, tenants: &[Tenant]) -> Result<usize, Error> {
        let declared: BTreeMap<String, BTreeSet<&str>> = tenants
            .iter()
            .map(|t| {
                (
                    t.name_any(),
                    t.spec.namespaces.iter().map(String::as_str).collect(),
                )
            })
            .collect();

        let managed = self
            .call("list managed namespaces", self.client.list_managed_namespaces())
            .await?;

        let mut pruned = 0;
        for namespace in managed {
            let name = namespace.name_any();
            let owner = namespace.labels().get(TENANT_LABEL).cloned().unwrap_or_default();
            let still_declared = declared
                .get(&owner)
                .is_some_and(|namespaces| namespaces.contains(name.as_str()));
            if still_declared {
                continue;
            }

            match self
                .call("delete namespace", self.client.delete_namespace(&name))
                .await
            {
                Ok(()) => {
                    info!(namespace = %name, tenant = %owner, "orphaned namespace deleted");
                    pruned += 1;
                }
                Err(e) => warn!(namespace = %name, error = %e, "failed to delete orphaned namespace"),
            }
        }
        Ok(pruned)
    }

    /// Bound a cluster call by the configured timeout
    async fn call<T, F>(&self, what: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(what, self.config.call_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockTenantKubeClient;
    use crate::desired::policy_names;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Namespace, ResourceQuota};
    use k8s_openapi::api::rbac::v1::RoleBinding;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kenv_common::crd::{NetworkPolicySpec, TenantResourceLimits};
    use kenv_common::{MANAGED_BY_LABEL, MESH_INJECTION_ENABLED, OWNER_LABEL, TENANT_CONTROLLER};
    use kube::api::ObjectMeta;
    use parking_lot::Mutex;

    // =========================================================================
    // In-memory cluster
    // =========================================================================

    type Key = (String, String);

    #[derive(Default)]
    struct ClusterState {
        tenants: BTreeMap<String, Tenant>,
        namespaces: BTreeMap<String, Namespace>,
        quotas: BTreeMap<Key, ResourceQuota>,
        policies: BTreeMap<Key, NetworkPolicy>,
        bindings: BTreeMap<Key, RoleBinding>,
        writes: usize,
        next_version: u64,
        failing_namespace: Option<String>,
        stalled_namespace: Option<String>,
    }

    impl ClusterState {
        fn stamp(&mut self, meta: &mut ObjectMeta) {
            self.next_version += 1;
            meta.resource_version = Some(self.next_version.to_string());
        }

        fn check_version(current: &ObjectMeta, incoming: &ObjectMeta) -> Result<(), Error> {
            if current.resource_version != incoming.resource_version {
                return Err(Error::conflict(
                    current.name.clone().unwrap_or_default(),
                    "resourceVersion mismatch",
                ));
            }
            Ok(())
        }
    }

    /// Minimal API server: honors resourceVersion on replace and label
    /// selection on list, and counts every write
    #[derive(Default)]
    struct FakeCluster {
        state: Mutex<ClusterState>,
    }

    impl FakeCluster {
        fn with_tenants(tenants: Vec<Tenant>) -> Arc<Self> {
            let cluster = Self::default();
            {
                let mut state = cluster.state.lock();
                for t in tenants {
                    state.tenants.insert(t.name_any(), t);
                }
            }
            Arc::new(cluster)
        }

        fn writes(&self) -> usize {
            self.state.lock().writes
        }

        fn set_spec(&self, tenant: &str, edit: impl FnOnce(&mut TenantSpec)) {
            let mut state = self.state.lock();
            if let Some(t) = state.tenants.get_mut(tenant) {
                edit(&mut t.spec);
                t.metadata.generation = Some(t.metadata.generation.unwrap_or(1) + 1);
            }
        }

        fn remove_tenant(&self, tenant: &str) {
            self.state.lock().tenants.remove(tenant);
        }

        fn count_policies(&self, name: &str) -> usize {
            self.state
                .lock()
                .policies
                .keys()
                .filter(|(_, n)| n == name)
                .count()
        }

        fn policy_names(&self, namespace: &str) -> Vec<String> {
            self.state
                .lock()
                .policies
                .keys()
                .filter(|(ns, _)| ns == namespace)
                .map(|(_, n)| n.clone())
                .collect()
        }

        fn namespace_labels(&self, namespace: &str) -> BTreeMap<String, String> {
            self.state
                .lock()
                .namespaces
                .get(namespace)
                .and_then(|n| n.metadata.labels.clone())
                .unwrap_or_default()
        }

        fn binding(&self, namespace: &str) -> Option<RoleBinding> {
            self.state
                .lock()
                .bindings
                .get(&(namespace.to_string(), OWNER_BINDING_NAME.to_string()))
                .cloned()
        }

        fn status(&self, tenant: &str) -> Option<TenantStatus> {
            self.state
                .lock()
                .tenants
                .get(tenant)
                .and_then(|t| t.status.clone())
        }

        fn guard(&self, namespace: &str) -> Result<(), Error> {
            if self.state.lock().failing_namespace.as_deref() == Some(namespace) {
                return Err(Error::execution("api server", "connection reset"));
            }
            Ok(())
        }

        async fn stall(&self, namespace: &str) {
            let stalled = self.state.lock().stalled_namespace.as_deref() == Some(namespace);
            if stalled {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
    }

    fn key(namespace: &str, meta: &ObjectMeta) -> Key {
        (namespace.to_string(), meta.name.clone().unwrap_or_default())
    }

    #[async_trait]
    impl TenantKubeClient for FakeCluster {
        async fn list_tenants(&self) -> Result<Vec<Tenant>, Error> {
            Ok(self.state.lock().tenants.values().cloned().collect())
        }

        async fn patch_tenant_status(&self, name: &str, status: &TenantStatus) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            let tenant = state
                .tenants
                .get_mut(name)
                .ok_or_else(|| Error::not_found("Tenant", name))?;
            tenant.status = Some(status.clone());
            Ok(())
        }

        async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
            self.stall(name).await;
            self.guard(name)?;
            Ok(self.state.lock().namespaces.get(name).cloned())
        }

        async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            let mut ns = namespace.clone();
            state.stamp(&mut ns.metadata);
            state.namespaces.insert(ns.name_any(), ns);
            Ok(())
        }

        async fn patch_namespace_labels(
            &self,
            name: &str,
            labels: &BTreeMap<String, Option<String>>,
        ) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            let ns = state
                .namespaces
                .get_mut(name)
                .ok_or_else(|| Error::not_found("Namespace", name))?;
            let current = ns.metadata.labels.get_or_insert_with(BTreeMap::new);
            for (k, v) in labels {
                match v {
                    Some(v) => {
                        current.insert(k.clone(), v.clone());
                    }
                    None => {
                        current.remove(k);
                    }
                }
            }
            Ok(())
        }

        async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            state.namespaces.remove(name);
            state.quotas.retain(|(ns, _), _| ns != name);
            state.policies.retain(|(ns, _), _| ns != name);
            state.bindings.retain(|(ns, _), _| ns != name);
            Ok(())
        }

        async fn list_managed_namespaces(&self) -> Result<Vec<Namespace>, Error> {
            Ok(self
                .state
                .lock()
                .namespaces
                .values()
                .filter(|n| {
                    n.labels().get(MANAGED_BY_LABEL).map(String::as_str) == Some(TENANT_CONTROLLER)
                })
                .cloned()
                .collect())
        }

        async fn get_quota(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<ResourceQuota>, Error> {
            self.guard(namespace)?;
            Ok(self
                .state
                .lock()
                .quotas
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn create_quota(&self, namespace: &str, quota: &ResourceQuota) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            let mut q = quota.clone();
            state.stamp(&mut q.metadata);
            state.quotas.insert(key(namespace, &q.metadata), q);
            Ok(())
        }

        async fn replace_quota(&self, namespace: &str, quota: &ResourceQuota) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            let k = key(namespace, &quota.metadata);
            let current = state
                .quotas
                .get(&k)
                .ok_or_else(|| Error::not_found("ResourceQuota", &k.1))?;
            ClusterState::check_version(&current.metadata, &quota.metadata)?;
            let mut q = quota.clone();
            state.stamp(&mut q.metadata);
            state.quotas.insert(k, q);
            Ok(())
        }

        async fn list_network_policies(
            &self,
            namespace: &str,
            tenant: &str,
        ) -> Result<Vec<NetworkPolicy>, Error> {
            let managed = managed_labels(tenant);
            Ok(self
                .state
                .lock()
                .policies
                .iter()
                .filter(|((ns, _), p)| ns == namespace && has_labels(p.metadata.labels.as_ref(), &managed))
                .map(|(_, p)| p.clone())
                .collect())
        }

        async fn create_network_policy(
            &self,
            namespace: &str,
            policy: &NetworkPolicy,
        ) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            let mut p = policy.clone();
            state.stamp(&mut p.metadata);
            state.policies.insert(key(namespace, &p.metadata), p);
            Ok(())
        }

        async fn replace_network_policy(
            &self,
            namespace: &str,
            policy: &NetworkPolicy,
        ) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            let k = key(namespace, &policy.metadata);
            let current = state
                .policies
                .get(&k)
                .ok_or_else(|| Error::not_found("NetworkPolicy", &k.1))?;
            ClusterState::check_version(&current.metadata, &policy.metadata)?;
            let mut p = policy.clone();
            state.stamp(&mut p.metadata);
            state.policies.insert(k, p);
            Ok(())
        }

        async fn delete_network_policy(&self, namespace: &str, name: &str) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            state
                .policies
                .remove(&(namespace.to_string(), name.to_string()));
            Ok(())
        }

        async fn get_role_binding(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<RoleBinding>, Error> {
            Ok(self
                .state
                .lock()
                .bindings
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn create_role_binding(
            &self,
            namespace: &str,
            binding: &RoleBinding,
        ) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            let k = key(namespace, &binding.metadata);
            if state.bindings.contains_key(&k) {
                return Err(Error::conflict(&k.1, "already exists"));
            }
            let mut b = binding.clone();
            state.stamp(&mut b.metadata);
            state.bindings.insert(k, b);
            Ok(())
        }

        async fn replace_role_binding(
            &self,
            namespace: &str,
            binding: &RoleBinding,
        ) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            let k = key(namespace, &binding.metadata);
            let current = state
                .bindings
                .get(&k)
                .ok_or_else(|| Error::not_found("RoleBinding", &k.1))?;
            ClusterState::check_version(&current.metadata, &binding.metadata)?;
            if current.role_ref != binding.role_ref {
                return Err(Error::validation("roleRef is immutable"));
            }
            let mut b = binding.clone();
            state.stamp(&mut b.metadata);
            state.bindings.insert(k, b);
            Ok(())
        }

        async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error> {
            let mut state = self.state.lock();
            state.writes += 1;
            state
                .bindings
                .remove(&(namespace.to_string(), name.to_string()));
            Ok(())
        }
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn team_alpha() -> Tenant {
        let mut tenant = Tenant::new(
            "team-alpha",
            TenantSpec {
                owner_id: "alice@example.com".to_string(),
                namespaces: vec!["dev".into(), "staging".into(), "prod".into()],
                resource_limits: TenantResourceLimits {
                    cpu: "4".into(),
                    memory: "8Gi".into(),
                    storage: "50Gi".into(),
                    max_pods: 50,
                    max_services: 10,
                    max_endpoints: 10,
                },
                network_policy: NetworkPolicySpec {
                    default_deny_ingress: true,
                    allow_intra_namespace: true,
                    allow_ingress_from_cidr: vec!["10.0.0.0/8".into()],
                    ..Default::default()
                },
                service_mesh_enabled: true,
            },
        );
        tenant.metadata.generation = Some(1);
        tenant
    }

    fn reconciler(cluster: Arc<FakeCluster>) -> TenantReconciler {
        TenantReconciler::new(cluster, ReconcilerConfig::default())
    }

    // =========================================================================
    // Stories
    // =========================================================================

    #[tokio::test]
    async fn story_team_alpha_converges_in_one_pass() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        let report = reconciler(cluster.clone()).tick().await.unwrap();

        assert_eq!(report.tenants, 1);
        assert_eq!(report.namespaces_ready, 3);
        assert_eq!(report.namespaces_failed, 0);

        let state = cluster.state.lock();
        assert_eq!(state.namespaces.len(), 3);
        assert_eq!(state.quotas.len(), 3);
        assert_eq!(state.bindings.len(), 3);
        let deny = state
            .policies
            .keys()
            .filter(|(_, n)| n == policy_names::DEFAULT_DENY_INGRESS)
            .count();
        assert_eq!(deny, 3);

        let dev = &state.namespaces["dev"];
        let labels = dev.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[TENANT_LABEL], "team-alpha");
        assert_eq!(labels[OWNER_LABEL], "alice-example.com");
        assert_eq!(labels[MESH_INJECTION_LABEL], MESH_INJECTION_ENABLED);

        let quota = &state.quotas[&("prod".to_string(), QUOTA_NAME.to_string())];
        let hard = quota.spec.as_ref().unwrap().hard.as_ref().unwrap();
        assert_eq!(hard["memory"], Quantity("8Gi".into()));

        let status = state.tenants["team-alpha"].status.clone().unwrap();
        assert_eq!(status.phase, TenantPhase::Ready);
        assert_eq!(status.ready_namespaces, 3);
        assert_eq!(status.observed_generation, Some(1));
    }

    #[tokio::test]
    async fn story_second_pass_over_unchanged_tenant_writes_nothing() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        let reconciler = reconciler(cluster.clone());

        reconciler.tick().await.unwrap();
        let after_first = cluster.writes();
        assert!(after_first > 0);

        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.changes, 0);
        assert_eq!(cluster.writes(), after_first);
    }

    #[tokio::test]
    async fn story_removed_cidr_policy_is_pruned() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        let reconciler = reconciler(cluster.clone());
        reconciler.tick().await.unwrap();
        assert_eq!(cluster.count_policies("allow-ingress-cidr-0"), 3);

        cluster.set_spec("team-alpha", |spec| {
            spec.network_policy.allow_ingress_from_cidr.clear();
        });
        reconciler.tick().await.unwrap();

        assert_eq!(cluster.count_policies("allow-ingress-cidr-0"), 0);
        assert_eq!(
            cluster.policy_names("dev"),
            vec!["allow-intra-namespace", "default-deny-ingress"]
        );
    }

    #[tokio::test]
    async fn story_changed_cidr_replaces_policy() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        let reconciler = reconciler(cluster.clone());
        reconciler.tick().await.unwrap();

        cluster.set_spec("team-alpha", |spec| {
            spec.network_policy.allow_ingress_from_cidr = vec!["172.16.0.0/12".into()];
        });
        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.changes, 3);

        let state = cluster.state.lock();
        let policy = &state.policies[&("dev".to_string(), "allow-ingress-cidr-0".to_string())];
        let json = serde_json::to_value(policy).unwrap();
        assert_eq!(json["spec"]["ingress"][0]["from"][0]["ipBlock"]["cidr"], "172.16.0.0/12");
    }

    #[tokio::test]
    async fn story_owner_change_updates_binding() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        let reconciler = reconciler(cluster.clone());
        reconciler.tick().await.unwrap();

        cluster.set_spec("team-alpha", |spec| spec.owner_id = "bob@example.com".into());
        reconciler.tick().await.unwrap();

        let binding = cluster.binding("staging").unwrap();
        assert_eq!(binding.subjects.unwrap()[0].name, "bob@example.com");
        assert_eq!(cluster.namespace_labels("staging")[OWNER_LABEL], "bob-example.com");
    }

    #[tokio::test]
    async fn story_drifted_role_ref_is_recreated() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        let reconciler = reconciler(cluster.clone());
        reconciler.tick().await.unwrap();

        {
            let mut state = cluster.state.lock();
            let binding = state
                .bindings
                .get_mut(&("dev".to_string(), OWNER_BINDING_NAME.to_string()))
                .unwrap();
            binding.role_ref.name = "view".into();
        }
        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.changes, 2);
        assert_eq!(cluster.binding("dev").unwrap().role_ref.name, "admin");
    }

    #[tokio::test]
    async fn story_drifted_quota_is_restored() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        let reconciler = reconciler(cluster.clone());
        reconciler.tick().await.unwrap();

        // Hand edit that keeps the hash annotation intact
        {
            let mut state = cluster.state.lock();
            let quota = state
                .quotas
                .get_mut(&("dev".to_string(), QUOTA_NAME.to_string()))
                .unwrap();
            let hard = quota.spec.as_mut().unwrap().hard.as_mut().unwrap();
            hard.insert("cpu".to_string(), Quantity("100".into()));
        }
        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.changes, 1);

        let state = cluster.state.lock();
        let quota = &state.quotas[&("dev".to_string(), QUOTA_NAME.to_string())];
        let hard = quota.spec.as_ref().unwrap().hard.as_ref().unwrap();
        assert_eq!(hard["cpu"], Quantity("4".into()));
    }

    #[tokio::test]
    async fn story_drifted_policy_is_restored() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        let reconciler = reconciler(cluster.clone());
        reconciler.tick().await.unwrap();

        let key = ("dev".to_string(), "allow-ingress-cidr-0".to_string());
        cluster.state.lock().policies.get_mut(&key).unwrap().spec = None;

        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.changes, 1);

        let state = cluster.state.lock();
        let json = serde_json::to_value(&state.policies[&key]).unwrap();
        assert_eq!(json["spec"]["ingress"][0]["from"][0]["ipBlock"]["cidr"], "10.0.0.0/8");
    }

    #[tokio::test]
    async fn story_existing_namespace_is_adopted_and_mesh_label_removed() {
        let mut tenant = team_alpha();
        tenant.spec.namespaces = vec!["legacy".into()];
        tenant.spec.service_mesh_enabled = false;
        let cluster = FakeCluster::with_tenants(vec![tenant]);
        {
            let mut state = cluster.state.lock();
            state.namespaces.insert(
                "legacy".into(),
                Namespace {
                    metadata: ObjectMeta {
                        name: Some("legacy".into()),
                        labels: Some(BTreeMap::from([
                            ("team".to_string(), "core".to_string()),
                            (MESH_INJECTION_LABEL.to_string(), MESH_INJECTION_ENABLED.to_string()),
                        ])),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            );
        }

        reconciler(cluster.clone()).tick().await.unwrap();

        let labels = cluster.namespace_labels("legacy");
        assert_eq!(labels["team"], "core");
        assert_eq!(labels[TENANT_LABEL], "team-alpha");
        assert!(!labels.contains_key(MESH_INJECTION_LABEL));
    }

    #[tokio::test]
    async fn story_failing_namespace_does_not_block_others() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        cluster.state.lock().failing_namespace = Some("staging".into());

        let report = reconciler(cluster.clone()).tick().await.unwrap();
        assert_eq!(report.namespaces_ready, 2);
        assert_eq!(report.namespaces_failed, 1);

        {
            let state = cluster.state.lock();
            assert!(state.namespaces.contains_key("dev"));
            assert!(state.namespaces.contains_key("prod"));
            assert!(!state.namespaces.contains_key("staging"));
        }

        let status = cluster.status("team-alpha").unwrap();
        assert_eq!(status.phase, TenantPhase::Degraded);
        assert_eq!(status.ready_namespaces, 2);
        assert!(status.message.unwrap().contains("staging"));
    }

    #[tokio::test]
    async fn story_stalled_call_times_out_and_pass_continues() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        cluster.state.lock().stalled_namespace = Some("dev".into());
        let reconciler = TenantReconciler::new(
            cluster.clone(),
            ReconcilerConfig {
                call_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let report = reconciler.tick().await.unwrap();
        assert_eq!(report.namespaces_failed, 1);
        assert_eq!(report.namespaces_ready, 2);
        let status = cluster.status("team-alpha").unwrap();
        assert!(status.message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn story_foreign_namespace_is_not_taken_over() {
        let mut other = team_alpha();
        other.metadata.name = Some("team-beta".into());
        other.spec.namespaces = vec!["dev".into()];
        let cluster = FakeCluster::with_tenants(vec![team_alpha(), other]);

        let report = reconciler(cluster.clone()).tick().await.unwrap();
        assert_eq!(report.namespaces_ready, 3);
        assert_eq!(report.namespaces_failed, 1);
        assert_eq!(cluster.namespace_labels("dev")[TENANT_LABEL], "team-alpha");
    }

    #[tokio::test]
    async fn story_namespaces_are_kept_unless_pruning_enabled() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        reconciler(cluster.clone()).tick().await.unwrap();

        cluster.set_spec("team-alpha", |spec| spec.namespaces.retain(|n| n != "prod"));
        reconciler(cluster.clone()).tick().await.unwrap();
        assert!(cluster.state.lock().namespaces.contains_key("prod"));

        let pruning = TenantReconciler::new(
            cluster.clone(),
            ReconcilerConfig {
                prune_namespaces: true,
                ..Default::default()
            },
        );
        let report = pruning.tick().await.unwrap();
        assert_eq!(report.namespaces_pruned, 1);
        assert!(!cluster.state.lock().namespaces.contains_key("prod"));

        // Namespaces of a deleted tenant are orphans too
        cluster.remove_tenant("team-alpha");
        let report = pruning.tick().await.unwrap();
        assert_eq!(report.namespaces_pruned, 2);
        assert!(cluster.state.lock().namespaces.is_empty());
    }

    #[tokio::test]
    async fn story_invalid_spec_marks_tenant_degraded() {
        let mut tenant = team_alpha();
        tenant.spec.namespaces = vec!["Not_A_Namespace".into()];
        let cluster = FakeCluster::with_tenants(vec![tenant]);

        let report = reconciler(cluster.clone()).tick().await.unwrap();
        assert_eq!(report.namespaces_failed, 1);
        assert!(cluster.state.lock().namespaces.is_empty());
        assert_eq!(cluster.status("team-alpha").unwrap().phase, TenantPhase::Degraded);
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_patched() {
        let mut tenant = team_alpha();
        tenant.spec.namespaces.clear();
        tenant.status = Some(TenantStatus {
            phase: TenantPhase::Ready,
            message: Some("0 namespaces converged".into()),
            observed_generation: Some(1),
            ready_namespaces: 0,
            last_reconciled: Some("2024-01-01T00:00:00Z".into()),
        });

        let mut client = MockTenantKubeClient::new();
        client.expect_patch_tenant_status().never();
        let reconciler = TenantReconciler::new(Arc::new(client), ReconcilerConfig::default());

        let outcome = reconciler.reconcile_tenant(&tenant).await;
        assert_eq!(outcome, TenantOutcome::default());
    }

    #[tokio::test]
    async fn test_list_failure_aborts_pass() {
        let mut client = MockTenantKubeClient::new();
        client
            .expect_list_tenants()
            .returning(|| Err(Error::execution("list tenants", "forbidden")));
        let reconciler = TenantReconciler::new(Arc::new(client), ReconcilerConfig::default());
        assert!(reconciler.tick().await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let cluster = FakeCluster::with_tenants(vec![team_alpha()]);
        let reconciler = Arc::new(TenantReconciler::new(
            cluster.clone(),
            ReconcilerConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let reconciler = reconciler.clone();
            let cancel = cancel.clone();
            async move { reconciler.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run should stop after cancel")
            .unwrap();

        assert_eq!(cluster.state.lock().namespaces.len(), 3);
    }
}
