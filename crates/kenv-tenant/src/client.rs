//! Cluster access for the tenant reconciler

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ResourceQuota};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::json;

use kenv_common::crd::{Tenant, TenantStatus};
use kenv_common::{Error, MANAGED_BY_LABEL, TENANT_CONTROLLER, TENANT_LABEL};

const FIELD_MANAGER: &str = "kenv-tenant-controller";

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Kubernetes operations the reconciler performs.
///
/// `get_*` return `Ok(None)` on 404. `replace_*` expect the object to carry
/// the observed `resourceVersion`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantKubeClient: Send + Sync {
    /// Every Tenant in the cluster
    async fn list_tenants(&self) -> Result<Vec<Tenant>, Error>;

    /// Overwrite a Tenant's status subresource
    async fn patch_tenant_status(&self, name: &str, status: &TenantStatus) -> Result<(), Error>;

    /// Get a namespace
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Create a namespace
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error>;

    /// Merge-patch namespace labels; a `None` value removes the label
    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<(), Error>;

    /// Delete a namespace
    async fn delete_namespace(&self, name: &str) -> Result<(), Error>;

    /// Namespaces labeled as managed by this controller, for any tenant
    async fn list_managed_namespaces(&self) -> Result<Vec<Namespace>, Error>;

    /// Get a resource quota
    async fn get_quota(&self, namespace: &str, name: &str) -> Result<Option<ResourceQuota>, Error>;

    /// Create a resource quota
    async fn create_quota(&self, namespace: &str, quota: &ResourceQuota) -> Result<(), Error>;

    /// Replace a resource quota
    async fn replace_quota(&self, namespace: &str, quota: &ResourceQuota) -> Result<(), Error>;

    /// Network policies in `namespace` managed for `tenant`
    async fn list_network_policies(
        &self,
        namespace: &str,
        tenant: &str,
    ) -> Result<Vec<NetworkPolicy>, Error>;

    /// Create a network policy
    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), Error>;

    /// Replace a network policy
    async fn replace_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), Error>;

    /// Delete a network policy
    async fn delete_network_policy(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get a role binding
    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RoleBinding>, Error>;

    /// Create a role binding
    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding)
        -> Result<(), Error>;

    /// Replace a role binding
    async fn replace_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error>;

    /// Delete a role binding
    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct TenantKubeClientImpl {
    client: Client,
}

impl TenantKubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={TENANT_CONTROLLER}")
}

fn name_of(meta: &kube::api::ObjectMeta, kind: &str) -> Result<String, Error> {
    meta.name
        .clone()
        .ok_or_else(|| Error::validation(format!("{kind} has no name")))
}

/// 404 on get becomes `None`
fn optional<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 404 on delete means already gone
fn deleted<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl TenantKubeClient for TenantKubeClientImpl {
    async fn list_tenants(&self) -> Result<Vec<Tenant>, Error> {
        let api: Api<Tenant> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_tenant_status(&self, name: &str, status: &TenantStatus) -> Result<(), Error> {
        let api: Api<Tenant> = Api::all(self.client.clone());
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        optional(api.get(name).await)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.create(&PostParams::default(), namespace).await?;
        Ok(())
    }

    async fn patch_namespace_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "labels": labels } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        deleted(api.delete(name, &DeleteParams::default()).await)
    }

    async fn list_managed_namespaces(&self) -> Result<Vec<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&managed_selector());
        Ok(api.list(&params).await?.items)
    }

    async fn get_quota(&self, namespace: &str, name: &str) -> Result<Option<ResourceQuota>, Error> {
        optional(self.namespaced::<ResourceQuota>(namespace).get(name).await)
    }

    async fn create_quota(&self, namespace: &str, quota: &ResourceQuota) -> Result<(), Error> {
        self.namespaced::<ResourceQuota>(namespace)
            .create(&PostParams::default(), quota)
            .await?;
        Ok(())
    }

    async fn replace_quota(&self, namespace: &str, quota: &ResourceQuota) -> Result<(), Error> {
        let name = name_of(&quota.metadata, "ResourceQuota")?;
        self.namespaced::<ResourceQuota>(namespace)
            .replace(&name, &PostParams::default(), quota)
            .await?;
        Ok(())
    }

    async fn list_network_policies(
        &self,
        namespace: &str,
        tenant: &str,
    ) -> Result<Vec<NetworkPolicy>, Error> {
        let selector = format!("{},{TENANT_LABEL}={tenant}", managed_selector());
        let params = ListParams::default().labels(&selector);
        Ok(self
            .namespaced::<NetworkPolicy>(namespace)
            .list(&params)
            .await?
            .items)
    }

    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), Error> {
        self.namespaced::<NetworkPolicy>(namespace)
            .create(&PostParams::default(), policy)
            .await?;
        Ok(())
    }

    async fn replace_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), Error> {
        let name = name_of(&policy.metadata, "NetworkPolicy")?;
        self.namespaced::<NetworkPolicy>(namespace)
            .replace(&name, &PostParams::default(), policy)
            .await?;
        Ok(())
    }

    async fn delete_network_policy(&self, namespace: &str, name: &str) -> Result<(), Error> {
        deleted(
            self.namespaced::<NetworkPolicy>(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RoleBinding>, Error> {
        optional(self.namespaced::<RoleBinding>(namespace).get(name).await)
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error> {
        self.namespaced::<RoleBinding>(namespace)
            .create(&PostParams::default(), binding)
            .await?;
        Ok(())
    }

    async fn replace_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error> {
        let name = name_of(&binding.metadata, "RoleBinding")?;
        self.namespaced::<RoleBinding>(namespace)
            .replace(&name, &PostParams::default(), binding)
            .await?;
        Ok(())
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<(), Error> {
        deleted(
            self.namespaced::<RoleBinding>(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }
}
