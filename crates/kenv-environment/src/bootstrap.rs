//! Cluster bootstrap: hands a freshly provisioned cluster to the tenant
//! reconciler by declaring a Tenant in it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
#[cfg(test)]
use mockall::automock;
use tracing::{info, instrument};

use kenv_common::crd::{NetworkPolicySpec, Tenant, TenantResourceLimits, TenantSpec};
use kenv_common::kube_utils::{client_from_kubeconfig_yaml, ensure_tenant_crd, sanitize_label_value};
use kenv_common::{Error, CLUSTER_NAME_LABEL, ENVIRONMENT_LABEL};

use crate::model::{Credential, Environment};

const FIELD_MANAGER: &str = "kenv-environment-manager";

/// Pods allowed per node when sizing the tenant quota
const PODS_PER_NODE: u32 = 110;

/// Services and endpoints allowed per namespace when sizing the tenant quota
const SERVICES_PER_NAMESPACE: u32 = 10;

/// Post-provisioning step run before an environment becomes ACTIVE
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterBootstrap: Send + Sync {
    /// Prepare the cluster reachable with `credential` for `environment`
    async fn bootstrap(&self, environment: &Environment, credential: &Credential)
        -> Result<(), Error>;
}

/// Installs the Tenant CRD and server-side applies the environment's Tenant
#[derive(Clone, Copy, Debug, Default)]
pub struct TenantBootstrap;

#[async_trait]
impl ClusterBootstrap for TenantBootstrap {
    #[instrument(skip_all, fields(env_id = %environment.id, cluster = %environment.cluster_name))]
    async fn bootstrap(
        &self,
        environment: &Environment,
        credential: &Credential,
    ) -> Result<(), Error> {
        let client = client_from_kubeconfig_yaml(credential.expose()).await?;
        ensure_tenant_crd(&client, FIELD_MANAGER).await?;

        let tenant = tenant_for(environment);
        let name = tenant.metadata.name.clone().unwrap_or_default();
        let api: Api<Tenant> = Api::all(client);
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&tenant),
        )
        .await?;

        info!(tenant = %name, "tenant declared");
        Ok(())
    }
}

/// Tenant declared for an environment.
///
/// One namespace named after the environment, quota derived from the
/// environment's limits, network policy copied over (default deny ingress
/// with intra-namespace traffic when none was given).
pub fn tenant_for(env: &Environment) -> Tenant {
    let limits = &env.resource_limits;
    let namespace = sanitize_label_value(&env.name.to_lowercase()).replace(['.', '_'], "-");
    let namespace = if namespace.is_empty() {
        env.cluster_name.clone()
    } else {
        namespace
    };

    let network_policy = env.network_policy.clone().unwrap_or(NetworkPolicySpec {
        default_deny_ingress: true,
        allow_intra_namespace: true,
        ..Default::default()
    });

    let spec = TenantSpec {
        owner_id: env.owner_id.clone(),
        namespaces: vec![namespace],
        resource_limits: TenantResourceLimits {
            cpu: limits.cpu.clone(),
            memory: limits.memory.clone(),
            storage: limits.storage.clone(),
            max_pods: limits.max_node_count.max(1) * PODS_PER_NODE,
            max_services: limits.max_namespaces.max(1) * SERVICES_PER_NAMESPACE,
            max_endpoints: limits.max_namespaces.max(1) * SERVICES_PER_NAMESPACE,
        },
        network_policy,
        service_mesh_enabled: env.service_mesh.as_ref().is_some_and(|m| m.enabled),
    };

    let mut tenant = Tenant::new(&env.cluster_name, spec);
    tenant.metadata = ObjectMeta {
        name: Some(env.cluster_name.clone()),
        labels: Some(BTreeMap::from([
            (ENVIRONMENT_LABEL.to_string(), env.id.clone()),
            (CLUSTER_NAME_LABEL.to_string(), env.cluster_name.clone()),
        ])),
        ..Default::default()
    };
    tenant
}
