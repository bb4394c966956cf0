//! Desired cluster objects for one tenant namespace.
//!
//! Pure functions of the Tenant spec. Every object carries the managed
//! labels; quota and policies also carry a hash of the spec they were
//! written from. Drift is judged against the observed spec itself, so an
//! out-of-band edit that leaves the annotation in place is still corrected.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, ResourceQuota, ResourceQuotaSpec};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use serde::Serialize;
use serde_json::{json, Value};

use kenv_common::crd::TenantSpec;
use kenv_common::kube_utils::{deterministic_hash, sanitize_label_value};
use kenv_common::{
    Error, DESIRED_HASH_ANNOTATION, MANAGED_BY_LABEL, MESH_INJECTION_ENABLED,
    MESH_INJECTION_LABEL, OWNER_LABEL, TENANT_CONTROLLER, TENANT_LABEL,
};

/// Name of the per-namespace quota
pub const QUOTA_NAME: &str = "tenant-quota";

/// Name of the owner's role binding
pub const OWNER_BINDING_NAME: &str = "tenant-owner";

/// ClusterRole granted to the owner
pub const OWNER_CLUSTER_ROLE: &str = "admin";

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Policy names
pub mod policy_names {
    /// Deny all ingress
    pub const DEFAULT_DENY_INGRESS: &str = "default-deny-ingress";
    /// Deny all egress
    pub const DEFAULT_DENY_EGRESS: &str = "default-deny-egress";
    /// Allow ingress from the same namespace
    pub const ALLOW_INTRA_NAMESPACE: &str = "allow-intra-namespace";
    /// Allow ingress from the tenant's other namespaces
    pub const ALLOW_CROSS_NAMESPACE: &str = "allow-cross-namespace";

    /// Ingress allowance for the `i`th declared CIDR
    pub fn ingress_cidr(i: usize) -> String {
        format!("allow-ingress-cidr-{i}")
    }

    /// Egress allowance for the `i`th declared CIDR
    pub fn egress_cidr(i: usize) -> String {
        format!("allow-egress-cidr-{i}")
    }
}

// =============================================================================
// Labels
// =============================================================================

/// Labels identifying objects this controller manages for `tenant`
pub fn managed_labels(tenant: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), TENANT_CONTROLLER.to_string()),
        (TENANT_LABEL.to_string(), tenant.to_string()),
    ])
}

/// True when `labels` contain every entry of `expected`
pub fn has_labels(
    labels: Option<&BTreeMap<String, String>>,
    expected: &BTreeMap<String, String>,
) -> bool {
    expected
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// Labels a tenant namespace must carry
pub fn namespace_labels(tenant: &str, spec: &TenantSpec) -> BTreeMap<String, String> {
    let mut labels = managed_labels(tenant);
    labels.insert(OWNER_LABEL.to_string(), sanitize_label_value(&spec.owner_id));
    if spec.service_mesh_enabled {
        labels.insert(
            MESH_INJECTION_LABEL.to_string(),
            MESH_INJECTION_ENABLED.to_string(),
        );
    }
    labels
}

/// The hash annotation value recorded on `obj`, if any
pub fn recorded_hash(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(DESIRED_HASH_ANNOTATION))
        .map(String::as_str)
}

/// True when the observed quota enforces exactly the desired hard limits
pub fn quota_matches(observed: &ResourceQuota, desired: &ResourceQuota) -> bool {
    fn hard(quota: &ResourceQuota) -> Option<&BTreeMap<String, Quantity>> {
        quota.spec.as_ref().and_then(|s| s.hard.as_ref())
    }
    hard(observed) == hard(desired)
}

/// True when the observed policy selects and allows exactly what is desired
pub fn policy_matches(observed: &NetworkPolicy, desired: &NetworkPolicy) -> bool {
    observed.spec == desired.spec
}

fn hash_of<T: Serialize>(value: &T) -> Result<String, Error> {
    let canonical = serde_json::to_string(value)?;
    Ok(deterministic_hash(&canonical))
}

fn managed_meta(name: &str, namespace: &str, tenant: &str, hash: Option<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(managed_labels(tenant)),
        annotations: hash.map(|h| BTreeMap::from([(DESIRED_HASH_ANNOTATION.to_string(), h)])),
        ..Default::default()
    }
}

// =============================================================================
// Objects
// =============================================================================

/// Namespace as created when it does not exist
pub fn desired_namespace(name: &str, tenant: &str, spec: &TenantSpec) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(namespace_labels(tenant, spec)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Quota whose hard limits equal the tenant limits verbatim
pub fn desired_quota(namespace: &str, tenant: &str, spec: &TenantSpec) -> Result<ResourceQuota, Error> {
    let limits = &spec.resource_limits;
    let hard: BTreeMap<String, Quantity> = [
        ("cpu", limits.cpu.clone()),
        ("memory", limits.memory.clone()),
        ("requests.cpu", limits.cpu.clone()),
        ("requests.memory", limits.memory.clone()),
        ("limits.cpu", limits.cpu.clone()),
        ("limits.memory", limits.memory.clone()),
        ("ephemeral-storage", limits.storage.clone()),
        ("pods", limits.max_pods.to_string()),
        ("services", limits.max_services.to_string()),
        ("count/endpoints", limits.max_endpoints.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), Quantity(v)))
    .collect();

    let hash = hash_of(&hard)?;
    Ok(ResourceQuota {
        metadata: managed_meta(QUOTA_NAME, namespace, tenant, Some(hash)),
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Every network policy the tenant declares for `namespace`, in a stable order
pub fn desired_policies(
    namespace: &str,
    tenant: &str,
    spec: &TenantSpec,
) -> Result<Vec<NetworkPolicy>, Error> {
    let np = &spec.network_policy;
    let mut specs: Vec<(String, Value)> = Vec::new();

    if np.default_deny_ingress {
        specs.push((
            policy_names::DEFAULT_DENY_INGRESS.to_string(),
            json!({ "podSelector": {}, "policyTypes": ["Ingress"] }),
        ));
    }
    if np.default_deny_egress {
        specs.push((
            policy_names::DEFAULT_DENY_EGRESS.to_string(),
            json!({ "podSelector": {}, "policyTypes": ["Egress"] }),
        ));
    }
    if np.allow_intra_namespace {
        specs.push((
            policy_names::ALLOW_INTRA_NAMESPACE.to_string(),
            json!({
                "podSelector": {},
                "policyTypes": ["Ingress"],
                "ingress": [{ "from": [{ "podSelector": {} }] }]
            }),
        ));
    }
    if np.allow_cross_namespace {
        specs.push((
            policy_names::ALLOW_CROSS_NAMESPACE.to_string(),
            json!({
                "podSelector": {},
                "policyTypes": ["Ingress"],
                "ingress": [{ "from": [{
                    "namespaceSelector": { "matchLabels": { (TENANT_LABEL): tenant } }
                }] }]
            }),
        ));
    }
    for (i, cidr) in np.allow_ingress_from_cidr.iter().enumerate() {
        specs.push((
            policy_names::ingress_cidr(i),
            json!({
                "podSelector": {},
                "policyTypes": ["Ingress"],
                "ingress": [{ "from": [{ "ipBlock": { "cidr": cidr } }] }]
            }),
        ));
    }
    for (i, cidr) in np.allow_egress_to_cidr.iter().enumerate() {
        specs.push((
            policy_names::egress_cidr(i),
            json!({
                "podSelector": {},
                "policyTypes": ["Egress"],
                "egress": [{ "to": [{ "ipBlock": { "cidr": cidr } }] }]
            }),
        ));
    }

    specs
        .into_iter()
        .map(|(name, policy_spec)| {
            let hash = hash_of(&policy_spec)?;
            let meta = managed_meta(&name, namespace, tenant, Some(hash));
            let object = json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "NetworkPolicy",
                "metadata": meta,
                "spec": policy_spec,
            });
            serde_json::from_value(object).map_err(|e| {
                Error::serialization_for_kind("NetworkPolicy", format!("{name}: {e}"))
            })
        })
        .collect()
}

/// Role binding granting the owner admin in `namespace`
pub fn desired_role_binding(namespace: &str, tenant: &str, spec: &TenantSpec) -> RoleBinding {
    RoleBinding {
        metadata: managed_meta(OWNER_BINDING_NAME, namespace, tenant, None),
        role_ref: owner_role_ref(),
        subjects: Some(vec![Subject {
            api_group: Some(RBAC_API_GROUP.to_string()),
            kind: "User".to_string(),
            name: spec.owner_id.clone(),
            namespace: None,
        }]),
    }
}

fn owner_role_ref() -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name: OWNER_CLUSTER_ROLE.to_string(),
    }
}
