//! Tenant CRD: a group of namespaces under shared quota, network, RBAC and
//! mesh policy.
//!
//! A Tenant is pure declared state. The reconciler makes the cluster match
//! `spec` on every pass; `status` only reports what the last pass observed.

use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::NetworkPolicySpec;
use crate::kube_utils::is_dns_label;
use crate::Error;

/// Tenant declares namespaces that share one owner and one policy.
///
/// Example:
/// ```yaml
/// apiVersion: kenv.dev/v1alpha1
/// kind: Tenant
/// metadata:
///   name: team-alpha
/// spec:
///   ownerId: alice@example.com
///   namespaces: [dev, staging, prod]
///   resourceLimits:
///     cpu: "4"
///     memory: 8Gi
///     storage: 50Gi
///     maxPods: 50
///     maxServices: 10
///     maxEndpoints: 10
///   networkPolicy:
///     defaultDenyIngress: true
///     allowIntraNamespace: true
///   serviceMeshEnabled: true
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kenv.dev",
    version = "v1alpha1",
    kind = "Tenant",
    status = "TenantStatus",
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.ownerId"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyNamespaces"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    /// User granted admin in every tenant namespace
    pub owner_id: String,

    /// Namespaces owned by this tenant, processed in this order
    pub namespaces: Vec<String>,

    /// Hard limits applied to each namespace's quota
    pub resource_limits: TenantResourceLimits,

    /// Network isolation applied to each namespace
    #[serde(default)]
    pub network_policy: NetworkPolicySpec,

    /// Label namespaces for sidecar injection
    #[serde(default)]
    pub service_mesh_enabled: bool,
}

/// Per-namespace quota. Quantities are passed to the cluster verbatim.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TenantResourceLimits {
    /// CPU quantity (e.g., "4", "500m")
    pub cpu: String,
    /// Memory quantity (e.g., "8Gi")
    pub memory: String,
    /// Ephemeral storage quantity (e.g., "50Gi")
    pub storage: String,
    /// Maximum pod count
    pub max_pods: u32,
    /// Maximum service count
    pub max_services: u32,
    /// Maximum endpoints object count
    pub max_endpoints: u32,
}

impl TenantSpec {
    /// Validate the declared spec before anything is applied
    pub fn validate(&self, tenant: &str) -> Result<(), Error> {
        if self.owner_id.trim().is_empty() {
            return Err(Error::validation_for_field(
                tenant,
                "spec.ownerId",
                "owner is required",
            ));
        }

        let mut seen = BTreeSet::new();
        for ns in &self.namespaces {
            if !is_dns_label(ns) {
                return Err(Error::validation_for_field(
                    tenant,
                    "spec.namespaces",
                    format!("'{ns}' is not a valid namespace name"),
                ));
            }
            if !seen.insert(ns.as_str()) {
                return Err(Error::validation_for_field(
                    tenant,
                    "spec.namespaces",
                    format!("namespace '{ns}' is declared twice"),
                ));
            }
        }

        let limits = &self.resource_limits;
        for (field, value) in [
            ("spec.resourceLimits.cpu", &limits.cpu),
            ("spec.resourceLimits.memory", &limits.memory),
            ("spec.resourceLimits.storage", &limits.storage),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation_for_field(tenant, field, "required"));
            }
        }

        self.network_policy.validate(tenant)
    }
}

/// Outcome of the last reconcile pass for a Tenant
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TenantPhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// Every namespace matched its declared state
    Ready,
    /// At least one namespace failed to converge
    Degraded,
}

impl std::fmt::Display for TenantPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
            Self::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Status written back by the reconciler. Never read as reconcile input.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TenantStatus {
    /// Outcome of the last pass
    #[serde(default)]
    pub phase: TenantPhase,

    /// Human-readable summary of the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Spec generation the last pass evaluated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Namespaces that converged on the last pass
    #[serde(default)]
    pub ready_namespaces: u32,

    /// RFC 3339 time of the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<String>,
}

impl TenantStatus {
    /// True when the two statuses differ in anything other than the timestamp
    pub fn differs_from(&self, other: &TenantStatus) -> bool {
        self.phase != other.phase
            || self.message != other.message
            || self.observed_generation != other.observed_generation
            || self.ready_namespaces != other.ready_namespaces
    }
}
