//! Environment record, lifecycle states and request/patch inputs

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use kenv_common::crd::NetworkPolicySpec;

/// Length of the id prefix used in a cluster name
const CLUSTER_NAME_ID_CHARS: usize = 8;

// =============================================================================
// Lifecycle state
// =============================================================================

/// Lifecycle state of an Environment
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentState {
    /// Record persisted, provisioning workflow queued
    #[default]
    Creating,
    /// Infrastructure is being created
    Provisioning,
    /// Infrastructure exists and the cluster is bootstrapped
    Active,
    /// An update workflow is applying changes
    Updating,
    /// The last workflow failed; an Update or Delete may follow
    Error,
    /// Teardown in progress
    Deleting,
    /// Teardown finished
    Deleted,
}

impl EnvironmentState {
    /// Whether a record in this state may move to `next`
    pub fn can_transition_to(self, next: EnvironmentState) -> bool {
        use EnvironmentState::*;
        matches!(
            (self, next),
            (Creating, Provisioning)
                | (Provisioning, Active)
                | (Active, Updating)
                | (Updating, Active)
                | (Active, Deleting)
                | (Error, Updating)
                | (Error, Deleting)
                | (Deleting, Deleted)
                | (Creating | Provisioning | Active | Updating | Deleting, Error)
        )
    }

    /// True once no further transition is possible
    pub fn is_terminal(self) -> bool {
        self == EnvironmentState::Deleted
    }
}

impl std::fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "CREATING"),
            Self::Provisioning => write!(f, "PROVISIONING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Updating => write!(f, "UPDATING"),
            Self::Error => write!(f, "ERROR"),
            Self::Deleting => write!(f, "DELETING"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

// =============================================================================
// Nested configuration
// =============================================================================

/// Size and count limits for an environment
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU quantity (e.g., "2")
    pub cpu: String,
    /// Memory quantity (e.g., "4Gi")
    pub memory: String,
    /// Storage quantity (e.g., "20Gi")
    pub storage: String,
    /// Upper bound for worker nodes
    pub max_node_count: u32,
    /// Upper bound for namespaces
    pub max_namespaces: u32,
    /// Upper bound for load balancers
    pub max_load_balancers: u32,
}

/// Service mesh mTLS enforcement
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MtlsMode {
    /// Only mTLS traffic accepted
    #[default]
    Strict,
    /// mTLS and plaintext accepted
    Permissive,
    /// mTLS off
    Disable,
}

/// Service mesh settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMeshConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtls_mode: Option<MtlsMode>,
    #[serde(default)]
    pub enable_tracing: bool,
    #[serde(default)]
    pub enable_metrics: bool,
    #[serde(default)]
    pub enable_circuit_breaker: bool,
    #[serde(default)]
    pub enable_outlier_detection: bool,
    #[serde(default)]
    pub enable_fault_injection: bool,
    #[serde(default)]
    pub enable_request_throttling: bool,
    #[serde(default, rename = "enableVirtualServiceRBAC")]
    pub enable_virtual_service_rbac: bool,
}

/// Monitoring stack settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    #[serde(default)]
    pub enable_prometheus: bool,
    #[serde(default)]
    pub enable_grafana: bool,
    #[serde(default)]
    pub enable_alert_manager: bool,
    /// One of 15s, 30s, 1m, 5m
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrape_interval: Option<String>,
    /// One of 1d, 7d, 14d, 30d
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_alert_threshold: Option<String>,
}

/// GitOps sync settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Repository URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    /// One of 1m, 5m, 10m, 15m, 30m, 1h
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_interval: Option<String>,
    #[serde(default)]
    pub automated_sync: bool,
    /// One of 1m, 5m, 10m
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_credential_id: Option<String>,
}

// =============================================================================
// Credential
// =============================================================================

/// Cluster-access kubeconfig. Debug output never shows the contents.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Wrap a kubeconfig
    pub fn new(kubeconfig: impl Into<String>) -> Self {
        Self(kubeconfig.into())
    }

    /// The kubeconfig YAML
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// True when no kubeconfig is held
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential(<redacted>)")
    }
}

// =============================================================================
// Environment record
// =============================================================================

/// One status transition, newest last in `Environment::history`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub status: EnvironmentState,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// The durable Environment record
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    /// Immutable UUID
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub template_id: String,
    #[serde(rename = "userId")]
    pub owner_id: String,
    pub resource_limits: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_mesh: Option<ServiceMeshConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringConfig>,
    #[serde(default, rename = "gitOps", skip_serializing_if = "Option::is_none")]
    pub gitops: Option<GitOpsConfig>,
    #[serde(default)]
    pub addons: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub status: EnvironmentState,
    #[serde(default)]
    pub status_message: String,
    /// `env-` plus the first 8 characters of the id; never changes
    pub cluster_name: String,
    #[serde(default, rename = "kubeConfig", skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Compare-and-swap token, bumped by the store on every write
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub history: Vec<StatusEntry>,
}

impl Environment {
    /// Cluster name for an environment id
    pub fn derive_cluster_name(id: &str) -> String {
        let prefix: String = id.chars().take(CLUSTER_NAME_ID_CHARS).collect();
        format!("env-{prefix}")
    }

    /// Build a fresh CREATING record from a request
    pub fn from_request(id: String, request: EnvironmentRequest, now: DateTime<Utc>) -> Self {
        let cluster_name = Self::derive_cluster_name(&id);
        let message = "Environment creation initiated".to_string();
        Self {
            id,
            name: request.name,
            description: request.description,
            template_id: request.template_id,
            owner_id: request.owner_id,
            resource_limits: request.resource_limits,
            network_policy: request.network_policy,
            service_mesh: request.service_mesh,
            monitoring: request.monitoring,
            gitops: request.gitops,
            addons: request.addons.into_iter().collect(),
            tags: request.tags,
            status: EnvironmentState::Creating,
            status_message: message.clone(),
            cluster_name,
            credential: None,
            console_url: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 0,
            history: vec![StatusEntry {
                status: EnvironmentState::Creating,
                message,
                at: now,
            }],
        }
    }

    /// True once Delete has been accepted
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Move to `status`, recording it in the bounded history
    pub fn set_status(
        &mut self,
        status: EnvironmentState,
        message: impl Into<String>,
        now: DateTime<Utc>,
        history_limit: usize,
    ) {
        let message = message.into();
        self.status = status;
        self.status_message = message.clone();
        self.updated_at = now;
        self.push_history(status, message, now, history_limit);
    }

    /// Append a history entry without changing status
    pub fn push_history(
        &mut self,
        status: EnvironmentState,
        message: String,
        at: DateTime<Utc>,
        history_limit: usize,
    ) {
        self.history.push(StatusEntry {
            status,
            message,
            at,
        });
        if self.history.len() > history_limit {
            let excess = self.history.len() - history_limit;
            self.history.drain(..excess);
        }
    }
}

// =============================================================================
// Inputs
// =============================================================================

/// Create input
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub template_id: String,
    #[serde(rename = "userId")]
    pub owner_id: String,
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub network_policy: Option<NetworkPolicySpec>,
    #[serde(default)]
    pub service_mesh: Option<ServiceMeshConfig>,
    #[serde(default)]
    pub monitoring: Option<MonitoringConfig>,
    #[serde(default, rename = "gitOps")]
    pub gitops: Option<GitOpsConfig>,
    #[serde(default)]
    pub addons: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Update input: only present fields change
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentPatch {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub network_policy: Option<NetworkPolicySpec>,
    #[serde(default)]
    pub service_mesh: Option<ServiceMeshConfig>,
    #[serde(default)]
    pub monitoring: Option<MonitoringConfig>,
    #[serde(default, rename = "gitOps")]
    pub gitops: Option<GitOpsConfig>,
    #[serde(default)]
    pub addons: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<BTreeMap<String, String>>,
}

impl EnvironmentPatch {
    /// Merge the present fields into `env`
    pub fn apply_to(self, env: &mut Environment) {
        if let Some(description) = self.description {
            env.description = description;
        }
        if let Some(limits) = self.resource_limits {
            env.resource_limits = limits;
        }
        if let Some(policy) = self.network_policy {
            env.network_policy = Some(policy);
        }
        if let Some(mesh) = self.service_mesh {
            env.service_mesh = Some(mesh);
        }
        if let Some(monitoring) = self.monitoring {
            env.monitoring = Some(monitoring);
        }
        if let Some(gitops) = self.gitops {
            env.gitops = Some(gitops);
        }
        if let Some(addons) = self.addons {
            env.addons = addons.into_iter().collect();
        }
        if let Some(tags) = self.tags {
            env.tags = tags;
        }
    }
}

/// Scan filter. Soft-deleted records are excluded unless `include_deleted`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvironmentFilter {
    pub owner_id: Option<String>,
    pub status: Option<EnvironmentState>,
    pub include_deleted: bool,
}

impl EnvironmentFilter {
    /// Filter on owner
    pub fn owned_by(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Default::default()
        }
    }

    /// Whether `env` passes this filter
    pub fn matches(&self, env: &Environment) -> bool {
        (self.include_deleted || !env.is_deleted())
            && self.owner_id.as_ref().map_or(true, |o| *o == env.owner_id)
            && self.status.map_or(true, |s| s == env.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EnvironmentState::*;

    fn dev_env_request() -> EnvironmentRequest {
        EnvironmentRequest {
            name: "dev-env".to_string(),
            template_id: "tmpl-eks".to_string(),
            owner_id: "alice".to_string(),
            resource_limits: ResourceLimits {
                cpu: "2".to_string(),
                memory: "4Gi".to_string(),
                storage: "20Gi".to_string(),
                max_node_count: 3,
                max_namespaces: 5,
                max_load_balancers: 1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(Creating.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Active));
        assert!(Active.can_transition_to(Updating));
        assert!(Updating.can_transition_to(Active));
        assert!(Active.can_transition_to(Deleting));
        assert!(Error.can_transition_to(Deleting));
        assert!(Error.can_transition_to(Updating));
        assert!(Deleting.can_transition_to(Deleted));

        for from in [Creating, Provisioning, Active, Updating, Deleting] {
            assert!(from.can_transition_to(Error), "{from} -> ERROR");
        }

        assert!(!Creating.can_transition_to(Active));
        assert!(!Provisioning.can_transition_to(Updating));
        assert!(!Updating.can_transition_to(Deleting));
        assert!(!Deleting.can_transition_to(Updating));
        assert!(!Deleted.can_transition_to(Error));
        assert!(!Error.can_transition_to(Active));
        assert!(Deleted.is_terminal());
    }

    #[test]
    fn test_state_wire_format() {
        assert_eq!(serde_json::to_value(Provisioning).unwrap(), "PROVISIONING");
        let parsed: EnvironmentState = serde_json::from_str("\"DELETED\"").unwrap();
        assert_eq!(parsed, Deleted);
        assert_eq!(Active.to_string(), "ACTIVE");
    }

    #[test]
    fn test_cluster_name_uses_id_prefix() {
        assert_eq!(
            Environment::derive_cluster_name("3f2a9c1e-77aa-4bcd-9e00-000000000000"),
            "env-3f2a9c1e"
        );
        assert_eq!(Environment::derive_cluster_name("abc"), "env-abc");
    }

    #[test]
    fn test_from_request_starts_creating() {
        let now = Utc::now();
        let env = Environment::from_request("12345678-aaaa".to_string(), dev_env_request(), now);
        assert_eq!(env.status, Creating);
        assert_eq!(env.cluster_name, "env-12345678");
        assert_eq!(env.status_message, "Environment creation initiated");
        assert_eq!(env.history.len(), 1);
        assert!(!env.is_deleted());
        assert!(env.credential.is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let now = Utc::now();
        let mut env = Environment::from_request("id".to_string(), dev_env_request(), now);
        for i in 0..10 {
            env.set_status(Error, format!("attempt {i}"), now, 4);
        }
        assert_eq!(env.history.len(), 4);
        assert_eq!(env.history.last().unwrap().message, "attempt 9");
        assert_eq!(env.history.first().unwrap().message, "attempt 6");
    }

    #[test]
    fn test_patch_only_touches_present_fields() {
        let now = Utc::now();
        let mut env = Environment::from_request("id".to_string(), dev_env_request(), now);
        env.tags.insert("team".into(), "core".into());

        EnvironmentPatch {
            description: Some("updated".to_string()),
            addons: Some(vec!["ingress".into(), "ingress".into(), "cert-manager".into()]),
            ..Default::default()
        }
        .apply_to(&mut env);

        assert_eq!(env.description, "updated");
        assert_eq!(env.addons.len(), 2);
        assert_eq!(env.tags.get("team").map(String::as_str), Some("core"));
        assert_eq!(env.resource_limits.cpu, "2");
    }

    #[test]
    fn test_filter_hides_deleted_by_default() {
        let now = Utc::now();
        let mut env = Environment::from_request("id".to_string(), dev_env_request(), now);
        assert!(EnvironmentFilter::default().matches(&env));
        assert!(EnvironmentFilter::owned_by("alice").matches(&env));
        assert!(!EnvironmentFilter::owned_by("bob").matches(&env));

        env.deleted_at = Some(now);
        assert!(!EnvironmentFilter::default().matches(&env));
        assert!(EnvironmentFilter {
            include_deleted: true,
            ..Default::default()
        }
        .matches(&env));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("apiVersion: v1\nusers: [secret]");
        assert_eq!(format!("{cred:?}"), "Credential(<redacted>)");
        assert!(!cred.is_empty());
    }

    #[test]
    fn test_request_uses_original_wire_names() {
        let req: EnvironmentRequest = serde_json::from_value(serde_json::json!({
            "name": "dev-env",
            "templateId": "t",
            "userId": "alice",
            "resourceLimits": {
                "cpu": "2", "memory": "4Gi", "storage": "20Gi",
                "maxNodeCount": 3, "maxNamespaces": 5, "maxLoadBalancers": 1
            },
            "gitOps": {"enabled": true, "gitRepository": "https://git.example.com/app"},
            "serviceMesh": {"enabled": true, "mtlsMode": "PERMISSIVE"}
        }))
        .unwrap();
        assert_eq!(req.owner_id, "alice");
        assert!(req.gitops.unwrap().enabled);
        assert_eq!(req.service_mesh.unwrap().mtls_mode, Some(MtlsMode::Permissive));
    }
}
