//! Module variables derived from an Environment record

use serde::{Deserialize, Serialize};
use serde_json::json;

use kenv_common::{Error, ENVIRONMENT_LABEL, OWNER_LABEL};
use kenv_workspace::Variables;

use crate::model::Environment;

/// Node count the cluster starts with, capped by the environment's maximum
const DEFAULT_MIN_NODES: u32 = 2;

/// Platform-wide values the record does not carry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProvisioningDefaults {
    /// Cloud region
    pub region: String,
    /// Environment tier label passed to the module
    pub environment: String,
    /// Worker instance types
    pub instance_types: Vec<String>,
    /// Kubernetes version for the control plane
    pub kubernetes_version: String,
    /// VPC address range
    pub vpc_cidr: String,
}

impl Default for ProvisioningDefaults {
    fn default() -> Self {
        Self {
            region: "us-west-2".to_string(),
            environment: "dev".to_string(),
            instance_types: vec!["m5.large".to_string()],
            kubernetes_version: "1.26".to_string(),
            vpc_cidr: "10.0.0.0/16".to_string(),
        }
    }
}

/// Variables for the provisioning module.
///
/// Node bounds come from `maxNodeCount`; optional sections are passed as
/// JSON null when absent so the module can apply its own defaults.
pub fn module_variables(
    env: &Environment,
    defaults: &ProvisioningDefaults,
) -> Result<Variables, Error> {
    let max_nodes = env.resource_limits.max_node_count.max(1);
    let min_nodes = DEFAULT_MIN_NODES.min(max_nodes);

    let mut tags = env.tags.clone();
    tags.insert(ENVIRONMENT_LABEL.to_string(), env.id.clone());
    tags.insert(OWNER_LABEL.to_string(), env.owner_id.clone());

    let mut vars = Variables::new();
    vars.insert("cluster_name".into(), json!(env.cluster_name));
    vars.insert("region".into(), json!(defaults.region));
    vars.insert("environment".into(), json!(defaults.environment));
    vars.insert("instance_types".into(), json!(defaults.instance_types));
    vars.insert("min_nodes".into(), json!(min_nodes));
    vars.insert("max_nodes".into(), json!(max_nodes));
    vars.insert("desired_nodes".into(), json!(min_nodes));
    vars.insert("kubernetes_version".into(), json!(defaults.kubernetes_version));
    vars.insert("vpc_cidr".into(), json!(defaults.vpc_cidr));
    vars.insert("resource_limits".into(), serde_json::to_value(&env.resource_limits)?);
    vars.insert("network_policy".into(), serde_json::to_value(&env.network_policy)?);
    vars.insert("service_mesh".into(), serde_json::to_value(&env.service_mesh)?);
    vars.insert("monitoring".into(), serde_json::to_value(&env.monitoring)?);
    vars.insert("gitops".into(), serde_json::to_value(&env.gitops)?);
    vars.insert("addons".into(), json!(env.addons));
    vars.insert("tags".into(), json!(tags));
    Ok(vars)
}
