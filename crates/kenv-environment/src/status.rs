//! Live status of a provisioned cluster and the composite status view

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service};
use kube::api::{Api, ListParams};
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use kenv_common::kube_utils::client_from_kubeconfig_yaml;
use kenv_common::{Error, MANAGED_BY_LABEL, OWNER_LABEL};

use crate::model::{Credential, Environment, EnvironmentState, StatusEntry};

/// Namespace and deployment probed for mesh health
const MESH_NAMESPACE: &str = "istio-system";
const MESH_CONTROL_PLANE: &str = "istiod";

/// Cluster-wide counts
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUtilization {
    pub node_count: u32,
    pub namespace_count: u32,
    pub pod_count: u32,
    pub service_count: u32,
}

/// One node as the API server reports it
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
}

/// One namespace with its workload counts
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceStatus {
    pub name: String,
    pub phase: String,
    pub pod_count: u32,
    pub service_count: u32,
    /// Owner label, when the namespace is tenant-managed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Mesh control plane health
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum MeshHealth {
    /// No mesh control plane installed
    #[default]
    NotInstalled,
    /// Control plane has every replica available
    Healthy,
    /// Control plane installed but not fully available
    Degraded,
}

/// What the aggregator observed on the live cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveStatus {
    pub resource_utilization: ResourceUtilization,
    pub node_status: Vec<NodeStatus>,
    pub namespace_statuses: Vec<NamespaceStatus>,
    pub service_mesh_status: MeshHealth,
    /// Share of nodes reporting Ready, 0.0 to 100.0
    pub ready_node_percentage: f64,
    pub last_sync_time: DateTime<Utc>,
}

/// Read-only composite of the persisted record and the live cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatusView {
    pub id: String,
    pub name: String,
    pub cluster_name: String,
    pub status: EnvironmentState,
    pub status_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_url: Option<String>,
    pub history: Vec<StatusEntry>,
    /// Live data, absent before the cluster exists or when it was unreachable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveStatus>,
    /// Why live data is missing, if collection failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_error: Option<String>,
}

impl EnvironmentStatusView {
    /// View of `env` with no live data
    pub fn persisted(env: &Environment) -> Self {
        Self {
            id: env.id.clone(),
            name: env.name.clone(),
            cluster_name: env.cluster_name.clone(),
            status: env.status,
            status_message: env.status_message.clone(),
            console_url: env.console_url.clone(),
            history: env.history.clone(),
            live: None,
            live_error: None,
        }
    }
}

/// Collects live metrics from an environment's cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusAggregator: Send + Sync {
    /// Observe the cluster reachable with `credential`
    async fn collect(&self, env_id: &str, credential: &Credential) -> Result<LiveStatus, Error>;
}

/// Aggregator that reads nodes, namespaces, pods and services directly
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeStatusAggregator;

#[async_trait]
impl StatusAggregator for KubeStatusAggregator {
    async fn collect(&self, env_id: &str, credential: &Credential) -> Result<LiveStatus, Error> {
        let client = client_from_kubeconfig_yaml(credential.expose()).await?;
        let lp = ListParams::default();

        let nodes = Api::<Node>::all(client.clone()).list(&lp).await?.items;
        let namespaces = Api::<Namespace>::all(client.clone()).list(&lp).await?.items;
        let pods = Api::<Pod>::all(client.clone()).list(&lp).await?.items;
        let services = Api::<Service>::all(client.clone()).list(&lp).await?.items;

        let deployments: Api<Deployment> = Api::namespaced(client, MESH_NAMESPACE);
        let mesh = match deployments.get(MESH_CONTROL_PLANE).await {
            Ok(d) => mesh_health(&d),
            Err(kube::Error::Api(ae)) if ae.code == 404 => MeshHealth::NotInstalled,
            Err(e) => return Err(e.into()),
        };

        debug!(env_id = %env_id, nodes = nodes.len(), pods = pods.len(), "collected live status");
        Ok(summarize(&nodes, &namespaces, &pods, &services, mesh, Utc::now()))
    }
}

fn mesh_health(deployment: &Deployment) -> MeshHealth {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    if available >= desired && desired > 0 {
        MeshHealth::Healthy
    } else {
        MeshHealth::Degraded
    }
}

fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Fold raw object lists into a `LiveStatus`
pub(crate) fn summarize(
    nodes: &[Node],
    namespaces: &[Namespace],
    pods: &[Pod],
    services: &[Service],
    mesh: MeshHealth,
    now: DateTime<Utc>,
) -> LiveStatus {
    let node_status: Vec<NodeStatus> = nodes
        .iter()
        .map(|n| {
            let status = n.status.as_ref();
            NodeStatus {
                name: n.name_any(),
                ready: node_ready(n),
                version: status
                    .and_then(|s| s.node_info.as_ref())
                    .map(|i| i.kubelet_version.clone()),
                internal_ip: status
                    .and_then(|s| s.addresses.as_ref())
                    .and_then(|a| a.iter().find(|a| a.type_ == "InternalIP"))
                    .map(|a| a.address.clone()),
            }
        })
        .collect();

    let namespace_statuses = namespaces
        .iter()
        .map(|ns| {
            let name = ns.name_any();
            let count_in = |ns_of: Option<String>| ns_of.as_deref() == Some(name.as_str());
            let managed = ns.labels().contains_key(MANAGED_BY_LABEL);
            NamespaceStatus {
                phase: ns
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_else(|| "Unknown".to_string()),
                pod_count: pods.iter().filter(|p| count_in(p.namespace())).count() as u32,
                service_count: services.iter().filter(|s| count_in(s.namespace())).count() as u32,
                owner: managed
                    .then(|| ns.labels().get(OWNER_LABEL).cloned())
                    .flatten(),
                name,
            }
        })
        .collect();

    let ready = node_status.iter().filter(|n| n.ready).count();
    let ready_node_percentage = if node_status.is_empty() {
        0.0
    } else {
        ready as f64 * 100.0 / node_status.len() as f64
    };

    LiveStatus {
        resource_utilization: ResourceUtilization {
            node_count: nodes.len() as u32,
            namespace_count: namespaces.len() as u32,
            pod_count: pods.len() as u32,
            service_count: services.len() as u32,
        },
        node_status,
        namespace_statuses,
        service_mesh_status: mesh,
        ready_node_percentage,
        last_sync_time: now,
    }
}
