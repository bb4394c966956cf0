//! Environment lifecycle management
//!
//! An Environment is a tenant-owned Kubernetes cluster described by a
//! versioned record. [`EnvironmentManager`] accepts create, update and
//! delete requests synchronously and runs provisioning, bootstrap and
//! teardown as background workflows, one per environment at a time.

pub mod bootstrap;
pub mod lease;
pub mod manager;
pub mod model;
pub mod status;
pub mod store;
pub mod validation;
pub mod variables;
pub mod workflow;

pub use bootstrap::{tenant_for, ClusterBootstrap, TenantBootstrap};
pub use manager::{EnvironmentManager, ManagerConfig, ManagerContext};
pub use model::{
    Credential, Environment, EnvironmentFilter, EnvironmentPatch, EnvironmentRequest,
    EnvironmentState, ResourceLimits,
};
pub use status::{EnvironmentStatusView, KubeStatusAggregator, LiveStatus, StatusAggregator};
pub use store::{EnvironmentStore, InMemoryEnvironmentStore};
pub use validation::{DefaultValidator, EnvironmentValidator};
pub use variables::{module_variables, ProvisioningDefaults};

pub use kenv_common::{Error, Result};
