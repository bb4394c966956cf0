//! Common types for kenv: the Tenant CRD, errors, labels and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key marking objects created by a kenv controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// `MANAGED_BY_LABEL` value for objects owned by the tenant reconciler
pub const TENANT_CONTROLLER: &str = "kenv-tenant-controller";

/// Label key carrying the owning Tenant's name
pub const TENANT_LABEL: &str = "kenv.dev/tenant";

/// Label key carrying the (sanitized) owner id
pub const OWNER_LABEL: &str = "kenv.dev/owner";

/// Label key carrying the environment id a Tenant was bootstrapped from
pub const ENVIRONMENT_LABEL: &str = "kenv.dev/environment";

/// Label key carrying the cluster name a Tenant was bootstrapped for
pub const CLUSTER_NAME_LABEL: &str = "kenv.dev/cluster-name";

/// Annotation holding the hash of the desired spec last applied to an object
pub const DESIRED_HASH_ANNOTATION: &str = "kenv.dev/desired-hash";

/// Namespace label enabling sidecar injection
pub const MESH_INJECTION_LABEL: &str = "istio-injection";

/// `MESH_INJECTION_LABEL` value when injection is on
pub const MESH_INJECTION_ENABLED: &str = "enabled";
