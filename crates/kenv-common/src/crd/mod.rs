//! Custom resource definitions and shared spec types

mod tenant;
mod types;

pub use tenant::{Tenant, TenantPhase, TenantResourceLimits, TenantSpec, TenantStatus};
pub use types::{is_valid_cidr, NetworkPolicySpec};
