//! Spec types shared between the Environment model and the Tenant CRD

use std::net::IpAddr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Network isolation declared for an environment or tenant
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    /// CIDRs allowed to reach tenant pods, one policy object per entry
    #[serde(rename = "allowIngressFromCIDR", default)]
    pub allow_ingress_from_cidr: Vec<String>,

    /// CIDRs tenant pods may reach, one policy object per entry
    #[serde(rename = "allowEgressToCIDR", default)]
    pub allow_egress_to_cidr: Vec<String>,

    /// Deny all ingress not explicitly allowed
    #[serde(default)]
    pub default_deny_ingress: bool,

    /// Deny all egress not explicitly allowed
    #[serde(default)]
    pub default_deny_egress: bool,

    /// Allow pods in the same namespace to talk to each other
    #[serde(default)]
    pub allow_intra_namespace: bool,

    /// Allow ingress from the tenant's other namespaces
    #[serde(default)]
    pub allow_cross_namespace: bool,

    /// External service hostnames the workloads depend on.
    /// Recorded for the admission policy engine; not enforced by NetworkPolicy.
    #[serde(default)]
    pub allow_external_services: Vec<String>,
}

impl NetworkPolicySpec {
    /// Check every declared CIDR parses as `address/prefix`
    pub fn validate(&self, subject: &str) -> Result<(), Error> {
        for (field, cidrs) in [
            ("networkPolicy.allowIngressFromCIDR", &self.allow_ingress_from_cidr),
            ("networkPolicy.allowEgressToCIDR", &self.allow_egress_to_cidr),
        ] {
            for cidr in cidrs {
                if !is_valid_cidr(cidr) {
                    return Err(Error::validation_for_field(
                        subject,
                        field,
                        format!("'{cidr}' is not a valid CIDR"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Parse-check an IPv4 or IPv6 CIDR such as `10.0.0.0/8`
pub fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr {
        IpAddr::V4(_) => prefix <= 32,
        IpAddr::V6(_) => prefix <= 128,
    }
}
