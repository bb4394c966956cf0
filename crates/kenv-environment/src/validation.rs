//! Input validation for environment records
//!
//! The manager calls the validator on the record a create or update would
//! persist, so create and update share one rule set.

use kenv_common::Error;

use crate::model::Environment;

const SCRAPE_INTERVALS: &[&str] = &["15s", "30s", "1m", "5m"];
const RETENTION_PERIODS: &[&str] = &["1d", "7d", "14d", "30d"];
const SYNC_INTERVALS: &[&str] = &["1m", "5m", "10m", "15m", "30m", "1h"];
const SYNC_TIMEOUTS: &[&str] = &["1m", "5m", "10m"];

/// Checks a record before it is persisted
pub trait EnvironmentValidator: Send + Sync {
    /// Reject the record with `Error::Validation` if it is malformed
    fn validate(&self, environment: &Environment) -> Result<(), Error>;
}

/// Default rules: name 3..=63, description at most 255, required ids and
/// quantities, bounded counts and enumerated intervals
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultValidator;

impl EnvironmentValidator for DefaultValidator {
    fn validate(&self, env: &Environment) -> Result<(), Error> {
        let subject = if env.name.is_empty() { &env.id } else { &env.name };
        let fail = |field: &str, msg: String| Err(Error::validation_for_field(subject, field, msg));

        let name_len = env.name.chars().count();
        if !(3..=63).contains(&name_len) {
            return fail("name", format!("must be 3 to 63 characters, got {name_len}"));
        }
        if env.description.chars().count() > 255 {
            return fail("description", "must be at most 255 characters".to_string());
        }
        if env.template_id.trim().is_empty() {
            return fail("templateId", "required".to_string());
        }
        if env.owner_id.trim().is_empty() {
            return fail("userId", "required".to_string());
        }

        let limits = &env.resource_limits;
        for (field, value) in [
            ("resourceLimits.cpu", &limits.cpu),
            ("resourceLimits.memory", &limits.memory),
            ("resourceLimits.storage", &limits.storage),
        ] {
            if value.trim().is_empty() {
                return fail(field, "required".to_string());
            }
        }
        for (field, value, min, max) in [
            ("resourceLimits.maxNodeCount", limits.max_node_count, 1, 10),
            ("resourceLimits.maxNamespaces", limits.max_namespaces, 1, 20),
            ("resourceLimits.maxLoadBalancers", limits.max_load_balancers, 0, 5),
        ] {
            if !(min..=max).contains(&value) {
                return fail(field, format!("must be between {min} and {max}, got {value}"));
            }
        }

        if let Some(policy) = &env.network_policy {
            policy.validate(subject)?;
        }

        if let Some(monitoring) = &env.monitoring {
            one_of(subject, "monitoring.scrapeInterval", &monitoring.scrape_interval, SCRAPE_INTERVALS)?;
            one_of(subject, "monitoring.retentionPeriod", &monitoring.retention_period, RETENTION_PERIODS)?;
        }

        if let Some(gitops) = &env.gitops {
            if let Some(repo) = gitops.git_repository.as_deref().filter(|r| !r.is_empty()) {
                if !looks_like_url(repo) {
                    return fail("gitOps.gitRepository", format!("'{repo}' is not a URL"));
                }
            }
            one_of(subject, "gitOps.syncInterval", &gitops.sync_interval, SYNC_INTERVALS)?;
            one_of(subject, "gitOps.syncTimeout", &gitops.sync_timeout, SYNC_TIMEOUTS)?;
        }

        Ok(())
    }
}

fn one_of(
    subject: &str,
    field: &str,
    value: &Option<String>,
    allowed: &[&str],
) -> Result<(), Error> {
    match value.as_deref() {
        None | Some("") => Ok(()),
        Some(v) if allowed.contains(&v) => Ok(()),
        Some(v) => Err(Error::validation_for_field(
            subject,
            field,
            format!("'{v}' must be one of {}", allowed.join(", ")),
        )),
    }
}

/// `scheme://host...` with a non-empty host
fn looks_like_url(value: &str) -> bool {
    match value.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
                && !rest.is_empty()
                && !rest.starts_with('/')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        EnvironmentRequest, GitOpsConfig, MonitoringConfig, NetworkPolicySpec, ResourceLimits,
    };
    use chrono::Utc;

    fn valid() -> Environment {
        Environment::from_request(
            "12345678-0000".to_string(),
            EnvironmentRequest {
                name: "dev-env".to_string(),
                template_id: "tmpl".to_string(),
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
            },
            Utc::now(),
        )
    }

    fn field_of(err: Error) -> Option<String> {
        match err {
            Error::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_record_passes() {
        assert!(DefaultValidator.validate(&valid()).is_ok());
    }

    #[test]
    fn test_name_length() {
        let mut env = valid();
        env.name = "ab".to_string();
        assert_eq!(field_of(DefaultValidator.validate(&env).unwrap_err()).as_deref(), Some("name"));
        env.name = "a".repeat(64);
        assert!(DefaultValidator.validate(&env).is_err());
    }

    #[test]
    fn test_limits_bounds() {
        let mut env = valid();
        env.resource_limits.max_node_count = 11;
        assert_eq!(
            field_of(DefaultValidator.validate(&env).unwrap_err()).as_deref(),
            Some("resourceLimits.maxNodeCount")
        );

        let mut env = valid();
        env.resource_limits.max_load_balancers = 0;
        assert!(DefaultValidator.validate(&env).is_ok());
        env.resource_limits.max_namespaces = 0;
        assert!(DefaultValidator.validate(&env).is_err());

        let mut env = valid();
        env.resource_limits.cpu.clear();
        assert_eq!(
            field_of(DefaultValidator.validate(&env).unwrap_err()).as_deref(),
            Some("resourceLimits.cpu")
        );
    }

    #[test]
    fn test_required_ids() {
        let mut env = valid();
        env.template_id.clear();
        assert!(DefaultValidator.validate(&env).is_err());

        let mut env = valid();
        env.owner_id = "  ".to_string();
        assert_eq!(field_of(DefaultValidator.validate(&env).unwrap_err()).as_deref(), Some("userId"));
    }

    #[test]
    fn test_enumerated_intervals() {
        let mut env = valid();
        env.monitoring = Some(MonitoringConfig {
            scrape_interval: Some("10s".to_string()),
            ..Default::default()
        });
        assert_eq!(
            field_of(DefaultValidator.validate(&env).unwrap_err()).as_deref(),
            Some("monitoring.scrapeInterval")
        );

        env.monitoring = Some(MonitoringConfig {
            scrape_interval: Some("30s".to_string()),
            retention_period: Some("7d".to_string()),
            ..Default::default()
        });
        env.gitops = Some(GitOpsConfig {
            enabled: true,
            git_repository: Some("https://git.example.com/org/app.git".to_string()),
            sync_interval: Some("2m".to_string()),
            ..Default::default()
        });
        assert_eq!(
            field_of(DefaultValidator.validate(&env).unwrap_err()).as_deref(),
            Some("gitOps.syncInterval")
        );
    }

    #[test]
    fn test_git_repository_must_be_url() {
        let mut env = valid();
        env.gitops = Some(GitOpsConfig {
            git_repository: Some("git.example.com/app".to_string()),
            ..Default::default()
        });
        assert!(DefaultValidator.validate(&env).is_err());

        assert!(looks_like_url("ssh://git@example.com/app"));
        assert!(!looks_like_url("https:///nohost"));
    }

    #[test]
    fn test_network_policy_cidrs_checked() {
        let mut env = valid();
        env.network_policy = Some(NetworkPolicySpec {
            allow_ingress_from_cidr: vec!["10.0.0.0/8".into(), "bogus".into()],
            ..Default::default()
        });
        assert!(DefaultValidator.validate(&env).is_err());
    }
}
