//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (workers > 0, capacities > 0, windows > 0)
//! - Check that header policy manifests compile
//! - Detect duplicate route prefixes and dependency roles
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;

use crate::config::schema::GatewayConfig;
use crate::headers::policy::CompiledHeaderPolicy;
use crate::headers::transform::TransformCatalog;
use crate::jobs::types::JobKind;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("not a socket address: {}", config.listener.bind_address),
        ));
    }

    if config.startup.enabled && config.startup.timeout_ms == 0 {
        errors.push(ValidationError::new("startup.timeout_ms", "must be > 0"));
    }

    if config.rate_limit.enabled {
        if config.rate_limit.window_secs == 0 {
            errors.push(ValidationError::new("rate_limit.window_secs", "must be > 0"));
        }
        if config.rate_limit.default_tenant.trim().is_empty() {
            errors.push(ValidationError::new("rate_limit.default_tenant", "must not be empty"));
        }
    }

    if config.jobs.workers == 0 {
        errors.push(ValidationError::new("jobs.workers", "must be > 0"));
    }
    if config.jobs.default_timeout_ms == Some(0) {
        errors.push(ValidationError::new("jobs.default_timeout_ms", "must be > 0 when set"));
    }

    for kind in config.jobs.commands.keys() {
        if kind.parse::<JobKind>().is_err() {
            errors.push(ValidationError::new(
                format!("jobs.commands.{kind}"),
                "unknown job kind",
            ));
        }
    }

    if config.events.buffer_capacity == 0 {
        errors.push(ValidationError::new("events.buffer_capacity", "must be > 0"));
    }

    if config.headers.debug_buffer_size == 0 {
        errors.push(ValidationError::new("headers.debug_buffer_size", "must be > 0"));
    }

    // Custom transforms are resolved by the host at runtime; an empty catalog
    // only checks rule syntax here.
    let catalog = TransformCatalog::default();
    let mut prefixes = HashSet::new();
    for (i, policy) in config.headers.policies.iter().enumerate() {
        if !policy.route_prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("headers.policies[{i}].route_prefix"),
                "must start with '/'",
            ));
        }
        if !prefixes.insert(policy.route_prefix.as_str()) {
            errors.push(ValidationError::new(
                format!("headers.policies[{i}].route_prefix"),
                format!("duplicate prefix {}", policy.route_prefix),
            ));
        }
        if let Err(e) = CompiledHeaderPolicy::compile(&policy.manifest, &catalog) {
            errors.push(ValidationError::new(
                format!("headers.policies[{i}].manifest"),
                e.to_string(),
            ));
        }
    }

    if config.health.enabled {
        if config.health.interval_secs == 0 {
            errors.push(ValidationError::new("health.interval_secs", "must be > 0"));
        }
        let mut roles = HashSet::new();
        for (i, dep) in config.health.dependencies.iter().enumerate() {
            if !roles.insert(dep.role.as_str()) {
                errors.push(ValidationError::new(
                    format!("health.dependencies[{i}].role"),
                    format!("duplicate role {}", dep.role),
                ));
            }
            if dep.url.parse::<hyper::Uri>().is_err() {
                errors.push(ValidationError::new(
                    format!("health.dependencies[{i}].url"),
                    format!("invalid url {}", dep.url),
                ));
            }
        }
    }

    if config.admin.enabled {
        if config.admin.api_key.trim().is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
        }
        if config.admin.bind_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "admin.bind_address",
                format!("not a socket address: {}", config.admin.bind_address),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RoutePolicyConfig;
    use crate::headers::manifest::HeaderPolicyManifest;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = GatewayConfig::default();
        config.jobs.workers = 0;
        config.events.buffer_capacity = 0;
        config.listener.bind_address = "nope".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn rejects_duplicate_policy_prefix() {
        let mut config = GatewayConfig::default();
        let manifest = HeaderPolicyManifest::new("p");
        config.headers.policies = vec![
            RoutePolicyConfig { route_prefix: "/jobs".into(), manifest: manifest.clone() },
            RoutePolicyConfig { route_prefix: "/jobs".into(), manifest },
        ];
        let errors = validate_config(&config).unwrap_err();
        assert!(errors[0].message.contains("duplicate"));
    }

    #[test]
    fn enabled_admin_needs_a_key() {
        let mut config = GatewayConfig::default();
        config.admin.enabled = true;
        config.admin.api_key = "  ".into();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "admin.api_key");
    }
}
