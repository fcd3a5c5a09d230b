//! Configuration loading from disk and the environment.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};
use crate::headers::EnforcementMode;

/// Selects the header enforcement mode (`off`, `debug`, `dry-run`).
pub const ENV_HEADERS_DEBUG: &str = "KB_HEADERS_DEBUG";
/// Default rate-limit tenant when the request does not name one.
pub const ENV_TENANT_ID: &str = "KB_TENANT_ID";
/// Overrides `listener.bind_address`.
pub const ENV_BIND: &str = "KB_GATEWAY_BIND";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load, override from the process environment, and validate a TOML file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content, |key| std::env::var(key).ok())
}

/// Parse configuration text with an explicit environment lookup.
pub fn parse_config<F>(content: &str, env: F) -> Result<GatewayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: GatewayConfig = toml::from_str(content)?;
    apply_env_overrides(&mut config, env)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Apply the supported environment overrides in place.
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = env(ENV_HEADERS_DEBUG) {
        config.headers.mode = value.parse::<EnforcementMode>().map_err(|_| ConfigError::Env {
            var: ENV_HEADERS_DEBUG,
            value,
        })?;
    }

    if let Some(tenant) = env(ENV_TENANT_ID).filter(|t| !t.trim().is_empty()) {
        config.rate_limit.default_tenant = tenant.trim().to_string();
    }

    if let Some(bind) = env(ENV_BIND) {
        config.listener.bind_address = bind;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("", env_of(&[])).unwrap();
        assert_eq!(config.headers.mode, EnforcementMode::Off);
        assert_eq!(config.events.buffer_capacity, 500);
        assert_eq!(config.rate_limit.default_tenant, "default");
    }

    #[test]
    fn environment_overrides_apply() {
        let config = parse_config(
            "",
            env_of(&[
                (ENV_HEADERS_DEBUG, "dry-run"),
                (ENV_TENANT_ID, "acme"),
                (ENV_BIND, "127.0.0.1:9999"),
            ]),
        )
        .unwrap();
        assert_eq!(config.headers.mode, EnforcementMode::DryRun);
        assert_eq!(config.rate_limit.default_tenant, "acme");
        assert_eq!(config.listener.bind_address, "127.0.0.1:9999");
    }

    #[test]
    fn bad_debug_flag_is_rejected() {
        let err = parse_config("", env_of(&[(ENV_HEADERS_DEBUG, "loud")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn parses_policies_and_commands() {
        let toml = r#"
            [jobs]
            workers = 2

            [jobs.commands.audit]
            program = "kb"
            args = ["audit", "--json"]

            [[headers.policies]]
            route_prefix = "/jobs"

            [headers.policies.manifest]
            plugin_id = "audit-plugin"
            defaults = "deny"

            [[headers.policies.manifest.inbound]]
            match = { exact = "x-api-key" }
            action = "forward"
            required = true
            transform = "trim|lowercase"
        "#;
        let config = parse_config(toml, env_of(&[])).unwrap();
        assert_eq!(config.jobs.workers, 2);
        assert_eq!(config.headers.policies.len(), 1);
        let manifest = &config.headers.policies[0].manifest;
        assert_eq!(manifest.plugin_id, "audit-plugin");
        assert_eq!(manifest.inbound.len(), 1);
        assert!(manifest.inbound[0].required);
        assert_eq!(
            config.jobs.commands["audit"].args,
            vec!["audit", "--json"]
        );
    }
}
