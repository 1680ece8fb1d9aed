//! Configuration loading from disk and environment.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use crate::config::schema::GatewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Overrides `broker.url`.
pub const ENV_BROKER_URL: &str = "RABBITMQ_URL";
/// Overrides the port of `gateway.bind_address`.
pub const ENV_GATEWAY_PORT: &str = "ORCHESTRATOR_PORT";

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid {var}: {message}")]
    Env { var: &'static str, message: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load, apply environment overrides to, and validate a TOML configuration file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: GatewayConfig = toml::from_str(&content)?;
    finalize(config)
}

/// Build a configuration from defaults when no file is given.
pub fn load_default() -> Result<GatewayConfig, ConfigError> {
    finalize(GatewayConfig::default())
}

fn finalize(mut config: GatewayConfig) -> Result<GatewayConfig, ConfigError> {
    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Apply environment overrides using `lookup` to read variables.
pub fn apply_env_overrides(
    config: &mut GatewayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(url) = lookup(ENV_BROKER_URL).filter(|v| !v.is_empty()) {
        config.broker.url = url;
    }

    if let Some(port) = lookup(ENV_GATEWAY_PORT).filter(|v| !v.is_empty()) {
        let port: u16 = port.parse().map_err(|_| ConfigError::Env {
            var: ENV_GATEWAY_PORT,
            message: format!("'{}' is not a port number", port),
        })?;
        let mut addr = config
            .gateway
            .bind_address
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        addr.set_port(port);
        config.gateway.bind_address = addr.to_string();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                (ENV_BROKER_URL, "amqp://rabbit:5672/%2f"),
                (ENV_GATEWAY_PORT, "4100"),
            ]),
        )
        .unwrap();

        assert_eq!(config.broker.url, "amqp://rabbit:5672/%2f");
        assert_eq!(config.gateway.bind_address, "0.0.0.0:4100");
    }

    #[test]
    fn test_bad_port_override() {
        let mut config = GatewayConfig::default();
        let err = apply_env_overrides(&mut config, env(&[(ENV_GATEWAY_PORT, "http")])).unwrap_err();
        assert!(err.to_string().contains("ORCHESTRATOR_PORT"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = std::env::temp_dir().join(format!("quiz-gateway-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gateway.toml");
        fs::write(
            &path,
            "[circuit_breaker]\nfailure_threshold = 2\nreset_timeout_ms = 100\n",
        )
        .unwrap();

        let config: GatewayConfig = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.reset_timeout_ms, 100);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_validation_error_surfaces() {
        let mut config = GatewayConfig::default();
        config.rpc.timeout_ms = 0;
        let err = validate_config(&config).map_err(ConfigError::Validation).unwrap_err();
        assert!(err.to_string().contains("rpc.timeout_ms"));
    }
}
