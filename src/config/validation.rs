//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thresholds > 0)
//! - Check the broker URI and bind addresses parse
//! - Detect duplicate queue declarations
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::GatewayConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
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

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.gateway.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "gateway.bind_address",
            format!("'{}' is not a socket address", config.gateway.bind_address),
        ));
    }
    if config.gateway.request_timeout_secs == 0 {
        errors.push(ValidationError::new("gateway.request_timeout_secs", "must be > 0"));
    }

    match url::Url::parse(&config.broker.url) {
        Ok(uri) if uri.scheme() == "amqp" || uri.scheme() == "amqps" => {}
        Ok(uri) => errors.push(ValidationError::new(
            "broker.url",
            format!("unsupported scheme '{}'", uri.scheme()),
        )),
        Err(e) => errors.push(ValidationError::new("broker.url", e.to_string())),
    }
    if config.broker.connect_attempts == 0 {
        errors.push(ValidationError::new("broker.connect_attempts", "must be > 0"));
    }
    if config.broker.connect_backoff_base_ms > config.broker.connect_backoff_max_ms {
        errors.push(ValidationError::new(
            "broker.connect_backoff_base_ms",
            "must not exceed connect_backoff_max_ms",
        ));
    }

    let mut seen = HashSet::new();
    for (i, queue) in config.broker.queues.iter().enumerate() {
        let field = format!("broker.queues[{}]", i);
        if queue.name.trim().is_empty() {
            errors.push(ValidationError::new(&field, "queue name is empty"));
        } else if !seen.insert(queue.name.as_str()) {
            errors.push(ValidationError::new(
                &field,
                format!("duplicate queue '{}'", queue.name),
            ));
        }
        if queue.message_ttl_ms == 0 {
            errors.push(ValidationError::new(format!("{}.message_ttl_ms", field), "must be > 0"));
        }
        if queue.max_length == 0 {
            errors.push(ValidationError::new(format!("{}.max_length", field), "must be > 0"));
        }
    }

    if config.rpc.timeout_ms == 0 {
        errors.push(ValidationError::new("rpc.timeout_ms", "must be > 0"));
    }

    let cb = &config.circuit_breaker;
    if cb.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be > 0"));
    }
    if cb.reset_timeout_ms == 0 {
        errors.push(ValidationError::new("circuit_breaker.reset_timeout_ms", "must be > 0"));
    }
    if cb.half_open_successes == 0 {
        errors.push(ValidationError::new("circuit_breaker.half_open_successes", "must be > 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
